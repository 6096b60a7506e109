use clap::{Parser, Subcommand};

/// capstore — capability token store and identity model
#[derive(Parser)]
#[command(name = "capstore", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply migrations (replica 0) or wait for them, then serve the method API
    Serve {
        /// Port to bind (overrides CAPSTORE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Apply pending migrations and exit
    Migrate {
        /// Re-run one migration by name without moving the cursor
        #[arg(long)]
        rerun: Option<String>,
        /// Print the migration cursor and exit
        #[arg(long)]
        status: bool,
    },

    /// Manage capability tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Manage credentials linked to accounts
    Credential {
        #[command(subcommand)]
        command: CredentialCommands,
    },

    /// Delete trashed and lapsed tokens once
    Gc,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Share a grain: mint a UiView token
    Create {
        #[arg(long)]
        grain: String,
        /// Sharing account
        #[arg(long)]
        account: String,
        /// Role index; omit for full access
        #[arg(long)]
        role: Option<u32>,
        #[arg(long)]
        petname: Option<String>,
        /// Deliver to this account instead of minting a webkey
        #[arg(long)]
        to_account: Option<String>,
    },
    /// Resolve a secret and print what it grants
    Restore {
        #[arg(long, env = "CAPSTORE_TOKEN")]
        secret: String,
    },
    /// Revoke a token by id
    Revoke {
        #[arg(long)]
        token_id: String,
    },
    /// Show listing details of a token
    Show {
        #[arg(long)]
        token_id: String,
    },
}

#[derive(Subcommand)]
pub enum CredentialCommands {
    /// Detach a credential from an account
    Unlink {
        /// Account performing the change; must own the credential
        #[arg(long)]
        acting: String,
        #[arg(long)]
        account: String,
        #[arg(long)]
        credential: String,
    },
    /// Allow or forbid logging in with a credential
    AllowLogin {
        #[arg(long)]
        acting: String,
        #[arg(long)]
        credential: String,
        #[arg(long, action = clap::ArgAction::Set)]
        allow: bool,
    },
}
