use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use capstore::cli::{self, Commands, CredentialCommands, TokenCommands};
use capstore::config::{self, Config};
use capstore::migrations::Migrator;
use capstore::models::permissions::RoleAssignment;
use capstore::tokens::{Issuer, RequestedOwner, UserRequest};
use capstore::{api, jobs, store, AppState};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "capstore=debug,tower_http=debug".into()),
    );
    let json_layer = cfg.log_json.then(|| tracing_subscriber::fmt::layer().json());
    let text_layer = (!cfg.log_json).then(tracing_subscriber::fmt::layer);
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();

    let args = cli::Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
        Some(Commands::Migrate { rerun, status }) => {
            let store = store::open(&cfg.database_url).await?;
            let migrator = Migrator::new(store, cfg.profile.clone());
            if status {
                let applied = migrator.applied().await?.unwrap_or(0);
                println!(
                    "Migrations applied: {}/{}",
                    applied,
                    capstore::migrations::MIGRATIONS.len()
                );
                Ok(())
            } else if let Some(name) = rerun {
                migrator.rerun(&name).await.map_err(anyhow::Error::from)
            } else {
                let applied = migrator.migrate_to_latest().await?;
                println!("Migrations applied: {}", applied);
                Ok(())
            }
        }
        Some(Commands::Token { command }) => {
            let store = store::open(&cfg.database_url).await?;
            let state = AppState::new(cfg, store);
            handle_token_command(command, &state).await
        }
        Some(Commands::Credential { command }) => {
            let store = store::open(&cfg.database_url).await?;
            let state = AppState::new(cfg, store);
            handle_credential_command(command, &state).await
        }
        Some(Commands::Gc) => {
            let store = store::open(&cfg.database_url).await?;
            let retention = cfg.trash_retention();
            let state = AppState::new(cfg, store);
            let report = jobs::cleanup::sweep(&state.tokens, retention, chrono::Utc::now()).await?;
            println!(
                "Removed {} trashed and {} unused tokens.",
                report.trashed, report.unused
            );
            Ok(())
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let store = store::open(&cfg.database_url).await?;

    let migrator = Migrator::new(store.clone(), cfg.profile.clone());
    migrator
        .run(
            cfg.replica_number,
            Duration::from_secs(cfg.migration_poll_secs),
        )
        .await
        .context("migrations did not complete")?;

    let cleanup_every = Duration::from_secs(cfg.cleanup_interval_secs);
    let retention = cfg.trash_retention();
    let primary = cfg.is_primary_replica();
    let state = Arc::new(AppState::new(cfg, store.clone()));

    let app = axum::Router::new()
        // Health endpoints (no auth)
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/readyz", axum::routing::get(|| async { "ok" }))
        .nest("/api/v1", api::api_router(state.clone()))
        .with_state(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware));

    // One replica sweeps; the others would only race it.
    if primary {
        jobs::cleanup::spawn(
            Arc::new(capstore::tokens::TokenStore::new(store)),
            retention,
            cleanup_every,
        );
        tracing::info!(every_secs = cleanup_every.as_secs(), "token cleanup job started");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("capstore listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

async fn handle_token_command(cmd: TokenCommands, state: &AppState) -> anyhow::Result<()> {
    match cmd {
        TokenCommands::Create {
            grain,
            account,
            role,
            petname,
            to_account,
        } => {
            let role_assignment = role.map(RoleAssignment::role).unwrap_or_else(RoleAssignment::all_access);
            let owner = match to_account {
                Some(account_id) => RequestedOwner::User(UserRequest {
                    account_id,
                    title: String::new(),
                }),
                None => RequestedOwner::Webkey(None),
            };
            let issued = state
                .tokens
                .new_api_token(Issuer::AccountId(account), &grain, petname, role_assignment, owner, None)
                .await?;
            println!("Token created:\n  ID:     {}\n  Secret: {}", issued.id, issued.token);
            println!("\nThe secret is shown only once.");
        }
        TokenCommands::Restore { secret } => {
            let restored = state.tokens.restore(&secret).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&api::handlers::restored_json(restored))?
            );
        }
        TokenCommands::Revoke { token_id } => {
            state.tokens.revoke(&token_id).await?;
            println!("Token {} revoked.", token_id);
        }
        TokenCommands::Show { token_id } => match state.tokens.cap_details(&token_id).await? {
            Some(d) => println!(
                "{:<46} {:<24} {:<20} {}",
                d.token_id,
                d.grain_id,
                d.grain_title,
                d.petname.unwrap_or_default()
            ),
            None => println!("Token not found or its grain no longer exists."),
        },
    }
    Ok(())
}

async fn handle_credential_command(cmd: CredentialCommands, state: &AppState) -> anyhow::Result<()> {
    match cmd {
        CredentialCommands::Unlink {
            acting,
            account,
            credential,
        } => {
            state
                .accounts
                .unlink_credential(&acting, &account, &credential)
                .await?;
            println!("Credential {} unlinked from {}.", credential, account);
        }
        CredentialCommands::AllowLogin {
            acting,
            credential,
            allow,
        } => {
            state
                .accounts
                .set_credential_allows_login(&acting, &credential, allow)
                .await?;
            println!("Credential {} login allowed: {}.", credential, allow);
        }
    }
    Ok(())
}
