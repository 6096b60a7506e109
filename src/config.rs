use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Key required in `X-Admin-Key` for the method API. Unset only outside production.
    pub admin_key: Option<String>,
    /// Replica 0 applies migrations; every other replica waits for it.
    /// Set via CAPSTORE_REPLICA_NUMBER. Default: 0.
    pub replica_number: u32,
    /// Days a trashed token is kept before the cleanup job deletes it. Default: 30.
    pub trash_retention_days: i64,
    /// Seconds between cleanup sweeps. Default: 86400.
    pub cleanup_interval_secs: u64,
    /// Seconds between cursor polls while a non-primary replica waits for migrations.
    pub migration_poll_secs: u64,
    pub log_json: bool,
    pub profile: ProfileSettings,
}

/// Settings consulted while deriving profile defaults for credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileSettings {
    /// LDAP attribute holding the display name.
    pub ldap_name_field: String,
    /// LDAP attribute holding the email address.
    pub ldap_email_field: String,
}

impl ProfileSettings {
    pub fn ldap(name_field: &str, email_field: &str) -> Self {
        Self {
            ldap_name_field: name_field.to_string(),
            ldap_email_field: email_field.to_string(),
        }
    }
}

impl Config {
    /// Returns the admin key for API authentication, if any.
    pub fn admin_key(&self) -> Option<&str> {
        self.admin_key.as_deref()
    }

    pub fn is_primary_replica(&self) -> bool {
        self.replica_number == 0
    }

    pub fn trash_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.trash_retention_days)
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Accepts `memory` or a `postgres://` / `postgresql://` URL.
fn validate_database_url(raw: &str) -> anyhow::Result<()> {
    if raw == "memory" {
        return Ok(());
    }
    let parsed = url::Url::parse(raw).map_err(|e| anyhow::anyhow!("DATABASE_URL is invalid: {}", e))?;
    match parsed.scheme() {
        "postgres" | "postgresql" => Ok(()),
        other => anyhow::bail!("DATABASE_URL scheme '{}' is not supported", other),
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let admin_key = std::env::var("CAPSTORE_ADMIN_KEY").ok().filter(|k| !k.is_empty());
    if admin_key.is_none() {
        let env_mode = std::env::var("CAPSTORE_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "CAPSTORE_ADMIN_KEY is not set. \
                 Set an admin key before running in production."
            );
        }
        eprintln!("⚠️  CAPSTORE_ADMIN_KEY is not set — the method API will reject every call.");
    }

    let trash_retention_days = env_or("CAPSTORE_TRASH_RETENTION_DAYS", 30i64);
    if trash_retention_days < 0 {
        anyhow::bail!("CAPSTORE_TRASH_RETENTION_DAYS must not be negative");
    }

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/capstore".into());
    validate_database_url(&database_url)?;

    Ok(Config {
        port: env_or("CAPSTORE_PORT", 8450),
        database_url,
        admin_key,
        replica_number: env_or("CAPSTORE_REPLICA_NUMBER", 0),
        trash_retention_days,
        cleanup_interval_secs: env_or("CAPSTORE_CLEANUP_INTERVAL_SECS", 86_400),
        migration_poll_secs: env_or("CAPSTORE_MIGRATION_POLL_SECS", 2),
        log_json: env_or("CAPSTORE_LOG_JSON", false),
        profile: ProfileSettings {
            ldap_name_field: std::env::var("CAPSTORE_LDAP_NAME_FIELD").unwrap_or_else(|_| "cn".into()),
            ldap_email_field: std::env::var("CAPSTORE_LDAP_EMAIL_FIELD")
                .unwrap_or_else(|_| "mail".into()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_url_validation() {
        assert!(validate_database_url("memory").is_ok());
        assert!(validate_database_url("postgres://u:p@localhost:5432/capstore").is_ok());
        assert!(validate_database_url("postgresql://localhost/capstore").is_ok());
        assert!(validate_database_url("mysql://localhost/capstore").is_err());
        assert!(validate_database_url("not a url").is_err());
    }
}
