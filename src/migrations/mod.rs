//! Ordered, checkpointed schema migrations.
//!
//! The registry is append-only: entries are never reordered or removed, because the persisted
//! cursor counts how many of them a database has already absorbed. Each migration must be safe to
//! run again from the top after a crash, since the cursor only advances once it returns.

mod identity;
mod tokens;

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use crate::config::ProfileSettings;
use crate::errors::{AuthzError, AuthzResult};
use crate::store::{Collection, DocumentStore, SharedStore};

/// Id of the cursor document in the `migrations` collection.
pub const CURSOR_ID: &str = "migrations_applied";

/// What a migration may consult besides the store.
#[derive(Debug, Clone, Default)]
pub struct MigrationContext {
    pub settings: ProfileSettings,
}

pub type MigrationFn =
    for<'a> fn(&'a dyn DocumentStore, &'a MigrationContext) -> BoxFuture<'a, AuthzResult<()>>;

#[derive(Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub run: MigrationFn,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration").field("name", &self.name).finish()
    }
}

// Only append to this list.
pub const MIGRATIONS: &[Migration] = &[
    Migration { name: "clean_up_api_tokens", run: tokens::clean_up_api_tokens },
    Migration {
        name: "extract_last_used_from_api_token_owner",
        run: tokens::extract_last_used_from_api_token_owner,
    },
    Migration {
        name: "add_membrane_requirements_to_identities",
        run: tokens::add_membrane_requirements_to_identities,
    },
    Migration {
        name: "add_encryption_to_frontend_ref_ip_network",
        run: tokens::add_encryption_to_frontend_ref_ip_network,
    },
    Migration { name: "notify_identity_changes", run: identity::notify_identity_changes },
    Migration {
        name: "one_persona_per_account_pre_cleanup",
        run: identity::one_persona_per_account_pre_cleanup,
    },
    Migration { name: "one_persona_per_account", run: identity::one_persona_per_account },
    Migration {
        name: "one_persona_per_account_post_cleanup",
        run: identity::one_persona_per_account_post_cleanup,
    },
    Migration { name: "cleanup_bad_expires_if_unused", run: tokens::cleanup_bad_expires_if_unused },
];

pub fn find(name: &str) -> Option<&'static Migration> {
    MIGRATIONS.iter().find(|m| m.name == name)
}

// ── Runner ───────────────────────────────────────────────────

pub struct Migrator {
    store: SharedStore,
    ctx: MigrationContext,
    migrations: &'static [Migration],
}

impl Migrator {
    pub fn new(store: SharedStore, settings: ProfileSettings) -> Self {
        Self::with_migrations(store, settings, MIGRATIONS)
    }

    pub fn with_migrations(
        store: SharedStore,
        settings: ProfileSettings,
        migrations: &'static [Migration],
    ) -> Self {
        Self {
            store,
            ctx: MigrationContext { settings },
            migrations,
        }
    }

    /// The persisted cursor, or `None` on a database that has never been migrated.
    pub async fn applied(&self) -> AuthzResult<Option<usize>> {
        let Some(doc) = self.store.get(Collection::Migrations, CURSOR_ID).await? else {
            return Ok(None);
        };
        let value = doc["value"]
            .as_u64()
            .ok_or_else(|| AuthzError::invariant("migration cursor is not a count"))?;
        Ok(Some(value as usize))
    }

    async fn set_applied(&self, value: usize) -> AuthzResult<()> {
        self.store
            .put(Collection::Migrations, CURSOR_ID, json!({ "value": value }))
            .await
    }

    /// Refuses to run against a database that has absorbed migrations this build does not have.
    pub async fn check_compatible(&self) -> AuthzResult<usize> {
        let applied = self.applied().await?.unwrap_or(0);
        if applied > self.migrations.len() {
            return Err(AuthzError::Configuration(format!(
                "database has {} migrations applied but this build only knows {}; \
                 refusing to run older code against newer data",
                applied,
                self.migrations.len()
            )));
        }
        Ok(applied)
    }

    /// Applies every pending migration in order. Only replica 0 may call this.
    pub async fn migrate_to_latest(&self) -> AuthzResult<usize> {
        let start = self.check_compatible().await?;
        if self.applied().await?.is_none() {
            self.set_applied(0).await?;
        }
        tracing::info!(applied = start, total = self.migrations.len(), "migrations already applied");

        for (i, migration) in self.migrations.iter().enumerate().skip(start) {
            tracing::info!(migration = migration.name, number = i + 1, "applying migration");
            if let Err(e) = (migration.run)(&*self.store, &self.ctx).await {
                tracing::error!(migration = migration.name, error = %e, "migration failed");
                return Err(e);
            }
            self.set_applied(i + 1).await?;
            tracing::info!(migration = migration.name, number = i + 1, "applied migration");
        }
        Ok(self.migrations.len())
    }

    /// Blocks until replica 0 has brought the cursor up to this build's registry.
    pub async fn wait_for_primary(&self, poll: Duration) -> AuthzResult<usize> {
        tracing::info!("waiting for migrations on replica zero");
        let mut interval = tokio::time::interval(poll);
        loop {
            interval.tick().await;
            let applied = self.check_compatible().await?;
            if applied >= self.migrations.len() {
                tracing::info!(applied, "migrations have completed on replica zero");
                return Ok(applied);
            }
            tracing::debug!(applied, total = self.migrations.len(), "migrations still pending");
        }
    }

    pub async fn run(&self, replica_number: u32, poll: Duration) -> AuthzResult<usize> {
        if replica_number == 0 {
            self.migrate_to_latest().await
        } else {
            self.wait_for_primary(poll).await
        }
    }

    /// Runs one migration regardless of the cursor. Operators use this to repair data; the
    /// cursor is left alone.
    pub async fn rerun(&self, name: &str) -> AuthzResult<()> {
        let migration = self
            .migrations
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| AuthzError::Configuration(format!("no migration named {}", name)))?;
        tracing::info!(migration = migration.name, "re-running migration");
        (migration.run)(&*self.store, &self.ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn mark<'a>(store: &'a dyn DocumentStore, _ctx: &'a MigrationContext) -> BoxFuture<'a, AuthzResult<()>> {
        Box::pin(async move {
            let n = store
                .get(Collection::Grains, "counter")
                .await?
                .and_then(|d| d["n"].as_u64())
                .unwrap_or(0);
            store.put(Collection::Grains, "counter", json!({ "n": n + 1 })).await
        })
    }

    fn fail<'a>(_store: &'a dyn DocumentStore, _ctx: &'a MigrationContext) -> BoxFuture<'a, AuthzResult<()>> {
        Box::pin(async move { Err(AuthzError::invariant("unexpected shape")) })
    }

    const TWO: &[Migration] = &[
        Migration { name: "first", run: mark },
        Migration { name: "second", run: mark },
    ];
    const BROKEN: &[Migration] = &[
        Migration { name: "first", run: mark },
        Migration { name: "broken", run: fail },
    ];

    #[test]
    fn test_registry_names_are_unique() {
        let mut names: Vec<_> = MIGRATIONS.iter().map(|m| m.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), MIGRATIONS.len());
        assert!(find("one_persona_per_account").is_some());
    }

    #[tokio::test]
    async fn test_primary_applies_pending_and_records_cursor() {
        let store = Arc::new(MemoryStore::new());
        let m = Migrator::with_migrations(store.clone(), ProfileSettings::default(), TWO);
        assert_eq!(m.applied().await.unwrap(), None);
        assert_eq!(m.migrate_to_latest().await.unwrap(), 2);
        assert_eq!(m.applied().await.unwrap(), Some(2));

        // Nothing pending on the second start.
        m.migrate_to_latest().await.unwrap();
        let counter = store.get(Collection::Grains, "counter").await.unwrap().unwrap();
        assert_eq!(counter["n"], 2);
    }

    #[tokio::test]
    async fn test_failed_migration_leaves_cursor_before_it() {
        let store = Arc::new(MemoryStore::new());
        let m = Migrator::with_migrations(store.clone(), ProfileSettings::default(), BROKEN);
        assert!(m.migrate_to_latest().await.is_err());
        assert_eq!(m.applied().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_cursor_beyond_registry_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(Collection::Migrations, CURSOR_ID, json!({ "value": 5 }))
            .await
            .unwrap();
        let m = Migrator::with_migrations(store, ProfileSettings::default(), TWO);
        assert!(matches!(m.check_compatible().await, Err(AuthzError::Configuration(_))));
        assert!(m.migrate_to_latest().await.is_err());
    }

    #[tokio::test]
    async fn test_replica_waits_for_primary() {
        let store = Arc::new(MemoryStore::new());
        let replica = Migrator::with_migrations(store.clone(), ProfileSettings::default(), TWO);
        let primary = Migrator::with_migrations(store.clone(), ProfileSettings::default(), TWO);

        let waiter = tokio::spawn(async move { replica.run(1, Duration::from_millis(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        primary.run(0, Duration::from_millis(5)).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 2);
    }
}
