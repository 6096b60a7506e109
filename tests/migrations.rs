//! Full migration runs against a legacy database.

use std::sync::Arc;

use capstore::config::ProfileSettings;
use capstore::identity::AccountService;
use capstore::migrations::{Migrator, MIGRATIONS};
use capstore::store::memory::MemoryStore;
use capstore::store::{Collection, DocumentStore, SharedStore};
use capstore::tokens::requirements::Evaluator;
use serde_json::{json, Value};

async fn legacy_db() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let seed: Vec<(Collection, &str, Value)> = vec![
        (
            Collection::Users,
            "ia",
            json!({"profile": {"name": "Alice", "service": "github"},
                   "services": {"github": {"id": 1, "username": "alice"}}}),
        ),
        (
            Collection::Users,
            "ib",
            json!({"profile": {"name": "Bob"}, "services": {"dev": {"name": "Bob"}}}),
        ),
        (
            Collection::Users,
            "A",
            json!({"loginIdentities": [{"id": "ia"}], "nonloginIdentities": [],
                   "lastActive": "2017-01-02T00:00:00Z"}),
        ),
        (
            Collection::Users,
            "B",
            json!({"loginIdentities": [{"id": "ib"}], "nonloginIdentities": [],
                   "lastActive": "2017-01-01T00:00:00Z"}),
        ),
        (
            Collection::Grains,
            "g",
            json!({"userId": "B", "identityId": "ib", "title": "Ledger",
                   "cachedViewInfo": {"permissions": [{}, {}],
                                      "roles": [{"permissions": [true, false], "default": true}]}}),
        ),
        (
            Collection::ApiTokens,
            "share",
            json!({"grainId": "g", "accountId": "B", "identityId": "ib",
                   "roleAssignment": {"allAccess": null},
                   "owner": {"user": {"identityId": "ia", "title": "Ledger",
                                      "lastUsed": "2017-01-01T00:00:00Z"}}}),
        ),
        (
            Collection::ApiTokens,
            "stale",
            json!({"grainId": "g", "accountId": "B", "identityId": "ib",
                   "roleAssignment": {"allAccess": null}, "expiresIfUnused": 1234}),
        ),
    ];
    for (collection, id, doc) in seed {
        store.put(collection, id, doc).await.unwrap();
    }
    store
}

#[tokio::test]
async fn test_migrate_to_latest_from_legacy_data() {
    let store = legacy_db().await;
    let shared: SharedStore = store.clone();
    let migrator = Migrator::new(shared.clone(), ProfileSettings::default());

    assert_eq!(migrator.applied().await.unwrap(), None);
    assert_eq!(migrator.migrate_to_latest().await.unwrap(), MIGRATIONS.len());
    assert_eq!(migrator.applied().await.unwrap(), Some(MIGRATIONS.len()));

    // Legacy users are now accounts and credentials.
    let accounts = AccountService::new(shared.clone(), ProfileSettings::default());
    let a = accounts.account("A").await.unwrap().unwrap();
    assert!(a.is_login_credential("ia"));
    assert_eq!(a.profile.name.as_deref(), Some("Alice"));
    assert!(accounts.credential("ia").await.unwrap().is_some());

    let share = store.get(Collection::ApiTokens, "share").await.unwrap().unwrap();
    assert_eq!(share["owner"]["user"]["accountId"], "A");
    assert_eq!(share["lastUsed"], "2017-01-01T00:00:00Z");
    assert!(store.get(Collection::ApiTokens, "stale").await.unwrap().is_none());

    // The migrated share still grants the new account access.
    let eval = Evaluator::new(&*shared, chrono::Utc::now());
    let grain = eval.load_grain("g").await.unwrap().unwrap();
    let held = eval.account_permissions(&grain, "A").await.unwrap();
    assert!(held.has(0) && held.has(1));
}

#[tokio::test]
async fn test_second_run_changes_nothing() {
    let store = legacy_db().await;
    let migrator = Migrator::new(store.clone(), ProfileSettings::default());
    migrator.migrate_to_latest().await.unwrap();
    let once = store.snapshot();

    migrator.migrate_to_latest().await.unwrap();
    assert_eq!(store.snapshot(), once);

    // A replica sees the finished cursor straight away.
    let applied = migrator
        .run(1, std::time::Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(applied, MIGRATIONS.len());
}

#[tokio::test]
async fn test_rerun_of_unknown_migration_is_a_configuration_error() {
    let store = legacy_db().await;
    let migrator = Migrator::new(store, ProfileSettings::default());
    let err = migrator.rerun("no_such_migration").await.unwrap_err();
    assert!(matches!(err, capstore::errors::AuthzError::Configuration(_)));
}
