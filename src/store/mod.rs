//! Document storage behind the authorization core.
//!
//! The core never holds a process-wide collection handle: every service receives an
//! `Arc<dyn DocumentStore>` at construction. Writes are atomic per document only; nothing in
//! the core relies on multi-document transactions.

pub mod document;
pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::AuthzResult;
pub use document::{Document, Filter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Users,
    ApiTokens,
    ApiHosts,
    Grains,
    Contacts,
    Notifications,
    Migrations,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Users,
        Collection::ApiTokens,
        Collection::ApiHosts,
        Collection::Grains,
        Collection::Contacts,
        Collection::Notifications,
        Collection::Migrations,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::ApiTokens => "apiTokens",
            Collection::ApiHosts => "apiHosts",
            Collection::Grains => "grains",
            Collection::Contacts => "contacts",
            Collection::Notifications => "notifications",
            Collection::Migrations => "migrations",
        }
    }
}

/// A uniqueness constraint over every value found at `path` (arrays fan out).
#[derive(Debug, Clone, Copy)]
pub struct UniqueIndex {
    pub collection: Collection,
    pub name: &'static str,
    pub path: &'static str,
}

/// A credential may be a login credential of at most one account.
pub const UNIQUE_INDEXES: &[UniqueIndex] = &[UniqueIndex {
    collection: Collection::Users,
    name: "loginCredentials.id",
    path: "loginCredentials.id",
}];

pub fn unique_indexes_for(collection: Collection) -> impl Iterator<Item = &'static UniqueIndex> {
    UNIQUE_INDEXES.iter().filter(move |i| i.collection == collection)
}

/// In-place edit of one document. Returns whether the document changed; an error aborts the
/// write and is handed back to the caller untouched.
pub type Mutation<'a> = dyn Fn(&mut Document) -> AuthzResult<bool> + Send + Sync + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Missing,
    Unchanged,
    Updated,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str) -> AuthzResult<Option<Document>>;

    /// Inserts a new document. Returns `false` without writing if `id` is already taken.
    async fn insert(&self, collection: Collection, id: &str, doc: Document) -> AuthzResult<bool>;

    /// Inserts or replaces.
    async fn put(&self, collection: Collection, id: &str, doc: Document) -> AuthzResult<()>;

    /// Atomically applies `mutate` to one document.
    async fn update(
        &self,
        collection: Collection,
        id: &str,
        mutate: &Mutation<'_>,
    ) -> AuthzResult<UpdateOutcome>;

    async fn delete(&self, collection: Collection, id: &str) -> AuthzResult<bool>;

    /// All documents matching `filter`, ordered by id.
    async fn find(&self, collection: Collection, filter: &Filter) -> AuthzResult<Vec<Document>>;

    /// Applies `mutate` to each matching document, one atomic write per document.
    /// Returns the number of documents changed.
    async fn update_where(
        &self,
        collection: Collection,
        filter: &Filter,
        mutate: &Mutation<'_>,
    ) -> AuthzResult<usize> {
        let mut changed = 0;
        for doc in self.find(collection, filter).await? {
            let Some(id) = document::doc_id(&doc) else {
                continue;
            };
            // Re-check the filter under the write so a concurrent change is not clobbered.
            let guarded = |d: &mut Document| {
                if !filter.matches(d) {
                    return Ok(false);
                }
                mutate(d)
            };
            if self.update(collection, id, &guarded).await? == UpdateOutcome::Updated {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Deletes matching documents. Returns how many were removed.
    async fn delete_where(&self, collection: Collection, filter: &Filter) -> AuthzResult<usize> {
        let mut removed = 0;
        for doc in self.find(collection, filter).await? {
            if let Some(id) = document::doc_id(&doc) {
                if self.delete(collection, id).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn find_one(&self, collection: Collection, filter: &Filter) -> AuthzResult<Option<Document>> {
        Ok(self.find(collection, filter).await?.into_iter().next())
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> AuthzResult<usize> {
        Ok(self.find(collection, filter).await?.len())
    }
}

pub type SharedStore = Arc<dyn DocumentStore>;

/// Opens the store named by `database_url`. `memory` selects the in-process store, which keeps
/// nothing across restarts; anything else is a Postgres URL.
pub async fn open(database_url: &str) -> anyhow::Result<SharedStore> {
    if database_url == "memory" {
        tracing::warn!("using the in-memory store; data will not survive a restart");
        return Ok(Arc::new(memory::MemoryStore::new()));
    }
    tracing::info!("Connecting to database...");
    let db = postgres::PgStore::connect(database_url).await?;
    tracing::info!("Running schema migrations...");
    db.migrate().await?;
    Ok(Arc::new(db))
}
