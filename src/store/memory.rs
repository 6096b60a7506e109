use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::document::{values_at, Document, Filter};
use super::{unique_indexes_for, Collection, DocumentStore, Mutation, UpdateOutcome};
use crate::errors::{AuthzError, AuthzResult};

/// In-process document store.
///
/// Each collection lives behind one DashMap entry, so every operation on a collection holds that
/// entry's lock for its whole duration: writes are atomic and unique indexes are checked against
/// a consistent view.
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<Collection, BTreeMap<String, Document>>,
}

/// Full copy of the store contents, for before/after comparisons.
pub type Snapshot = BTreeMap<Collection, BTreeMap<String, Document>>;

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.collections
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: Collection) -> usize {
        self.collections.get(&collection).map(|c| c.len()).unwrap_or(0)
    }
}

/// Rejects `doc` if any value it holds at a unique path is already held by another document.
fn check_unique(
    collection: Collection,
    docs: &BTreeMap<String, Document>,
    id: &str,
    doc: &Document,
) -> AuthzResult<()> {
    for index in unique_indexes_for(collection) {
        let mut owners: HashMap<String, &str> = HashMap::new();
        for (other_id, other) in docs.iter().filter(|(k, _)| k.as_str() != id) {
            for v in values_at(other, index.path) {
                owners.insert(v.to_string(), other_id.as_str());
            }
        }
        for v in values_at(doc, index.path) {
            if let Some(other_id) = owners.get(&v.to_string()) {
                return Err(AuthzError::InvariantViolation(format!(
                    "unique index {} violated: {} already held by {}",
                    index.name, v, other_id
                )));
            }
        }
    }
    Ok(())
}

fn with_id(mut doc: Document, id: &str) -> Document {
    if let Some(map) = doc.as_object_mut() {
        map.insert("_id".to_string(), Value::String(id.to_string()));
    }
    doc
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: Collection, id: &str) -> AuthzResult<Option<Document>> {
        Ok(self
            .collections
            .get(&collection)
            .and_then(|c| c.get(id).cloned()))
    }

    async fn insert(&self, collection: Collection, id: &str, doc: Document) -> AuthzResult<bool> {
        let mut docs = self.collections.entry(collection).or_default();
        if docs.contains_key(id) {
            return Ok(false);
        }
        let doc = with_id(doc, id);
        check_unique(collection, &docs, id, &doc)?;
        docs.insert(id.to_string(), doc);
        Ok(true)
    }

    async fn put(&self, collection: Collection, id: &str, doc: Document) -> AuthzResult<()> {
        let mut docs = self.collections.entry(collection).or_default();
        let doc = with_id(doc, id);
        check_unique(collection, &docs, id, &doc)?;
        docs.insert(id.to_string(), doc);
        Ok(())
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        mutate: &Mutation<'_>,
    ) -> AuthzResult<UpdateOutcome> {
        let mut docs = self.collections.entry(collection).or_default();
        let Some(existing) = docs.get(id) else {
            return Ok(UpdateOutcome::Missing);
        };
        let mut edited = existing.clone();
        if !mutate(&mut edited)? {
            return Ok(UpdateOutcome::Unchanged);
        }
        let edited = with_id(edited, id);
        check_unique(collection, &docs, id, &edited)?;
        docs.insert(id.to_string(), edited);
        Ok(UpdateOutcome::Updated)
    }

    async fn delete(&self, collection: Collection, id: &str) -> AuthzResult<bool> {
        Ok(self
            .collections
            .get_mut(&collection)
            .map(|mut c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn find(&self, collection: Collection, filter: &Filter) -> AuthzResult<Vec<Document>> {
        Ok(self
            .collections
            .get(&collection)
            .map(|c| c.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_refuses_existing_id() {
        let store = MemoryStore::new();
        assert!(store.insert(Collection::Grains, "g", json!({"title": "a"})).await.unwrap());
        assert!(!store.insert(Collection::Grains, "g", json!({"title": "b"})).await.unwrap());
        let doc = store.get(Collection::Grains, "g").await.unwrap().unwrap();
        assert_eq!(doc["title"], "a");
        assert_eq!(doc["_id"], "g");
    }

    #[tokio::test]
    async fn test_unique_login_credential_index() {
        let store = MemoryStore::new();
        store
            .put(Collection::Users, "a1", json!({"type": "account", "loginCredentials": [{"id": "c1"}]}))
            .await
            .unwrap();
        let err = store
            .put(Collection::Users, "a2", json!({"type": "account", "loginCredentials": [{"id": "c1"}]}))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::InvariantViolation(_)));
        // Re-writing the owner itself is fine.
        store
            .put(Collection::Users, "a1", json!({"type": "account", "loginCredentials": [{"id": "c1"}, {"id": "c2"}]}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_error_leaves_document_untouched() {
        let store = MemoryStore::new();
        store.put(Collection::Grains, "g", json!({"n": 1})).await.unwrap();
        let failing = |d: &mut Document| {
            d["n"] = json!(2);
            Err(AuthzError::invariant("nope"))
        };
        assert!(store.update(Collection::Grains, "g", &failing).await.is_err());
        assert_eq!(store.get(Collection::Grains, "g").await.unwrap().unwrap()["n"], 1);
        let missing = store.update(Collection::Grains, "x", &failing).await.unwrap();
        assert_eq!(missing, UpdateOutcome::Missing);
    }

    #[tokio::test]
    async fn test_update_where_and_delete_where() {
        let store = MemoryStore::new();
        for (id, g) in [("t1", "g1"), ("t2", "g1"), ("t3", "g2")] {
            store.put(Collection::ApiTokens, id, json!({"grainId": g})).await.unwrap();
        }
        let revoke = |d: &mut Document| {
            d["revoked"] = json!(true);
            Ok(true)
        };
        let n = store
            .update_where(Collection::ApiTokens, &Filter::eq("grainId", "g1"), &revoke)
            .await
            .unwrap();
        assert_eq!(n, 2);
        let removed = store
            .delete_where(Collection::ApiTokens, &Filter::eq("revoked", true))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len(Collection::ApiTokens), 1);
    }
}
