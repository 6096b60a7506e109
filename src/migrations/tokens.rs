//! Migrations that only touch `apiTokens`.

use futures::future::BoxFuture;
use serde_json::{json, Value};

use super::MigrationContext;
use crate::errors::AuthzResult;
use crate::store::document::{doc_id, get_path, get_str, remove_path, set_path};
use crate::store::{Collection, Document, DocumentStore, Filter};

pub(super) fn clean_up_api_tokens<'a>(
    store: &'a dyn DocumentStore,
    _ctx: &'a MigrationContext,
) -> BoxFuture<'a, AuthzResult<()>> {
    Box::pin(async move {
        // Tokens whose user was gone when account and identity ids were split never got an
        // identity and cannot be used.
        let orphaned = store
            .delete_where(
                Collection::ApiTokens,
                &Filter::and([Filter::exists("userId"), Filter::missing("identityId")]),
            )
            .await?
            + store
                .delete_where(
                    Collection::ApiTokens,
                    &Filter::and([
                        Filter::exists("owner.user.userId"),
                        Filter::missing("owner.user.identityId"),
                    ]),
                )
                .await?;

        let icons = store
            .update_where(
                Collection::ApiTokens,
                &Filter::exists("owner.user.denormalizedGrainMetadata.appIcon"),
                &|doc: &mut Document| {
                    let Some(icon) = remove_path(doc, "owner.user.denormalizedGrainMetadata.appIcon") else {
                        return Ok(false);
                    };
                    Ok(set_path(doc, "owner.user.denormalizedGrainMetadata.icon", icon))
                },
            )
            .await?;

        // Child UiView tokens used to be created without the parent's identityId.
        let mut pending: Vec<(String, Value)> = store
            .find(
                Collection::ApiTokens,
                &Filter::and([
                    Filter::exists("grainId"),
                    Filter::exists("identityId"),
                    Filter::missing("parentToken"),
                ]),
            )
            .await?
            .iter()
            .filter_map(|root| Some((doc_id(root)?.to_string(), root["identityId"].clone())))
            .collect();
        let mut repaired = 0;
        while let Some((parent_id, identity_id)) = pending.pop() {
            let children = store
                .find(
                    Collection::ApiTokens,
                    &Filter::and([
                        Filter::eq("parentToken", parent_id.as_str()),
                        Filter::exists("grainId"),
                        Filter::missing("identityId"),
                    ]),
                )
                .await?;
            for child in children {
                let Some(child_id) = doc_id(&child) else { continue };
                store
                    .update(Collection::ApiTokens, child_id, &|doc: &mut Document| {
                        Ok(set_path(doc, "identityId", identity_id.clone()))
                    })
                    .await?;
                repaired += 1;
                pending.push((child_id.to_string(), identity_id.clone()));
            }
        }

        tracing::info!(orphaned, icons, repaired, "cleaned up api tokens");
        Ok(())
    })
}

pub(super) fn extract_last_used_from_api_token_owner<'a>(
    store: &'a dyn DocumentStore,
    _ctx: &'a MigrationContext,
) -> BoxFuture<'a, AuthzResult<()>> {
    Box::pin(async move {
        let moved = store
            .update_where(
                Collection::ApiTokens,
                &Filter::exists("owner.user.lastUsed"),
                &|doc: &mut Document| {
                    let Some(last_used) = remove_path(doc, "owner.user.lastUsed") else {
                        return Ok(false);
                    };
                    Ok(set_path(doc, "lastUsed", last_used))
                },
            )
            .await?;
        tracing::info!(moved, "hoisted lastUsed off token owners");
        Ok(())
    })
}

pub(super) fn add_membrane_requirements_to_identities<'a>(
    store: &'a dyn DocumentStore,
    _ctx: &'a MigrationContext,
) -> BoxFuture<'a, AuthzResult<()>> {
    Box::pin(async move {
        // An identity capability held by a grain must lapse once the identity loses access.
        let filter = Filter::and([
            Filter::exists("frontendRef.identity"),
            Filter::exists("owner.grain.grainId"),
            Filter::missing("requirements.0"),
        ]);
        let added = store
            .update_where(Collection::ApiTokens, &filter, &|doc: &mut Document| {
                let (Some(grain_id), Some(identity_id)) = (
                    get_str(doc, "owner.grain.grainId").map(str::to_string),
                    get_path(doc, "frontendRef.identity").cloned(),
                ) else {
                    return Ok(false);
                };
                let requirement = json!({
                    "permissionsHeld": {
                        "grainId": grain_id,
                        "identityId": identity_id,
                        "permissions": [],
                    }
                });
                match doc.get_mut("requirements").and_then(Value::as_array_mut) {
                    Some(list) if !list.is_empty() => return Ok(false),
                    Some(list) => list.push(requirement),
                    None => {
                        set_path(doc, "requirements", json!([requirement]));
                    }
                }
                Ok(true)
            })
            .await?;
        tracing::info!(added, "added membrane requirements to identity capabilities");
        Ok(())
    })
}

pub(super) fn add_encryption_to_frontend_ref_ip_network<'a>(
    store: &'a dyn DocumentStore,
    _ctx: &'a MigrationContext,
) -> BoxFuture<'a, AuthzResult<()>> {
    Box::pin(async move {
        let updated = store
            .update_where(
                Collection::ApiTokens,
                &Filter::eq("frontendRef.ipNetwork", true),
                &|doc: &mut Document| {
                    Ok(set_path(
                        doc,
                        "frontendRef.ipNetwork",
                        json!({ "encryption": { "none": null } }),
                    ))
                },
            )
            .await?;
        tracing::info!(updated, "added encryption to ipNetwork capabilities");
        Ok(())
    })
}

pub(super) fn cleanup_bad_expires_if_unused<'a>(
    store: &'a dyn DocumentStore,
    _ctx: &'a MigrationContext,
) -> BoxFuture<'a, AuthzResult<()>> {
    Box::pin(async move {
        // Some releases stored a number instead of a date. Those tokens are long expired.
        let removed = store
            .delete_where(Collection::ApiTokens, &Filter::IsNumber("expiresIfUnused".into()))
            .await?;
        tracing::info!(removed, "removed tokens with numeric expiresIfUnused");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    async fn twice<F>(store: &MemoryStore, run: F)
    where
        F: for<'a> Fn(&'a dyn DocumentStore, &'a MigrationContext) -> BoxFuture<'a, AuthzResult<()>>,
    {
        let ctx = MigrationContext::default();
        let dyn_store: &dyn DocumentStore = store;
        run(dyn_store, &ctx).await.unwrap();
        let once = store.snapshot();
        run(dyn_store, &ctx).await.unwrap();
        assert_eq!(store.snapshot(), once);
    }

    async fn seed(store: &MemoryStore, id: &str, doc: Value) {
        store.put(Collection::ApiTokens, id, doc).await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_up_api_tokens() {
        let store = MemoryStore::new();
        seed(&store, "orphan", json!({"userId": "u", "grainId": "g"})).await;
        seed(&store, "orphan2", json!({"owner": {"user": {"userId": "u"}}})).await;
        seed(
            &store,
            "icon",
            json!({"owner": {"user": {"identityId": "i", "denormalizedGrainMetadata": {"appIcon": {"url": "x"}}}}}),
        )
        .await;
        seed(&store, "root", json!({"grainId": "g", "identityId": "i1"})).await;
        seed(&store, "child", json!({"grainId": "g", "parentToken": "root"})).await;
        seed(&store, "grandchild", json!({"grainId": "g", "parentToken": "child"})).await;

        twice(&store, clean_up_api_tokens).await;

        assert!(store.get(Collection::ApiTokens, "orphan").await.unwrap().is_none());
        assert!(store.get(Collection::ApiTokens, "orphan2").await.unwrap().is_none());
        let icon = store.get(Collection::ApiTokens, "icon").await.unwrap().unwrap();
        assert_eq!(icon["owner"]["user"]["denormalizedGrainMetadata"], json!({"icon": {"url": "x"}}));
        let gc = store.get(Collection::ApiTokens, "grandchild").await.unwrap().unwrap();
        assert_eq!(gc["identityId"], "i1");
    }

    #[tokio::test]
    async fn test_extract_last_used() {
        let store = MemoryStore::new();
        seed(&store, "t", json!({"owner": {"user": {"identityId": "i", "lastUsed": "2016-01-01T00:00:00Z"}}})).await;
        seed(&store, "never", json!({"owner": {"user": {"identityId": "i"}}})).await;
        twice(&store, extract_last_used_from_api_token_owner).await;
        let t = store.get(Collection::ApiTokens, "t").await.unwrap().unwrap();
        assert_eq!(t["lastUsed"], "2016-01-01T00:00:00Z");
        assert!(t["owner"]["user"].get("lastUsed").is_none());
        let never = store.get(Collection::ApiTokens, "never").await.unwrap().unwrap();
        assert!(never.get("lastUsed").is_none());
    }

    #[tokio::test]
    async fn test_membrane_requirements_added_once() {
        let store = MemoryStore::new();
        seed(&store, "cap", json!({"frontendRef": {"identity": "i"}, "owner": {"grain": {"grainId": "g", "saveLabel": {}}}})).await;
        seed(
            &store,
            "has",
            json!({"frontendRef": {"identity": "i"}, "owner": {"grain": {"grainId": "g"}},
                   "requirements": [{"userIsAdmin": "a"}]}),
        )
        .await;
        twice(&store, add_membrane_requirements_to_identities).await;
        let cap = store.get(Collection::ApiTokens, "cap").await.unwrap().unwrap();
        assert_eq!(
            cap["requirements"],
            json!([{"permissionsHeld": {"grainId": "g", "identityId": "i", "permissions": []}}])
        );
        let has = store.get(Collection::ApiTokens, "has").await.unwrap().unwrap();
        assert_eq!(has["requirements"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ip_network_and_bad_expires() {
        let store = MemoryStore::new();
        seed(&store, "net", json!({"frontendRef": {"ipNetwork": true}})).await;
        seed(&store, "bad", json!({"expiresIfUnused": 1490000000000u64})).await;
        seed(&store, "good", json!({"expiresIfUnused": "2030-01-01T00:00:00Z"})).await;
        twice(&store, add_encryption_to_frontend_ref_ip_network).await;
        twice(&store, cleanup_bad_expires_if_unused).await;
        let net = store.get(Collection::ApiTokens, "net").await.unwrap().unwrap();
        assert_eq!(net["frontendRef"]["ipNetwork"], json!({"encryption": {"none": null}}));
        assert!(store.get(Collection::ApiTokens, "bad").await.unwrap().is_none());
        assert!(store.get(Collection::ApiTokens, "good").await.unwrap().is_some());
    }
}
