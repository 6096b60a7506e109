//! End-to-end sharing scenarios over the in-memory store.

use std::sync::Arc;

use capstore::errors::AuthzError;
use capstore::models::permissions::RoleAssignment;
use capstore::models::token::{MembraneRequirement, TokenOwner};
use capstore::store::memory::MemoryStore;
use capstore::store::{Collection, DocumentStore};
use capstore::tokens::{
    Issuer, NewToken, ProviderSpec, RequestedOwner, ResolvedCapability, TokenStore, TokenUpdate,
    UserRequest,
};
use serde_json::json;

async fn setup() -> (Arc<MemoryStore>, TokenStore) {
    let store = Arc::new(MemoryStore::new());
    store
        .put(
            Collection::Grains,
            "g",
            json!({"userId": "alice", "title": "Budget", "private": true,
                   "cachedViewInfo": {"permissions": [{}, {}],
                                      "roles": [{"permissions": [true, true]},
                                                {"permissions": [false, true], "default": true}]}}),
        )
        .await
        .unwrap();
    for name in ["alice", "bob", "carol"] {
        store
            .put(
                Collection::Users,
                name,
                json!({"type": "account", "loginCredentials": [{"id": format!("{}-cred", name)}],
                       "profile": {"name": name}}),
            )
            .await
            .unwrap();
    }
    let tokens = TokenStore::new(store.clone());
    (store, tokens)
}

fn to_user(account: &str) -> RequestedOwner {
    RequestedOwner::User(UserRequest {
        account_id: account.into(),
        title: "Budget".into(),
    })
}

fn permissions(cap: &ResolvedCapability) -> Vec<bool> {
    match cap {
        ResolvedCapability::UiView { permissions, .. } => (0..2).map(|i| permissions.has(i)).collect(),
        other => panic!("expected a UiView capability, got {:?}", other),
    }
}

#[tokio::test]
async fn test_owner_share_grants_full_access() {
    let (_store, tokens) = setup().await;
    let issued = tokens
        .new_api_token(
            Issuer::AccountId("alice".into()),
            "g",
            None,
            RoleAssignment::all_access(),
            RequestedOwner::Webkey(None),
            None,
        )
        .await
        .unwrap();
    let restored = tokens.restore(&issued.token).await.unwrap();
    assert_eq!(restored.token_id, issued.id);
    assert_eq!(permissions(&restored.capability), vec![true, true]);
}

#[tokio::test]
async fn test_child_token_is_attenuated_and_dies_with_parent() {
    let (_store, tokens) = setup().await;
    let parent = tokens
        .new_api_token(
            Issuer::AccountId("alice".into()),
            "g",
            None,
            RoleAssignment::all_access(),
            RequestedOwner::Webkey(None),
            None,
        )
        .await
        .unwrap();
    let child = tokens
        .new_api_token(
            Issuer::RawParentToken(parent.token.clone()),
            "g",
            None,
            RoleAssignment::role(1),
            RequestedOwner::Webkey(None),
            None,
        )
        .await
        .unwrap();
    let restored = tokens.restore(&child.token).await.unwrap();
    assert_eq!(permissions(&restored.capability), vec![false, true]);

    tokens.revoke(&parent.id).await.unwrap();
    assert!(matches!(tokens.restore(&parent.token).await, Err(AuthzError::Revoked)));
    assert!(matches!(
        tokens.restore(&child.token).await,
        Err(AuthzError::RevokedByAncestor)
    ));
}

#[tokio::test]
async fn test_reshare_loses_access_when_upstream_share_is_revoked() {
    let (_store, tokens) = setup().await;
    let to_bob = tokens
        .new_api_token(
            Issuer::AccountId("alice".into()),
            "g",
            None,
            RoleAssignment::role(1),
            to_user("bob"),
            None,
        )
        .await
        .unwrap();
    // Bob asks for everything but can only pass on what he holds.
    let from_bob = tokens
        .new_api_token(
            Issuer::AccountId("bob".into()),
            "g",
            None,
            RoleAssignment::all_access(),
            to_user("carol"),
            None,
        )
        .await
        .unwrap();
    let restored = tokens.restore(&from_bob.token).await.unwrap();
    assert_eq!(permissions(&restored.capability), vec![false, true]);
    assert!(matches!(
        restored.capability,
        ResolvedCapability::UiView { identity_id: Some(_), .. }
    ));

    tokens
        .update_api_token(
            "alice",
            &to_bob.id,
            TokenUpdate {
                revoked: Some(true),
                petname: None,
            },
        )
        .await
        .unwrap();
    let restored = tokens.restore(&from_bob.token).await.unwrap();
    assert_eq!(permissions(&restored.capability), vec![false, false]);
}

#[tokio::test]
async fn test_failed_requirement_revokes_token() {
    let (_store, tokens) = setup().await;
    let guard = tokens
        .new_api_token(
            Issuer::AccountId("alice".into()),
            "g",
            None,
            RoleAssignment::all_access(),
            RequestedOwner::Webkey(None),
            None,
        )
        .await
        .unwrap();
    let mut req = NewToken::new(
        TokenOwner::Webkey,
        ProviderSpec::UiView {
            grain_id: "g".into(),
            account_id: Some("alice".into()),
            role_assignment: RoleAssignment::all_access(),
        },
    );
    req.requirements = vec![MembraneRequirement::TokenValid(guard.id.clone())];
    let (secret, _id) = tokens.create(req).await.unwrap();
    assert!(tokens.restore(secret.as_str()).await.is_ok());

    tokens.revoke(&guard.id).await.unwrap();
    assert!(matches!(
        tokens.restore(secret.as_str()).await,
        Err(AuthzError::RequirementNotMet { .. })
    ));
}

#[tokio::test]
async fn test_unknown_or_malformed_secret_is_not_found() {
    let (_store, tokens) = setup().await;
    let fresh = capstore::vault::TokenSecret::generate();
    assert!(matches!(tokens.restore(fresh.as_str()).await, Err(AuthzError::NotFound)));
    assert!(matches!(tokens.restore("not a token").await, Err(AuthzError::NotFound)));
    assert!(matches!(tokens.restore("").await, Err(AuthzError::NotFound)));
}

#[tokio::test]
async fn test_login_credential_belongs_to_one_account() {
    let (store, _tokens) = setup().await;
    let clash = store
        .put(
            Collection::Users,
            "mallory",
            json!({"type": "account", "loginCredentials": [{"id": "bob-cred"}], "profile": {}}),
        )
        .await;
    assert!(matches!(clash, Err(AuthzError::InvariantViolation(_))));

    // As a non-login credential it is fine.
    store
        .put(
            Collection::Users,
            "mallory",
            json!({"type": "account", "loginCredentials": [{"id": "mallory-cred"}],
                   "nonloginCredentials": [{"id": "bob-cred"}], "profile": {}}),
        )
        .await
        .unwrap();
}
