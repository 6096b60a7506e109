//! Live validity and permission evaluation.
//!
//! Nothing here is cached. Every call re-reads the tokens, grains and accounts it depends on,
//! so a revoked parent or a lost permission shows up on the very next restore without any write
//! to the dependent token.
//!
//! Permissions flow along a sharing graph whose vertices are accounts and tokens:
//!
//! - the grain owner holds every permission;
//! - a token holds `sharer ∩ role`, where the sharer is its parent token if it has one and the
//!   sharing account otherwise;
//! - any other account holds the union over the live UiView tokens it has received;
//! - on legacy non-private grains every account also holds the default role.
//!
//! The graph may contain cycles (two users re-sharing to each other, or requirements pointing
//! back at their own token). Each walk carries the vertices on its current path and treats a
//! revisit as contributing nothing.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::errors::{AuthzError, AuthzResult};
use crate::models::grain::Grain;
use crate::models::permissions::{PermissionSet, RoleAssignment};
use crate::models::token::{ApiToken, MembraneRequirement, PermissionHolder};
use crate::models::user::UserRecord;
use crate::store::{Collection, DocumentStore, Filter};

/// Validity of one token at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    RevokedDirect,
    /// Carries the rendered requirement that failed.
    RevokedByRequirement(String),
    RevokedByAncestor,
    Expired,
}

impl TokenState {
    pub fn is_valid(&self) -> bool {
        matches!(self, TokenState::Valid)
    }

    /// The restore error for a non-valid state.
    pub fn into_result(self) -> AuthzResult<()> {
        match self {
            TokenState::Valid => Ok(()),
            TokenState::RevokedDirect => Err(AuthzError::Revoked),
            TokenState::RevokedByRequirement(requirement) => {
                Err(AuthzError::RequirementNotMet { requirement })
            }
            TokenState::RevokedByAncestor => Err(AuthzError::RevokedByAncestor),
            TokenState::Expired => Err(AuthzError::Expired),
        }
    }
}

/// Vertices on the walk in progress.
type Path = Vec<String>;

pub struct Evaluator<'s> {
    store: &'s dyn DocumentStore,
    now: DateTime<Utc>,
}

impl<'s> Evaluator<'s> {
    pub fn new(store: &'s dyn DocumentStore, now: DateTime<Utc>) -> Self {
        Self { store, now }
    }

    pub async fn load_token(&self, id: &str) -> AuthzResult<Option<ApiToken>> {
        match self.store.get(Collection::ApiTokens, id).await? {
            Some(doc) => Ok(Some(ApiToken::from_doc(&doc)?)),
            None => Ok(None),
        }
    }

    pub async fn load_grain(&self, id: &str) -> AuthzResult<Option<Grain>> {
        match self.store.get(Collection::Grains, id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    /// Full state of `token`, in restore order: direct flags, requirements, expiry, ancestors.
    pub async fn state(&self, token: &ApiToken) -> AuthzResult<TokenState> {
        let mut path = Path::new();
        self.state_on(token, &mut path).await
    }

    fn state_on<'a>(
        &'a self,
        token: &'a ApiToken,
        path: &'a mut Path,
    ) -> BoxFuture<'a, AuthzResult<TokenState>> {
        async move {
            let vertex = format!("s:{}", token.id);
            if path.contains(&vertex) {
                return Ok(TokenState::RevokedByAncestor);
            }
            if token.is_revoked_directly() {
                return Ok(TokenState::RevokedDirect);
            }

            path.push(vertex);
            let result = self.state_after_flags(token, path).await;
            path.pop();
            result
        }
        .boxed()
    }

    async fn state_after_flags(&self, token: &ApiToken, path: &mut Path) -> AuthzResult<TokenState> {
        for requirement in &token.requirements {
            if !self.requirement_holds(requirement, path).await? {
                tracing::debug!(token_id = %token.id, %requirement, "requirement no longer holds");
                return Ok(TokenState::RevokedByRequirement(requirement.to_string()));
            }
        }
        if token.is_expired_at(self.now) {
            return Ok(TokenState::Expired);
        }
        if let Some(parent_id) = token.provider.parent_token() {
            let parent = match self.load_token(parent_id).await? {
                Some(p) => p,
                None => return Ok(TokenState::RevokedByAncestor),
            };
            if !self.state_on(&parent, path).await?.is_valid() {
                return Ok(TokenState::RevokedByAncestor);
            }
        }
        Ok(TokenState::Valid)
    }

    pub async fn requirements_hold(&self, requirements: &[MembraneRequirement]) -> AuthzResult<bool> {
        let mut path = Path::new();
        for r in requirements {
            if !self.requirement_holds(r, &mut path).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn requirement_holds<'a>(
        &'a self,
        requirement: &'a MembraneRequirement,
        path: &'a mut Path,
    ) -> BoxFuture<'a, AuthzResult<bool>> {
        async move {
            match requirement {
                MembraneRequirement::TokenValid(id) => match self.load_token(id).await? {
                    Some(t) => Ok(self.state_on(&t, path).await?.is_valid()),
                    None => Ok(false),
                },
                MembraneRequirement::UserIsAdmin(account_id) => {
                    let doc = self.store.get(Collection::Users, account_id).await?;
                    Ok(match doc.map(UserRecord::from_doc).transpose()? {
                        Some(UserRecord::Account(a)) => a.is_admin,
                        _ => false,
                    })
                }
                MembraneRequirement::PermissionsHeld {
                    grain_id,
                    holder,
                    permissions,
                } => {
                    let Some(grain) = self.load_grain(grain_id).await? else {
                        return Ok(false);
                    };
                    let held = match holder {
                        PermissionHolder::Account(a) => self.account_permissions_on(&grain, a, path).await?,
                        PermissionHolder::Token(t) => match self.load_token(t).await? {
                            Some(token) => self.live_token_permissions(&grain, &token, path).await?,
                            None => PermissionSet::empty(),
                        },
                    };
                    Ok(held.covers(permissions))
                }
            }
        }
        .boxed()
    }

    /// Permissions `account_id` currently holds on `grain`.
    pub async fn account_permissions(&self, grain: &Grain, account_id: &str) -> AuthzResult<PermissionSet> {
        let mut path = Path::new();
        self.account_permissions_on(grain, account_id, &mut path).await
    }

    fn account_permissions_on<'a>(
        &'a self,
        grain: &'a Grain,
        account_id: &'a str,
        path: &'a mut Path,
    ) -> BoxFuture<'a, AuthzResult<PermissionSet>> {
        async move {
            let view = grain.view_info();
            if grain.is_owned_by(account_id) {
                return Ok(PermissionSet::all(view.permissions.len()));
            }
            let vertex = format!("i:{}:{}", grain.id, account_id);
            if path.contains(&vertex) {
                return Ok(PermissionSet::empty());
            }
            path.push(vertex);

            let mut held = if grain.private == Some(true) {
                PermissionSet::empty()
            } else {
                PermissionSet::from_role_assignment(&RoleAssignment::none(), &view)
            };
            // An error aborts the whole evaluation, so the path needs no cleanup on `?`.
            let received = self
                .store
                .find(
                    Collection::ApiTokens,
                    &Filter::and([
                        Filter::eq("grainId", grain.id.as_str()),
                        Filter::eq("owner.user.accountId", account_id),
                    ]),
                )
                .await?;
            for doc in received {
                let token = ApiToken::from_doc(&doc)?;
                if token.is_ui_view() {
                    held.add(&self.live_token_permissions(grain, &token, path).await?);
                }
            }
            path.pop();
            Ok(held)
        }
        .boxed()
    }

    /// Permissions carried by `token`, or nothing if it is not currently valid.
    pub async fn token_permissions(&self, grain: &Grain, token: &ApiToken) -> AuthzResult<PermissionSet> {
        let mut path = Path::new();
        self.live_token_permissions(grain, token, &mut path).await
    }

    fn live_token_permissions<'a>(
        &'a self,
        grain: &'a Grain,
        token: &'a ApiToken,
        path: &'a mut Path,
    ) -> BoxFuture<'a, AuthzResult<PermissionSet>> {
        async move {
            let Some(role) = token.role_assignment() else {
                return Ok(PermissionSet::empty());
            };
            if token.provider.grain_id() != Some(grain.id.as_str()) {
                return Ok(PermissionSet::empty());
            }
            let vertex = format!("t:{}", token.id);
            if path.contains(&vertex) {
                return Ok(PermissionSet::empty());
            }
            if !self.state_on(token, path).await?.is_valid() {
                return Ok(PermissionSet::empty());
            }

            path.push(vertex);
            let sharer = match token.provider.parent_token() {
                Some(parent_id) => match self.load_token(parent_id).await? {
                    Some(parent) => self.live_token_permissions(grain, &parent, path).await?,
                    None => PermissionSet::empty(),
                },
                None => match token.sharer_account() {
                    Some(account) => self.account_permissions_on(grain, account, path).await?,
                    None => PermissionSet::empty(),
                },
            };
            path.pop();

            let own = PermissionSet::from_role_assignment(role, &grain.view_info());
            Ok(sharer.intersection(&own))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    async fn seed(store: &MemoryStore) {
        store
            .put(
                Collection::Grains,
                "g",
                json!({
                    "_id": "g", "userId": "alice", "title": "Doc", "private": true,
                    "cachedViewInfo": {
                        "permissions": [{}, {}],
                        "roles": [{"permissions": [true, true]}, {"permissions": [false, true], "default": true}],
                    },
                }),
            )
            .await
            .unwrap();
        store
            .put(Collection::Users, "alice", json!({"type": "account", "isAdmin": true}))
            .await
            .unwrap();
    }

    async fn put_token(store: &MemoryStore, doc: serde_json::Value) -> ApiToken {
        let id = doc["_id"].as_str().unwrap().to_string();
        store.put(Collection::ApiTokens, &id, doc).await.unwrap();
        ApiToken::from_doc(&store.get(Collection::ApiTokens, &id).await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_share_chain_permissions() {
        let store = MemoryStore::new();
        seed(&store).await;
        put_token(&store, json!({"_id": "ab", "grainId": "g", "accountId": "alice",
            "roleAssignment": {"roleId": 0}, "owner": {"user": {"accountId": "bob", "title": "t"}}})).await;
        put_token(&store, json!({"_id": "bc", "grainId": "g", "accountId": "bob",
            "roleAssignment": {"roleId": 1}, "owner": {"user": {"accountId": "carol", "title": "t"}}})).await;

        let eval = Evaluator::new(&store, Utc::now());
        let grain = eval.load_grain("g").await.unwrap().unwrap();
        assert_eq!(eval.account_permissions(&grain, "alice").await.unwrap(), PermissionSet::all(2));
        assert_eq!(eval.account_permissions(&grain, "bob").await.unwrap().as_slice(), &[true, true]);
        assert_eq!(eval.account_permissions(&grain, "carol").await.unwrap().as_slice(), &[false, true]);
        assert!(eval.account_permissions(&grain, "dave").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sharing_cycle_terminates() {
        let store = MemoryStore::new();
        seed(&store).await;
        for (id, from, to) in [("bc", "bob", "carol"), ("cb", "carol", "bob")] {
            put_token(&store, json!({"_id": id, "grainId": "g", "accountId": from,
                "roleAssignment": {"allAccess": null}, "owner": {"user": {"accountId": to, "title": "t"}}})).await;
        }
        let eval = Evaluator::new(&store, Utc::now());
        let grain = eval.load_grain("g").await.unwrap().unwrap();
        assert!(eval.account_permissions(&grain, "bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_order_and_ancestors() {
        let store = MemoryStore::new();
        seed(&store).await;
        let parent = put_token(&store, json!({"_id": "p", "grainId": "g", "accountId": "alice",
            "roleAssignment": {"allAccess": null}, "revoked": true})).await;
        let child = put_token(&store, json!({"_id": "c", "parentToken": "p", "grainId": "g", "accountId": "alice"})).await;
        let eval = Evaluator::new(&store, Utc::now());
        assert_eq!(eval.state(&parent).await.unwrap(), TokenState::RevokedDirect);
        assert_eq!(eval.state(&child).await.unwrap(), TokenState::RevokedByAncestor);

        let orphan = put_token(&store, json!({"_id": "o", "parentToken": "gone"})).await;
        assert_eq!(eval.state(&orphan).await.unwrap(), TokenState::RevokedByAncestor);

        let expired = put_token(&store, json!({"_id": "e", "grainId": "g",
            "expires": "2000-01-01T00:00:00Z", "requirements": [{"userIsAdmin": "bob"}]})).await;
        assert!(matches!(eval.state(&expired).await.unwrap(), TokenState::RevokedByRequirement(_)));
    }

    #[tokio::test]
    async fn test_requirements() {
        let store = MemoryStore::new();
        seed(&store).await;
        let eval = Evaluator::new(&store, Utc::now());
        let held = |account: &str, perms: Vec<bool>| MembraneRequirement::PermissionsHeld {
            grain_id: "g".into(),
            holder: PermissionHolder::Account(account.into()),
            permissions: perms,
        };
        assert!(eval.requirements_hold(&[held("alice", vec![true, true])]).await.unwrap());
        assert!(!eval.requirements_hold(&[held("bob", vec![false, true])]).await.unwrap());
        assert!(eval.requirements_hold(&[MembraneRequirement::UserIsAdmin("alice".into())]).await.unwrap());
        assert!(!eval.requirements_hold(&[MembraneRequirement::TokenValid("nope".into())]).await.unwrap());
        let missing_grain = MembraneRequirement::PermissionsHeld {
            grain_id: "gone".into(),
            holder: PermissionHolder::Account("alice".into()),
            permissions: vec![],
        };
        assert!(!eval.requirements_hold(&[missing_grain]).await.unwrap());
    }

    #[tokio::test]
    async fn test_self_referencing_requirement_fails_closed() {
        let store = MemoryStore::new();
        seed(&store).await;
        let t = put_token(&store, json!({"_id": "loop", "grainId": "g", "accountId": "alice",
            "requirements": [{"tokenValid": "loop"}]})).await;
        let eval = Evaluator::new(&store, Utc::now());
        assert!(matches!(eval.state(&t).await.unwrap(), TokenState::RevokedByRequirement(_)));
    }
}
