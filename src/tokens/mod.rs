//! The capability token store.
//!
//! Tokens are content-addressed by the hash of their secret and form a forest through
//! `parentToken`. Validity is never stored: `restore` re-derives it from live state on every call
//! (see [`requirements`]).

pub mod requirements;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{AuthzError, AuthzResult};
use crate::models::api_host::{ApiHost, ApiHostSpec};
use crate::models::grain::{Grain, OldUser, OldUserProfile};
use crate::models::permissions::{PermissionSet, RoleAssignment};
use crate::models::token::{
    ApiToken, ChildProvider, ChildUiView, FrontendRef, GrainTarget, HttpAuth, MembraneRequirement,
    Provider, TokenOwner, UserOwner,
};
use crate::models::user::UserRecord;
use crate::store::document::{doc_id, get_str};
use crate::store::{Collection, Document, Filter, SharedStore, UpdateOutcome};
use crate::vault::cipher::{self, FieldNonce};
use crate::vault::{self, TokenSecret};
use requirements::Evaluator;

// ── Requests ─────────────────────────────────────────────────

/// What a new token grants, before it is tied to a parent or encrypted.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderSpec {
    UiView {
        grain_id: String,
        account_id: Option<String>,
        role_assignment: RoleAssignment,
    },
    Object { grain_id: String, object_id: Value },
    FrontendRef(FrontendRef),
    /// A child of the parent whose secret is given in [`NewToken::parent`].
    Child { role_assignment: Option<RoleAssignment> },
}

#[derive(Debug, Clone)]
pub struct NewToken {
    pub parent: Option<TokenSecret>,
    pub owner: TokenOwner,
    pub provider: ProviderSpec,
    pub requirements: Vec<MembraneRequirement>,
    pub petname: Option<String>,
    pub for_sharing: bool,
    pub expires: Option<DateTime<Utc>>,
    pub expires_if_unused: Option<DateTime<Utc>>,
    pub api_host: Option<ApiHostSpec>,
}

impl NewToken {
    pub fn new(owner: TokenOwner, provider: ProviderSpec) -> Self {
        Self {
            parent: None,
            owner,
            provider,
            requirements: Vec::new(),
            petname: None,
            for_sharing: false,
            expires: None,
            expires_if_unused: None,
            api_host: None,
        }
    }
}

/// Who is minting a token through `newApiToken`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Issuer {
    AccountId(String),
    RawParentToken(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebkeyRequest {
    #[serde(default)]
    pub for_sharing: bool,
    /// Milliseconds after creation the token lapses if never used.
    #[serde(default)]
    pub expires_if_unused_duration: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub account_id: String,
    #[serde(default)]
    pub title: String,
}

/// Owners `newApiToken` accepts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestedOwner {
    Webkey(Option<WebkeyRequest>),
    User(UserRequest),
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    #[serde(rename = "_id")]
    pub id: String,
    /// The secret. This is the only place it is ever disclosed.
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUpdate {
    pub revoked: Option<bool>,
    pub petname: Option<String>,
}

/// Selects tokens for `remove`.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenQuery {
    Id(String),
    Grain(String),
    OwnedBy(String),
    TrashedBefore(DateTime<Utc>),
    ExpiredIfUnusedBefore(DateTime<Utc>),
    /// Trashed tokens of one grain held by one account.
    ForgottenGrain { grain_id: String, account_id: String },
}

impl TokenQuery {
    pub fn to_filter(&self) -> Filter {
        match self {
            TokenQuery::Id(id) => Filter::id(id),
            TokenQuery::Grain(g) => Filter::eq("grainId", g.as_str()),
            TokenQuery::OwnedBy(a) => Filter::eq("owner.user.accountId", a.as_str()),
            TokenQuery::TrashedBefore(t) => Filter::lt("trashed", json!(t)),
            TokenQuery::ExpiredIfUnusedBefore(t) => Filter::lt("expiresIfUnused", json!(t)),
            TokenQuery::ForgottenGrain { grain_id, account_id } => Filter::and([
                Filter::eq("grainId", grain_id.as_str()),
                Filter::eq("owner.user.accountId", account_id.as_str()),
                Filter::exists("trashed"),
            ]),
        }
    }
}

// ── Results ──────────────────────────────────────────────────

/// What a successfully restored token grants.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedCapability {
    UiView {
        grain_id: String,
        /// The identity the grain knows the holder by, for user-owned tokens.
        identity_id: Option<String>,
        permissions: PermissionSet,
    },
    Object { grain_id: String, object_id: Value },
    /// Secrets inside are decrypted.
    Frontend(FrontendRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Restored {
    pub token_id: String,
    pub owner: TokenOwner,
    pub capability: ResolvedCapability,
}

/// Summary of a token for listings. Tokens whose grain is gone have none.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapDetails {
    pub token_id: String,
    pub grain_id: String,
    pub grain_title: String,
    pub petname: Option<String>,
}

// ── Store ────────────────────────────────────────────────────

pub struct TokenStore {
    store: SharedStore,
}

fn encrypt_auth(secret: &TokenSecret, auth: HttpAuth) -> HttpAuth {
    match auth {
        HttpAuth::None => HttpAuth::None,
        HttpAuth::Bearer(t) => HttpAuth::Bearer(cipher::encrypt_str(secret, FieldNonce::Zero, &t)),
        HttpAuth::Basic { username, password } => HttpAuth::Basic {
            username,
            password: cipher::encrypt_password(secret, &password),
        },
        HttpAuth::Refresh(t) => HttpAuth::Refresh(cipher::encrypt_str(secret, FieldNonce::Zero, &t)),
    }
}

fn decrypt_auth(secret: &TokenSecret, auth: HttpAuth) -> AuthzResult<HttpAuth> {
    Ok(match auth {
        HttpAuth::None => HttpAuth::None,
        HttpAuth::Bearer(t) => HttpAuth::Bearer(cipher::decrypt_str(secret, FieldNonce::Zero, &t)?),
        HttpAuth::Basic { username, password } => HttpAuth::Basic {
            username,
            password: cipher::decrypt_password(secret, &password)?,
        },
        HttpAuth::Refresh(t) => HttpAuth::Refresh(cipher::decrypt_str(secret, FieldNonce::Zero, &t)?),
    })
}

impl TokenStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn evaluator(&self, now: DateTime<Utc>) -> Evaluator<'_> {
        Evaluator::new(&*self.store, now)
    }

    pub async fn get(&self, token_id: &str) -> AuthzResult<Option<ApiToken>> {
        self.evaluator(Utc::now()).load_token(token_id).await
    }

    async fn grain(&self, grain_id: &str) -> AuthzResult<Option<Grain>> {
        self.evaluator(Utc::now()).load_grain(grain_id).await
    }

    /// Mints a token and returns its secret together with its id.
    pub async fn create(&self, req: NewToken) -> AuthzResult<(TokenSecret, String)> {
        let secret = TokenSecret::generate();
        let id = secret.token_id();

        let provider = match req.provider {
            ProviderSpec::UiView {
                grain_id,
                account_id,
                role_assignment,
            } => Provider::Grain {
                grain_id,
                target: GrainTarget::UiView {
                    account_id,
                    role_assignment,
                },
            },
            ProviderSpec::Object { grain_id, object_id } => Provider::Grain {
                grain_id,
                target: GrainTarget::Object(object_id),
            },
            ProviderSpec::FrontendRef(FrontendRef::Http { url, auth }) => {
                Provider::FrontendRef(FrontendRef::Http {
                    url,
                    auth: encrypt_auth(&secret, auth),
                })
            }
            ProviderSpec::FrontendRef(other) => Provider::FrontendRef(other),
            ProviderSpec::Child { role_assignment } => {
                let parent_secret = req
                    .parent
                    .as_ref()
                    .ok_or_else(|| AuthzError::invariant("child token requested without a parent"))?;
                let parent_id = parent_secret.token_id();
                let parent = self.get(&parent_id).await?.ok_or(AuthzError::NotFound)?;
                let ui_view = match (parent.provider.grain_id(), parent.role_assignment()) {
                    (Some(grain_id), Some(_)) => Some(ChildUiView {
                        grain_id: grain_id.to_string(),
                        account_id: parent.sharer_account().map(str::to_string),
                        role_assignment: role_assignment.unwrap_or_else(RoleAssignment::all_access),
                    }),
                    _ => None,
                };
                Provider::Child(ChildProvider {
                    parent_token: parent_id,
                    parent_token_key: Some(cipher::encrypt_str(
                        &secret,
                        FieldNonce::Zero,
                        parent_secret.as_str(),
                    )),
                    ui_view,
                })
            }
        };

        let mut token = ApiToken {
            id: id.clone(),
            owner: req.owner,
            provider,
            requirements: req.requirements,
            for_sharing: req.for_sharing,
            petname: req.petname,
            created: Some(Utc::now()),
            revoked: false,
            trashed: None,
            suspended: false,
            expires: req.expires,
            expires_if_unused: req.expires_if_unused,
            last_used: None,
            has_api_host: false,
        };

        if let Some(spec) = req.api_host {
            let host = ApiHost {
                id: vault::api_host_id(secret.as_str()),
                hash2: vault::api_host_hash2(&id),
                spec,
            };
            self.store
                .put(Collection::ApiHosts, &host.id, serde_json::to_value(&host)?)
                .await?;
            token.has_api_host = true;
        }

        if !self.store.insert(Collection::ApiTokens, &id, token.to_doc()?).await? {
            return Err(AuthzError::invariant("token id collision"));
        }
        tracing::info!(token_id = %id, "created token");
        Ok((secret, id))
    }

    /// The identity id by which `account_id` is known inside `grain`.
    pub async fn get_or_generate_identity_id(&self, account_id: &str, grain: &Grain) -> AuthzResult<String> {
        if grain.is_owned_by(account_id) {
            if let Some(id) = &grain.identity_id {
                return Ok(id.clone());
            }
        }

        let existing = self
            .store
            .find_one(
                Collection::ApiTokens,
                &Filter::and([
                    Filter::eq("grainId", grain.id.as_str()),
                    Filter::eq("owner.user.accountId", account_id),
                    Filter::exists("owner.user.identityId"),
                ]),
            )
            .await?;
        if let Some(id) = existing.as_ref().and_then(|t| get_str(t, "owner.user.identityId")) {
            return Ok(id.to_string());
        }

        let account = match self.store.get(Collection::Users, account_id).await? {
            Some(doc) => UserRecord::from_doc(doc)?.into_account(),
            None => None,
        };
        if let Some(account) = &account {
            if let Some(old) = grain.old_user_for(&account.credential_ids()) {
                let taken = self
                    .store
                    .find_one(
                        Collection::ApiTokens,
                        &Filter::and([
                            Filter::eq("grainId", grain.id.as_str()),
                            Filter::eq("owner.user.identityId", old.identity_id.as_str()),
                        ]),
                    )
                    .await?
                    .is_some();
                if !taken {
                    return Ok(old.identity_id.clone());
                }
            }
            // Legacy public grains derived identity ids from the profile's identicon.
            if grain.private != Some(true) {
                if let Some(identicon) = &account.profile.identicon {
                    return Ok(identicon.clone());
                }
            }
        }
        Ok(vault::random_id())
    }

    /// `newApiToken`: shares a grain with a webkey or with a specific user.
    pub async fn new_api_token(
        &self,
        issuer: Issuer,
        grain_id: &str,
        petname: Option<String>,
        role_assignment: RoleAssignment,
        owner: RequestedOwner,
        api_host: Option<ApiHostSpec>,
    ) -> AuthzResult<IssuedToken> {
        let grain = self.grain(grain_id).await?.ok_or(AuthzError::NotFound)?;

        let (provider, parent, parent_for_sharing) = match issuer {
            Issuer::AccountId(account_id) => (
                ProviderSpec::UiView {
                    grain_id: grain_id.to_string(),
                    account_id: Some(account_id),
                    role_assignment,
                },
                None,
                false,
            ),
            Issuer::RawParentToken(raw) => {
                let parent_secret = TokenSecret::parse(&raw).ok_or(AuthzError::NotFound)?;
                let parent = self
                    .get(&parent_secret.token_id())
                    .await?
                    .ok_or(AuthzError::NotFound)?;
                let same_grain = parent.provider.grain_id() == Some(grain_id);
                if !same_grain || !parent.is_ui_view() {
                    return Err(AuthzError::NotFound);
                }
                (
                    ProviderSpec::Child {
                        role_assignment: Some(role_assignment),
                    },
                    Some(parent_secret),
                    parent.for_sharing,
                )
            }
        };

        let mut req = NewToken::new(TokenOwner::Webkey, provider);
        req.parent = parent;
        req.petname = petname;
        req.api_host = api_host;

        let mut identity_to_forget = None;
        match owner {
            RequestedOwner::Webkey(options) => {
                let options = options.unwrap_or_default();
                req.for_sharing = parent_for_sharing || options.for_sharing;
                req.expires_if_unused = options
                    .expires_if_unused_duration
                    .map(|ms| Utc::now() + Duration::milliseconds(ms));
            }
            RequestedOwner::User(user) => {
                let identity_id = self.get_or_generate_identity_id(&user.account_id, &grain).await?;
                identity_to_forget = Some(identity_id.clone());
                let upstream_title = (grain.title != user.title).then(|| grain.title.clone());
                req.owner = TokenOwner::User(UserOwner {
                    account_id: user.account_id,
                    identity_id: Some(identity_id),
                    title: user.title,
                    upstream_title,
                    renamed: None,
                    seen_all_activity: None,
                    denormalized_grain_metadata: Some(grain.denormalized_metadata()),
                });
            }
        }

        let (secret, id) = self.create(req).await?;

        if let Some(identity_id) = identity_to_forget {
            self.store
                .update(Collection::Grains, grain_id, &|doc: &mut Document| {
                    let Some(old) = doc.get_mut("oldUsers").and_then(Value::as_array_mut) else {
                        return Ok(false);
                    };
                    let before = old.len();
                    old.retain(|u| u["identityId"] != identity_id.as_str());
                    Ok(old.len() != before)
                })
                .await?;
        }

        Ok(IssuedToken {
            id,
            token: secret.as_str().to_string(),
        })
    }

    /// Redeems a secret. Walks the full parent chain on every call.
    pub async fn restore(&self, presented: &str) -> AuthzResult<Restored> {
        let secret = TokenSecret::parse(presented).ok_or(AuthzError::NotFound)?;
        let now = Utc::now();
        let eval = self.evaluator(now);
        let token = eval.load_token(&secret.token_id()).await?.ok_or(AuthzError::NotFound)?;

        if let Err(e) = eval.state(&token).await?.into_result() {
            tracing::debug!(token_id = %token.id, error = %e, "restore refused");
            return Err(e);
        }

        // Follow the chain to its root, unlocking each parent's secret when a key is stored.
        let mut current = token.clone();
        let mut current_secret = Some(secret);
        while let Provider::Child(child) = &current.provider {
            let parent_secret = match (&current_secret, &child.parent_token_key) {
                (Some(s), Some(key)) => {
                    let text = cipher::decrypt_str(s, FieldNonce::Zero, key)?;
                    let parent_secret = TokenSecret::parse(&text)
                        .filter(|p| p.token_id() == child.parent_token)
                        .ok_or_else(|| {
                            AuthzError::invariant(format!(
                                "parentTokenKey of {} does not unlock its parent",
                                current.id
                            ))
                        })?;
                    Some(parent_secret)
                }
                _ => None,
            };
            let parent = eval
                .load_token(&child.parent_token)
                .await?
                .ok_or(AuthzError::RevokedByAncestor)?;
            current = parent;
            current_secret = parent_secret;
        }

        let capability = match current.provider {
            Provider::Grain {
                grain_id,
                target: GrainTarget::UiView { .. },
            } => {
                let grain = eval.load_grain(&grain_id).await?.ok_or(AuthzError::NotFound)?;
                ResolvedCapability::UiView {
                    permissions: eval.token_permissions(&grain, &token).await?,
                    identity_id: token.owner.user().and_then(|u| u.identity_id.clone()),
                    grain_id,
                }
            }
            Provider::Grain {
                grain_id,
                target: GrainTarget::Object(object_id),
            } => ResolvedCapability::Object { grain_id, object_id },
            Provider::FrontendRef(FrontendRef::Http { url, auth }) => {
                let auth = match (current_secret, auth) {
                    (_, HttpAuth::None) => HttpAuth::None,
                    (Some(s), auth) => decrypt_auth(&s, auth)?,
                    (None, _) => {
                        return Err(AuthzError::invariant(
                            "token chain does not carry the key for its HTTP credentials",
                        ))
                    }
                };
                ResolvedCapability::Frontend(FrontendRef::Http { url, auth })
            }
            Provider::FrontendRef(other) => ResolvedCapability::Frontend(other),
            Provider::Child(_) => return Err(AuthzError::invariant("unterminated token chain")),
        };

        self.store
            .update(Collection::ApiTokens, &token.id, &|doc: &mut Document| {
                let Some(map) = doc.as_object_mut() else {
                    return Ok(false);
                };
                map.insert("lastUsed".into(), json!(now));
                map.remove("expiresIfUnused");
                Ok(true)
            })
            .await?;
        tracing::debug!(token_id = %token.id, "restored token");

        Ok(Restored {
            token_id: token.id,
            owner: token.owner,
            capability,
        })
    }

    /// `updateApiToken`: only the sharing account or the grain owner may change a token.
    pub async fn update_api_token(&self, acting_account: &str, token_id: &str, update: TokenUpdate) -> AuthzResult<()> {
        let token = self.get(token_id).await?.ok_or(AuthzError::NotFound)?;
        let is_sharer = token.sharer_account() == Some(acting_account);
        let is_grain_owner = match token.provider.grain_id() {
            Some(g) => self.grain(g).await?.map_or(false, |g| g.is_owned_by(acting_account)),
            None => false,
        };
        if !is_sharer && !is_grain_owner {
            tracing::warn!(token_id, account_id = acting_account, "token update refused");
            return Err(AuthzError::NotFound);
        }

        let outcome = self
            .store
            .update(Collection::ApiTokens, token_id, &|doc: &mut Document| {
                let Some(map) = doc.as_object_mut() else {
                    return Ok(false);
                };
                if let Some(revoked) = update.revoked {
                    map.insert("revoked".into(), json!(revoked));
                }
                if let Some(petname) = &update.petname {
                    map.insert("petname".into(), json!(petname));
                }
                Ok(update.revoked.is_some() || update.petname.is_some())
            })
            .await?;
        if outcome == UpdateOutcome::Missing {
            return Err(AuthzError::NotFound);
        }
        tracing::info!(token_id, account_id = acting_account, revoked = ?update.revoked, "updated token");
        Ok(())
    }

    /// Sets `revoked`. Children are not touched; they fail at their next restore.
    pub async fn revoke(&self, token_id: &str) -> AuthzResult<()> {
        let outcome = self
            .store
            .update(Collection::ApiTokens, token_id, &|doc: &mut Document| {
                if doc["revoked"] == true {
                    return Ok(false);
                }
                doc["revoked"] = json!(true);
                Ok(true)
            })
            .await?;
        if outcome == UpdateOutcome::Missing {
            return Err(AuthzError::NotFound);
        }
        tracing::info!(token_id, "revoked token");
        Ok(())
    }

    /// Moves the tokens `account_id` holds for these grains to the trash.
    pub async fn trash_tokens(&self, grain_ids: &[String], account_id: &str) -> AuthzResult<usize> {
        let now = json!(Utc::now());
        let filter = Filter::and([
            Filter::In("grainId".into(), grain_ids.iter().map(|g| json!(g)).collect()),
            Filter::eq("owner.user.accountId", account_id),
            Filter::missing("trashed"),
        ]);
        self.store
            .update_where(Collection::ApiTokens, &filter, &|doc: &mut Document| {
                doc["trashed"] = now.clone();
                Ok(true)
            })
            .await
    }

    pub async fn untrash_tokens(&self, grain_ids: &[String], account_id: &str) -> AuthzResult<usize> {
        let filter = Filter::and([
            Filter::In("grainId".into(), grain_ids.iter().map(|g| json!(g)).collect()),
            Filter::eq("owner.user.accountId", account_id),
            Filter::exists("trashed"),
        ]);
        self.store
            .update_where(Collection::ApiTokens, &filter, &|doc: &mut Document| {
                Ok(doc.as_object_mut().and_then(|m| m.remove("trashed")).is_some())
            })
            .await
    }

    /// Deletes matching tokens and their ApiHosts. With `save_old_users`, the identities of
    /// user-owned tokens are collected before deletion and appended to each grain's `oldUsers`.
    pub async fn remove(&self, query: &TokenQuery, save_old_users: bool) -> AuthzResult<usize> {
        let filter = query.to_filter();
        let docs = self.store.find(Collection::ApiTokens, &filter).await?;

        // grain -> identity -> account
        let mut grains: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut accounts: BTreeSet<String> = BTreeSet::new();
        for doc in &docs {
            let Some(id) = doc_id(doc) else { continue };
            if doc["hasApiHost"] == true {
                self.store
                    .delete_where(
                        Collection::ApiHosts,
                        &Filter::eq("hash2", vault::api_host_hash2(id)),
                    )
                    .await?;
            }
            if doc.pointer("/frontendRef/http").is_some() {
                // Remote OAuth grants behind these credentials are not revoked; each service
                // needs its own revocation call.
                tracing::warn!(token_id = id, "deleting HTTP credential token without remote revocation");
            }
            if save_old_users {
                let grain_id = get_str(doc, "grainId");
                let account = get_str(doc, "owner.user.accountId");
                let identity = get_str(doc, "owner.user.identityId");
                if let (Some(g), Some(a), Some(i)) = (grain_id, account, identity) {
                    grains.entry(g.to_string()).or_default().insert(i.to_string(), a.to_string());
                    accounts.insert(a.to_string());
                }
            }
        }

        let mut removed = 0;
        for doc in &docs {
            if let Some(id) = doc_id(doc) {
                if self.store.delete(Collection::ApiTokens, id).await? {
                    removed += 1;
                }
            }
        }

        if save_old_users {
            let mut infos: BTreeMap<String, (Vec<String>, OldUserProfile)> = BTreeMap::new();
            for account_id in &accounts {
                let Some(doc) = self.store.get(Collection::Users, account_id).await? else {
                    continue;
                };
                let Some(account) = UserRecord::from_doc(doc)?.into_account() else {
                    continue;
                };
                let credential_ids = account.login_credentials.iter().map(|c| c.id.clone()).collect();
                let profile = OldUserProfile {
                    display_name: account.profile.name.map(|n| json!({ "defaultText": n })),
                    preferred_handle: account.profile.handle,
                    pronouns: account.profile.pronoun,
                };
                infos.insert(account_id.clone(), (credential_ids, profile));
            }

            for (grain_id, identities) in grains {
                let entries = identities
                    .iter()
                    .filter_map(|(identity_id, account_id)| {
                        let (credential_ids, profile) = infos.get(account_id)?;
                        Some(serde_json::to_value(OldUser {
                            identity_id: identity_id.clone(),
                            credential_ids: credential_ids.clone(),
                            profile: profile.clone(),
                        }))
                    })
                    .collect::<Result<Vec<Value>, _>>()?;
                if entries.is_empty() {
                    continue;
                }
                self.store
                    .update(Collection::Grains, &grain_id, &|doc: &mut Document| {
                        let map = doc
                            .as_object_mut()
                            .ok_or_else(|| AuthzError::invariant("grain is not an object"))?;
                        let old = map.entry("oldUsers").or_insert_with(|| json!([]));
                        let list = old
                            .as_array_mut()
                            .ok_or_else(|| AuthzError::invariant("oldUsers is not a list"))?;
                        list.extend(entries.iter().cloned());
                        Ok(true)
                    })
                    .await?;
            }
        }

        if removed > 0 {
            tracing::info!(removed, ?query, "removed tokens");
        }
        Ok(removed)
    }

    /// Forgets a trashed grain from an account's point of view.
    pub async fn forget_grain(&self, grain_id: &str, account_id: &str) -> AuthzResult<usize> {
        self.remove(
            &TokenQuery::ForgottenGrain {
                grain_id: grain_id.to_string(),
                account_id: account_id.to_string(),
            },
            true,
        )
        .await
    }

    /// `None` when the token or its grain no longer exists.
    pub async fn cap_details(&self, token_id: &str) -> AuthzResult<Option<CapDetails>> {
        let Some(token) = self.get(token_id).await? else {
            return Ok(None);
        };
        let Some(grain_id) = token.provider.grain_id() else {
            return Ok(None);
        };
        Ok(self.grain(grain_id).await?.map(|grain| CapDetails {
            token_id: token.id.clone(),
            grain_id: grain.id,
            grain_title: grain.title,
            petname: token.petname.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::DocumentStore;

    async fn setup() -> (Arc<MemoryStore>, TokenStore) {
        let store = Arc::new(MemoryStore::new());
        store
            .put(
                Collection::Grains,
                "g",
                json!({"_id": "g", "userId": "alice", "identityId": "alice-in-g", "title": "Notes",
                       "private": true, "appTitle": {"defaultText": "Etherpad"},
                       "cachedViewInfo": {"permissions": [{}, {}],
                                          "roles": [{"permissions": [true, true]},
                                                    {"permissions": [false, true], "default": true}]}}),
            )
            .await
            .unwrap();
        store
            .put(Collection::Users, "alice", json!({"_id": "alice", "type": "account", "profile": {"name": "Alice"}}))
            .await
            .unwrap();
        store
            .put(
                Collection::Users,
                "bob",
                json!({"_id": "bob", "type": "account", "loginCredentials": [{"id": "bob-cred"}],
                       "profile": {"name": "Bob", "handle": "bob", "pronoun": "male"}}),
            )
            .await
            .unwrap();
        let tokens = TokenStore::new(store.clone());
        (store, tokens)
    }

    fn user(account: &str, title: &str) -> RequestedOwner {
        RequestedOwner::User(UserRequest {
            account_id: account.into(),
            title: title.into(),
        })
    }

    #[tokio::test]
    async fn test_new_api_token_for_user_gets_identity_and_metadata() {
        let (_store, tokens) = setup().await;
        let issued = tokens
            .new_api_token(
                Issuer::AccountId("alice".into()),
                "g",
                Some("for bob".into()),
                RoleAssignment::all_access(),
                user("bob", "Bob's notes"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(issued.id, vault::hash_token(&issued.token));
        let t = tokens.get(&issued.id).await.unwrap().unwrap();
        let owner = t.owner.user().unwrap();
        assert_eq!(owner.upstream_title.as_deref(), Some("Notes"));
        assert!(owner.identity_id.is_some());
        assert_eq!(
            owner.denormalized_grain_metadata.as_ref().unwrap()["appTitle"]["defaultText"],
            "Etherpad"
        );

        // A second share to the same account reuses the identity.
        let again = tokens
            .new_api_token(
                Issuer::AccountId("alice".into()),
                "g",
                None,
                RoleAssignment::role(1),
                user("bob", "Notes"),
                None,
            )
            .await
            .unwrap();
        let t2 = tokens.get(&again.id).await.unwrap().unwrap();
        assert_eq!(t2.owner.user().unwrap().identity_id, owner.identity_id);
        assert_eq!(t2.owner.user().unwrap().upstream_title, None);
    }

    #[tokio::test]
    async fn test_new_api_token_rejects_missing_grain_and_foreign_parent() {
        let (_store, tokens) = setup().await;
        let err = tokens
            .new_api_token(
                Issuer::AccountId("alice".into()),
                "nope",
                None,
                RoleAssignment::all_access(),
                RequestedOwner::Webkey(None),
                None,
            )
            .await;
        assert!(matches!(err, Err(AuthzError::NotFound)));

        let bogus = TokenSecret::generate();
        let err = tokens
            .new_api_token(
                Issuer::RawParentToken(bogus.as_str().into()),
                "g",
                None,
                RoleAssignment::all_access(),
                RequestedOwner::Webkey(None),
                None,
            )
            .await;
        assert!(matches!(err, Err(AuthzError::NotFound)));
    }

    #[tokio::test]
    async fn test_webkey_for_sharing_is_inherited() {
        let (_store, tokens) = setup().await;
        let parent = tokens
            .new_api_token(
                Issuer::AccountId("alice".into()),
                "g",
                None,
                RoleAssignment::all_access(),
                RequestedOwner::Webkey(Some(WebkeyRequest {
                    for_sharing: true,
                    expires_if_unused_duration: Some(60_000),
                })),
                None,
            )
            .await
            .unwrap();
        let p = tokens.get(&parent.id).await.unwrap().unwrap();
        assert!(p.for_sharing && p.expires_if_unused.is_some());

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
        let c = tokens.get(&child.id).await.unwrap().unwrap();
        assert!(c.for_sharing);
        assert_eq!(c.provider.parent_token(), Some(parent.id.as_str()));
        assert_eq!(c.sharer_account(), Some("alice"));
    }

    #[tokio::test]
    async fn test_restore_records_use_and_clears_expires_if_unused() {
        let (store, tokens) = setup().await;
        let issued = tokens
            .new_api_token(
                Issuer::AccountId("alice".into()),
                "g",
                None,
                RoleAssignment::all_access(),
                RequestedOwner::Webkey(Some(WebkeyRequest {
                    for_sharing: false,
                    expires_if_unused_duration: Some(3_600_000),
                })),
                None,
            )
            .await
            .unwrap();
        let restored = tokens.restore(&issued.token).await.unwrap();
        assert_eq!(
            restored.capability,
            ResolvedCapability::UiView {
                grain_id: "g".into(),
                identity_id: None,
                permissions: PermissionSet::all(2),
            }
        );
        let doc = store.get(Collection::ApiTokens, &issued.id).await.unwrap().unwrap();
        assert!(doc.get("lastUsed").is_some());
        assert!(doc.get("expiresIfUnused").is_none());
    }

    #[tokio::test]
    async fn test_http_credentials_are_encrypted_at_rest() {
        let (store, tokens) = setup().await;
        let req = NewToken::new(
            TokenOwner::Frontend,
            ProviderSpec::FrontendRef(FrontendRef::Http {
                url: "https://api.example.com".into(),
                auth: HttpAuth::Bearer("s3cr3t-bearer".into()),
            }),
        );
        let (secret, id) = tokens.create(req).await.unwrap();
        let doc = store.get(Collection::ApiTokens, &id).await.unwrap().unwrap();
        assert_ne!(doc["frontendRef"]["http"]["auth"]["bearer"], "s3cr3t-bearer");

        // A child reaches the parent's credentials through parentTokenKey.
        let mut child = NewToken::new(TokenOwner::Webkey, ProviderSpec::Child { role_assignment: None });
        child.parent = Some(secret.clone());
        let (child_secret, _) = tokens.create(child).await.unwrap();
        for s in [&secret, &child_secret] {
            let restored = tokens.restore(s.as_str()).await.unwrap();
            assert_eq!(
                restored.capability,
                ResolvedCapability::Frontend(FrontendRef::Http {
                    url: "https://api.example.com".into(),
                    auth: HttpAuth::Bearer("s3cr3t-bearer".into()),
                })
            );
        }
    }

    #[tokio::test]
    async fn test_update_api_token_requires_sharer_or_owner() {
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
        let revoke = TokenUpdate {
            revoked: Some(true),
            petname: None,
        };
        assert!(tokens.update_api_token("mallory", &issued.id, revoke.clone()).await.is_err());
        tokens.update_api_token("alice", &issued.id, revoke).await.unwrap();
        assert!(matches!(tokens.restore(&issued.token).await, Err(AuthzError::Revoked)));
    }

    #[tokio::test]
    async fn test_remove_saves_old_users_and_identity_comes_back() {
        let (store, tokens) = setup().await;
        let issued = tokens
            .new_api_token(
                Issuer::AccountId("alice".into()),
                "g",
                None,
                RoleAssignment::all_access(),
                user("bob", "Notes"),
                None,
            )
            .await
            .unwrap();
        let identity = tokens.get(&issued.id).await.unwrap().unwrap().owner.user().unwrap().identity_id.clone();

        assert_eq!(tokens.remove(&TokenQuery::OwnedBy("bob".into()), true).await.unwrap(), 1);
        let grain = store.get(Collection::Grains, "g").await.unwrap().unwrap();
        assert_eq!(grain["oldUsers"][0]["identityId"], json!(identity));
        assert_eq!(grain["oldUsers"][0]["credentialIds"], json!(["bob-cred"]));
        assert_eq!(grain["oldUsers"][0]["profile"]["displayName"]["defaultText"], "Bob");

        let back = tokens
            .new_api_token(
                Issuer::AccountId("alice".into()),
                "g",
                None,
                RoleAssignment::all_access(),
                user("bob", "Notes"),
                None,
            )
            .await
            .unwrap();
        let t = tokens.get(&back.id).await.unwrap().unwrap();
        assert_eq!(t.owner.user().unwrap().identity_id, identity);
        let grain = store.get(Collection::Grains, "g").await.unwrap().unwrap();
        assert_eq!(grain["oldUsers"], json!([]));
    }

    #[tokio::test]
    async fn test_remove_by_grain_records_every_departed_user() {
        let (store, tokens) = setup().await;
        store
            .put(
                Collection::Users,
                "carol",
                json!({"_id": "carol", "type": "account", "loginCredentials": [{"id": "carol-cred"}],
                       "profile": {"name": "Carol"}}),
            )
            .await
            .unwrap();
        for account in ["bob", "carol"] {
            tokens
                .new_api_token(
                    Issuer::AccountId("alice".into()),
                    "g",
                    None,
                    RoleAssignment::all_access(),
                    user(account, "Notes"),
                    None,
                )
                .await
                .unwrap();
        }

        assert_eq!(tokens.remove(&TokenQuery::Grain("g".into()), true).await.unwrap(), 2);
        assert_eq!(store.len(Collection::ApiTokens), 0);
        let grain = store.get(Collection::Grains, "g").await.unwrap().unwrap();
        let mut credentials: Vec<&str> = grain["oldUsers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["credentialIds"][0].as_str().unwrap())
            .collect();
        credentials.sort();
        assert_eq!(credentials, vec!["bob-cred", "carol-cred"]);
    }

    #[tokio::test]
    async fn test_remove_deletes_api_host() {
        let (store, tokens) = setup().await;
        let mut req = NewToken::new(
            TokenOwner::Webkey,
            ProviderSpec::UiView {
                grain_id: "g".into(),
                account_id: Some("alice".into()),
                role_assignment: RoleAssignment::all_access(),
            },
        );
        req.api_host = Some(ApiHostSpec::default());
        let (_secret, id) = tokens.create(req).await.unwrap();
        assert_eq!(store.len(Collection::ApiHosts), 1);
        tokens.remove(&TokenQuery::Id(id), false).await.unwrap();
        assert_eq!(store.len(Collection::ApiHosts), 0);
    }

    #[tokio::test]
    async fn test_trash_and_cap_details() {
        let (store, tokens) = setup().await;
        let issued = tokens
            .new_api_token(
                Issuer::AccountId("alice".into()),
                "g",
                Some("pet".into()),
                RoleAssignment::all_access(),
                user("bob", "Notes"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(tokens.trash_tokens(&["g".into()], "bob").await.unwrap(), 1);
        assert!(matches!(tokens.restore(&issued.token).await, Err(AuthzError::Revoked)));
        assert_eq!(tokens.untrash_tokens(&["g".into()], "bob").await.unwrap(), 1);
        assert!(tokens.restore(&issued.token).await.is_ok());

        assert_eq!(tokens.cap_details(&issued.id).await.unwrap().unwrap().grain_title, "Notes");
        store.delete(Collection::Grains, "g").await.unwrap();
        assert_eq!(tokens.cap_details(&issued.id).await.unwrap(), None);
    }
}
