//! The move from "identities linked to users" to "credentials linked to accounts".
//!
//! Before it, one `users` collection held user records with `loginIdentities` and identity
//! records with a `profile`, told apart only by shape, and an identity could be linked from
//! several users. Afterwards each record carries `type`, every account has exactly one profile,
//! and every reference that named an identity names an account instead.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};

use super::MigrationContext;
use crate::errors::{AuthzError, AuthzResult};
use crate::identity::fill_in_profile_defaults;
use crate::models::user::{Credential, Pronoun, Profile};
use crate::store::document::{doc_id, get_path, get_str, has_path, remove_path, rename_field, set_path};
use crate::store::{Collection, Document, DocumentStore, Filter, UpdateOutcome};
use crate::vault;

const DEMO_NAME: &str = "Demo User";

/// Linked identity ids of a legacy user, most recently linked first.
fn legacy_identity_ids(user: &Document) -> Vec<String> {
    let ids = |field: &str| -> Vec<String> {
        user.get(field)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|i| get_str(i, "id").map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    let mut all = ids("nonloginIdentities");
    all.extend(ids("loginIdentities"));
    all.reverse();
    all
}

fn id_list(ids: &[String]) -> Vec<Value> {
    ids.iter().map(|id| json!(id)).collect()
}

/// Id of the copy of `token_id` made for `account_id` when a share is fanned out. Stable across
/// runs, so a re-run finds the copy it made before.
pub(super) fn fan_out_id(token_id: &str, account_id: &str) -> String {
    vault::hash_token(&format!("{}:{}", token_id, account_id))
}

// ── notifyIdentityChanges ────────────────────────────────────

pub(super) fn notify_identity_changes<'a>(
    store: &'a dyn DocumentStore,
    _ctx: &'a MigrationContext,
) -> BoxFuture<'a, AuthzResult<()>> {
    Box::pin(async move {
        let names: HashMap<String, String> = store
            .find(Collection::Users, &Filter::exists("profile.name"))
            .await?
            .iter()
            .filter_map(|u| Some((doc_id(u)?.to_string(), get_str(u, "profile.name")?.to_string())))
            .collect();

        let mut notified = 0;
        for user in store.find(Collection::Users, &Filter::exists("loginIdentities")).await? {
            let Some(user_id) = doc_id(&user) else { continue };

            // Users whose identities disagree on a name will see their profile change.
            let mut previous: Option<&str> = None;
            let mut needs_notification = false;
            for identity_id in legacy_identity_ids(&user) {
                let name = names.get(&identity_id).map(String::as_str);
                if name.is_none() || (previous.is_some() && previous != name) {
                    needs_notification = true;
                }
                previous = name;
            }
            if !needs_notification {
                continue;
            }

            let existing = store
                .find_one(
                    Collection::Notifications,
                    &Filter::and([Filter::eq("userId", user_id), Filter::eq("identityChanges", true)]),
                )
                .await?;
            if existing.is_none() {
                let id = vault::random_id();
                store
                    .insert(
                        Collection::Notifications,
                        &id,
                        json!({
                            "userId": user_id,
                            "identityChanges": true,
                            "timestamp": Utc::now(),
                            "isUnread": true,
                        }),
                    )
                    .await?;
                notified += 1;
            }
        }
        tracing::info!(notified, "notified users of identity changes");
        Ok(())
    })
}

// ── onePersonaPerAccountPreCleanup ───────────────────────────

pub(super) fn one_persona_per_account_pre_cleanup<'a>(
    store: &'a dyn DocumentStore,
    _ctx: &'a MigrationContext,
) -> BoxFuture<'a, AuthzResult<()>> {
    Box::pin(async move {
        store
            .update_where(Collection::Users, &Filter::exists("stashedOldUser"), &|doc: &mut Document| {
                Ok(remove_path(doc, "stashedOldUser").is_some())
            })
            .await?;

        // Created while ids were half split, by a user deleted since. Never restorable.
        let half_split = store
            .delete_where(
                Collection::ApiTokens,
                &Filter::and([Filter::exists("identityId"), Filter::missing("accountId")]),
            )
            .await?;
        let introduced = store
            .delete_where(Collection::ApiTokens, &Filter::exists("owner.grain.introducerIdentity"))
            .await?;

        // Every other service keeps an entry under `services`; demo credentials did not.
        store
            .update_where(
                Collection::Users,
                &Filter::and([Filter::eq("profile.service", "demo"), Filter::missing("services.demo")]),
                &|doc: &mut Document| Ok(set_path(doc, "services.demo", json!({}))),
            )
            .await?;

        tracing::info!(half_split, introduced, "removed obsolete tokens");
        Ok(())
    })
}

// ── onePersonaPerAccount ─────────────────────────────────────

/// Which accounts link each identity, most recently active first.
struct IdentityMap {
    accounts: HashMap<String, Vec<String>>,
    account_ids: HashSet<String>,
}

impl IdentityMap {
    async fn build(store: &dyn DocumentStore) -> AuthzResult<Self> {
        let mut linked: HashMap<String, Vec<(String, Option<DateTime<Utc>>)>> = HashMap::new();
        let mut account_ids = HashSet::new();
        for user in store.find(Collection::Users, &Filter::eq("type", "account")).await? {
            let Some(id) = doc_id(&user) else { continue };
            account_ids.insert(id.to_string());
            let active = get_str(&user, "lastActive")
                .or_else(|| get_str(&user, "createdAt"))
                .and_then(|t| t.parse::<DateTime<Utc>>().ok());
            for field in ["loginIdentities", "nonloginIdentities"] {
                for identity in user.get(field).and_then(Value::as_array).into_iter().flatten() {
                    if let Some(identity_id) = get_str(identity, "id") {
                        linked
                            .entry(identity_id.to_string())
                            .or_default()
                            .push((id.to_string(), active));
                    }
                }
            }
        }
        let accounts = linked
            .into_iter()
            .map(|(identity, mut list)| {
                list.sort_by(|a, b| b.1.cmp(&a.1));
                (identity, list.into_iter().map(|(id, _)| id).collect())
            })
            .collect();
        Ok(Self { accounts, account_ids })
    }

    fn accounts_for(&self, identity_id: &str) -> Vec<String> {
        match self.accounts.get(identity_id) {
            Some(list) => list.clone(),
            None => {
                tracing::warn!(identity_id, "no such identity");
                vec![format!("invalid-{}", identity_id)]
            }
        }
    }

    fn account_for(&self, identity_id: &str) -> String {
        self.accounts_for(identity_id).swap_remove(0)
    }

    fn knows(&self, identity_id: &str) -> bool {
        self.accounts.contains_key(identity_id)
    }

    /// Like [`Self::account_for`], but `None` for a reference that already names an account.
    fn remap(&self, reference: &str) -> Option<String> {
        if self.accounts.contains_key(reference) {
            return Some(self.account_for(reference));
        }
        if self.account_ids.contains(reference) || reference.starts_with("invalid-") {
            return None;
        }
        Some(self.account_for(reference))
    }
}

/// Counts the shares that name `identity_id`, treating fan-out copies as the share they copy.
async fn distinct_shares(store: &dyn DocumentStore, identity_id: &str) -> AuthzResult<usize> {
    let shares = store
        .find(Collection::ApiTokens, &Filter::eq("owner.user.identityId", identity_id))
        .await?;
    let distinct: BTreeSet<String> = shares
        .into_iter()
        .map(|mut doc| {
            remove_path(&mut doc, "_id");
            remove_path(&mut doc, "owner.user.accountId");
            doc.to_string()
        })
        .collect();
    Ok(distinct.len())
}

async fn best_profile(
    store: &dyn DocumentStore,
    ctx: &MigrationContext,
    account_id: &str,
    login_ids: &[String],
) -> AuthzResult<Option<Profile>> {
    let identities = store
        .find(
            Collection::Users,
            &Filter::and([Filter::In("_id".into(), id_list(login_ids)), Filter::exists("profile")]),
        )
        .await?;

    let mut candidates = Vec::with_capacity(identities.len());
    for doc in identities {
        let credential: Credential = serde_json::from_value(doc)?;
        let mut profile = credential.profile.clone().unwrap_or_default();
        fill_in_profile_defaults(&credential, &mut profile, &ctx.settings)?;
        candidates.push((credential.id, profile));
    }

    if candidates.len() <= 1 {
        return Ok(candidates.pop().map(|(_, p)| p));
    }

    let mut best: Option<(i64, Profile)> = None;
    for (identity_id, profile) in candidates {
        let grains = store
            .count(
                Collection::Grains,
                &Filter::and([Filter::eq("userId", account_id), Filter::eq("identityId", identity_id.as_str())]),
            )
            .await?;
        let mut score = (grains + distinct_shares(store, &identity_id).await?) as i64;
        // Prefer a real identity over a demo one unless the demo saw much more use.
        if profile.name.as_deref() != Some(DEMO_NAME) {
            score += 10;
        }
        if best.as_ref().map_or(true, |(max, _)| score > *max) {
            best = Some((score, profile));
        }
    }
    Ok(best.map(|(_, p)| p))
}

async fn migrate_accounts(store: &dyn DocumentStore, ctx: &MigrationContext, map: &IdentityMap) -> AuthzResult<usize> {
    let users = store
        .find(
            Collection::Users,
            &Filter::and([Filter::eq("type", "account"), Filter::exists("loginIdentities")]),
        )
        .await?;
    let mut migrated = 0;
    for user in users {
        let Some(account_id) = doc_id(&user) else { continue };
        let login_ids: Vec<String> = user["loginIdentities"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|i| get_str(i, "id").map(str::to_string))
            .collect();

        let profile = match best_profile(store, ctx, account_id, &login_ids).await? {
            Some(mut profile) => {
                profile.extra.remove("service");
                Some(profile)
            }
            // A re-run keeps the placeholder chosen the first time.
            None if has_path(&user, "profile") => None,
            None => {
                tracing::warn!(account_id, "no suitable profile found for account");
                Some(Profile {
                    name: Some("Unknown".into()),
                    handle: Some("unknown".into()),
                    pronoun: Some(Pronoun::Neutral),
                    identicon: Some(vault::random_id()),
                    ..Default::default()
                })
            }
        };

        let identity_ids = legacy_identity_ids(&user);
        let referrer = store
            .find(
                Collection::Users,
                &Filter::and([Filter::In("_id".into(), id_list(&identity_ids)), Filter::exists("referredBy")]),
            )
            .await?
            .iter()
            .find_map(|u| u.get("referredBy").cloned());
        let referred_accounts: Option<Vec<String>> = user.get("referredIdentityIds").and_then(Value::as_array).map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(|id| map.account_for(id))
                .collect()
        });

        let profile = profile.map(serde_json::to_value).transpose()?;
        store
            .update(Collection::Users, account_id, &|doc: &mut Document| {
                let before = doc.clone();
                if let Some(p) = &profile {
                    set_path(doc, "profile", p.clone());
                }
                if let Some(r) = &referrer {
                    set_path(doc, "referredBy", r.clone());
                }
                if let Some(accounts) = &referred_accounts {
                    set_path(doc, "referredAccountIds", json!(accounts));
                }
                Ok(*doc != before)
            })
            .await?;
        migrated += 1;
    }
    Ok(migrated)
}

/// Points each user-owned share at an account. A share whose identity several accounts link is
/// copied once per extra account.
async fn migrate_shares(store: &dyn DocumentStore, map: &IdentityMap) -> AuthzResult<(usize, usize)> {
    let shares = store
        .find(Collection::ApiTokens, &Filter::exists("owner.user.identityId"))
        .await?;
    let (mut assigned, mut copied) = (0, 0);
    for share in shares {
        let (Some(token_id), Some(identity_id)) = (doc_id(&share), get_str(&share, "owner.user.identityId")) else {
            continue;
        };
        let accounts = map.accounts_for(identity_id);
        let primary = accounts[0].clone();

        let outcome = store
            .update(Collection::ApiTokens, token_id, &|doc: &mut Document| {
                if has_path(doc, "owner.user.accountId") {
                    return Ok(false);
                }
                Ok(set_path(doc, "owner.user.accountId", json!(primary)))
            })
            .await?;
        if outcome == UpdateOutcome::Updated {
            assigned += 1;
        }

        let (Some(grain_id), Some(sharer)) = (get_str(&share, "grainId"), get_str(&share, "accountId")) else {
            continue;
        };
        for account in accounts.iter().skip(1) {
            let similar = store
                .find_one(
                    Collection::ApiTokens,
                    &Filter::and([
                        Filter::eq("grainId", grain_id),
                        Filter::eq("accountId", sharer),
                        Filter::eq("owner.user.accountId", account.as_str()),
                    ]),
                )
                .await?;
            if similar.is_some() {
                continue;
            }
            let copy_id = fan_out_id(token_id, account);
            let mut copy = share.clone();
            set_path(&mut copy, "_id", json!(copy_id));
            set_path(&mut copy, "owner.user.accountId", json!(account));
            if store.insert(Collection::ApiTokens, &copy_id, copy).await? {
                copied += 1;
            }
        }
    }
    Ok((assigned, copied))
}

pub(super) fn one_persona_per_account<'a>(
    store: &'a dyn DocumentStore,
    ctx: &'a MigrationContext,
) -> BoxFuture<'a, AuthzResult<()>> {
    Box::pin(async move {
        tracing::info!("migrating to one persona per account");

        let accounts = store
            .update_where(
                Collection::Users,
                &Filter::and([Filter::missing("type"), Filter::exists("loginIdentities")]),
                &|doc: &mut Document| Ok(set_path(doc, "type", json!("account"))),
            )
            .await?;
        let credentials = store
            .update_where(
                Collection::Users,
                &Filter::and([Filter::missing("type"), Filter::exists("profile")]),
                &|doc: &mut Document| Ok(set_path(doc, "type", json!("credential"))),
            )
            .await?;
        tracing::info!(accounts, credentials, "tagged users");

        let map = IdentityMap::build(store).await?;

        let migrated = migrate_accounts(store, ctx, &map).await?;
        tracing::info!(migrated, "migrated account profiles");

        let (assigned, copied) = migrate_shares(store, &map).await?;
        tracing::info!(assigned, copied, "migrated shares");

        let requirements = store
            .update_where(
                Collection::ApiTokens,
                &Filter::exists("requirements.permissionsHeld.identityId"),
                &|doc: &mut Document| {
                    let Some(list) = doc.get_mut("requirements").and_then(Value::as_array_mut) else {
                        return Ok(false);
                    };
                    let mut changed = false;
                    for requirement in list.iter_mut() {
                        let Some(held) = requirement.get_mut("permissionsHeld").and_then(Value::as_object_mut) else {
                            continue;
                        };
                        let Some(identity_id) = held.get("identityId").and_then(Value::as_str) else {
                            continue;
                        };
                        let account = json!(map.account_for(identity_id));
                        if held.get("accountId") != Some(&account) {
                            held.insert("accountId".into(), account);
                            changed = true;
                        }
                    }
                    Ok(changed)
                },
            )
            .await?;

        let capabilities = store
            .update_where(
                Collection::ApiTokens,
                &Filter::exists("frontendRef.identity"),
                &|doc: &mut Document| {
                    let Some(account) = get_str(doc, "frontendRef.identity").and_then(|r| map.remap(r)) else {
                        return Ok(false);
                    };
                    Ok(set_path(doc, "frontendRef.identity", json!(account)))
                },
            )
            .await?;

        let contacts = store
            .update_where(Collection::Contacts, &Filter::exists("identityId"), &|doc: &mut Document| {
                let Some(identity_id) = get_str(doc, "identityId") else {
                    return Ok(false);
                };
                // Identities are no longer listed once the account fields have been renamed.
                if has_path(doc, "accountId") && !map.knows(identity_id) {
                    return Ok(false);
                }
                let account = json!(map.account_for(identity_id));
                if get_path(doc, "accountId") == Some(&account) {
                    return Ok(false);
                }
                Ok(set_path(doc, "accountId", account))
            })
            .await?;

        let notifications = store
            .update_where(
                Collection::Notifications,
                &Filter::exists("initiatingIdentity"),
                &|doc: &mut Document| {
                    let account = json!(get_str(doc, "initiatingIdentity").map(|i| map.account_for(i)));
                    if get_path(doc, "initiatingAccount") == Some(&account) {
                        return Ok(false);
                    }
                    Ok(set_path(doc, "initiatingAccount", account))
                },
            )
            .await?;

        tracing::info!(requirements, capabilities, contacts, notifications, "migrated identity references");
        Ok(())
    })
}

// ── onePersonaPerAccountPostCleanup ──────────────────────────

pub(super) fn one_persona_per_account_post_cleanup<'a>(
    store: &'a dyn DocumentStore,
    _ctx: &'a MigrationContext,
) -> BoxFuture<'a, AuthzResult<()>> {
    Box::pin(async move {
        let accounts = store
            .update_where(Collection::Users, &Filter::eq("type", "account"), &|doc: &mut Document| {
                let mut changed = false;
                for (from, to) in [
                    ("loginIdentities", "loginCredentials"),
                    ("nonloginIdentities", "nonloginCredentials"),
                ] {
                    if has_path(doc, from) && has_path(doc, to) {
                        return Err(AuthzError::invariant(format!(
                            "account {} has both {} and {}",
                            doc_id(doc).unwrap_or("?"),
                            from,
                            to
                        )));
                    }
                    changed |= rename_field(doc, from, to);
                }
                changed |= remove_path(doc, "referredIdentityIds").is_some();
                Ok(changed)
            })
            .await?;

        // Credentials keep their profiles: only one of an account's profiles was promoted.
        store
            .update_where(
                Collection::Contacts,
                &Filter::and([Filter::exists("identityId"), Filter::exists("accountId")]),
                &|doc: &mut Document| Ok(remove_path(doc, "identityId").is_some()),
            )
            .await?;
        store
            .update_where(
                Collection::Notifications,
                &Filter::exists("initiatingIdentity"),
                &|doc: &mut Document| Ok(remove_path(doc, "initiatingIdentity").is_some()),
            )
            .await?;
        store
            .update_where(Collection::ApiTokens, &Filter::exists("identityId"), &|doc: &mut Document| {
                Ok(remove_path(doc, "identityId").is_some())
            })
            .await?;
        store
            .update_where(
                Collection::ApiTokens,
                &Filter::exists("requirements.permissionsHeld.identityId"),
                &|doc: &mut Document| {
                    let Some(list) = doc.get_mut("requirements").and_then(Value::as_array_mut) else {
                        return Ok(false);
                    };
                    let mut changed = false;
                    for requirement in list.iter_mut() {
                        changed |= remove_path(requirement, "permissionsHeld.identityId").is_some();
                    }
                    Ok(changed)
                },
            )
            .await?;

        tracing::info!(accounts, "renamed account credential lists");
        Ok(())
    })
}
