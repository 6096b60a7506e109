use chrono::Utc;
use serde_json::{json, Value};

use super::profile::{self, UserEmail};
use crate::config::ProfileSettings;
use crate::errors::{AuthzError, AuthzResult};
use crate::models::user::{Account, Credential, CredentialRef, Service, UserRecord};
use crate::store::{Collection, Document, Filter, SharedStore, UpdateOutcome};
use crate::vault;

const LOGIN: &str = "loginCredentials";
const NONLOGIN: &str = "nonloginCredentials";

fn list_has(doc: &Document, list: &str, credential_id: &str) -> bool {
    doc.get(list)
        .and_then(Value::as_array)
        .map_or(false, |items| items.iter().any(|c| c["id"] == credential_id))
}

fn list_len(doc: &Document, list: &str) -> usize {
    doc.get(list).and_then(Value::as_array).map_or(0, Vec::len)
}

fn pull(doc: &mut Document, list: &str, credential_id: &str) -> bool {
    let Some(items) = doc.get_mut(list).and_then(Value::as_array_mut) else {
        return false;
    };
    let before = items.len();
    items.retain(|c| c["id"] != credential_id);
    items.len() != before
}

fn push(doc: &mut Document, list: &str, credential_id: &str) -> AuthzResult<()> {
    let map = doc
        .as_object_mut()
        .ok_or_else(|| AuthzError::invariant("user record is not an object"))?;
    let entry = map.entry(list.to_string()).or_insert_with(|| json!([]));
    entry
        .as_array_mut()
        .ok_or_else(|| AuthzError::invariant(format!("{} is not a list", list)))?
        .push(json!({ "id": credential_id }));
    Ok(())
}

fn linked_anywhere(credential_id: &str) -> Filter {
    Filter::Or(vec![
        Filter::eq("loginCredentials.id", credential_id),
        Filter::eq("nonloginCredentials.id", credential_id),
    ])
}

/// Account and credential management over the `users` collection.
pub struct AccountService {
    store: SharedStore,
    settings: ProfileSettings,
}

impl AccountService {
    pub fn new(store: SharedStore, settings: ProfileSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &ProfileSettings {
        &self.settings
    }

    async fn record(&self, id: &str) -> AuthzResult<Option<UserRecord>> {
        match self.store.get(Collection::Users, id).await? {
            Some(doc) => Ok(Some(UserRecord::from_doc(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn account(&self, id: &str) -> AuthzResult<Option<Account>> {
        Ok(self.record(id).await?.and_then(UserRecord::into_account))
    }

    pub async fn credential(&self, id: &str) -> AuthzResult<Option<Credential>> {
        Ok(self.record(id).await?.and_then(UserRecord::into_credential))
    }

    /// Whether `user_id` is the credential itself or an account with it linked.
    pub async fn user_has_credential(&self, user_id: &str, credential_id: &str) -> AuthzResult<bool> {
        if user_id == credential_id {
            return Ok(true);
        }
        Ok(self
            .account(user_id)
            .await?
            .map_or(false, |a| a.has_credential(credential_id)))
    }

    /// Creates a fresh account whose only login credential is `credential_id`.
    pub async fn create_account_for_credential(&self, credential_id: &str) -> AuthzResult<Account> {
        let credential = self.credential(credential_id).await?.ok_or(AuthzError::NotFound)?;
        if self
            .store
            .find_one(Collection::Users, &linked_anywhere(credential_id))
            .await?
            .is_some()
        {
            return Err(AuthzError::invariant(format!(
                "credential {} is already linked to an account",
                credential_id
            )));
        }

        let mut profile = credential.profile.clone().unwrap_or_default();
        profile::fill_in_profile_defaults(&credential, &mut profile, &self.settings)?;

        let (service, data) = credential.service()?;
        let mut account = Account {
            id: vault::random_id(),
            login_credentials: vec![CredentialRef { id: credential.id.clone() }],
            nonlogin_credentials: Vec::new(),
            profile,
            created_at: Some(Utc::now()),
            ..Default::default()
        };
        match service {
            Service::Dev => {
                account.is_admin = data.get("isAdmin").and_then(Value::as_bool).unwrap_or(false);
                if data.get("hasCompletedSignup").and_then(Value::as_bool) == Some(true) {
                    account.has_completed_signup = Some(true);
                }
            }
            _ => account.expires = credential.expires,
        }

        let doc = serde_json::to_value(UserRecord::Account(account.clone()))?;
        // The unique index rejects a concurrent link of the same login credential.
        if !self.store.insert(Collection::Users, &account.id, doc).await? {
            return Err(AuthzError::invariant("account id collision"));
        }
        tracing::info!(account_id = %account.id, credential_id, "created account for credential");
        Ok(account)
    }

    /// Links a credential to an account. It becomes a login credential only when `allow_login`
    /// holds and it is not linked to any other account yet. Linking to a demo account makes the
    /// account permanent and moves the demo credential to nonlogin.
    pub async fn link_credential_to_account(
        &self,
        credential_id: &str,
        account_id: &str,
        allow_login: bool,
    ) -> AuthzResult<()> {
        let account = match self.record(account_id).await? {
            Some(UserRecord::Account(a)) => a,
            Some(UserRecord::Credential(_)) => {
                return Err(AuthzError::invariant("cannot link a credential to another credential"))
            }
            None => return Err(AuthzError::NotFound),
        };
        if account.has_credential(credential_id) {
            return Err(AuthzError::invariant(format!(
                "credential {} is already linked to this account",
                credential_id
            )));
        }
        let credential = match self.record(credential_id).await? {
            Some(UserRecord::Credential(c)) => c,
            Some(UserRecord::Account(_)) => {
                return Err(AuthzError::invariant("cannot link an account to another account"))
            }
            None => return Err(AuthzError::NotFound),
        };

        if self
            .store
            .find_one(Collection::Users, &Filter::eq("loginCredentials.id", credential_id))
            .await?
            .is_some()
        {
            return Err(AuthzError::invariant(
                "credential can already log into another account",
            ));
        }
        let linked_elsewhere = self
            .store
            .find_one(Collection::Users, &Filter::eq("nonloginCredentials.id", credential_id))
            .await?
            .is_some();
        let target = if linked_elsewhere || !allow_login { NONLOGIN } else { LOGIN };

        let demo_credential = if account.expires.is_some() {
            if linked_elsewhere {
                return Err(AuthzError::invariant(
                    "cannot upgrade a demo account with a credential linked elsewhere",
                ));
            }
            account.credential_ids().into_iter().next()
        } else {
            None
        };

        let mut imported = credential.profile.clone().unwrap_or_default();
        if demo_credential.is_some() {
            profile::fill_in_profile_defaults(&credential, &mut imported, &self.settings)?;
        }
        let imported = serde_json::to_value(&imported)?;
        let upgraded_at = json!(Utc::now());

        let outcome = self
            .store
            .update(Collection::Users, account_id, &|doc: &mut Document| {
                if list_has(doc, LOGIN, credential_id) || list_has(doc, NONLOGIN, credential_id) {
                    return Ok(false);
                }
                push(doc, target, credential_id)?;
                if let Some(demo) = &demo_credential {
                    let map = doc
                        .as_object_mut()
                        .ok_or_else(|| AuthzError::invariant("account is not an object"))?;
                    map.remove("expires");
                    map.insert("upgradedFromDemo".into(), upgraded_at.clone());
                    map.insert("profile".into(), imported.clone());
                    if list_has(doc, LOGIN, demo) && !list_has(doc, NONLOGIN, demo) {
                        pull(doc, LOGIN, demo);
                        push(doc, NONLOGIN, demo)?;
                    }
                }
                Ok(true)
            })
            .await?;
        if outcome == UpdateOutcome::Missing {
            return Err(AuthzError::NotFound);
        }

        if let Some(demo) = &demo_credential {
            self.store
                .update(Collection::Users, demo, &|doc: &mut Document| {
                    let Some(map) = doc.as_object_mut() else {
                        return Ok(false);
                    };
                    map.remove("expires");
                    map.insert("upgradedFromDemo".into(), upgraded_at.clone());
                    Ok(true)
                })
                .await?;
            tracing::info!(account_id, "demo account upgraded");
        }
        tracing::info!(account_id, credential_id, login = target == LOGIN, "linked credential");
        Ok(())
    }

    /// Detaches a credential from an account. The acting user must own the credential, and the
    /// account must keep at least one login credential.
    pub async fn unlink_credential(
        &self,
        acting_user: &str,
        account_id: &str,
        credential_id: &str,
    ) -> AuthzResult<()> {
        if !self.user_has_credential(acting_user, credential_id).await? {
            return Err(AuthzError::NotFound);
        }
        let outcome = self
            .store
            .update(Collection::Users, account_id, &|doc: &mut Document| {
                let was_login = list_has(doc, LOGIN, credential_id);
                if was_login && list_len(doc, LOGIN) == 1 {
                    return Err(AuthzError::invariant(format!(
                        "cannot unlink {}: it is the account's last login credential",
                        credential_id
                    )));
                }
                let pulled_login = pull(doc, LOGIN, credential_id);
                let pulled_nonlogin = pull(doc, NONLOGIN, credential_id);
                Ok(pulled_login || pulled_nonlogin)
            })
            .await?;
        match outcome {
            UpdateOutcome::Missing => Err(AuthzError::NotFound),
            UpdateOutcome::Unchanged => Ok(()),
            UpdateOutcome::Updated => {
                tracing::info!(account_id, credential_id, "unlinked credential");
                Ok(())
            }
        }
    }

    /// Promotes a credential of the acting account to login status, or demotes it.
    pub async fn set_credential_allows_login(
        &self,
        acting_account: &str,
        credential_id: &str,
        allow_login: bool,
    ) -> AuthzResult<()> {
        if !self.user_has_credential(acting_account, credential_id).await? {
            return Err(AuthzError::NotFound);
        }
        let (from, to) = if allow_login { (NONLOGIN, LOGIN) } else { (LOGIN, NONLOGIN) };
        // Promoting a credential that logs into another account trips the unique index.
        let outcome = self
            .store
            .update(Collection::Users, acting_account, &|doc: &mut Document| {
                if !list_has(doc, from, credential_id) || list_has(doc, to, credential_id) {
                    return Ok(false);
                }
                if !allow_login && list_len(doc, LOGIN) == 1 {
                    return Err(AuthzError::invariant(format!(
                        "cannot demote {}: it is the account's last login credential",
                        credential_id
                    )));
                }
                pull(doc, from, credential_id);
                push(doc, to, credential_id)?;
                Ok(true)
            })
            .await?;
        if outcome == UpdateOutcome::Missing {
            return Err(AuthzError::NotFound);
        }
        tracing::info!(account_id = acting_account, credential_id, allow_login, "set credential login");
        Ok(())
    }

    /// Credentials that hold `email` as a verified address.
    pub async fn find_credentials_by_email(&self, email: &str) -> AuthzResult<Vec<Credential>> {
        let ldap_path = format!("services.ldap.rawAttrs.{}", self.settings.ldap_email_field);
        let filter = Filter::Or(vec![
            Filter::eq("services.google.email", email),
            Filter::eq("services.email.email", email),
            Filter::eq("services.github.emails.email", email),
            Filter::eq(&ldap_path, email),
            Filter::eq("services.oidc.email", email),
            Filter::eq("services.saml.email", email),
        ]);
        let mut found = Vec::new();
        for doc in self.store.find(Collection::Users, &filter).await? {
            let Some(credential) = UserRecord::from_doc(doc)?.into_credential() else {
                continue;
            };
            let verified = profile::verified_emails_for_credential(&credential, &self.settings)?;
            if verified.iter().any(|v| v.email == email) {
                found.push(credential);
            }
        }
        Ok(found)
    }

    pub async fn find_accounts_by_email(&self, email: &str) -> AuthzResult<Vec<Account>> {
        let ids: Vec<Value> = self
            .find_credentials_by_email(email)
            .await?
            .into_iter()
            .map(|c| json!(c.id))
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Filter::Or(vec![
            Filter::In("loginCredentials.id".into(), ids.clone()),
            Filter::In("nonloginCredentials.id".into(), ids),
        ]);
        let mut accounts = Vec::new();
        for doc in self.store.find(Collection::Users, &filter).await? {
            if let Some(a) = UserRecord::from_doc(doc)?.into_account() {
                accounts.push(a);
            }
        }
        Ok(accounts)
    }

    pub async fn user_emails(&self, account: &Account) -> AuthzResult<Vec<UserEmail>> {
        let mut credentials = Vec::new();
        for id in account.credential_ids() {
            if let Some(c) = self.credential(&id).await? {
                credentials.push(c);
            }
        }
        profile::user_emails(account, &credentials, &self.settings)
    }

    /// Adds `contact_id` to the owner's contact list, or refreshes the existing entry.
    pub async fn add_contact(&self, owner_id: &str, contact_id: &str) -> AuthzResult<()> {
        let petname = self
            .account(contact_id)
            .await?
            .and_then(|a| a.profile.name)
            .map(Value::String)
            .unwrap_or(Value::Null);
        let existing = self
            .store
            .find_one(
                Collection::Contacts,
                &Filter::and([Filter::eq("ownerId", owner_id), Filter::eq("accountId", contact_id)]),
            )
            .await?;
        let id = existing
            .as_ref()
            .and_then(|d| crate::store::document::doc_id(d).map(str::to_string))
            .unwrap_or_else(vault::random_id);
        let doc = json!({
            "_id": id,
            "ownerId": owner_id,
            "accountId": contact_id,
            "petname": petname,
            "created": Utc::now(),
        });
        self.store.put(Collection::Contacts, &id, doc).await
    }
}
