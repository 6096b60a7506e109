//! The two record kinds of the `users` collection.
//!
//! A credential is one way of authenticating (a GitHub login, an email address, an LDAP entry).
//! An account owns grains and tokens and lists the credentials linked to it. Both live in one
//! collection and are told apart by the `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{AuthzError, AuthzResult};
use crate::store::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pronoun {
    Male,
    Female,
    Neutral,
    Robot,
}

impl Pronoun {
    pub fn from_gender(gender: &str) -> Option<Self> {
        match gender {
            "male" => Some(Pronoun::Male),
            "female" => Some(Pronoun::Female),
            "neutral" => Some(Pronoun::Neutral),
            "robot" => Some(Pronoun::Robot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identicon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pronoun: Option<Pronoun>,
    /// Legacy fields such as `service`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Authentication services a credential can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Github,
    Google,
    Oidc,
    Email,
    Dev,
    Demo,
    Ldap,
    Saml,
}

impl Service {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "github" => Service::Github,
            "google" => Service::Google,
            "oidc" => Service::Oidc,
            "email" => Service::Email,
            "dev" => Service::Dev,
            "demo" => Service::Demo,
            "ldap" => Service::Ldap,
            "saml" => Service::Saml,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(rename = "_id")]
    pub id: String,
    /// Exactly one auth service is expected, plus the session bookkeeping entry `resume`.
    #[serde(default)]
    pub services: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unverified_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended: Option<Value>,
}

impl Credential {
    /// Name of the single service this credential belongs to (known or not).
    pub fn service_name(&self) -> AuthzResult<&str> {
        let keys: Vec<&str> = self
            .services
            .keys()
            .map(String::as_str)
            .filter(|k| *k != "resume")
            .collect();
        match keys.as_slice() {
            [one] => Ok(one),
            _ => Err(AuthzError::invariant(format!(
                "expected exactly one auth service on credential {}, found [{}]",
                self.id,
                keys.join(",")
            ))),
        }
    }

    /// The service and its data. An unknown service is a configuration error.
    pub fn service(&self) -> AuthzResult<(Service, &Value)> {
        let name = self.service_name()?;
        let service = Service::parse(name).ok_or_else(|| {
            AuthzError::Configuration(format!("unrecognized authentication service: {}", name))
        })?;
        let data = self.services.get(name).unwrap_or(&Value::Null);
        Ok((service, data))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub login_credentials: Vec<CredentialRef>,
    #[serde(default)]
    pub nonlogin_credentials: Vec<CredentialRef>,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referred_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referred_account_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_completed_signup: Option<bool>,
}

impl Account {
    pub fn is_login_credential(&self, credential_id: &str) -> bool {
        self.login_credentials.iter().any(|c| c.id == credential_id)
    }

    pub fn has_credential(&self, credential_id: &str) -> bool {
        self.is_login_credential(credential_id)
            || self.nonlogin_credentials.iter().any(|c| c.id == credential_id)
    }

    /// Linked credential ids, most recently added login credential first.
    pub fn credential_ids(&self) -> Vec<String> {
        self.nonlogin_credentials
            .iter()
            .chain(self.login_credentials.iter())
            .rev()
            .map(|c| c.id.clone())
            .collect()
    }
}

/// A `users` record, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UserRecord {
    Account(Account),
    Credential(Credential),
}

impl UserRecord {
    pub fn from_doc(doc: Document) -> AuthzResult<Self> {
        Ok(serde_json::from_value(doc)?)
    }

    pub fn into_account(self) -> Option<Account> {
        match self {
            UserRecord::Account(a) => Some(a),
            UserRecord::Credential(_) => None,
        }
    }

    pub fn into_credential(self) -> Option<Credential> {
        match self {
            UserRecord::Credential(c) => Some(c),
            UserRecord::Account(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_record_discriminates_on_type() {
        let acct = UserRecord::from_doc(json!({
            "_id": "a1",
            "type": "account",
            "loginCredentials": [{"id": "c1"}],
            "nonloginCredentials": [],
            "profile": {"name": "Alice", "pronoun": "female"},
        }))
        .unwrap();
        let acct = acct.into_account().unwrap();
        assert!(acct.is_login_credential("c1"));
        assert_eq!(acct.profile.pronoun, Some(Pronoun::Female));

        let cred = UserRecord::from_doc(json!({
            "_id": "c1", "type": "credential", "services": {"github": {"username": "alice"}}
        }))
        .unwrap();
        assert!(cred.into_credential().is_some());
    }

    #[test]
    fn test_untagged_record_rejected() {
        assert!(UserRecord::from_doc(json!({"_id": "x", "profile": {}})).is_err());
    }

    #[test]
    fn test_service_name_ignores_resume() {
        let c: Credential = serde_json::from_value(json!({
            "_id": "c", "services": {"resume": {}, "email": {"email": "a@b.c"}}
        }))
        .unwrap();
        assert_eq!(c.service_name().unwrap(), "email");
        assert_eq!(c.service().unwrap().0, Service::Email);
    }

    #[test]
    fn test_service_requires_exactly_one() {
        let none: Credential = serde_json::from_value(json!({"_id": "c", "services": {}})).unwrap();
        assert!(matches!(none.service_name(), Err(AuthzError::InvariantViolation(_))));
        let two: Credential = serde_json::from_value(json!({
            "_id": "c", "services": {"github": {}, "google": {}}
        }))
        .unwrap();
        assert!(matches!(two.service_name(), Err(AuthzError::InvariantViolation(_))));
        let odd: Credential =
            serde_json::from_value(json!({"_id": "c", "services": {"myspace": {}}})).unwrap();
        assert!(matches!(odd.service(), Err(AuthzError::Configuration(_))));
    }

    #[test]
    fn test_credential_ids_most_recent_login_first() {
        let a = Account {
            id: "a".into(),
            login_credentials: vec![CredentialRef { id: "l1".into() }, CredentialRef { id: "l2".into() }],
            nonlogin_credentials: vec![CredentialRef { id: "n1".into() }],
            ..Default::default()
        };
        assert_eq!(a.credential_ids(), vec!["l2", "l1", "n1"]);
    }
}
