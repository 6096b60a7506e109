//! Typed view of `apiTokens` records.
//!
//! On disk a token is a flat document in which the owner, the provider and the `frontendRef`
//! are each "an object with one of several keys set". Decoding turns those into enums and
//! rejects records with zero or several variants present.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::permissions::RoleAssignment;
use super::{decode, payload_str, single_variant};
use crate::errors::{AuthzError, AuthzResult};
use crate::store::Document;

// ── Owner ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOwner {
    pub account_id: String,
    /// The id by which the grain knows this user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_all_activity: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denormalized_grain_metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrainOwner {
    pub grain_id: String,
    #[serde(default)]
    pub save_label: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introducer_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerboxRequestOwner {
    pub grain_id: String,
    pub session_id: String,
}

/// Who may present the token.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum TokenOwner {
    /// Anyone holding the secret. Also the meaning of an absent owner.
    #[default]
    Webkey,
    User(UserOwner),
    Grain(GrainOwner),
    ClientPowerboxRequest(PowerboxRequestOwner),
    Frontend,
}

impl TokenOwner {
    pub fn user(&self) -> Option<&UserOwner> {
        match self {
            TokenOwner::User(u) => Some(u),
            _ => None,
        }
    }
}

impl TryFrom<Value> for TokenOwner {
    type Error = AuthzError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        if v.is_null() {
            return Ok(TokenOwner::Webkey);
        }
        let (kind, payload) = single_variant("owner", &v)?;
        Ok(match kind {
            "webkey" => TokenOwner::Webkey,
            "user" => TokenOwner::User(decode("owner.user", payload)?),
            "grain" => TokenOwner::Grain(decode("owner.grain", payload)?),
            "clientPowerboxRequest" => {
                TokenOwner::ClientPowerboxRequest(decode("owner.clientPowerboxRequest", payload)?)
            }
            "frontend" => TokenOwner::Frontend,
            other => return Err(AuthzError::invariant(format!("unknown owner kind: {}", other))),
        })
    }
}

impl From<TokenOwner> for Value {
    fn from(owner: TokenOwner) -> Value {
        match owner {
            TokenOwner::Webkey => json!({ "webkey": null }),
            TokenOwner::User(u) => json!({ "user": u }),
            TokenOwner::Grain(g) => json!({ "grain": g }),
            TokenOwner::ClientPowerboxRequest(r) => json!({ "clientPowerboxRequest": r }),
            TokenOwner::Frontend => json!({ "frontend": null }),
        }
    }
}

// ── Frontend refs ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEncryption {
    None,
    Tls,
}

/// Credentials for an external HTTP service. In a stored record the secret parts are base64
/// ciphertext (see `vault::cipher`); a restored capability carries them decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
    Refresh(String),
}

impl HttpAuth {
    fn from_value(v: &Value) -> AuthzResult<Self> {
        let (kind, payload) = single_variant("frontendRef.http.auth", v)?;
        Ok(match kind {
            "none" => HttpAuth::None,
            "bearer" => HttpAuth::Bearer(payload_str("auth.bearer", payload)?),
            "basic" => HttpAuth::Basic {
                username: payload_str("auth.basic.username", &payload["username"])?,
                password: payload_str("auth.basic.password", &payload["password"])?,
            },
            "refresh" => HttpAuth::Refresh(payload_str("auth.refresh", payload)?),
            other => return Err(AuthzError::invariant(format!("unknown http auth: {}", other))),
        })
    }

    fn to_value(&self) -> Value {
        match self {
            HttpAuth::None => json!({ "none": null }),
            HttpAuth::Bearer(t) => json!({ "bearer": t }),
            HttpAuth::Basic { username, password } => {
                json!({ "basic": { "username": username, "password": password } })
            }
            HttpAuth::Refresh(t) => json!({ "refresh": t }),
        }
    }
}

/// A capability implemented by the platform itself rather than by a grain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum FrontendRef {
    NotificationHandle(String),
    IpNetwork { encryption: NetworkEncryption },
    IpInterface,
    EmailVerifier { id: String, services: Option<Vec<String>> },
    VerifiedEmail { verifier_id: String, tab_id: String, address: String },
    /// Holds an account id.
    Identity(String),
    Http { url: String, auth: HttpAuth },
    ScheduledJob { id: String },
}

impl TryFrom<Value> for FrontendRef {
    type Error = AuthzError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        let (kind, p) = single_variant("frontendRef", &v)?;
        Ok(match kind {
            "notificationHandle" => FrontendRef::NotificationHandle(payload_str(kind, p)?),
            "ipNetwork" => {
                let enc = p.get("encryption").ok_or_else(|| {
                    AuthzError::invariant("frontendRef.ipNetwork lacks encryption (unmigrated record)")
                })?;
                let encryption = match single_variant("ipNetwork.encryption", enc)?.0 {
                    "none" => NetworkEncryption::None,
                    "tls" => NetworkEncryption::Tls,
                    other => {
                        return Err(AuthzError::invariant(format!("unknown encryption: {}", other)))
                    }
                };
                FrontendRef::IpNetwork { encryption }
            }
            "ipInterface" => FrontendRef::IpInterface,
            "emailVerifier" => FrontendRef::EmailVerifier {
                id: payload_str("emailVerifier.id", &p["id"])?,
                services: match p.get("services") {
                    None | Some(Value::Null) | Some(Value::Bool(false)) => None,
                    Some(s) => Some(decode("emailVerifier.services", s)?),
                },
            },
            "verifiedEmail" => FrontendRef::VerifiedEmail {
                verifier_id: payload_str("verifiedEmail.verifierId", &p["verifierId"])?,
                tab_id: payload_str("verifiedEmail.tabId", &p["tabId"])?,
                address: payload_str("verifiedEmail.address", &p["address"])?,
            },
            "identity" => FrontendRef::Identity(payload_str(kind, p)?),
            "http" => FrontendRef::Http {
                url: payload_str("http.url", &p["url"])?,
                auth: HttpAuth::from_value(&p["auth"])?,
            },
            "scheduledJob" => FrontendRef::ScheduledJob {
                id: payload_str("scheduledJob.id", &p["id"])?,
            },
            other => {
                return Err(AuthzError::invariant(format!("unknown frontendRef kind: {}", other)))
            }
        })
    }
}

impl From<FrontendRef> for Value {
    fn from(r: FrontendRef) -> Value {
        match r {
            FrontendRef::NotificationHandle(h) => json!({ "notificationHandle": h }),
            FrontendRef::IpNetwork { encryption } => {
                let enc = match encryption {
                    NetworkEncryption::None => json!({ "none": null }),
                    NetworkEncryption::Tls => json!({ "tls": null }),
                };
                json!({ "ipNetwork": { "encryption": enc } })
            }
            FrontendRef::IpInterface => json!({ "ipInterface": true }),
            FrontendRef::EmailVerifier { id, services } => {
                let mut body = json!({ "id": id });
                if let Some(s) = services {
                    body["services"] = json!(s);
                }
                json!({ "emailVerifier": body })
            }
            FrontendRef::VerifiedEmail { verifier_id, tab_id, address } => json!({
                "verifiedEmail": { "verifierId": verifier_id, "tabId": tab_id, "address": address }
            }),
            FrontendRef::Identity(a) => json!({ "identity": a }),
            FrontendRef::Http { url, auth } => json!({ "http": { "url": url, "auth": auth.to_value() } }),
            FrontendRef::ScheduledJob { id } => json!({ "scheduledJob": { "id": id } }),
        }
    }
}

// ── Requirements ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionHolder {
    Account(String),
    Token(String),
}

/// A condition that held when the token was created and must keep holding for it to stay valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum MembraneRequirement {
    /// The named token is still valid.
    TokenValid(String),
    /// The holder still has at least `permissions` on the grain.
    PermissionsHeld {
        grain_id: String,
        holder: PermissionHolder,
        permissions: Vec<bool>,
    },
    /// The account is still an administrator.
    UserIsAdmin(String),
}

impl TryFrom<Value> for MembraneRequirement {
    type Error = AuthzError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        let (kind, p) = single_variant("requirement", &v)?;
        Ok(match kind {
            "tokenValid" => MembraneRequirement::TokenValid(payload_str(kind, p)?),
            "userIsAdmin" => MembraneRequirement::UserIsAdmin(payload_str(kind, p)?),
            "permissionsHeld" => {
                let holder = match (p.get("accountId"), p.get("tokenId")) {
                    (Some(a), None) => PermissionHolder::Account(payload_str("accountId", a)?),
                    (None, Some(t)) => PermissionHolder::Token(payload_str("tokenId", t)?),
                    (Some(_), Some(_)) => {
                        return Err(AuthzError::invariant(
                            "permissionsHeld names both accountId and tokenId",
                        ))
                    }
                    (None, None) => {
                        return Err(AuthzError::invariant(
                            "permissionsHeld names neither accountId nor tokenId",
                        ))
                    }
                };
                MembraneRequirement::PermissionsHeld {
                    grain_id: payload_str("permissionsHeld.grainId", &p["grainId"])?,
                    holder,
                    permissions: match p.get("permissions") {
                        None | Some(Value::Null) => Vec::new(),
                        Some(list) => decode("permissionsHeld.permissions", list)?,
                    },
                }
            }
            other => return Err(AuthzError::invariant(format!("unknown requirement: {}", other))),
        })
    }
}

impl From<MembraneRequirement> for Value {
    fn from(r: MembraneRequirement) -> Value {
        match r {
            MembraneRequirement::TokenValid(t) => json!({ "tokenValid": t }),
            MembraneRequirement::UserIsAdmin(a) => json!({ "userIsAdmin": a }),
            MembraneRequirement::PermissionsHeld { grain_id, holder, permissions } => {
                let mut body = json!({ "grainId": grain_id, "permissions": permissions });
                match holder {
                    PermissionHolder::Account(a) => body["accountId"] = json!(a),
                    PermissionHolder::Token(t) => body["tokenId"] = json!(t),
                }
                json!({ "permissionsHeld": body })
            }
        }
    }
}

impl std::fmt::Display for MembraneRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembraneRequirement::TokenValid(t) => write!(f, "tokenValid({})", t),
            MembraneRequirement::UserIsAdmin(a) => write!(f, "userIsAdmin({})", a),
            MembraneRequirement::PermissionsHeld { grain_id, holder, .. } => match holder {
                PermissionHolder::Account(a) => write!(f, "permissionsHeld(grain {}, account {})", grain_id, a),
                PermissionHolder::Token(t) => write!(f, "permissionsHeld(grain {}, token {})", grain_id, t),
            },
        }
    }
}

// ── Provider ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum GrainTarget {
    /// The grain's UI, possibly attenuated by a role.
    UiView {
        /// The sharer. Absent only for tokens minted by the grain owner's session.
        account_id: Option<String>,
        role_assignment: RoleAssignment,
    },
    /// A raw capability exported by the grain (opaque).
    Object(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildUiView {
    pub grain_id: String,
    pub account_id: Option<String>,
    pub role_assignment: RoleAssignment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildProvider {
    pub parent_token: String,
    /// The parent's secret, encrypted under this token's secret with nonce 0.
    pub parent_token_key: Option<String>,
    /// Present when the chain ends in a UiView; denormalized from the parent.
    pub ui_view: Option<ChildUiView>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Provider {
    Grain { grain_id: String, target: GrainTarget },
    FrontendRef(FrontendRef),
    Child(ChildProvider),
}

impl Provider {
    pub fn grain_id(&self) -> Option<&str> {
        match self {
            Provider::Grain { grain_id, .. } => Some(grain_id),
            Provider::Child(c) => c.ui_view.as_ref().map(|v| v.grain_id.as_str()),
            Provider::FrontendRef(_) => None,
        }
    }

    pub fn parent_token(&self) -> Option<&str> {
        match self {
            Provider::Child(c) => Some(&c.parent_token),
            _ => None,
        }
    }
}

// ── ApiToken ─────────────────────────────────────────────────

/// Flat on-disk layout.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredToken {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<TokenOwner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    grain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role_assignment: Option<RoleAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frontend_ref: Option<FrontendRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_token_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    for_sharing: Option<bool>,
    #[serde(default)]
    requirements: Option<Vec<MembraneRequirement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    petname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revoked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trashed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    suspended: Option<bool>,
    #[serde(default)]
    expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_if_unused: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    has_api_host: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiToken {
    /// base64(SHA-256(secret)).
    pub id: String,
    pub owner: TokenOwner,
    pub provider: Provider,
    pub requirements: Vec<MembraneRequirement>,
    pub for_sharing: bool,
    pub petname: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub trashed: Option<DateTime<Utc>>,
    pub suspended: bool,
    pub expires: Option<DateTime<Utc>>,
    pub expires_if_unused: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub has_api_host: bool,
}

impl ApiToken {
    pub fn from_doc(doc: &Document) -> AuthzResult<Self> {
        let s: StoredToken = decode("apiToken", doc)?;
        let provider = match (&s.parent_token, &s.frontend_ref, &s.grain_id) {
            (Some(_), Some(_), _) | (None, Some(_), Some(_)) => {
                return Err(AuthzError::invariant(format!(
                    "token {} sets more than one provider",
                    s.id
                )))
            }
            (Some(parent), None, grain_id) => {
                if s.object_id.is_some() {
                    return Err(AuthzError::invariant(format!(
                        "child token {} also carries objectId",
                        s.id
                    )));
                }
                Provider::Child(ChildProvider {
                    parent_token: parent.clone(),
                    parent_token_key: s.parent_token_key.clone(),
                    ui_view: grain_id.as_ref().map(|g| ChildUiView {
                        grain_id: g.clone(),
                        account_id: s.account_id.clone(),
                        // A child without an explicit role passes its parent's access through.
                        role_assignment: s
                            .role_assignment
                            .clone()
                            .unwrap_or_else(RoleAssignment::all_access),
                    }),
                })
            }
            (None, Some(fr), None) => Provider::FrontendRef(fr.clone()),
            (None, None, Some(grain_id)) => Provider::Grain {
                grain_id: grain_id.clone(),
                target: match &s.object_id {
                    Some(obj) => GrainTarget::Object(obj.clone()),
                    None => GrainTarget::UiView {
                        account_id: s.account_id.clone(),
                        role_assignment: s.role_assignment.clone().unwrap_or_default(),
                    },
                },
            },
            (None, None, None) => {
                return Err(AuthzError::invariant(format!("token {} has no provider", s.id)))
            }
        };

        Ok(ApiToken {
            id: s.id,
            owner: s.owner.unwrap_or_default(),
            provider,
            requirements: s.requirements.unwrap_or_default(),
            for_sharing: s.for_sharing.unwrap_or(false),
            petname: s.petname,
            created: s.created,
            revoked: s.revoked.unwrap_or(false),
            trashed: s.trashed,
            suspended: s.suspended.unwrap_or(false),
            expires: s.expires,
            expires_if_unused: s.expires_if_unused,
            last_used: s.last_used,
            has_api_host: s.has_api_host.unwrap_or(false),
        })
    }

    pub fn to_doc(&self) -> AuthzResult<Document> {
        let mut s = StoredToken {
            id: self.id.clone(),
            owner: Some(self.owner.clone()),
            requirements: Some(self.requirements.clone()),
            for_sharing: self.for_sharing.then_some(true),
            petname: self.petname.clone(),
            created: self.created,
            revoked: self.revoked.then_some(true),
            trashed: self.trashed,
            suspended: self.suspended.then_some(true),
            expires: self.expires,
            expires_if_unused: self.expires_if_unused,
            last_used: self.last_used,
            has_api_host: self.has_api_host.then_some(true),
            ..Default::default()
        };
        match &self.provider {
            Provider::Grain { grain_id, target } => {
                s.grain_id = Some(grain_id.clone());
                match target {
                    GrainTarget::UiView { account_id, role_assignment } => {
                        s.account_id = account_id.clone();
                        s.role_assignment = Some(role_assignment.clone());
                    }
                    GrainTarget::Object(obj) => s.object_id = Some(obj.clone()),
                }
            }
            Provider::FrontendRef(fr) => s.frontend_ref = Some(fr.clone()),
            Provider::Child(c) => {
                s.parent_token = Some(c.parent_token.clone());
                s.parent_token_key = c.parent_token_key.clone();
                if let Some(v) = &c.ui_view {
                    s.grain_id = Some(v.grain_id.clone());
                    s.account_id = v.account_id.clone();
                    s.role_assignment = Some(v.role_assignment.clone());
                }
            }
        }
        Ok(serde_json::to_value(s)?)
    }

    /// The grain-side role this token grants, for UiView tokens and their children.
    pub fn role_assignment(&self) -> Option<&RoleAssignment> {
        match &self.provider {
            Provider::Grain { target: GrainTarget::UiView { role_assignment, .. }, .. } => {
                Some(role_assignment)
            }
            Provider::Child(ChildProvider { ui_view: Some(v), .. }) => Some(&v.role_assignment),
            _ => None,
        }
    }

    /// The account that shared this view (denormalized down child chains).
    pub fn sharer_account(&self) -> Option<&str> {
        match &self.provider {
            Provider::Grain { target: GrainTarget::UiView { account_id, .. }, .. } => account_id.as_deref(),
            Provider::Child(ChildProvider { ui_view: Some(v), .. }) => v.account_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_ui_view(&self) -> bool {
        self.role_assignment().is_some()
    }

    /// Whether a hard lifecycle flag blocks the token.
    pub fn is_revoked_directly(&self) -> bool {
        self.revoked || self.trashed.is_some() || self.suspended
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.map_or(false, |t| t <= now) || self.expires_if_unused.map_or(false, |t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_view_token_decodes() {
        let t = ApiToken::from_doc(&json!({
            "_id": "t1",
            "grainId": "g1",
            "accountId": "alice",
            "roleAssignment": {"allAccess": null},
            "owner": {"user": {"accountId": "bob", "title": "Shared doc"}},
            "created": "2024-01-01T00:00:00Z",
            "expires": null,
        }))
        .unwrap();
        assert_eq!(t.sharer_account(), Some("alice"));
        assert_eq!(t.owner.user().unwrap().account_id, "bob");
        assert_eq!(t.role_assignment(), Some(&RoleAssignment::all_access()));
        assert!(t.requirements.is_empty());
    }

    #[test]
    fn test_missing_owner_means_webkey() {
        let t = ApiToken::from_doc(&json!({"_id": "t", "grainId": "g"})).unwrap();
        assert_eq!(t.owner, TokenOwner::Webkey);
    }

    #[test]
    fn test_provider_exclusivity() {
        let both = json!({"_id": "t", "grainId": "g", "frontendRef": {"identity": "a"}});
        assert!(matches!(ApiToken::from_doc(&both), Err(AuthzError::InvariantViolation(_))));
        let none = json!({"_id": "t"});
        assert!(matches!(ApiToken::from_doc(&none), Err(AuthzError::InvariantViolation(_))));
        let child_obj = json!({"_id": "t", "parentToken": "p", "objectId": {}});
        assert!(ApiToken::from_doc(&child_obj).is_err());
    }

    #[test]
    fn test_frontend_ref_with_two_kinds_rejected() {
        let doc = json!({"_id": "t", "frontendRef": {"identity": "a", "ipInterface": true}});
        assert!(ApiToken::from_doc(&doc).is_err());
    }

    #[test]
    fn test_owner_with_two_kinds_rejected() {
        let doc = json!({"_id": "t", "grainId": "g", "owner": {"webkey": null, "frontend": null}});
        assert!(ApiToken::from_doc(&doc).is_err());
    }

    #[test]
    fn test_unmigrated_ip_network_rejected() {
        let doc = json!({"_id": "t", "frontendRef": {"ipNetwork": true}});
        assert!(ApiToken::from_doc(&doc).is_err());
        let ok = json!({"_id": "t", "frontendRef": {"ipNetwork": {"encryption": {"tls": null}}}});
        let t = ApiToken::from_doc(&ok).unwrap();
        assert_eq!(
            t.provider,
            Provider::FrontendRef(FrontendRef::IpNetwork { encryption: NetworkEncryption::Tls })
        );
    }

    #[test]
    fn test_child_ui_view_defaults_to_pass_through() {
        let t = ApiToken::from_doc(&json!({
            "_id": "c", "parentToken": "p", "grainId": "g", "accountId": "alice"
        }))
        .unwrap();
        assert_eq!(t.provider.parent_token(), Some("p"));
        assert_eq!(t.role_assignment(), Some(&RoleAssignment::all_access()));
    }

    #[test]
    fn test_requirements_decode() {
        let t = ApiToken::from_doc(&json!({
            "_id": "t",
            "frontendRef": {"identity": "alice"},
            "requirements": [
                {"permissionsHeld": {"grainId": "g", "accountId": "alice", "permissions": [true]}},
                {"userIsAdmin": "alice"},
                {"tokenValid": "x"},
            ],
        }))
        .unwrap();
        assert_eq!(t.requirements.len(), 3);
        assert_eq!(
            t.requirements[0],
            MembraneRequirement::PermissionsHeld {
                grain_id: "g".into(),
                holder: PermissionHolder::Account("alice".into()),
                permissions: vec![true],
            }
        );
        let bad = json!({"_id": "t", "frontendRef": {"identity": "a"},
                         "requirements": [{"permissionsHeld": {"grainId": "g", "identityId": "i"}}]});
        assert!(ApiToken::from_doc(&bad).is_err());
    }

    #[test]
    fn test_to_doc_keeps_flat_layout() {
        let t = ApiToken {
            id: "t".into(),
            owner: TokenOwner::Webkey,
            provider: Provider::Child(ChildProvider {
                parent_token: "p".into(),
                parent_token_key: Some("ct".into()),
                ui_view: Some(ChildUiView {
                    grain_id: "g".into(),
                    account_id: Some("alice".into()),
                    role_assignment: RoleAssignment::role(1),
                }),
            }),
            requirements: vec![],
            for_sharing: false,
            petname: Some("link".into()),
            created: None,
            revoked: false,
            trashed: None,
            suspended: false,
            expires: None,
            expires_if_unused: None,
            last_used: None,
            has_api_host: false,
        };
        let doc = t.to_doc().unwrap();
        assert_eq!(doc["parentToken"], "p");
        assert_eq!(doc["grainId"], "g");
        assert_eq!(doc["roleAssignment"], json!({"roleId": 1}));
        assert_eq!(doc["owner"], json!({"webkey": null}));
        assert!(doc.get("revoked").is_none());
        assert_eq!(ApiToken::from_doc(&doc).unwrap(), t);
    }
}
