use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::permissions::ViewInfo;
use super::user::Pronoun;

/// Profile of a departed user, kept on the grain so the identity can be recognized if the same
/// person comes back through another share.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OldUserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pronouns: Option<Pronoun>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OldUser {
    pub identity_id: String,
    #[serde(default)]
    pub credential_ids: Vec<String>,
    #[serde(default)]
    pub profile: OldUserProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grain {
    #[serde(rename = "_id")]
    pub id: String,
    /// Owning account.
    pub user_id: String,
    /// The owner's identity as the grain sees it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_title: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_icon: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trashed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_view_info: Option<ViewInfo>,
    #[serde(default)]
    pub old_users: Vec<OldUser>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Grain {
    pub fn view_info(&self) -> ViewInfo {
        self.cached_view_info.clone().unwrap_or_default()
    }

    pub fn is_owned_by(&self, account_id: &str) -> bool {
        self.user_id == account_id
    }

    /// Metadata copied onto a user-owned share so the recipient can render it without reading
    /// the grain.
    pub fn denormalized_metadata(&self) -> Value {
        let mut meta = json!({});
        if let Some(title) = &self.app_title {
            meta["appTitle"] = title.clone();
        }
        if let Some(icon) = &self.app_icon {
            meta["icon"] = icon.clone();
        }
        if let Some(app_id) = &self.app_id {
            meta["appId"] = json!(app_id);
        }
        meta
    }

    /// The `oldUsers` entry whose credentials overlap `credential_ids`, if any.
    pub fn old_user_for(&self, credential_ids: &[String]) -> Option<&OldUser> {
        self.old_users
            .iter()
            .find(|u| u.credential_ids.iter().any(|c| credential_ids.contains(c)))
    }
}
