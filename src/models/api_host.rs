use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Static content served for a token's API host (e.g. a WebDAV-capable endpoint).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHostResource {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiHostOptions {
    #[serde(default)]
    pub dav: Vec<String>,
}

/// Caller-supplied part of an ApiHost; the ids are derived from the token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiHostSpec {
    #[serde(default)]
    pub options: ApiHostOptions,
    #[serde(default)]
    pub resources: BTreeMap<String, ApiHostResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiHost {
    /// `vault::api_host_id(secret)`.
    #[serde(rename = "_id")]
    pub id: String,
    /// `vault::api_host_hash2(token_id)`.
    pub hash2: String,
    #[serde(flatten)]
    pub spec: ApiHostSpec,
}
