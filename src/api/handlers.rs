use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::{AppError, AuthzError};
use crate::models::api_host::ApiHostSpec;
use crate::models::permissions::RoleAssignment;
use crate::tokens::{CapDetails, Issuer, RequestedOwner, ResolvedCapability, Restored, TokenUpdate};
use crate::AppState;

/// Header carrying the account the trusted caller acts for.
pub const ACCOUNT_HEADER: &str = "x-account-id";

// ── Request DTOs ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApiTokenParams {
    pub issuer: Issuer,
    pub grain_id: String,
    #[serde(default)]
    pub petname: Option<String>,
    #[serde(default)]
    pub role_assignment: RoleAssignment,
    pub owner: RequestedOwner,
    /// Static content served to unauthenticated requests on the token's API host.
    #[serde(default)]
    pub unauthenticated: Option<ApiHostSpec>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateApiTokenParams {
    pub token_id: String,
    pub new_fields: TokenUpdate,
}

#[derive(Deserialize)]
pub struct RestoreParams {
    pub token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequestParams {
    pub request_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlinkCredentialParams {
    pub account_id: String,
    pub credential_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCredentialAllowsLoginParams {
    pub credential_id: String,
    pub allow_login: bool,
}

fn acting_account(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("missing {} header", ACCOUNT_HEADER)))
}

fn params<T: for<'de> Deserialize<'de>>(body: Value) -> Result<T, AppError> {
    Ok(serde_json::from_value(body)?)
}

/// JSON rendering of a restored capability. HTTP credentials come back decrypted.
pub fn restored_json(restored: Restored) -> Value {
    let capability = match restored.capability {
        ResolvedCapability::UiView {
            grain_id,
            identity_id,
            permissions,
        } => json!({
            "uiView": {
                "grainId": grain_id,
                "identityId": identity_id,
                "permissions": permissions.as_slice(),
            }
        }),
        ResolvedCapability::Object { grain_id, object_id } => json!({
            "object": { "grainId": grain_id, "objectId": object_id }
        }),
        ResolvedCapability::Frontend(r) => json!({ "frontendRef": Value::from(r) }),
    };
    json!({
        "tokenId": restored.token_id,
        "owner": Value::from(restored.owner),
        "capability": capability,
    })
}

// ── Method dispatch ──────────────────────────────────────────

/// POST /api/v1/methods/:name — invoke one management method with a JSON body.
pub async fn call_method(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    tracing::debug!(method = %name, "method call");
    match name.as_str() {
        "newApiToken" => {
            let p: NewApiTokenParams = params(body)?;
            if let Issuer::AccountId(issuer) = &p.issuer {
                if acting_account(&headers)? != issuer.as_str() {
                    return Err(AppError::Unauthorized);
                }
            }
            let issued = state
                .tokens
                .new_api_token(
                    p.issuer,
                    &p.grain_id,
                    p.petname,
                    p.role_assignment,
                    p.owner,
                    p.unauthenticated,
                )
                .await?;
            Ok(Json(serde_json::to_value(issued)?))
        }
        "updateApiToken" => {
            let acting = acting_account(&headers)?;
            let p: UpdateApiTokenParams = params(body)?;
            state
                .tokens
                .update_api_token(acting, &p.token_id, p.new_fields)
                .await?;
            Ok(Json(json!({ "updated": true })))
        }
        "restore" => {
            let p: RestoreParams = params(body)?;
            let restored = state.tokens.restore(&p.token).await?;
            Ok(Json(restored_json(restored)))
        }
        "claimRequest" => {
            let p: ClaimRequestParams = params(body)?;
            let restored = state.tokens.restore(&p.request_token).await?;
            Ok(Json(restored_json(restored)))
        }
        "unlinkCredential" => {
            let acting = acting_account(&headers)?;
            let p: UnlinkCredentialParams = params(body)?;
            state
                .accounts
                .unlink_credential(acting, &p.account_id, &p.credential_id)
                .await?;
            Ok(Json(json!({ "unlinked": true })))
        }
        "setCredentialAllowsLogin" => {
            let acting = acting_account(&headers)?;
            let p: SetCredentialAllowsLoginParams = params(body)?;
            state
                .accounts
                .set_credential_allows_login(acting, &p.credential_id, p.allow_login)
                .await?;
            Ok(Json(json!({ "allowLogin": p.allow_login })))
        }
        other => Err(AppError::UnknownMethod(other.to_string())),
    }
}

/// GET /api/v1/tokens/:id — listing details of one token.
pub async fn get_token_details(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
) -> Result<Json<CapDetails>, AppError> {
    let details = state
        .tokens
        .cap_details(&token_id)
        .await?
        .ok_or(AuthzError::NotFound)?;
    Ok(Json(details))
}
