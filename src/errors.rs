use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures of the authorization core.
///
/// Restore failures are always returned to the caller as one of these variants; nothing is
/// silently downgraded to "valid".
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Unknown token, credential, account or grain. Also returned for a secret that does not
    /// hash to any stored token, so a caller cannot probe which secrets exist.
    #[error("not found")]
    NotFound,

    /// Explicitly revoked, trashed, or suspended.
    #[error("token has been revoked")]
    Revoked,

    /// Some token up the `parentToken` chain is no longer valid (or no longer exists).
    #[error("an ancestor of this token has been revoked")]
    RevokedByAncestor,

    #[error("requirement not satisfied: {requirement}")]
    RequirementNotMet { requirement: String },

    #[error("token has expired")]
    Expired,

    /// Programmer or data-integrity error, e.g. removing an account's last login credential or a
    /// record carrying more than one variant of a union.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Fatal misconfiguration, e.g. an authentication service this server does not know.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl AuthzError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        AuthzError::InvariantViolation(msg.into())
    }

    /// Whether the token-state machine considers this a revocation of some kind.
    pub fn is_revocation(&self) -> bool {
        matches!(
            self,
            AuthzError::Revoked
                | AuthzError::RevokedByAncestor
                | AuthzError::RequirementNotMet { .. }
        )
    }
}

impl From<serde_json::Error> for AuthzError {
    fn from(e: serde_json::Error) -> Self {
        AuthzError::InvariantViolation(format!("malformed record: {}", e))
    }
}

pub type AuthzResult<T> = Result<T, AuthzError>;

/// HTTP-facing error for the method API.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            // Missing token and wrong secret must be indistinguishable.
            AppError::Authz(AuthzError::NotFound) => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "not_found",
                "not found".to_string(),
            ),
            AppError::Authz(AuthzError::Revoked) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "revoked",
                "token has been revoked".to_string(),
            ),
            AppError::Authz(AuthzError::RevokedByAncestor) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "revoked_by_ancestor",
                "an ancestor of this token has been revoked".to_string(),
            ),
            AppError::Authz(AuthzError::RequirementNotMet { requirement }) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "requirement_not_met",
                format!("requirement not satisfied: {}", requirement),
            ),
            AppError::Authz(AuthzError::Expired) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "expired",
                "token has expired".to_string(),
            ),
            AppError::Authz(AuthzError::InvariantViolation(m)) => (
                StatusCode::CONFLICT,
                "invalid_request_error",
                "invariant_violation",
                m.clone(),
            ),
            AppError::Authz(AuthzError::Configuration(m)) => {
                tracing::error!("Configuration error: {}", m);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "configuration_error",
                    "server misconfiguration".to_string(),
                )
            }
            AppError::Authz(AuthzError::Store(e)) => {
                tracing::error!("Store error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "unauthorized",
                "invalid or missing admin key".to_string(),
            ),
            AppError::BadRequest(m) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "bad_request",
                m.clone(),
            ),
            AppError::UnknownMethod(name) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "unknown_method",
                format!("no such method '{}'", name),
            ),
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revocation_classification() {
        assert!(AuthzError::Revoked.is_revocation());
        assert!(AuthzError::RevokedByAncestor.is_revocation());
        assert!(AuthzError::RequirementNotMet { requirement: "x".into() }.is_revocation());
        assert!(!AuthzError::NotFound.is_revocation());
        assert!(!AuthzError::Expired.is_revocation());
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let resp = AppError::Authz(AuthzError::NotFound).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_invariant_violation_maps_to_409() {
        let resp = AppError::Authz(AuthzError::invariant("last login credential")).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
