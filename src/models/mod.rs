pub mod api_host;
pub mod grain;
pub mod permissions;
pub mod token;
pub mod user;

use serde_json::Value;

use crate::errors::{AuthzError, AuthzResult};

/// Splits a stored union (`{variantName: payload}`) into its single key and payload. Zero or
/// several keys are a data-integrity error.
pub(crate) fn single_variant<'a>(what: &str, v: &'a Value) -> AuthzResult<(&'a str, &'a Value)> {
    let map = v
        .as_object()
        .ok_or_else(|| AuthzError::invariant(format!("{} must be an object, got {}", what, v)))?;
    let mut keys = map.iter();
    match (keys.next(), keys.next()) {
        (Some((k, payload)), None) => Ok((k.as_str(), payload)),
        (None, _) => Err(AuthzError::invariant(format!("{} has no variant set", what))),
        (Some(_), Some(_)) => Err(AuthzError::invariant(format!(
            "{} has several variants set: {}",
            what,
            map.keys().cloned().collect::<Vec<_>>().join(",")
        ))),
    }
}

pub(crate) fn payload_str(what: &str, v: &Value) -> AuthzResult<String> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| AuthzError::invariant(format!("{} must be a string", what)))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(what: &str, v: &Value) -> AuthzResult<T> {
    serde_json::from_value(v.clone())
        .map_err(|e| AuthzError::invariant(format!("malformed {}: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_variant() {
        let v = json!({"user": {"accountId": "a"}});
        let (k, p) = single_variant("owner", &v).unwrap();
        assert_eq!(k, "user");
        assert_eq!(p["accountId"], "a");
        assert!(single_variant("owner", &json!({})).is_err());
        assert!(single_variant("owner", &json!({"user": {}, "grain": {}})).is_err());
        assert!(single_variant("owner", &json!("webkey")).is_err());
    }
}
