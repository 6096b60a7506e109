use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::AuthzError;

// ── PermissionSet ────────────────────────────────────────────

/// Permissions on one grain, indexed like the grain's `ViewInfo.permissions`. Missing trailing
/// entries count as `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(Vec<bool>);

impl PermissionSet {
    pub fn new(bits: Vec<bool>) -> Self {
        Self(bits)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn all(len: usize) -> Self {
        Self(vec![true; len])
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }

    pub fn has(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|p| *p)
    }

    pub fn is_subset_of(&self, other: &PermissionSet) -> bool {
        self.0
            .iter()
            .enumerate()
            .all(|(i, mine)| !*mine || other.has(i))
    }

    /// Union in place. Returns whether anything changed.
    pub fn add(&mut self, other: &PermissionSet) -> bool {
        if self.0.len() < other.0.len() {
            self.0.resize(other.0.len(), false);
        }
        let mut changed = false;
        for (i, p) in other.0.iter().enumerate() {
            if *p && !self.0[i] {
                self.0[i] = true;
                changed = true;
            }
        }
        changed
    }

    /// Set difference in place. Returns whether anything changed.
    pub fn remove(&mut self, other: &PermissionSet) -> bool {
        let mut changed = false;
        for (i, p) in self.0.iter_mut().enumerate() {
            if *p && other.has(i) {
                *p = false;
                changed = true;
            }
        }
        changed
    }

    /// Intersection in place. Returns whether anything changed.
    pub fn intersect(&mut self, other: &PermissionSet) -> bool {
        let mut changed = false;
        for (i, p) in self.0.iter_mut().enumerate() {
            if *p && !other.has(i) {
                *p = false;
                changed = true;
            }
        }
        changed
    }

    pub fn intersection(mut self, other: &PermissionSet) -> Self {
        self.intersect(other);
        self
    }

    /// Whether every permission set in `required` is held.
    pub fn covers(&self, required: &[bool]) -> bool {
        required
            .iter()
            .enumerate()
            .all(|(i, needed)| !*needed || self.has(i))
    }

    /// Permissions granted by a role assignment on a grain with the given view info.
    pub fn from_role_assignment(ra: &RoleAssignment, view: &ViewInfo) -> Self {
        let mut result = match &ra.role {
            Role::None => view
                .roles
                .iter()
                .find(|r| r.default)
                .map(|r| PermissionSet::new(r.permissions.clone()))
                .unwrap_or_default(),
            Role::AllAccess => PermissionSet::all(view.permissions.len()),
            Role::RoleId(id) => view
                .roles
                .get(*id as usize)
                .map(|r| PermissionSet::new(r.permissions.clone()))
                .unwrap_or_default(),
        };
        result.add(&PermissionSet::new(ra.add.clone()));
        result.remove(&PermissionSet::new(ra.remove.clone()));
        result
    }
}

// ── ViewInfo ─────────────────────────────────────────────────

/// The slice of an app's `UiView.ViewInfo` cached on each grain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewInfo {
    /// Permission descriptors; only the count matters here.
    #[serde(default)]
    pub permissions: Vec<Value>,
    #[serde(default)]
    pub roles: Vec<RoleDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleDef {
    #[serde(default)]
    pub permissions: Vec<bool>,
    #[serde(default)]
    pub default: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── RoleAssignment ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No role chosen: the grain's default role applies.
    None,
    AllAccess,
    RoleId(u32),
}

/// Stored as `{none: null}`, `{allAccess: null}` or `{roleId: n}`, optionally with
/// `addPermissions`/`removePermissions` bit lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct RoleAssignment {
    pub role: Role,
    pub add: Vec<bool>,
    pub remove: Vec<bool>,
}

impl RoleAssignment {
    pub fn all_access() -> Self {
        Self::of(Role::AllAccess)
    }

    pub fn none() -> Self {
        Self::of(Role::None)
    }

    pub fn role(id: u32) -> Self {
        Self::of(Role::RoleId(id))
    }

    fn of(role: Role) -> Self {
        Self {
            role,
            add: Vec::new(),
            remove: Vec::new(),
        }
    }
}

impl Default for RoleAssignment {
    fn default() -> Self {
        Self::none()
    }
}

fn bool_list(map: &Map<String, Value>, keys: &[&str]) -> Result<Vec<bool>, AuthzError> {
    for key in keys {
        if let Some(v) = map.get(*key) {
            return match v {
                Value::Null => Ok(Vec::new()),
                Value::Array(items) => items
                    .iter()
                    .map(|b| {
                        b.as_bool()
                            .ok_or_else(|| AuthzError::invariant(format!("{} must hold booleans", key)))
                    })
                    .collect(),
                _ => Err(AuthzError::invariant(format!("{} must be a list", key))),
            };
        }
    }
    Ok(Vec::new())
}

impl TryFrom<Value> for RoleAssignment {
    type Error = AuthzError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        // A missing or null assignment means "no role chosen".
        let map = match v {
            Value::Null => return Ok(Self::none()),
            Value::Object(map) => map,
            other => {
                return Err(AuthzError::invariant(format!(
                    "roleAssignment must be an object, got {}",
                    other
                )))
            }
        };
        let mut roles = Vec::new();
        if map.contains_key("none") {
            roles.push(Role::None);
        }
        if map.contains_key("allAccess") {
            roles.push(Role::AllAccess);
        }
        if let Some(id) = map.get("roleId") {
            let id = id
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| AuthzError::invariant("roleId must be a non-negative integer"))?;
            roles.push(Role::RoleId(id));
        }
        let role = match roles.as_slice() {
            [] => Role::None,
            [one] => *one,
            _ => return Err(AuthzError::invariant("roleAssignment names more than one role")),
        };
        Ok(Self {
            role,
            add: bool_list(&map, &["addPermissions", "addPermissionSet"])?,
            remove: bool_list(&map, &["removePermissions", "removePermissionSet"])?,
        })
    }
}

impl From<RoleAssignment> for Value {
    fn from(ra: RoleAssignment) -> Value {
        let mut v = match ra.role {
            Role::None => json!({ "none": null }),
            Role::AllAccess => json!({ "allAccess": null }),
            Role::RoleId(id) => json!({ "roleId": id }),
        };
        if let Some(map) = v.as_object_mut() {
            if !ra.add.is_empty() {
                map.insert("addPermissions".into(), json!(ra.add));
            }
            if !ra.remove.is_empty() {
                map.insert("removePermissions".into(), json!(ra.remove));
            }
        }
        v
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ViewInfo {
        serde_json::from_value(json!({
            "permissions": [{"name": "edit"}, {"name": "view"}, {"name": "admin"}],
            "roles": [
                {"permissions": [true, true, false], "title": "editor"},
                {"permissions": [false, true, false], "default": true, "title": "viewer"},
            ],
        }))
        .unwrap()
    }

    #[test]
    fn test_none_assignment_uses_default_role() {
        let p = PermissionSet::from_role_assignment(&RoleAssignment::none(), &view());
        assert_eq!(p.as_slice(), &[false, true, false]);
    }

    #[test]
    fn test_all_access_covers_every_permission() {
        let p = PermissionSet::from_role_assignment(&RoleAssignment::all_access(), &view());
        assert_eq!(p, PermissionSet::all(3));
    }

    #[test]
    fn test_role_with_add_and_remove() {
        let ra: RoleAssignment = serde_json::from_value(json!({
            "roleId": 0,
            "addPermissions": [false, false, true],
            "removePermissions": [true],
        }))
        .unwrap();
        let p = PermissionSet::from_role_assignment(&ra, &view());
        assert_eq!(p.as_slice(), &[false, true, true]);
    }

    #[test]
    fn test_unknown_role_grants_nothing() {
        let p = PermissionSet::from_role_assignment(&RoleAssignment::role(9), &view());
        assert!(p.is_empty());
    }

    #[test]
    fn test_two_roles_rejected() {
        let r: Result<RoleAssignment, _> =
            serde_json::from_value(json!({"allAccess": null, "roleId": 1}));
        assert!(r.is_err());
    }

    #[test]
    fn test_role_assignment_stored_shape() {
        assert_eq!(Value::from(RoleAssignment::all_access()), json!({"allAccess": null}));
        let back: RoleAssignment = serde_json::from_value(json!({"roleId": 1})).unwrap();
        assert_eq!(back, RoleAssignment::role(1));
    }

    #[test]
    fn test_set_algebra() {
        let mut a = PermissionSet::new(vec![true, false, true]);
        let b = PermissionSet::new(vec![true, true]);
        assert!(!a.is_subset_of(&b));
        assert!(a.intersect(&b));
        assert_eq!(a.as_slice(), &[true, false, false]);
        assert!(a.is_subset_of(&b));
        assert!(a.covers(&[true]));
        assert!(!a.covers(&[false, true]));
        assert!(a.add(&b));
        assert!(!a.add(&b));
    }
}
