//! Dotted-path access and filters over JSON documents.
//!
//! Paths follow the document-database convention: `owner.user.accountId` descends through
//! objects, and an array met on the way is fanned out, so `loginCredentials.id` addresses the
//! `id` of every element.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub type Document = Value;

/// Every value reachable at `path`.
pub fn values_at<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for v in current {
            collect_segment(v, segment, &mut next);
        }
        current = next;
    }
    current
}

fn collect_segment<'a>(v: &'a Value, segment: &str, out: &mut Vec<&'a Value>) {
    match v {
        Value::Object(map) => {
            if let Some(child) = map.get(segment) {
                out.push(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_segment(item, segment, out);
            }
        }
        _ => {}
    }
}

/// Single value at a path that does not cross arrays.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |v, seg| v.as_object()?.get(seg))
}

pub fn get_str<'a>(doc: &'a Value, path: &str) -> Option<&'a str> {
    get_path(doc, path).and_then(Value::as_str)
}

pub fn has_path(doc: &Value, path: &str) -> bool {
    get_path(doc, path).is_some()
}

/// Sets `path`, creating intermediate objects. Returns false if a non-object is in the way.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> bool {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return false;
    };
    let mut current = doc;
    for seg in segments {
        let Some(map) = current.as_object_mut() else {
            return false;
        };
        current = map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    match current.as_object_mut() {
        Some(map) => {
            map.insert(last.to_string(), value);
            true
        }
        None => false,
    }
}

/// Removes `path` and returns the old value, if any.
pub fn remove_path(doc: &mut Value, path: &str) -> Option<Value> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop()?;
    let mut current = doc;
    for seg in segments {
        current = current.as_object_mut()?.get_mut(seg)?;
    }
    current.as_object_mut()?.remove(last)
}

/// Removes `field` from every element of the array at `array_path`. Returns whether anything
/// was removed.
pub fn remove_in_array(doc: &mut Value, array_path: &str, field: &str) -> bool {
    let Some(Value::Array(items)) = get_path_mut(doc, array_path) else {
        return false;
    };
    let mut removed = false;
    for item in items.iter_mut() {
        if let Some(obj) = item.as_object_mut() {
            removed |= obj.remove(field).is_some();
        }
    }
    removed
}

pub fn get_path_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .try_fold(doc, |v, seg| v.as_object_mut()?.get_mut(seg))
}

/// Renames a top-level field. Returns false if the source field was absent.
pub fn rename_field(doc: &mut Value, from: &str, to: &str) -> bool {
    let Some(map) = doc.as_object_mut() else {
        return false;
    };
    match map.remove(from) {
        Some(v) => {
            map.insert(to.to_string(), v);
            true
        }
        None => false,
    }
}

pub fn doc_id(doc: &Value) -> Option<&str> {
    get_str(doc, "_id")
}

/// Predicate over documents. Stores may push parts of it down to their query engine but always
/// produce exactly the documents for which [`Filter::matches`] holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// Some value at the path equals the operand.
    Eq(String, Value),
    /// Some value at the path is one of the operands.
    In(String, Vec<Value>),
    Exists(String),
    Missing(String),
    /// Some value at the path orders strictly before the operand (dates compare as dates).
    Lt(String, Value),
    /// Some value at the path is a JSON number.
    IsNumber(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(path.to_string(), value.into())
    }

    pub fn exists(path: &str) -> Self {
        Filter::Exists(path.to_string())
    }

    pub fn missing(path: &str) -> Self {
        Filter::Missing(path.to_string())
    }

    pub fn lt(path: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(path.to_string(), value.into())
    }

    pub fn id(id: &str) -> Self {
        Filter::eq("_id", id)
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(path, expected) => values_at(doc, path).into_iter().any(|v| v == expected),
            Filter::In(path, options) => values_at(doc, path)
                .into_iter()
                .any(|v| options.iter().any(|o| o == v)),
            // A stored `null` counts as present, matching the source database's `$exists`.
            Filter::Exists(path) => !values_at(doc, path).is_empty(),
            Filter::Missing(path) => values_at(doc, path).is_empty(),
            Filter::Lt(path, bound) => values_at(doc, path)
                .into_iter()
                .any(|v| compare_values(v, bound) == Some(Ordering::Less)),
            Filter::IsNumber(path) => values_at(doc, path).into_iter().any(Value::is_number),
            Filter::And(all) => all.iter().all(|f| f.matches(doc)),
            Filter::Or(any) => any.iter().any(|f| f.matches(doc)),
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (x.parse::<DateTime<Utc>>(), y.parse::<DateTime<Utc>>()) {
                (Ok(dx), Ok(dy)) => Some(dx.cmp(&dy)),
                _ => Some(x.cmp(y)),
            }
        }
        _ => None,
    }
}
