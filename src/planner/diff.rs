//! Field-level diff between two JSON resource states.
//!
//! This module computes the list of changed field paths between the last
//! saved state and the desired state. Lists can be compared by a key field
//! instead of by position, so reordering does not register as a change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::path::{key_text, normalize_pattern};

/// A single changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Path of the changed field.
    pub path: String,
    /// Previous value (absent when the field was added).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    /// New value (absent when the field was removed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

/// List fields that are compared by key instead of by position.
///
/// Maps a path pattern (selectors written as `[*]`) to the name of the field
/// that identifies each element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyedSlices(BTreeMap<String, String>);

impl KeyedSlices {
    /// Creates an empty keyed-slice configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Registers a key field for a list path pattern.
    #[must_use]
    pub fn with(mut self, pattern: impl Into<String>, key_field: impl Into<String>) -> Self {
        self.0.insert(pattern.into(), key_field.into());
        self
    }

    /// Returns the key field for a concrete list path.
    #[must_use]
    pub fn key_field(&self, path: &str) -> Option<&str> {
        if self.0.is_empty() {
            return None;
        }
        self.0.get(&normalize_pattern(path)).map(String::as_str)
    }

    /// Returns true if no list is keyed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for KeyedSlices {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Computes the changes between `old` and `new`.
///
/// `null` and an absent field are considered equal.
#[must_use]
pub fn diff(old: &Value, new: &Value, keyed: &KeyedSlices) -> Vec<Change> {
    let mut changes = Vec::new();
    diff_at("", present(Some(old)), present(Some(new)), keyed, &mut changes);
    changes
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn child(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{path}.{field}")
    }
}

fn diff_at(
    path: &str,
    old: Option<&Value>,
    new: Option<&Value>,
    keyed: &KeyedSlices,
    out: &mut Vec<Change>,
) {
    match (old, new) {
        (None, None) => {}
        (Some(Value::Object(a)), Some(Value::Object(b))) => diff_objects(path, a, b, keyed, out),
        (Some(Value::Array(a)), Some(Value::Array(b))) => diff_arrays(path, a, b, keyed, out),
        (a, b) if a == b => {}
        (a, b) => out.push(Change {
            path: path.to_string(),
            old: a.cloned(),
            new: b.cloned(),
        }),
    }
}

fn diff_objects(
    path: &str,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    keyed: &KeyedSlices,
    out: &mut Vec<Change>,
) {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for key in keys {
        diff_at(
            &child(path, key),
            present(old.get(key)),
            present(new.get(key)),
            keyed,
            out,
        );
    }
}

fn diff_arrays(
    path: &str,
    old: &[Value],
    new: &[Value],
    keyed: &KeyedSlices,
    out: &mut Vec<Change>,
) {
    if let Some(field) = keyed.key_field(path)
        && let (Some(old_keyed), Some(new_keyed)) = (index_by(old, field), index_by(new, field))
    {
        let mut order: Vec<&String> = old_keyed.iter().map(|(k, _)| k).collect();
        for (k, _) in &new_keyed {
            if !order.contains(&k) {
                order.push(k);
            }
        }
        for key in order {
            let before = old_keyed.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
            let after = new_keyed.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
            diff_at(
                &format!("{path}[{field}='{key}']"),
                present(before),
                present(after),
                keyed,
                out,
            );
        }
        return;
    }

    for i in 0..old.len().max(new.len()) {
        diff_at(
            &format!("{path}[{i}]"),
            present(old.get(i)),
            present(new.get(i)),
            keyed,
            out,
        );
    }
}

/// Pairs each element with its key; `None` if any element lacks one or two
/// elements share a key, in which case the list is compared by position.
fn index_by<'a>(items: &'a [Value], field: &str) -> Option<Vec<(String, &'a Value)>> {
    let indexed: Vec<(String, &Value)> = items
        .iter()
        .map(|item| item.get(field).and_then(key_text).map(|k| (k, item)))
        .collect::<Option<_>>()?;

    let mut seen = BTreeSet::new();
    if indexed.iter().all(|(k, _)| seen.insert(k.as_str())) {
        Some(indexed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(changes: &[Change]) -> Vec<&str> {
        changes.iter().map(|c| c.path.as_str()).collect()
    }

    #[test]
    fn test_identical_states_have_no_changes() {
        let state = json!({"name": "a", "tags": {"team": "x"}, "tasks": [1, 2]});
        assert!(diff(&state, &state, &KeyedSlices::new()).is_empty());
    }

    #[test]
    fn test_null_equals_absent() {
        let old = json!({"name": "a", "description": null});
        let new = json!({"name": "a"});
        assert!(diff(&old, &new, &KeyedSlices::new()).is_empty());
    }

    #[test]
    fn test_nested_field_change() {
        let old = json!({"name": "old", "settings": {"size": 1, "region": "eu"}});
        let new = json!({"name": "new", "settings": {"size": 2, "region": "eu"}});
        let changes = diff(&old, &new, &KeyedSlices::new());

        assert_eq!(paths(&changes), vec!["name", "settings.size"]);
        assert_eq!(changes[0].old, Some(json!("old")));
        assert_eq!(changes[0].new, Some(json!("new")));
    }

    #[test]
    fn test_added_and_removed_fields() {
        let old = json!({"a": 1});
        let new = json!({"b": 2});
        let changes = diff(&old, &new, &KeyedSlices::new());

        assert_eq!(paths(&changes), vec!["a", "b"]);
        assert_eq!(changes[0].new, None);
        assert_eq!(changes[1].old, None);
    }

    #[test]
    fn test_keyed_slices_ignore_reordering() {
        let old = json!({"tasks": [{"task_key": "a", "t": 1}, {"task_key": "b", "t": 2}]});
        let new = json!({"tasks": [{"task_key": "b", "t": 2}, {"task_key": "a", "t": 1}]});

        let positional = diff(&old, &new, &KeyedSlices::new());
        assert!(!positional.is_empty());

        let keyed = KeyedSlices::new().with("tasks", "task_key");
        assert!(diff(&old, &new, &keyed).is_empty());
    }

    #[test]
    fn test_keyed_slice_change_path() {
        let old = json!({"tasks": [{"task_key": "a", "t": 1}]});
        let new = json!({"tasks": [{"task_key": "a", "t": 5}, {"task_key": "c"}]});
        let keyed = KeyedSlices::new().with("tasks", "task_key");
        let changes = diff(&old, &new, &keyed);

        assert_eq!(
            paths(&changes),
            vec!["tasks[task_key='a'].t", "tasks[task_key='c']"]
        );
    }

    #[test]
    fn test_duplicate_keys_fall_back_to_position() {
        let old = json!({"tasks": [{"task_key": "a", "t": 1}, {"task_key": "a", "t": 2}]});
        let new = json!({"tasks": [
            {"task_key": "a", "t": 1},
            {"task_key": "a", "t": 99},
            {"task_key": "a", "t": 7}
        ]});
        let keyed = KeyedSlices::new().with("tasks", "task_key");
        let changes = diff(&old, &new, &keyed);

        assert_eq!(paths(&changes), vec!["tasks[1].t", "tasks[2]"]);
        assert_eq!(changes[0].old, Some(json!(2)));
        assert_eq!(changes[0].new, Some(json!(99)));
    }

    #[test]
    fn test_type_change_is_reported_at_field() {
        let old = json!({"spec": {"x": 1}});
        let new = json!({"spec": "inline"});
        let changes = diff(&old, &new, &KeyedSlices::new());
        assert_eq!(paths(&changes), vec!["spec"]);
    }
}
