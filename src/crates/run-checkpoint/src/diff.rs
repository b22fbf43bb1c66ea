//! Structural diff between two state blobs
//!
//! [`compute_diff`] classifies every top-level key of two blobs as added, removed, changed
//! or unchanged. It is a pure function: no I/O, no locking, inputs are only borrowed.
//!
//! # Equality
//!
//! Two values are equal when their [`canonical_json`] strings are equal. The canonical
//! form sorts object keys recursively and keeps array order, so `{"a":1,"b":2}` and
//! `{"b":2,"a":1}` are equal while `[1,2]` and `[2,1]` are not. Numbers keep their
//! serde_json rendering, which means `1` and `1.0` differ.
//!
//! # Keys
//!
//! The key universe is the union of both blobs' top-level keys: keys of `before` in
//! iteration order, then keys only present in `after`. A blob that is not a JSON object
//! is treated as a single entry under [`ROOT_KEY`].
//!
//! # Output order
//!
//! Changed items first, then added, removed, unchanged. Within a kind, key-union order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write;

/// Key used for a blob that is not an object
pub const ROOT_KEY: &str = "$";

/// Classification of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Added,
    Removed,
    Changed,
    Unchanged,
}

impl DiffKind {
    /// Presentation rank: changed, added, removed, unchanged
    fn rank(self) -> usize {
        match self {
            Self::Changed => 0,
            Self::Added => 1,
            Self::Removed => 2,
            Self::Unchanged => 3,
        }
    }
}

impl std::fmt::Display for DiffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Changed => "changed",
            Self::Unchanged => "unchanged",
        };
        f.write_str(name)
    }
}

/// One key's classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffItem {
    pub key: String,
    pub kind: DiffKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_after: Option<Value>,
}

/// Per-kind counts of a diff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub changed: usize,
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl DiffSummary {
    pub fn from_items(items: &[DiffItem]) -> Self {
        let mut summary = Self::default();
        for item in items {
            match item.kind {
                DiffKind::Changed => summary.changed += 1,
                DiffKind::Added => summary.added += 1,
                DiffKind::Removed => summary.removed += 1,
                DiffKind::Unchanged => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Whether anything differs
    pub fn has_changes(&self) -> bool {
        self.changed + self.added + self.removed > 0
    }
}

/// Compare two blobs key by key.
pub fn compute_diff(before: &Value, after: &Value) -> Vec<DiffItem> {
    let before_entries = entries(before);
    let after_entries = entries(after);
    let before_map: HashMap<&str, &Value> = before_entries.iter().copied().collect();
    let after_map: HashMap<&str, &Value> = after_entries.iter().copied().collect();

    let mut keys: Vec<&str> = before_entries.iter().map(|(k, _)| *k).collect();
    keys.extend(
        after_entries
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| !before_map.contains_key(k)),
    );

    let mut items: Vec<DiffItem> = keys
        .into_iter()
        .map(|key| {
            let value_before = before_map.get(key).map(|v| (*v).clone());
            let value_after = after_map.get(key).map(|v| (*v).clone());
            let kind = match (&value_before, &value_after) {
                (None, Some(_)) => DiffKind::Added,
                (Some(_), None) => DiffKind::Removed,
                (Some(b), Some(a)) if canonical_json(b) == canonical_json(a) => DiffKind::Unchanged,
                _ => DiffKind::Changed,
            };
            DiffItem {
                key: key.to_string(),
                kind,
                value_before,
                value_after,
            }
        })
        .collect();

    // sort_by_key is stable, so key-union order survives within a kind
    items.sort_by_key(|item| item.kind.rank());
    items
}

fn entries(value: &Value) -> Vec<(&str, &Value)> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        other => vec![(ROOT_KEY, other)],
    }
}

/// Deterministic serialization: object keys sorted recursively, arrays in order, no
/// whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Number(n) => {
            let _ = write!(out, "{}", n);
        }
        Value::Bool(b) => {
            let _ = write!(out, "{}", b);
        }
        Value::Null => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json's string escaping is deterministic
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => {
            let _ = write!(out, "{:?}", s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn kinds(items: &[DiffItem]) -> Vec<(&str, DiffKind)> {
        items.iter().map(|i| (i.key.as_str(), i.kind)).collect()
    }

    #[test]
    fn test_presentation_order() {
        let before = json!({"a": 1, "b": 2});
        let after = json!({"a": 1, "b": 3, "c": 4});
        let diff = compute_diff(&before, &after);

        assert_eq!(
            kinds(&diff),
            vec![
                ("b", DiffKind::Changed),
                ("c", DiffKind::Added),
                ("a", DiffKind::Unchanged)
            ]
        );
        assert_eq!(diff[0].value_before, Some(json!(2)));
        assert_eq!(diff[0].value_after, Some(json!(3)));
        assert_eq!(diff[1].value_before, None);
        assert_eq!(diff[1].value_after, Some(json!(4)));
    }

    #[test]
    fn test_all_kinds_in_order() {
        let before = json!({"keep": true, "gone": 1, "edit": "x"});
        let after = json!({"keep": true, "edit": "y", "new": null});
        let diff = compute_diff(&before, &after);

        assert_eq!(
            kinds(&diff),
            vec![
                ("edit", DiffKind::Changed),
                ("new", DiffKind::Added),
                ("gone", DiffKind::Removed),
                ("keep", DiffKind::Unchanged)
            ]
        );
    }

    #[test]
    fn test_nested_mapping_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"ctx": {"user": "u", "tools": ["x", "y"]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"ctx": {"tools": ["x", "y"], "user": "u"}}"#).unwrap();
        assert_eq!(kinds(&compute_diff(&a, &b)), vec![("ctx", DiffKind::Unchanged)]);
    }

    #[test]
    fn test_sequence_order_matters() {
        let a = json!({"messages": ["hi", "there"]});
        let b = json!({"messages": ["there", "hi"]});
        assert_eq!(kinds(&compute_diff(&a, &b)), vec![("messages", DiffKind::Changed)]);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"d": [2, {"z": 0, "y": 1}], "c": "q\""}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":"q\"","d":[2,{"y":1,"z":0}]},"b":1}"#
        );
    }

    #[test]
    fn test_non_object_blobs_use_root_key() {
        let diff = compute_diff(&json!([1, 2]), &json!({"a": 1}));
        assert_eq!(
            kinds(&diff),
            vec![("a", DiffKind::Added), (ROOT_KEY, DiffKind::Removed)]
        );
        assert_eq!(
            kinds(&compute_diff(&json!(5), &json!(6))),
            vec![(ROOT_KEY, DiffKind::Changed)]
        );
    }

    #[test]
    fn test_inputs_are_untouched() {
        let before = json!({"a": {"b": 1}});
        let after = json!({"a": {"b": 2}});
        let (b0, a0) = (before.clone(), after.clone());
        let _ = compute_diff(&before, &after);
        assert_eq!(before, b0);
        assert_eq!(after, a0);
    }

    #[test]
    fn test_summary_counts() {
        let diff = compute_diff(&json!({"a": 1, "b": 2}), &json!({"a": 1, "b": 3, "c": 4}));
        let summary = DiffSummary::from_items(&diff);
        assert_eq!(
            summary,
            DiffSummary {
                changed: 1,
                added: 1,
                removed: 0,
                unchanged: 1
            }
        );
        assert!(summary.has_changes());
    }

    #[test]
    fn test_wide_blobs() {
        let mut before = serde_json::Map::new();
        let mut after = serde_json::Map::new();
        for i in 0..20_000u64 {
            before.insert(format!("k{}", i), json!(i));
            // every third key changes, every fifth is dropped
            if i % 5 != 0 {
                after.insert(format!("k{}", i), json!(if i % 3 == 0 { i + 1 } else { i }));
            }
        }
        after.insert("extra".into(), json!(true));

        let items = compute_diff(&Value::Object(before), &Value::Object(after));
        let summary = DiffSummary::from_items(&items);
        assert_eq!(summary.removed, 4_000);
        assert_eq!(summary.added, 1);
        assert_eq!(summary.changed, 5_333);
        assert_eq!(summary.unchanged, 20_000 - 4_000 - 5_333);
        assert_eq!(items.last().map(|i| i.kind), Some(DiffKind::Unchanged));
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            "[a-z]{0,4}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                prop::collection::btree_map("[a-d]", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn arb_blob() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-f]", arb_value(), 0..6)
            .prop_map(|m| Value::Object(m.into_iter().collect()))
    }

    fn mirror(kind: DiffKind) -> DiffKind {
        match kind {
            DiffKind::Added => DiffKind::Removed,
            DiffKind::Removed => DiffKind::Added,
            other => other,
        }
    }

    proptest! {
        #[test]
        fn prop_diff_with_self_is_all_unchanged(blob in arb_blob()) {
            let diff = compute_diff(&blob, &blob);
            prop_assert_eq!(diff.len(), blob.as_object().map(|m| m.len()).unwrap_or(0));
            prop_assert!(diff.iter().all(|i| i.kind == DiffKind::Unchanged));
        }

        #[test]
        fn prop_diff_is_symmetric(a in arb_blob(), b in arb_blob()) {
            let forward = compute_diff(&a, &b);
            let backward = compute_diff(&b, &a);
            prop_assert_eq!(forward.len(), backward.len());

            for item in &forward {
                let other = backward.iter().find(|o| o.key == item.key);
                prop_assert!(other.is_some());
                let other = other.unwrap();
                prop_assert_eq!(other.kind, mirror(item.kind));
                if item.kind == DiffKind::Changed {
                    prop_assert_eq!(&other.value_before, &item.value_after);
                    prop_assert_eq!(&other.value_after, &item.value_before);
                }
            }
        }

        #[test]
        fn prop_output_is_grouped_by_kind(a in arb_blob(), b in arb_blob()) {
            let ranks: Vec<_> = compute_diff(&a, &b).iter().map(|i| i.kind.rank()).collect();
            prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
