//! Change verdicts between the current and prior snapshots.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::transform::{canonical_key, js_parse_float, number_value};
use crate::watch::WatchConfig;

/// One detected change, in extractor-declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub name: String,
    pub previous: Value,
    pub current: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub comparator: String,
}

/// Compare the current snapshot against the prior one field by field.
/// The extractor list drives both ordering and per-field overrides.
pub fn compute_changes(
    watch: &WatchConfig,
    current: &Map<String, Value>,
    previous: &Map<String, Value>,
) -> Vec<ChangeRecord> {
    let default_comparator = watch.comparator.as_deref().unwrap_or("hash");
    let default_threshold = watch.threshold.unwrap_or(0.0);

    let mut changes = Vec::new();
    for extractor in &watch.extractors {
        let name = &extractor.name;
        let comparator = extractor
            .comparator
            .as_deref()
            .unwrap_or(default_comparator);
        let threshold = extractor.threshold.unwrap_or(default_threshold);

        let cur = current.get(name).unwrap_or(&Value::Null);
        let prev = previous.get(name).unwrap_or(&Value::Null);

        let (changed, details) = verdict(comparator, cur, prev, threshold);
        if changed {
            changes.push(ChangeRecord {
                name: name.clone(),
                previous: prev.clone(),
                current: cur.clone(),
                details,
                comparator: comparator.to_string(),
            });
        }
    }
    changes
}

fn verdict(comparator: &str, cur: &Value, prev: &Value, threshold: f64) -> (bool, Option<Value>) {
    match comparator {
        "exact" => (cur != prev, None),
        "length" => {
            let (cur_len, prev_len) = (value_length(cur), value_length(prev));
            (
                cur_len != prev_len,
                Some(json!({
                    "previous": prev_len,
                    "current": cur_len,
                    "diff": cur_len as i64 - prev_len as i64,
                })),
            )
        }
        "added" => {
            let added = members_missing_from(cur, prev);
            (!added.is_empty(), Some(json!({ "added": added })))
        }
        "removed" => {
            let removed = members_missing_from(prev, cur);
            (!removed.is_empty(), Some(json!({ "removed": removed })))
        }
        "addedOrRemoved" => {
            let added = members_missing_from(cur, prev);
            let removed = members_missing_from(prev, cur);
            (
                !added.is_empty() || !removed.is_empty(),
                Some(json!({ "added": added, "removed": removed })),
            )
        }
        "numeric" => numeric_verdict(cur, prev, |diff| diff.abs() > threshold),
        "increased" => numeric_verdict(cur, prev, |diff| diff > threshold),
        "decreased" => numeric_verdict(cur, prev, |diff| diff < -threshold),
        "none" => (false, None),
        "hash" => hash_verdict(cur, prev),
        other => {
            // `custom` and anything unrecognized degrade to hash
            log::debug!("comparator '{}' degrades to hash", other);
            hash_verdict(cur, prev)
        }
    }
}

fn hash_verdict(cur: &Value, prev: &Value) -> (bool, Option<Value>) {
    (value_hash(cur) != value_hash(prev), None)
}

/// md5 over the canonical JSON serialization
pub fn value_hash(value: &Value) -> String {
    let json = value.to_string();
    format!("{:x}", md5::compute(json.as_bytes()))
}

fn numeric_verdict(
    cur: &Value,
    prev: &Value,
    changed: impl Fn(f64) -> bool,
) -> (bool, Option<Value>) {
    match (js_parse_float(cur), js_parse_float(prev)) {
        (Some(cur_n), Some(prev_n)) => {
            let diff = cur_n - prev_n;
            (
                changed(diff),
                Some(json!({
                    "previous": number_value(prev_n),
                    "current": number_value(cur_n),
                    "diff": number_value(diff),
                })),
            )
        }
        _ => (false, None),
    }
}

/// Sequence length, string length, or the length of the scalar's rendering;
/// null counts as zero.
fn value_length(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len(),
        Value::String(s) => s.chars().count(),
        Value::Null => 0,
        other => crate::transform::scalar_string(other).chars().count(),
    }
}

/// Members of `haystack` absent from `reference`, in order. Non-sequences
/// contribute no members.
fn members_missing_from(haystack: &Value, reference: &Value) -> Vec<Value> {
    let empty = Vec::new();
    let haystack = haystack.as_array().unwrap_or(&empty);
    let reference_keys: HashSet<String> = reference
        .as_array()
        .unwrap_or(&empty)
        .iter()
        .map(canonical_key)
        .collect();
    haystack
        .iter()
        .filter(|item| !reference_keys.contains(&canonical_key(item)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{Extractor, ExtractorKind};
    use serde_json::json;

    fn watch_with(extractors: Vec<(&str, Option<&str>, Option<f64>)>, comparator: Option<&str>, threshold: Option<f64>) -> WatchConfig {
        let extractors = extractors
            .into_iter()
            .map(|(name, cmp, th)| Extractor {
                name: name.to_string(),
                kind: ExtractorKind::Title,
                selector: None,
                xpath: false,
                attribute: None,
                path: None,
                check_frames: false,
                default: None,
                script: None,
                transform: None,
                transforms: Vec::new(),
                filter: None,
                comparator: cmp.map(String::from),
                threshold: th,
                options: Map::new(),
            })
            .collect();
        serde_json::from_value::<WatchConfig>(json!({
            "name": "w",
            "url": "https://example.com",
            "extractors": [{"name": "placeholder", "type": "title"}]
        }))
        .map(|mut w| {
            w.extractors = extractors;
            w.comparator = comparator.map(String::from);
            w.threshold = threshold;
            w
        })
        .unwrap()
    }

    fn snapshot(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_hash_default_detects_change() {
        let watch = watch_with(vec![("title", None, None)], None, None);
        let prev = snapshot(&[("title", json!("Old"))]);
        let cur = snapshot(&[("title", json!("New"))]);
        let changes = compute_changes(&watch, &cur, &prev);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].comparator, "hash");
        assert!(compute_changes(&watch, &cur, &cur).is_empty());
    }

    #[test]
    fn test_added_or_removed_scenario() {
        // prior ["a","b","c"], current ["b","c","d"] -> added ["d"], removed ["a"]
        let watch = watch_with(vec![("items", Some("addedOrRemoved"), None)], None, None);
        let prev = snapshot(&[("items", json!(["a", "b", "c"]))]);
        let cur = snapshot(&[("items", json!(["b", "c", "d"]))]);
        let changes = compute_changes(&watch, &cur, &prev);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "items");
        assert_eq!(
            changes[0].details,
            Some(json!({"added": ["d"], "removed": ["a"]}))
        );
    }

    #[test]
    fn test_added_only() {
        let watch = watch_with(vec![("items", Some("added"), None)], None, None);
        let prev = snapshot(&[("items", json!(["a"]))]);
        let cur = snapshot(&[("items", json!(["a", "b"]))]);
        let changes = compute_changes(&watch, &cur, &prev);
        assert_eq!(changes[0].details, Some(json!({"added": ["b"]})));

        // removal alone is not an addition
        let changes = compute_changes(&watch, &snapshot(&[("items", json!([]))]), &prev);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_structured_set_membership() {
        let watch = watch_with(vec![("opts", Some("removed"), None)], None, None);
        let prev = snapshot(&[("opts", json!([{"value": "1", "text": "One"}, {"value": "2", "text": "Two"}]))]);
        let cur = snapshot(&[("opts", json!([{"value": "2", "text": "Two"}]))]);
        let changes = compute_changes(&watch, &cur, &prev);
        assert_eq!(
            changes[0].details,
            Some(json!({"removed": [{"value": "1", "text": "One"}]}))
        );
    }

    #[test]
    fn test_decreased_threshold_scenario() {
        // prior "€ 120.00" -> current "€ 118.50", threshold 1: changed, diff -1.5
        let watch = watch_with(vec![("price", Some("decreased"), Some(1.0))], None, None);
        let prev = snapshot(&[("price", json!(120.0))]);
        let cur = snapshot(&[("price", json!(118.5))]);
        let changes = compute_changes(&watch, &cur, &prev);
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].details,
            Some(json!({"previous": 120, "current": 118.5, "diff": -1.5}))
        );

        // threshold 2: no change
        let watch = watch_with(vec![("price", Some("decreased"), Some(2.0))], None, None);
        assert!(compute_changes(&watch, &cur, &prev).is_empty());
    }

    #[test]
    fn test_increased_ignores_decrease() {
        let watch = watch_with(vec![("count", Some("increased"), None)], None, None);
        let prev = snapshot(&[("count", json!(5))]);
        assert!(!compute_changes(&watch, &snapshot(&[("count", json!(3))]), &prev)
            .iter()
            .any(|c| c.name == "count"));
        let changes = compute_changes(&watch, &snapshot(&[("count", json!(8))]), &prev);
        assert_eq!(
            changes[0].details,
            Some(json!({"previous": 5, "current": 8, "diff": 3}))
        );
    }

    #[test]
    fn test_numeric_parses_leading_prefix() {
        let watch = watch_with(vec![("price", Some("numeric"), Some(0.5))], None, None);
        let prev = snapshot(&[("price", json!("10.00 USD"))]);
        let cur = snapshot(&[("price", json!("11.00 USD"))]);
        let changes = compute_changes(&watch, &cur, &prev);
        assert_eq!(changes.len(), 1);

        // unparseable values are "not changed"
        let cur = snapshot(&[("price", json!("sold out"))]);
        assert!(compute_changes(&watch, &cur, &prev).is_empty());
    }

    #[test]
    fn test_length_missing_prior_is_zero() {
        let watch = watch_with(vec![("rows", Some("length"), None)], None, None);
        let cur = snapshot(&[("rows", json!(["a", "b"]))]);
        let changes = compute_changes(&watch, &cur, &Map::new());
        assert_eq!(
            changes[0].details,
            Some(json!({"previous": 0, "current": 2, "diff": 2}))
        );
    }

    #[test]
    fn test_none_never_changes() {
        let watch = watch_with(vec![("x", Some("none"), None)], None, None);
        let prev = snapshot(&[("x", json!(1))]);
        let cur = snapshot(&[("x", json!(2))]);
        assert!(compute_changes(&watch, &cur, &prev).is_empty());
    }

    #[test]
    fn test_unknown_comparator_degrades_to_hash() {
        let watch = watch_with(vec![("x", Some("bogus"), None)], None, None);
        let prev = snapshot(&[("x", json!(1))]);
        let cur = snapshot(&[("x", json!(2))]);
        let changes = compute_changes(&watch, &cur, &prev);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].comparator, "bogus");
    }

    #[test]
    fn test_change_order_follows_declaration() {
        let watch = watch_with(
            vec![("b", Some("exact"), None), ("a", Some("exact"), None)],
            None,
            None,
        );
        let prev = snapshot(&[("a", json!(1)), ("b", json!(1))]);
        let cur = snapshot(&[("a", json!(2)), ("b", json!(2))]);
        let names: Vec<_> = compute_changes(&watch, &cur, &prev)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_watch_level_default_applies() {
        let watch = watch_with(vec![("n", None, None)], Some("numeric"), Some(5.0));
        let prev = snapshot(&[("n", json!(10))]);
        assert!(compute_changes(&watch, &snapshot(&[("n", json!(14))]), &prev).is_empty());
        assert_eq!(
            compute_changes(&watch, &snapshot(&[("n", json!(16))]), &prev).len(),
            1
        );
    }
}
