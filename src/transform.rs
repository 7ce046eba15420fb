//! Pure data reshapers applied to extractor output.
//!
//! Every transform tolerates null by returning it unchanged and no-ops
//! gracefully on a type mismatch. Unknown transform names are identity.

use serde_json::{Map, Value};

use crate::jsonpath;
use crate::watch::TransformSpec;

/// Apply an ordered transform pipeline.
pub fn apply_specs(specs: &[TransformSpec], value: Value) -> Value {
    let empty = Map::new();
    specs.iter().fold(value, |value, spec| match spec {
        TransformSpec::Name(name) => apply(name, &empty, value),
        TransformSpec::Detailed { kind, options } => apply(kind, options, value),
    })
}

/// Apply one transform by name.
pub fn apply(name: &str, options: &Map<String, Value>, value: Value) -> Value {
    // parseNumber is the one transform with defined null behavior
    if value.is_null() && name != "parseNumber" {
        return value;
    }

    match name {
        "flatten" => flatten(value, opt_u64(options, "depth").unwrap_or(1)),
        "unique" => unique(value),
        "sort" => sort(
            value,
            opt_str(options, "key"),
            opt_bool(options, "desc").unwrap_or(false),
        ),
        "reverse" => reverse(value),
        "join" => join(value, &opt_str(options, "separator").unwrap_or_else(|| ", ".into())),
        "split" => split(value, &opt_str(options, "separator").unwrap_or_else(|| ",".into())),
        "first" => first(value),
        "last" => last(value),
        "slice" => slice(
            value,
            opt_u64(options, "start").unwrap_or(0) as usize,
            opt_u64(options, "end").map(|e| e as usize),
        ),
        "filter" => filter(
            value,
            opt_str(options, "include").as_deref(),
            opt_str(options, "exclude").as_deref(),
        ),
        "map" | "pluck" => pluck(value, opt_str(options, "key").as_deref()),
        "trim" => map_strings(value, |s| s.trim().to_string()),
        "lowercase" => map_strings(value, |s| s.to_lowercase()),
        "uppercase" => map_strings(value, |s| s.to_uppercase()),
        "regex" => regex_match(
            value,
            &opt_str(options, "pattern").unwrap_or_default(),
            &opt_str(options, "flags").unwrap_or_else(|| "g".into()),
        ),
        "replace" => regex_replace(
            value,
            &opt_str(options, "pattern").unwrap_or_default(),
            &opt_str(options, "replacement").unwrap_or_default(),
            &opt_str(options, "flags").unwrap_or_else(|| "g".into()),
        ),
        "parseNumber" => parse_number(value),
        "parseJson" => parse_json(value),
        "jsonPath" => match opt_str(options, "path") {
            Some(path) => jsonpath::lookup(&value, &path),
            None => value,
        },
        "compact" => compact(value),
        other => {
            log::debug!("unknown transform '{}', passing value through", other);
            value
        }
    }
}

fn opt_str(options: &Map<String, Value>, key: &str) -> Option<String> {
    options.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn opt_u64(options: &Map<String, Value>, key: &str) -> Option<u64> {
    options.get(key).and_then(|v| v.as_u64())
}

fn opt_bool(options: &Map<String, Value>, key: &str) -> Option<bool> {
    options.get(key).and_then(|v| v.as_bool())
}

fn flatten(value: Value, depth: u64) -> Value {
    match value {
        Value::Array(items) if depth > 0 => {
            let mut out = Vec::new();
            for item in items {
                match item {
                    Value::Array(_) => match flatten(item, depth - 1) {
                        Value::Array(inner) => out.extend(inner),
                        other => out.push(other),
                    },
                    other => out.push(other),
                }
            }
            Value::Array(out)
        }
        other => other,
    }
}

/// Stable first-wins dedup by structural (JSON) equality
fn unique(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for item in items {
                let key = canonical_key(&item);
                if seen.insert(key) {
                    out.push(item);
                }
            }
            Value::Array(out)
        }
        other => other,
    }
}

fn sort(value: Value, key: Option<String>, desc: bool) -> Value {
    match value {
        Value::Array(mut items) => {
            let sort_key = |item: &Value| -> Value {
                match &key {
                    Some(k) => item.get(k).cloned().unwrap_or(Value::Null),
                    None => item.clone(),
                }
            };
            items.sort_by(|a, b| {
                let (ka, kb) = (sort_key(a), sort_key(b));
                let ordering = match (js_parse_float(&ka), js_parse_float(&kb)) {
                    (Some(na), Some(nb)) => {
                        na.partial_cmp(&nb).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    _ => scalar_string(&ka).cmp(&scalar_string(&kb)),
                };
                if desc { ordering.reverse() } else { ordering }
            });
            Value::Array(items)
        }
        other => other,
    }
}

fn reverse(value: Value) -> Value {
    match value {
        Value::Array(mut items) => {
            items.reverse();
            Value::Array(items)
        }
        other => other,
    }
}

fn join(value: Value, separator: &str) -> Value {
    match value {
        Value::Array(items) => Value::String(
            items
                .iter()
                .map(scalar_string)
                .collect::<Vec<_>>()
                .join(separator),
        ),
        other => other,
    }
}

fn split(value: Value, separator: &str) -> Value {
    match value {
        Value::String(s) => Value::Array(
            s.split(separator)
                .map(|piece| Value::String(piece.trim().to_string()))
                .collect(),
        ),
        other => other,
    }
}

fn first(value: Value) -> Value {
    match value {
        Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
        other => other,
    }
}

fn last(value: Value) -> Value {
    match value {
        Value::Array(items) => items.into_iter().next_back().unwrap_or(Value::Null),
        other => other,
    }
}

fn slice(value: Value, start: usize, end: Option<usize>) -> Value {
    match value {
        Value::Array(items) => {
            let end = end.unwrap_or(items.len()).min(items.len());
            let start = start.min(end);
            Value::Array(items[start..end].to_vec())
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let end = end.unwrap_or(chars.len()).min(chars.len());
            let start = start.min(end);
            Value::String(chars[start..end].iter().collect())
        }
        other => other,
    }
}

/// Keep array elements matching `include` and not matching `exclude`.
/// Records are matched against their `value` or `text` field.
fn filter(value: Value, include: Option<&str>, exclude: Option<&str>) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|item| {
                    let subject = filter_subject(item);
                    let included = include.map(|i| subject.contains(i)).unwrap_or(true);
                    let excluded = exclude.map(|e| subject.contains(e)).unwrap_or(false);
                    included && !excluded
                })
                .collect(),
        ),
        other => other,
    }
}

fn filter_subject(item: &Value) -> String {
    if let Value::Object(map) = item {
        for field in ["value", "text"] {
            if let Some(v) = map.get(field) {
                return scalar_string(v);
            }
        }
    }
    scalar_string(item)
}

fn pluck(value: Value, key: Option<&str>) -> Value {
    let key = match key {
        Some(k) => k.to_string(),
        None => return value,
    };
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| item.get(&key).cloned().unwrap_or(Value::Null))
                .collect(),
        ),
        other => other,
    }
}

/// Apply a string operation to a string value, or map it over a sequence.
fn map_strings(value: Value, op: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(op(&s)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Value::String(op(&s)),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

fn build_regex(pattern: &str, flags: &str) -> Option<regex::Regex> {
    let pattern = if flags.contains('i') {
        format!("(?i){}", pattern)
    } else {
        pattern.to_string()
    };
    match regex::Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            log::debug!("invalid regex '{}': {}", pattern, e);
            None
        }
    }
}

fn regex_match(value: Value, pattern: &str, flags: &str) -> Value {
    let re = match build_regex(pattern, flags) {
        Some(re) => re,
        None => return value,
    };
    match value {
        Value::String(s) => {
            let matches: Vec<Value> = if flags.contains('g') {
                re.find_iter(&s)
                    .map(|m| Value::String(m.as_str().to_string()))
                    .collect()
            } else {
                re.find(&s)
                    .map(|m| Value::String(m.as_str().to_string()))
                    .into_iter()
                    .collect()
            };
            Value::Array(matches)
        }
        other => other,
    }
}

fn regex_replace(value: Value, pattern: &str, replacement: &str, flags: &str) -> Value {
    let re = match build_regex(pattern, flags) {
        Some(re) => re,
        None => return value,
    };
    let global = flags.contains('g');
    map_strings(value, move |s| {
        if global {
            re.replace_all(s, replacement).into_owned()
        } else {
            re.replace(s, replacement).into_owned()
        }
    })
}

/// Strip non-numeric characters, then parse. Null-safe: failures become 0.
fn parse_number(value: Value) -> Value {
    let parsed = match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let stripped: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            leading_float(&stripped)
        }
        Value::Array(items) => return parse_number(items.first().cloned().unwrap_or(Value::Null)),
        _ => None,
    };
    number_value(parsed.unwrap_or(0.0))
}

fn parse_json(value: Value) -> Value {
    if let Value::String(s) = &value {
        if let Ok(parsed) = serde_json::from_str(s) {
            return parsed;
        }
    }
    value
}

/// Drop null and empty-string elements
fn compact(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|item| !item.is_null() && item.as_str() != Some(""))
                .collect(),
        ),
        other => other,
    }
}

/// JSON serialization for structured values, string coercion for scalars.
/// Used for set membership, joining, and message rendering.
pub(crate) fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => fmt_number(n),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Structural-equality key: scalars coerce to strings, structures serialize.
pub(crate) fn canonical_key(value: &Value) -> String {
    scalar_string(value)
}

/// Render a JSON number without a trailing `.0` for whole floats
pub(crate) fn fmt_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.abs() < 1e15 {
            return (f as i64).to_string();
        }
        return f.to_string();
    }
    n.to_string()
}

/// Wrap an f64 as a JSON number, preferring integers for whole values
pub(crate) fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        Value::from(f as i64)
    } else {
        Value::from(f)
    }
}

/// Leniently parse a value as a float the way a page script would:
/// numbers pass through, strings parse their leading numeric prefix,
/// sequences defer to their first element.
pub(crate) fn js_parse_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => leading_float(s),
        Value::Array(items) => items.first().and_then(js_parse_float),
        _ => None,
    }
}

fn leading_float(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let mut saw_digit = false;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
        saw_digit = true;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
            saw_digit = true;
        }
    }
    if !saw_digit {
        return None;
    }
    // optional exponent
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > digits_start {
            end = exp_end;
        }
    }
    s[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn named(name: &str) -> TransformSpec {
        TransformSpec::Name(name.to_string())
    }

    fn with_opts(name: &str, options: serde_json::Value) -> TransformSpec {
        TransformSpec::Detailed {
            kind: name.to_string(),
            options: options.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_null_passes_through() {
        for name in ["trim", "sort", "join", "regex", "jsonPath"] {
            assert_eq!(apply(name, &Map::new(), Value::Null), Value::Null);
        }
    }

    #[test]
    fn test_unknown_transform_is_identity() {
        let v = json!(["a", "b"]);
        assert_eq!(apply("frobnicate", &Map::new(), v.clone()), v);
    }

    #[test]
    fn test_trim_maps_over_sequences() {
        assert_eq!(
            apply("trim", &Map::new(), json!(["  a ", "b", 3])),
            json!(["a", "b", 3])
        );
        assert_eq!(apply("trim", &Map::new(), json!(42)), json!(42));
    }

    #[test]
    fn test_flatten_depth() {
        let v = json!([[1, [2, 3]], [4]]);
        assert_eq!(apply("flatten", &Map::new(), v.clone()), json!([1, [2, 3], 4]));
        let specs = [with_opts("flatten", json!({"depth": 2}))];
        assert_eq!(apply_specs(&specs, v), json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_unique_first_wins() {
        assert_eq!(
            apply("unique", &Map::new(), json!(["a", "b", "a", "c", "b"])),
            json!(["a", "b", "c"])
        );
    }

    #[test]
    fn test_sort_numeric_and_by_key() {
        assert_eq!(
            apply("sort", &Map::new(), json!(["10", "2", "1"])),
            json!(["1", "2", "10"])
        );
        let specs = [with_opts("sort", json!({"key": "value", "desc": true}))];
        assert_eq!(
            apply_specs(&specs, json!([{"value": 1}, {"value": 3}, {"value": 2}])),
            json!([{"value": 3}, {"value": 2}, {"value": 1}])
        );
    }

    #[test]
    fn test_split_join_round_trip() {
        let original = json!(["alpha", "beta", "gamma"]);
        let joined = apply("join", &Map::new(), original.clone());
        assert_eq!(joined, json!("alpha, beta, gamma"));
        let specs = [with_opts("split", json!({"separator": ","}))];
        assert_eq!(apply_specs(&specs, joined), original);
    }

    #[test]
    fn test_first_last_slice() {
        assert_eq!(apply("first", &Map::new(), json!([1, 2, 3])), json!(1));
        assert_eq!(apply("last", &Map::new(), json!([1, 2, 3])), json!(3));
        assert_eq!(apply("first", &Map::new(), json!([])), Value::Null);
        let specs = [with_opts("slice", json!({"start": 1, "end": 3}))];
        assert_eq!(apply_specs(&specs, json!([0, 1, 2, 3])), json!([1, 2]));
    }

    #[test]
    fn test_filter_include_exclude() {
        let specs = [with_opts("filter", json!({"include": "rust"}))];
        assert_eq!(
            apply_specs(&specs, json!(["rustls", "openssl", "rustc"])),
            json!(["rustls", "rustc"])
        );
        let specs = [with_opts("filter", json!({"exclude": "beta"}))];
        assert_eq!(
            apply_specs(&specs, json!([{"value": "1.0"}, {"value": "1.1-beta"}])),
            json!([{"value": "1.0"}])
        );
    }

    #[test]
    fn test_pluck() {
        let specs = [with_opts("pluck", json!({"key": "text"}))];
        assert_eq!(
            apply_specs(&specs, json!([{"value": "a", "text": "A"}, {"value": "b", "text": "B"}])),
            json!(["A", "B"])
        );
    }

    #[test]
    fn test_regex_match() {
        let specs = [with_opts("regex", json!({"pattern": r"\d+"}))];
        assert_eq!(apply_specs(&specs, json!("a1 b22 c333")), json!(["1", "22", "333"]));
        let specs = [with_opts("regex", json!({"pattern": r"\d+", "flags": ""}))];
        assert_eq!(apply_specs(&specs, json!("a1 b22")), json!(["1"]));
    }

    #[test]
    fn test_replace() {
        let specs = [with_opts("replace", json!({"pattern": ",", "replacement": ""}))];
        assert_eq!(apply_specs(&specs, json!("1,234,567")), json!("1234567"));
        let specs = [with_opts(
            "replace",
            json!({"pattern": "(?i)in stock", "replacement": "available"}),
        )];
        assert_eq!(apply_specs(&specs, json!(["In Stock"])), json!(["available"]));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(apply("parseNumber", &Map::new(), json!("€ 120.00")), json!(120));
        assert_eq!(apply("parseNumber", &Map::new(), json!("$1,234.56")), json!(1234.56));
        assert_eq!(apply("parseNumber", &Map::new(), json!("-3.5%")), json!(-3.5));
        assert_eq!(apply("parseNumber", &Map::new(), Value::Null), json!(0));
        assert_eq!(apply("parseNumber", &Map::new(), json!("no digits")), json!(0));
        assert_eq!(apply("parseNumber", &Map::new(), json!(["€ 118.50"])), json!(118.5));
    }

    #[test]
    fn test_parse_json_identity_and_failure() {
        let v = json!({"a": [1, 2], "b": "x"});
        let s = Value::String(serde_json::to_string(&v).unwrap());
        assert_eq!(apply("parseJson", &Map::new(), s), v);
        assert_eq!(
            apply("parseJson", &Map::new(), json!("not json")),
            json!("not json")
        );
    }

    #[test]
    fn test_json_path_transform() {
        let specs = [with_opts("jsonPath", json!({"path": "items[0].price"}))];
        assert_eq!(
            apply_specs(&specs, json!({"items": [{"price": 9.99}]})),
            json!(9.99)
        );
    }

    #[test]
    fn test_compact() {
        assert_eq!(
            apply("compact", &Map::new(), json!(["a", null, "", "b"])),
            json!(["a", "b"])
        );
    }

    #[test]
    fn test_scenario_price_pipeline() {
        // "€ 118.50" text through trim + parseNumber
        let specs = [named("trim"), named("parseNumber")];
        assert_eq!(apply_specs(&specs, json!("  € 118.50 ")), json!(118.5));
    }

    #[test]
    fn test_js_parse_float() {
        assert_eq!(js_parse_float(&json!("120.5 EUR")), Some(120.5));
        assert_eq!(js_parse_float(&json!("  -3e2")), Some(-300.0));
        assert_eq!(js_parse_float(&json!(7)), Some(7.0));
        assert_eq!(js_parse_float(&json!(["8.5", "9"])), Some(8.5));
        assert_eq!(js_parse_float(&json!("EUR 120")), None);
        assert_eq!(js_parse_float(&Value::Null), None);
    }
}
