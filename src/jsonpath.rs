//! Minimal JSON path resolver: dotted keys with `[n]` index suffixes,
//! with an optional leading `$.` accepted for compatibility.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Resolve `path` against `value`, returning a reference to the target.
/// Returns None for any missing key, out-of-range index, or malformed path.
pub fn resolve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in parse(path)? {
        current = match segment {
            Segment::Key(k) => current.as_object()?.get(&k)?,
            Segment::Index(i) => current.as_array()?.get(i)?,
        };
    }
    Some(current)
}

/// Like [`resolve`] but clones the target, substituting `Null` when missing.
pub fn lookup(value: &Value, path: &str) -> Value {
    resolve(value, path).cloned().unwrap_or(Value::Null)
}

fn parse(path: &str) -> Option<Vec<Segment>> {
    let path = path.trim();
    let path = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
    if path.is_empty() {
        return Some(Vec::new());
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        // a key may carry any number of index suffixes: items[0][1]
        let mut rest = part;
        if let Some(bracket) = rest.find('[') {
            let key = &rest[..bracket];
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']')?;
                let index: usize = stripped[..close].parse().ok()?;
                segments.push(Segment::Index(index));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return None;
            }
        } else {
            segments.push(Segment::Key(rest.to_string()));
        }
    }
    Some(segments)
}
