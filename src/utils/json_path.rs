//! Field-path access over JSON values.
//!
//! Paths are dot-separated keys with optional array indexes: `items[0].price`,
//! `slots.0.start`, `$.available`.

use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("invalid path '{0}'")]
    InvalidPath(String),
}

/// Path segment after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

pub struct PathMapper;

impl PathMapper {
    /// Parse a path into segments, validating its shape.
    pub fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
        let normalized = path.trim();
        let normalized = normalized
            .strip_prefix("$.")
            .or_else(|| normalized.strip_prefix('$'))
            .unwrap_or(normalized);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }

        let invalid = || PathError::InvalidPath(path.to_string());
        let mut out = Vec::new();
        for part in normalized.split('.') {
            if part.is_empty() {
                return Err(invalid());
            }
            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if !key.is_empty() {
                match key.parse::<usize>() {
                    Ok(idx) => out.push(Segment::Index(idx)),
                    Err(_) => out.push(Segment::Key(key.to_string())),
                }
            } else if rest.is_empty() {
                return Err(invalid());
            }
            while !rest.is_empty() {
                let inner = rest.strip_prefix('[').ok_or_else(invalid)?;
                let end = inner.find(']').ok_or_else(invalid)?;
                let idx = inner[..end].trim().parse::<usize>().map_err(|_| invalid())?;
                out.push(Segment::Index(idx));
                rest = &inner[end + 1..];
            }
        }
        Ok(out)
    }

    /// Resolve pre-parsed segments.
    pub fn resolve<'a>(obj: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
        let mut current = obj;
        for seg in segments {
            current = match (seg, current) {
                (Segment::Key(k), Value::Object(map)) => map.get(k)?,
                // numeric keys on objects ("0") are still keys
                (Segment::Index(i), Value::Object(map)) => map.get(&i.to_string())?,
                (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Get the value at `path`, or `None` if any segment is missing.
    pub fn get_path<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
        let segments = Self::parse(path).ok()?;
        Self::resolve(obj, &segments)
    }
}

/// Truthiness used by bare-path conditions: null, false, 0, "" and empty collections are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Equality that treats `1` and `1.0` as equal.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering for numbers and strings; other combinations are unordered.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
