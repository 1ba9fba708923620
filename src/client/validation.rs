//! Argument validation against declared parameters.
//!
//! Runs before anything touches the network: every required parameter present, every value of
//! the declared type and inside its `enum`, bounds, pattern and format, nothing undeclared.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::error::ParameterError;
use super::request::{location_of, scalar_text};
use crate::protocol::{Capability, ParamLocation, Parameter};

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"));
static DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]{4})-([0-9]{2})-([0-9]{2})$").expect("static regex"));
static DATE_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}[Tt ][0-9]{2}:[0-9]{2}:[0-9]{2}(\.[0-9]+)?([Zz]|[+-][0-9]{2}:[0-9]{2})$")
        .expect("static regex")
});

/// Why a value breaks a parameter's constraints (its type already checked).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Violation {
    Enum,
    Bounds(String),
    Pattern(String),
    Format(String),
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Enum => f.write_str("not one of the allowed values"),
            Violation::Bounds(reason) => f.write_str(reason),
            Violation::Pattern(p) => write!(f, "does not match pattern '{}'", p),
            Violation::Format(fmt) => write!(f, "is not a valid {}", fmt),
        }
    }
}

fn valid_date(raw: &str) -> bool {
    let Some(c) = DATE.captures(raw) else {
        return false;
    };
    let month: u32 = c[2].parse().unwrap_or(0);
    let day: u32 = c[3].parse().unwrap_or(0);
    (1..=12).contains(&month) && (1..=31).contains(&day)
}

/// Known string formats. Unknown formats are accepted.
fn format_ok(format: &str, raw: &str) -> bool {
    match format {
        "email" => EMAIL.is_match(raw),
        "uri" | "url" => url::Url::parse(raw).is_ok(),
        "uuid" => uuid::Uuid::parse_str(raw).is_ok(),
        "date" => valid_date(raw),
        "date-time" => DATE_TIME.is_match(raw) && raw.get(..10).is_some_and(valid_date),
        _ => true,
    }
}

pub(crate) fn violation(param: &Parameter, value: &Value, pattern: Option<&Regex>) -> Option<Violation> {
    if let Some(allowed) = &param.enum_values {
        if !allowed.iter().any(|a| a == value || (a.is_number() && a.as_f64() == value.as_f64())) {
            return Some(Violation::Enum);
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = param.minimum {
            if n < min {
                return Some(Violation::Bounds(format!("{} is below the minimum {}", n, min)));
            }
        }
        if let Some(max) = param.maximum {
            if n > max {
                return Some(Violation::Bounds(format!("{} is above the maximum {}", n, max)));
            }
        }
    }

    if let Some(s) = value.as_str() {
        if let Some(re) = pattern {
            if !re.is_match(s) {
                return Some(Violation::Pattern(re.as_str().to_string()));
            }
        }
        if let Some(format) = &param.format {
            if !format_ok(format, s) {
                return Some(Violation::Format(format.clone()));
            }
        }
    }
    None
}

/// Constraint check for a value already known to be of the parameter's type.
pub fn check_constraints(param: &Parameter, value: &Value, pattern: Option<&Regex>) -> Result<(), String> {
    match violation(param, value, pattern) {
        Some(v) => Err(v.to_string()),
        None => Ok(()),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate `arguments` for `cap`, filling in declared defaults.
///
/// `null` counts as absent. The returned map holds only declared parameters.
pub fn validate_arguments(cap: &Capability, arguments: &Value) -> Result<Map<String, Value>, ParameterError> {
    let empty = Map::new();
    let supplied = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(ParameterError::NotAnObject {
                capability: cap.id.clone(),
                found: type_name(other).to_string(),
            })
        }
    };

    if let Some(name) = supplied.keys().find(|k| cap.parameter(k).is_none()) {
        return Err(ParameterError::Unknown {
            capability: cap.id.clone(),
            name: name.clone(),
        });
    }

    let placeholders = cap.path_placeholders();
    let mut out = Map::new();
    for param in &cap.parameters {
        let value = match supplied.get(&param.name).filter(|v| !v.is_null()) {
            Some(v) => v,
            None => match &param.default {
                Some(d) => {
                    out.insert(param.name.clone(), d.clone());
                    continue;
                }
                None if param.required => {
                    return Err(ParameterError::Missing {
                        capability: cap.id.clone(),
                        name: param.name.clone(),
                    })
                }
                None => continue,
            },
        };

        if !param.param_type.admits(value) {
            return Err(ParameterError::Type {
                capability: cap.id.clone(),
                name: param.name.clone(),
                expected: param.param_type,
                found: type_name(value).to_string(),
            });
        }

        // Patterns were compiled once at validation time; a broken one never reaches here.
        let pattern = param.pattern.as_deref().and_then(|p| Regex::new(p).ok());
        if let Some(v) = violation(param, value, pattern.as_ref()) {
            let capability = cap.id.clone();
            let name = param.name.clone();
            return Err(match v {
                Violation::Enum => ParameterError::Enum {
                    capability,
                    name,
                    value: value.clone(),
                },
                Violation::Bounds(reason) => ParameterError::Bounds { capability, name, reason },
                Violation::Pattern(pattern) => ParameterError::Pattern { capability, name, pattern },
                Violation::Format(format) => ParameterError::Format { capability, name, format },
            });
        }
        if location_of(cap, &param.name, &placeholders) == ParamLocation::Path {
            let text = scalar_text(value);
            if text.chars().all(|c| c == '.') {
                return Err(ParameterError::PathSegment {
                    capability: cap.id.clone(),
                    name: param.name.clone(),
                    value: text,
                });
            }
        }
        out.insert(param.name.clone(), value.clone());
    }
    Ok(out)
}
