//! Manifest JSON Schema and reusable-schema reference handling
//!
//! The published schema is generated from the data model in [`manifest`](super::manifest) so
//! the structural check and the typed decoder can never drift apart.

use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::manifest::Manifest;

/// Prefix of a reference into the manifest's `schemas` mapping.
pub const SCHEMA_REF_PREFIX: &str = "#/schemas/";

static MANIFEST_SCHEMA: Lazy<Value> = Lazy::new(|| {
    let root = schemars::schema_for!(Manifest);
    serde_json::to_value(root).unwrap_or_else(|_| json!({ "type": "object" }))
});

/// JSON Schema (draft-07) of the manifest wire format.
pub fn manifest_schema() -> &'static Value {
    &MANIFEST_SCHEMA
}

/// Compile a draft-07 schema, flattening the compiler error to text.
pub(crate) fn compile(schema: &Value) -> Result<JSONSchema, String> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| e.to_string())
}

/// Every `$ref` string inside `value`, with the JSON path where it was found.
pub fn collect_refs(value: &Value, path: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if k == "$ref" {
                    if let Some(r) = v.as_str() {
                        out.push((path.to_string(), r.to_string()));
                    }
                } else {
                    collect_refs(v, &format!("{}.{}", path, k), out);
                }
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                collect_refs(v, &format!("{}[{}]", path, i), out);
            }
        }
        _ => {}
    }
}

/// Name of the schema a local reference points at, if it is a `#/schemas/<name>` reference.
pub fn local_ref_name(reference: &str) -> Option<&str> {
    reference
        .strip_prefix(SCHEMA_REF_PREFIX)
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

fn rewrite_refs(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let rewritten = match (k.as_str(), v.as_str().and_then(local_ref_name)) {
                    ("$ref", Some(name)) => Value::String(format!("#/definitions/{}", name)),
                    _ => rewrite_refs(v),
                };
                out.insert(k.clone(), rewritten);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(rewrite_refs).collect()),
        other => other.clone(),
    }
}

/// Build a self-contained schema document for `schema`, resolving `#/schemas/...`
/// references against the manifest's reusable definitions.
pub fn resolve_document(schema: &Value, definitions: &BTreeMap<String, Value>) -> Value {
    let defs: Map<String, Value> = definitions
        .iter()
        .map(|(k, v)| (k.clone(), rewrite_refs(v)))
        .collect();
    json!({
        "definitions": defs,
        "allOf": [rewrite_refs(schema)],
    })
}

/// Compile the response schema of a capability for later checks.
pub fn compile_response_schema(
    schema: &Value,
    definitions: &BTreeMap<String, Value>,
) -> Result<JSONSchema, String> {
    compile(&resolve_document(schema, definitions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_schema_requires_core_fields() {
        let schema = manifest_schema();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        for field in ["name", "description", "version", "provider", "auth", "capabilities"] {
            assert!(required.contains(&field), "missing required field {}", field);
        }
        assert!(!required.contains(&"workflows"));
    }

    #[test]
    fn refs_are_collected_with_paths() {
        let value = json!({
            "type": "object",
            "properties": {
                "items": { "type": "array", "items": { "$ref": "#/schemas/Product" } }
            }
        });
        let mut refs = Vec::new();
        collect_refs(&value, "schemas.Page", &mut refs);
        assert_eq!(
            refs,
            vec![(
                "schemas.Page.properties.items.items".to_string(),
                "#/schemas/Product".to_string()
            )]
        );
        assert_eq!(local_ref_name("#/schemas/Product"), Some("Product"));
        assert_eq!(local_ref_name("https://elsewhere/schema.json"), None);
    }

    #[test]
    fn response_schema_resolves_local_definitions() {
        let mut defs = BTreeMap::new();
        defs.insert(
            "Availability".to_string(),
            json!({
                "type": "object",
                "required": ["available"],
                "properties": { "available": { "type": "boolean" } }
            }),
        );
        let compiled =
            compile_response_schema(&json!({ "$ref": "#/schemas/Availability" }), &defs).unwrap();
        assert!(compiled.is_valid(&json!({ "available": true })));
        assert!(!compiled.is_valid(&json!({ "available": "yes" })));
        assert!(!compiled.is_valid(&json!({})));
    }
}
