//! Manifest structure and lookups
//!
//! A [`Manifest`] is the typed form of the `agent.json` document a host publishes. Once it
//! has passed [`ManifestValidator`](super::ManifestValidator) it is treated as an immutable
//! value and shared read-only (usually behind an `Arc`).

use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use super::config::*;

/// Capability manifest (parsed from `/.well-known/agent.json`).
///
/// Required fields: name, description, version, provider, auth, capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub description: String,
    /// Semantic version of this manifest document.
    pub version: String,
    pub provider: Provider,
    pub auth: AuthSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
    /// Declaration order is significant.
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflows: Vec<Workflow>,
    /// Reusable schema definitions, referenced as `{"$ref": "#/schemas/<name>"}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub schemas: BTreeMap<String, Value>,
    #[serde(default)]
    pub policies: PolicySpec,
}

impl Manifest {
    pub fn capability(&self, id: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.id == id)
    }

    pub fn workflow(&self, id: &str) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.id == id)
    }

    /// Encode to the wire format.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// HTTP method of a capability endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Methods whose arguments travel in the JSON body by default.
    pub fn carries_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discretely invocable action or query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Namespaced intent tag such as `commerce:search`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_type: Option<String>,
    /// Absolute `https` URI or a path relative to the manifest location.
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    /// Inline schema or `{"$ref": "#/schemas/<name>"}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub side_effects: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<Confirmation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<Deprecation>,
}

impl Capability {
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Whether every call needs a fresh human acknowledgment.
    pub fn requires_confirmation(&self) -> bool {
        self.side_effects
            && self
                .confirmation
                .as_ref()
                .map(|c| c.required)
                .unwrap_or(false)
    }

    /// The message that must be shown to a human before a gated call.
    pub fn confirmation_message(&self) -> Option<&str> {
        self.confirmation.as_ref().map(|c| c.message.as_str())
    }

    /// `{name}` placeholders in the endpoint.
    pub fn path_placeholders(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut rest = self.endpoint.as_str();
        while let Some(start) = rest.find('{') {
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) => {
                    out.push(&after[..end]);
                    rest = &after[end + 1..];
                }
                None => break,
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Confirmation {
    pub required: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Deprecation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ParamType::Integer | ParamType::Number)
    }

    /// Whether `value` is an instance of this type.
    pub fn admits(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
            }
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a parameter is placed on the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Body,
    Header,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Explicit placement; otherwise derived from the method and endpoint template.
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    pub location: Option<ParamLocation>,
}

impl Parameter {
    /// Minimal parameter of the given type, mostly useful for building manifests in code.
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            description: None,
            default: None,
            enum_values: None,
            format: None,
            minimum: None,
            maximum: None,
            pattern: None,
            location: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A named, ordered (optionally branching) composition of capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditional: BTreeMap<String, Conditional>,
}

impl Workflow {
    pub fn position(&self, step: &str) -> Option<usize> {
        self.steps.iter().position(|s| s == step)
    }
}

/// Branch evaluated after a step completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Conditional {
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_true: Option<BranchTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_false: Option<BranchTarget>,
}

/// Where control goes after a conditional.
///
/// Serialized as a step id, or as the reserved markers `$abort` / `$complete`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BranchTarget {
    Step(String),
    Abort,
    Complete,
}

impl BranchTarget {
    pub const ABORT: &'static str = "$abort";
    pub const COMPLETE: &'static str = "$complete";

    pub fn as_str(&self) -> &str {
        match self {
            BranchTarget::Step(id) => id,
            BranchTarget::Abort => Self::ABORT,
            BranchTarget::Complete => Self::COMPLETE,
        }
    }

    pub fn step(id: impl Into<String>) -> Self {
        BranchTarget::Step(id.into())
    }
}

impl From<&str> for BranchTarget {
    fn from(raw: &str) -> Self {
        match raw {
            Self::ABORT => BranchTarget::Abort,
            Self::COMPLETE => BranchTarget::Complete,
            other => BranchTarget::Step(other.to_string()),
        }
    }
}

impl Serialize for BranchTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BranchTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(BranchTarget::from(raw.as_str()))
    }
}

impl JsonSchema for BranchTarget {
    fn schema_name() -> String {
        "BranchTarget".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn branch_targets_use_reserved_markers() {
        let c: Conditional = serde_json::from_value(json!({
            "condition": "available == false",
            "onFalse": "$abort",
            "onTrue": "create-appointment"
        }))
        .unwrap();
        assert_eq!(c.on_false, Some(BranchTarget::Abort));
        assert_eq!(c.on_true, Some(BranchTarget::step("create-appointment")));

        let back = serde_json::to_value(&c).unwrap();
        assert_eq!(back["onFalse"], "$abort");
    }

    #[test]
    fn placeholders_are_extracted_in_order() {
        let cap: Capability = serde_json::from_value(json!({
            "id": "get-order",
            "name": "Get order",
            "description": "Fetch one order line",
            "endpoint": "/api/orders/{order_id}/lines/{line}",
            "method": "GET"
        }))
        .unwrap();
        assert_eq!(cap.path_placeholders(), vec!["order_id", "line"]);
        assert!(!cap.requires_confirmation());
    }

    #[test]
    fn integer_type_admits_whole_floats_only() {
        assert!(ParamType::Integer.admits(&json!(3)));
        assert!(ParamType::Integer.admits(&json!(3.0)));
        assert!(!ParamType::Integer.admits(&json!(3.5)));
        assert!(!ParamType::Integer.admits(&json!("3")));
        assert!(ParamType::Number.admits(&json!(3.5)));
    }
}
