//! Manifest validator
//!
//! Validation is batched: every structural and referential problem is reported in one pass,
//! and a manifest with any problem is rejected wholesale. Checks run in order of increasing
//! cost: JSON Schema shape, version form, id uniqueness, parameter constraint consistency,
//! schema references, scope grantability, workflow references, workflow cycles.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

use super::config::{AuthSpec, RateLimitSpec};
use super::error::{ValidationError, ValidationErrors};
use super::manifest::{
    BranchTarget, Capability, Manifest, ParamLocation, ParamType, Parameter, Workflow,
};
use super::schema;
use crate::workflow::Condition;
use crate::{Error, ErrorContext, Result};

static SEMVER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-((?:0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*)(?:\.(?:0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*))*))?(?:\+([0-9a-zA-Z-]+(?:\.[0-9a-zA-Z-]+)*))?$",
    )
    .expect("semver pattern is valid")
});

/// Validates raw manifest documents into [`Manifest`] values.
pub struct ManifestValidator {
    schema: Option<JSONSchema>,
}

impl ManifestValidator {
    pub fn new() -> Self {
        let schema = match schema::compile(schema::manifest_schema()) {
            Ok(s) => Some(s),
            Err(e) => {
                // Typed decoding still catches shape errors, one at a time.
                warn!(error = %e, "manifest JSON Schema failed to compile; using typed decoding only");
                None
            }
        };
        Self { schema }
    }

    /// Validate a raw JSON document.
    pub fn validate(&self, raw: &Value) -> std::result::Result<Manifest, ValidationErrors> {
        if !raw.is_object() {
            return Err(ValidationErrors(vec![ValidationError::schema(
                "$",
                "manifest must be a JSON object",
            )]));
        }

        if let Some(compiled) = &self.schema {
            if let Err(errors) = compiled.validate(raw) {
                let errors: Vec<ValidationError> = errors
                    .map(|e| ValidationError::schema(pointer_to_path(&e.instance_path.to_string()), e.to_string()))
                    .collect();
                debug!(count = errors.len(), "manifest failed schema validation");
                return Err(ValidationErrors(errors));
            }
        }

        let manifest: Manifest = serde_json::from_value(raw.clone()).map_err(|e| {
            ValidationErrors(vec![ValidationError::schema("$", e.to_string())])
        })?;

        self.validate_manifest(&manifest)?;
        Ok(manifest)
    }

    /// Validate a JSON string.
    pub fn validate_str(&self, raw: &str) -> std::result::Result<Manifest, ValidationErrors> {
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            ValidationErrors(vec![ValidationError::schema("$", format!("JSON syntax error: {}", e))])
        })?;
        self.validate(&value)
    }

    /// Validate a YAML string (authoring convenience; the wire format is JSON).
    pub fn validate_yaml_str(&self, raw: &str) -> std::result::Result<Manifest, ValidationErrors> {
        let value: Value = serde_yaml::from_str(raw).map_err(|e| {
            ValidationErrors(vec![ValidationError::schema("$", format!("YAML syntax error: {}", e))])
        })?;
        self.validate(&value)
    }

    /// Validate a local `.json` / `.yaml` file.
    pub fn validate_file(&self, path: impl AsRef<Path>) -> Result<Manifest> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read manifest: {}", e),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("manifest_validator"),
            )
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let manifest = if is_yaml {
            self.validate_yaml_str(&content)?
        } else {
            self.validate_str(&content)?
        };
        Ok(manifest)
    }

    /// Semantic checks on an already-typed manifest.
    pub fn validate_manifest(&self, manifest: &Manifest) -> std::result::Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        check_metadata(manifest, &mut errors);
        check_unique_ids(manifest, &mut errors);
        check_auth(&manifest.auth, &mut errors);
        if let Some(rl) = &manifest.rate_limit {
            check_rate_limit(rl, &mut errors);
        }
        for (i, cap) in manifest.capabilities.iter().enumerate() {
            check_capability(i, cap, &mut errors);
        }
        check_schema_refs(manifest, &mut errors);
        check_scopes(manifest, &mut errors);
        for (i, wf) in manifest.workflows.iter().enumerate() {
            check_workflow(i, wf, manifest, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            debug!(count = errors.len(), manifest = %manifest.name, "manifest rejected");
            Err(ValidationErrors(errors))
        }
    }
}

impl Default for ManifestValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// `/capabilities/0/id` -> `capabilities[0].id`
fn pointer_to_path(pointer: &str) -> String {
    let mut out = String::new();
    for seg in pointer.split('/').filter(|s| !s.is_empty()) {
        if seg.chars().all(|c| c.is_ascii_digit()) {
            out.push_str(&format!("[{}]", seg));
        } else {
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(&seg.replace("~1", "/").replace("~0", "~"));
        }
    }
    if out.is_empty() {
        "$".to_string()
    } else {
        out
    }
}

fn check_metadata(manifest: &Manifest, errors: &mut Vec<ValidationError>) {
    if manifest.name.trim().is_empty() {
        errors.push(ValidationError::schema("name", "must not be empty"));
    }
    if !SEMVER.is_match(manifest.version.trim()) {
        errors.push(ValidationError::schema(
            "version",
            format!("'{}' is not a semantic version (MAJOR.MINOR.PATCH)", manifest.version),
        ));
    }
    if url::Url::parse(&manifest.provider.url).is_err() {
        errors.push(ValidationError::schema(
            "provider.url",
            format!("'{}' is not an absolute URL", manifest.provider.url),
        ));
    }
}

fn check_unique_ids(manifest: &Manifest, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for cap in &manifest.capabilities {
        if cap.id.trim().is_empty() {
            errors.push(ValidationError::schema("capabilities[].id", "must not be empty"));
        } else if !seen.insert(cap.id.as_str()) && reported.insert(cap.id.as_str()) {
            errors.push(ValidationError::DuplicateId {
                kind: "capability",
                id: cap.id.clone(),
            });
        }
    }

    let mut seen = HashSet::new();
    for wf in &manifest.workflows {
        if !seen.insert(wf.id.as_str()) {
            errors.push(ValidationError::DuplicateId {
                kind: "workflow",
                id: wf.id.clone(),
            });
        }
    }
}

fn check_https(path: String, raw: &str, errors: &mut Vec<ValidationError>) {
    match url::Url::parse(raw) {
        Ok(u) if u.scheme() == "https" => {}
        Ok(u) => errors.push(ValidationError::schema(
            path,
            format!("'{}' uses {} (https required)", raw, u.scheme()),
        )),
        Err(e) => errors.push(ValidationError::schema(path, format!("'{}': {}", raw, e))),
    }
}

fn check_auth(auth: &AuthSpec, errors: &mut Vec<ValidationError>) {
    if auth.schemes.is_empty() {
        errors.push(ValidationError::schema("auth.schemes", "at least one scheme is required"));
    }
    let mut kinds = HashSet::new();
    for (i, scheme) in auth.schemes.iter().enumerate() {
        if !kinds.insert(scheme.kind()) {
            errors.push(ValidationError::DuplicateId {
                kind: "auth scheme",
                id: scheme.kind().to_string(),
            });
        }
        for (field, url) in scheme.endpoints() {
            check_https(format!("auth.schemes[{}].{}", i, field), url, errors);
        }
    }
}

fn check_rate_limit(rl: &RateLimitSpec, errors: &mut Vec<ValidationError>) {
    if rl.requests == 0 {
        errors.push(ValidationError::schema("rateLimit.requests", "must be greater than zero"));
    }
    if rl.window_duration().is_none() {
        errors.push(ValidationError::schema(
            "rateLimit.window",
            format!("'{}' is not a window such as 30s, 1m, 1h or 1d", rl.window),
        ));
    }
    if rl.burst_limit == Some(0) {
        errors.push(ValidationError::schema("rateLimit.burstLimit", "must be greater than zero"));
    }
}

fn check_capability(index: usize, cap: &Capability, errors: &mut Vec<ValidationError>) {
    let base = format!("capabilities[{}]", index);

    if cap.endpoint.contains("://") {
        check_https(format!("{}.endpoint", base), &cap.endpoint, errors);
    } else if !cap.endpoint.starts_with('/') {
        errors.push(ValidationError::schema(
            format!("{}.endpoint", base),
            "relative endpoints must start with '/'",
        ));
    }

    let mut names = HashSet::new();
    for (j, param) in cap.parameters.iter().enumerate() {
        if !names.insert(param.name.as_str()) {
            errors.push(ValidationError::DuplicateId {
                kind: "parameter",
                id: format!("{}.{}", cap.id, param.name),
            });
        }
        check_parameter(&format!("{}.parameters[{}]", base, j), cap, param, errors);
    }

    let placeholders = cap.path_placeholders();
    for name in &placeholders {
        match cap.parameter(name) {
            None => errors.push(ValidationError::dangling(
                format!("{}.endpoint", base),
                format!("{{{}}}", name),
            )),
            Some(p) if !p.required && p.default.is_none() => errors.push(ValidationError::schema(
                format!("{}.endpoint", base),
                format!("path parameter '{}' must be required or have a default", name),
            )),
            Some(_) => {}
        }
    }
    for (j, param) in cap.parameters.iter().enumerate() {
        if param.location == Some(ParamLocation::Path) && !placeholders.contains(&param.name.as_str()) {
            errors.push(ValidationError::schema(
                format!("{}.parameters[{}].in", base, j),
                format!("'{}' is a path parameter but the endpoint has no {{{}}}", param.name, param.name),
            ));
        }
        if param.location == Some(ParamLocation::Body) && !cap.method.carries_body() {
            errors.push(ValidationError::schema(
                format!("{}.parameters[{}].in", base, j),
                format!("{} requests carry no body", cap.method),
            ));
        }
    }

    if let Some(conf) = &cap.confirmation {
        if conf.required && conf.message.trim().is_empty() {
            errors.push(ValidationError::schema(
                format!("{}.confirmation.message", base),
                "a required confirmation needs a message to present",
            ));
        }
        if conf.required && !cap.side_effects {
            warn!(capability = %cap.id, "confirmation declared on a capability without side effects; it will not gate calls");
        }
    }
}

fn check_parameter(path: &str, cap: &Capability, param: &Parameter, errors: &mut Vec<ValidationError>) {
    let ty = param.param_type;

    if let Some(values) = &param.enum_values {
        if values.is_empty() {
            errors.push(ValidationError::schema(format!("{}.enum", path), "must not be empty"));
        }
        for (k, v) in values.iter().enumerate() {
            if !ty.admits(v) {
                errors.push(ValidationError::schema(
                    format!("{}.enum[{}]", path, k),
                    format!("{} is not a {}", v, ty),
                ));
            }
        }
    }

    if param.minimum.is_some() || param.maximum.is_some() {
        if !ty.is_numeric() {
            errors.push(ValidationError::schema(
                path,
                format!("minimum/maximum require a numeric type, found {}", ty),
            ));
        }
        if let (Some(min), Some(max)) = (param.minimum, param.maximum) {
            if min > max {
                errors.push(ValidationError::schema(
                    path,
                    format!("minimum {} exceeds maximum {}", min, max),
                ));
            }
        }
    }

    let mut compiled_pattern = None;
    if let Some(pattern) = &param.pattern {
        if ty != ParamType::String {
            errors.push(ValidationError::schema(
                format!("{}.pattern", path),
                format!("pattern requires type string, found {}", ty),
            ));
        }
        match Regex::new(pattern) {
            Ok(re) => compiled_pattern = Some(re),
            Err(e) => errors.push(ValidationError::schema(format!("{}.pattern", path), e.to_string())),
        }
    }

    if param.format.is_some() && ty != ParamType::String {
        errors.push(ValidationError::schema(
            format!("{}.format", path),
            format!("format requires type string, found {}", ty),
        ));
    }

    if let Some(default) = &param.default {
        let default_path = format!("{}.default", path);
        if !ty.admits(default) {
            errors.push(ValidationError::schema(default_path, format!("{} is not a {}", default, ty)));
        } else if let Err(reason) = crate::client::validation::check_constraints(param, default, compiled_pattern.as_ref()) {
            errors.push(ValidationError::schema(default_path, reason));
        }
    }

    if param.name.trim().is_empty() {
        errors.push(ValidationError::schema(
            format!("{}.name", path),
            format!("parameter of capability '{}' has an empty name", cap.id),
        ));
    }
}

fn check_schema_refs(manifest: &Manifest, errors: &mut Vec<ValidationError>) {
    let mut refs = Vec::new();
    for (name, def) in &manifest.schemas {
        schema::collect_refs(def, &format!("schemas.{}", name), &mut refs);
    }
    for (i, cap) in manifest.capabilities.iter().enumerate() {
        if let Some(rs) = &cap.response_schema {
            schema::collect_refs(rs, &format!("capabilities[{}].responseSchema", i), &mut refs);
        }
    }
    for (path, reference) in refs {
        let resolved = schema::local_ref_name(&reference)
            .map(|name| manifest.schemas.contains_key(name))
            .unwrap_or(false);
        if !resolved {
            errors.push(ValidationError::dangling(path, reference));
        }
    }
}

fn check_scopes(manifest: &Manifest, errors: &mut Vec<ValidationError>) {
    let grantable = manifest.auth.declared_scopes();
    for cap in &manifest.capabilities {
        for scope in &cap.required_scopes {
            if !grantable.contains(scope.as_str()) {
                errors.push(ValidationError::UngrantableScope {
                    capability: cap.id.clone(),
                    scope: scope.clone(),
                });
            }
        }
    }
}

fn check_workflow(index: usize, wf: &Workflow, manifest: &Manifest, errors: &mut Vec<ValidationError>) {
    let base = format!("workflows[{}]", index);
    if wf.steps.is_empty() {
        errors.push(ValidationError::schema(format!("{}.steps", base), "must not be empty"));
        return;
    }

    for (j, step) in wf.steps.iter().enumerate() {
        if manifest.capability(step).is_none() {
            errors.push(ValidationError::dangling(format!("{}.steps[{}]", base, j), step.clone()));
        }
    }

    let in_steps: HashSet<&str> = wf.steps.iter().map(String::as_str).collect();
    let mut unknown = false;
    for (key, cond) in &wf.conditional {
        if !in_steps.contains(key.as_str()) {
            unknown = true;
            errors.push(ValidationError::UnknownStep {
                workflow: wf.id.clone(),
                step: key.clone(),
            });
        }
        for target in [&cond.on_true, &cond.on_false].into_iter().flatten() {
            if let BranchTarget::Step(id) = target {
                if !in_steps.contains(id.as_str()) {
                    unknown = true;
                    errors.push(ValidationError::UnknownStep {
                        workflow: wf.id.clone(),
                        step: id.clone(),
                    });
                }
            }
        }
        if let Err(e) = Condition::parse(&cond.condition) {
            errors.push(ValidationError::schema(
                format!("{}.conditional.{}.condition", base, key),
                e.to_string(),
            ));
        }
    }

    if !unknown {
        if let Some((step, path)) = find_cycle(wf) {
            errors.push(ValidationError::CyclicWorkflow {
                workflow: wf.id.clone(),
                step,
                path,
            });
        }
    }
}

/// Successor step indices of `i`, following conditional edges when present.
fn successors(wf: &Workflow, index: &HashMap<&str, usize>, i: usize) -> Vec<usize> {
    let next = if i + 1 < wf.steps.len() { Some(i + 1) } else { None };
    match wf.conditional.get(&wf.steps[i]) {
        None => next.into_iter().collect(),
        Some(cond) => {
            let mut out: Vec<usize> = Vec::new();
            for target in [&cond.on_true, &cond.on_false] {
                let succ = match target {
                    None => next,
                    Some(BranchTarget::Step(id)) => index.get(id.as_str()).copied(),
                    Some(BranchTarget::Abort) | Some(BranchTarget::Complete) => None,
                };
                if let Some(s) = succ {
                    if !out.contains(&s) {
                        out.push(s);
                    }
                }
            }
            out
        }
    }
}

/// First path (by step id) that revisits a step, if any.
fn find_cycle(wf: &Workflow) -> Option<(String, Vec<String>)> {
    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    for (i, step) in wf.steps.iter().enumerate() {
        if first_seen.insert(step.as_str(), i).is_some() {
            // Sequential flow alone reaches the same id twice.
            let path = wf.steps[..=i].to_vec();
            return Some((step.clone(), path));
        }
    }

    let index = first_seen;
    let n = wf.steps.len();
    // 0 = unvisited, 1 = on stack, 2 = done
    let mut color = vec![0u8; n];
    let mut stack: Vec<usize> = Vec::new();

    fn visit(
        wf: &Workflow,
        index: &HashMap<&str, usize>,
        node: usize,
        color: &mut [u8],
        stack: &mut Vec<usize>,
    ) -> Option<usize> {
        color[node] = 1;
        stack.push(node);
        for succ in successors(wf, index, node) {
            if color[succ] == 1 {
                return Some(succ);
            }
            if color[succ] == 0 {
                if let Some(hit) = visit(wf, index, succ, color, stack) {
                    return Some(hit);
                }
            }
        }
        stack.pop();
        color[node] = 2;
        None
    }

    let hit = visit(wf, &index, 0, &mut color, &mut stack)?;
    let start = stack.iter().position(|&s| s == hit).unwrap_or(0);
    let mut path: Vec<String> = stack[start..].iter().map(|&i| wf.steps[i].clone()).collect();
    path.push(wf.steps[hit].clone());
    Some((wf.steps[hit].clone(), path))
}
