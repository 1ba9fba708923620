mod common;

use atp_runtime::protocol::{
    BranchTarget, Capability, HttpMethod, Manifest, ManifestValidator, Parameter, ParamType,
    ValidationError,
};
use serde_json::json;

#[test]
fn fixture_manifest_validates() {
    let manifest = common::manifest();
    assert_eq!(manifest.capabilities.len(), 4);
    assert_eq!(manifest.workflows[0].steps, vec!["check-availability", "create-appointment"]);
    assert_eq!(
        manifest.workflows[0].conditional["check-availability"].on_false,
        Some(BranchTarget::Abort)
    );
}

#[test]
fn duplicate_capability_id_rejects_the_manifest() {
    let mut raw = common::manifest_json();
    let dup = raw["capabilities"][0].clone();
    raw["capabilities"].as_array_mut().unwrap().push(dup);

    let errors = ManifestValidator::new().validate(&raw).unwrap_err();
    assert!(errors.contains(|e| matches!(
        e,
        ValidationError::DuplicateId { kind: "capability", id } if id == "search-products"
    )));
}

#[test]
fn conditional_on_unknown_step_fails_before_any_invocation() {
    let mut raw = common::manifest_json();
    raw["workflows"][0]["conditional"]["ship-order"] = json!({
        "condition": "ok == true",
        "onTrue": "$complete"
    });

    let errors = ManifestValidator::new().validate(&raw).unwrap_err();
    assert!(errors.contains(|e| matches!(
        e,
        ValidationError::UnknownStep { step, .. } if step == "ship-order"
    )));
}

#[test]
fn deeply_nested_condition_is_rejected_not_overflowed() {
    let mut raw = common::manifest_json();
    let nested = format!("{}available == true{}", "(".repeat(200_000), ")".repeat(200_000));
    raw["workflows"][0]["conditional"]["check-availability"]["condition"] = json!(nested);

    let errors = std::thread::Builder::new()
        .stack_size(2 * 1024 * 1024)
        .spawn(move || ManifestValidator::new().validate(&raw))
        .unwrap()
        .join()
        .unwrap()
        .unwrap_err();
    assert!(errors.contains(|e| matches!(
        e,
        ValidationError::SchemaViolation { path, .. } if path.ends_with(".condition")
    )));
}

#[test]
fn problems_are_reported_together() {
    let mut raw = common::manifest_json();
    raw["version"] = json!("v1");
    raw["capabilities"][0]["requiredScopes"] = json!(["admin:everything"]);
    raw["capabilities"][0]["responseSchema"] = json!({ "$ref": "#/schemas/Missing" });
    raw["workflows"][0]["conditional"]["check-availability"]["onTrue"] = json!("nowhere");

    let errors = ManifestValidator::new().validate(&raw).unwrap_err();
    assert!(errors.len() >= 4, "{}", errors);
    assert!(errors.contains(|e| matches!(e, ValidationError::SchemaViolation { path, .. } if path == "version")));
    assert!(errors.contains(|e| matches!(
        e,
        ValidationError::UngrantableScope { scope, .. } if scope == "admin:everything"
    )));
    assert!(errors.contains(|e| matches!(e, ValidationError::DanglingReference { .. })));
    assert!(errors.contains(|e| matches!(e, ValidationError::UnknownStep { step, .. } if step == "nowhere")));
}

#[test]
fn branch_back_to_an_earlier_step_is_a_cycle() {
    let mut raw = common::manifest_json();
    raw["workflows"][0]["conditional"]["create-appointment"] = json!({
        "condition": "confirmed == true",
        "onTrue": "$complete",
        "onFalse": "check-availability"
    });

    let errors = ManifestValidator::new().validate(&raw).unwrap_err();
    assert!(errors.contains(|e| matches!(
        e,
        ValidationError::CyclicWorkflow { step, .. } if step == "check-availability"
    )));
}

#[test]
fn plain_http_endpoints_are_refused() {
    let mut raw = common::manifest_json();
    raw["capabilities"][0]["endpoint"] = json!("http://shop.example/api/v1/products/search");
    raw["auth"]["schemes"][0]["tokenUrl"] = json!("http://shop.example/oauth/token");

    let errors = ManifestValidator::new().validate(&raw).unwrap_err();
    let insecure: Vec<_> = errors
        .iter()
        .filter(|e| matches!(e, ValidationError::SchemaViolation { message, .. } if message.contains("https required")))
        .collect();
    assert_eq!(insecure.len(), 2, "{}", errors);
}

#[test]
fn default_must_satisfy_its_own_constraints() {
    let mut raw = common::manifest_json();
    raw["capabilities"][1]["parameters"][1]["default"] = json!(0);

    let errors = ManifestValidator::new().validate(&raw).unwrap_err();
    assert!(errors.contains(|e| matches!(
        e,
        ValidationError::SchemaViolation { path, .. } if path.ends_with("parameters[1].default")
    )));
}

#[test]
fn encode_then_decode_is_lossless() {
    let mut manifest = common::manifest();
    let mut cap: Capability = manifest.capabilities[0].clone();
    cap.id = "lookup-sku".to_string();
    cap.method = HttpMethod::Get;
    cap.endpoint = "/api/v1/products/{sku}".to_string();
    cap.response_schema = None;
    cap.parameters = vec![Parameter::new("sku", ParamType::String).required()];
    manifest.capabilities.push(cap);

    let encoded = manifest.to_json().unwrap();
    let decoded: Manifest = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, manifest);
    tokio_test::assert_ok!(ManifestValidator::new().validate_manifest(&decoded));
}

#[test]
fn yaml_and_json_sources_agree() {
    let raw = common::manifest_json();
    let yaml = serde_yaml::to_string(&raw).unwrap();
    let json = serde_json::to_string(&raw).unwrap();

    let validator = ManifestValidator::new();
    assert_eq!(
        validator.validate_yaml_str(&yaml).unwrap(),
        validator.validate_str(&json).unwrap()
    );
}

#[test]
fn validate_file_reads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&common::manifest_json()).unwrap()).unwrap();

    let manifest = ManifestValidator::new().validate_file(&path).unwrap();
    assert_eq!(manifest.name, "Example Shop");

    let missing = ManifestValidator::new().validate_file(dir.path().join("nope.json"));
    assert!(matches!(missing, Err(atp_runtime::Error::Configuration { .. })));
}
