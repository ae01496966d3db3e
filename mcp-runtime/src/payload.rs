//! Request payload construction for test case create and update calls.
//!
//! Create payloads carry only the fields the caller supplied; nothing is
//! ever sent as an explicit `null`, so platform defaults apply on create and
//! existing values survive updates. Update payloads follow the write API's
//! full-replace semantics: omitting a field clears it on the server, which
//! is why the four base fields are mandatory on the fetched record.

use serde_json::{Map, Value, json};

use crate::ToolError;
use crate::gherkin::to_canonical_bdd;

/// Fields that must be present and non-empty on a fetched test case before
/// a full-replace update may be sent.
const UPDATE_REQUIRED_FIELDS: [&str; 4] = ["projectKey", "name", "status", "priority"];

const UPDATE_OPTIONAL_SCALAR_FIELDS: [&str; 6] = [
    "objective",
    "precondition",
    "folder",
    "component",
    "owner",
    "estimatedTime",
];

#[derive(Clone, Debug, Default)]
pub(crate) struct TestStep {
    pub description: Option<String>,
    pub test_data: Option<String>,
    pub expected_result: Option<String>,
    pub test_case_key: Option<String>,
}

/// Test script content, one variant per wire-level `type` tag. Modeled as a
/// sum type so a step list can never coexist with script text.
#[derive(Clone, Debug)]
pub(crate) enum TestScript {
    Steps(Vec<TestStep>),
    PlainText(String),
    Bdd(String),
}

impl TestScript {
    /// Parses the `test_script` argument object. The `type` tag selects the
    /// variant; the matching content field is required.
    pub(crate) fn from_args(value: &Value) -> Result<Self, ToolError> {
        let obj = value.as_object().ok_or_else(|| {
            ToolError::new("validation_failed", "'test_script' must be an object")
                .with_field("test_script")
        })?;
        let script_type = obj.get("type").and_then(Value::as_str).ok_or_else(|| {
            ToolError::new(
                "validation_failed",
                "'test_script.type' must be one of STEP_BY_STEP, PLAIN_TEXT, BDD",
            )
            .with_field("test_script.type")
        })?;

        match script_type {
            "STEP_BY_STEP" => {
                let steps = obj
                    .get("steps")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        ToolError::new(
                            "validation_failed",
                            "STEP_BY_STEP scripts require a 'steps' array",
                        )
                        .with_field("test_script.steps")
                    })?
                    .iter()
                    .map(parse_step)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TestScript::Steps(steps))
            }
            "PLAIN_TEXT" => Ok(TestScript::PlainText(require_script_text(obj)?)),
            "BDD" => Ok(TestScript::Bdd(require_script_text(obj)?)),
            other => Err(ToolError::new(
                "validation_failed",
                format!("Unsupported test script type '{other}'"),
            )
            .with_field("test_script.type")),
        }
    }

    pub(crate) fn type_tag(&self) -> &'static str {
        match self {
            TestScript::Steps(_) => "STEP_BY_STEP",
            TestScript::PlainText(_) => "PLAIN_TEXT",
            TestScript::Bdd(_) => "BDD",
        }
    }

    /// Emits the wire representation. The `type` tag is always set; steps
    /// carry only their present sub-fields. BDD text runs through the
    /// converter first and falls back to the raw text when the converter
    /// finds no recognizable steps.
    pub(crate) fn to_payload(&self) -> Value {
        match self {
            TestScript::Steps(steps) => {
                let steps: Vec<Value> = steps.iter().map(step_payload).collect();
                json!({ "type": "STEP_BY_STEP", "steps": steps })
            }
            TestScript::PlainText(text) => json!({ "type": "PLAIN_TEXT", "text": text }),
            TestScript::Bdd(text) => {
                let converted = to_canonical_bdd(text);
                let final_text = if converted.trim().is_empty() {
                    text.clone()
                } else {
                    converted
                };
                json!({ "type": "BDD", "text": final_text })
            }
        }
    }
}

fn require_script_text(obj: &Map<String, Value>) -> Result<String, ToolError> {
    match obj.get("text").and_then(Value::as_str) {
        Some(text) => Ok(text.to_string()),
        None => Err(ToolError::new(
            "validation_failed",
            "PLAIN_TEXT and BDD scripts require a 'text' string",
        )
        .with_field("test_script.text")),
    }
}

fn parse_step(value: &Value) -> Result<TestStep, ToolError> {
    let obj = value.as_object().ok_or_else(|| {
        ToolError::new("validation_failed", "'test_script.steps' items must be objects")
            .with_field("test_script.steps")
    })?;
    let field = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
    Ok(TestStep {
        description: field("description"),
        test_data: field("testData"),
        expected_result: field("expectedResult"),
        test_case_key: field("testCaseKey"),
    })
}

fn step_payload(step: &TestStep) -> Value {
    let mut obj = Map::new();
    if let Some(description) = &step.description {
        obj.insert("description".to_string(), json!(description));
    }
    if let Some(test_data) = &step.test_data {
        obj.insert("testData".to_string(), json!(test_data));
    }
    if let Some(expected_result) = &step.expected_result {
        obj.insert("expectedResult".to_string(), json!(expected_result));
    }
    if let Some(test_case_key) = &step.test_case_key {
        obj.insert("testCaseKey".to_string(), json!(test_case_key));
    }
    Value::Object(obj)
}

/// Validated `zephyr_create_test_case` arguments.
#[derive(Clone, Debug, Default)]
pub(crate) struct CreateTestCaseArgs {
    pub project_key: String,
    pub name: String,
    pub test_script: Option<TestScript>,
    pub folder: Option<String>,
    pub priority: Option<String>,
    pub precondition: Option<String>,
    pub objective: Option<String>,
    pub component: Option<String>,
    pub owner: Option<String>,
    pub estimated_time: Option<u64>,
    pub labels: Option<Vec<String>>,
    pub issue_links: Option<Vec<String>>,
    pub custom_fields: Option<Value>,
    pub parameters: Option<Value>,
}

/// Builds the create payload. Only supplied fields are included; empty label
/// and issue-link lists are treated as absent. Status is unconditionally
/// `Draft`: new test cases always enter the draft state, whatever the caller
/// asked for.
pub(crate) fn build_create_payload(args: &CreateTestCaseArgs) -> Value {
    let mut payload = Map::new();
    payload.insert("projectKey".to_string(), json!(args.project_key));
    payload.insert("name".to_string(), json!(args.name));

    if let Some(folder) = &args.folder {
        payload.insert("folder".to_string(), json!(folder));
    }
    if let Some(priority) = &args.priority {
        payload.insert("priority".to_string(), json!(priority));
    }
    if let Some(precondition) = &args.precondition {
        payload.insert("precondition".to_string(), json!(precondition));
    }
    if let Some(objective) = &args.objective {
        payload.insert("objective".to_string(), json!(objective));
    }
    if let Some(component) = &args.component {
        payload.insert("component".to_string(), json!(component));
    }
    if let Some(owner) = &args.owner {
        payload.insert("owner".to_string(), json!(owner));
    }
    if let Some(estimated_time) = args.estimated_time {
        payload.insert("estimatedTime".to_string(), json!(estimated_time));
    }
    if let Some(labels) = args.labels.as_deref().filter(|labels| !labels.is_empty()) {
        payload.insert("labels".to_string(), json!(labels));
    }
    if let Some(issue_links) = args
        .issue_links
        .as_deref()
        .filter(|links| !links.is_empty())
    {
        payload.insert("issueLinks".to_string(), json!(issue_links));
    }
    if let Some(custom_fields) = &args.custom_fields {
        payload.insert("customFields".to_string(), custom_fields.clone());
    }
    if let Some(parameters) = &args.parameters {
        payload.insert("parameters".to_string(), parameters.clone());
    }
    if let Some(test_script) = &args.test_script {
        payload.insert("testScript".to_string(), test_script.to_payload());
    }

    // Fixed policy: the caller-supplied status is ignored on create.
    payload.insert("status".to_string(), json!("Draft"));

    Value::Object(payload)
}

/// Builds the full-replace update payload for a BDD rewrite of an existing
/// test case. Fails before any write when the fetched record lacks one of
/// the required base fields, since resending without it would clear it.
pub(crate) fn build_update_payload(existing: &Value, bdd_content: &str) -> Result<Value, ToolError> {
    let mut payload = Map::new();

    for field in UPDATE_REQUIRED_FIELDS {
        let Some(value) = existing.get(field).filter(|value| !is_blank(value)) else {
            return Err(ToolError::new(
                "validation_failed",
                format!("Existing test case is missing required field '{field}' needed for update"),
            )
            .with_field(field));
        };
        payload.insert(field.to_string(), value.clone());
    }

    for field in UPDATE_OPTIONAL_SCALAR_FIELDS {
        if let Some(value) = existing.get(field).filter(|value| !value.is_null()) {
            payload.insert(field.to_string(), value.clone());
        }
    }

    if let Some(labels) = existing.get("labels").filter(|value| value.is_array()) {
        payload.insert("labels".to_string(), labels.clone());
    }
    if let Some(custom_fields) = existing.get("customFields").filter(|value| !value.is_null()) {
        payload.insert("customFields".to_string(), custom_fields.clone());
    }
    if let Some(parameters) = existing.get("parameters").filter(|value| !value.is_null()) {
        payload.insert("parameters".to_string(), parameters.clone());
    }

    // issueLinks is preferred; the deprecated single issueKey migrates into
    // the list form when the list is absent.
    if let Some(issue_links) = existing.get("issueLinks").filter(|value| value.is_array()) {
        payload.insert("issueLinks".to_string(), issue_links.clone());
    } else if let Some(issue_key) = existing.get("issueKey").and_then(Value::as_str) {
        payload.insert("issueLinks".to_string(), json!([issue_key]));
    }

    let converted = to_canonical_bdd(bdd_content);
    let final_text = if converted.trim().is_empty() {
        bdd_content.to_string()
    } else {
        converted
    };
    payload.insert(
        "testScript".to_string(),
        json!({ "type": "BDD", "text": final_text }),
    );

    Ok(Value::Object(payload))
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_args() -> CreateTestCaseArgs {
        CreateTestCaseArgs {
            project_key: "PROJ".to_string(),
            name: "Checkout totals".to_string(),
            ..CreateTestCaseArgs::default()
        }
    }

    #[test]
    fn absent_optional_fields_are_omitted_entirely() {
        let payload = build_create_payload(&minimal_args());
        let obj = payload.as_object().unwrap();
        assert!(!obj.contains_key("folder"));
        assert!(!obj.contains_key("priority"));
        assert!(!obj.contains_key("labels"));
        assert_eq!(obj["projectKey"], "PROJ");
        assert_eq!(obj["name"], "Checkout totals");
    }

    #[test]
    fn create_status_is_always_draft() {
        let payload = build_create_payload(&minimal_args());
        assert_eq!(payload["status"], "Draft");
    }

    #[test]
    fn empty_label_list_is_treated_as_absent() {
        let mut args = minimal_args();
        args.labels = Some(Vec::new());
        let payload = build_create_payload(&args);
        assert!(payload.get("labels").is_none());
    }

    #[test]
    fn estimated_time_maps_to_camel_case() {
        let mut args = minimal_args();
        args.estimated_time = Some(120_000);
        let payload = build_create_payload(&args);
        assert_eq!(payload["estimatedTime"], 120_000);
    }

    #[test]
    fn step_payload_carries_only_present_sub_fields() {
        let mut args = minimal_args();
        args.test_script = Some(TestScript::Steps(vec![TestStep {
            description: Some("Open the cart".to_string()),
            expected_result: Some("Cart is shown".to_string()),
            ..TestStep::default()
        }]));
        let payload = build_create_payload(&args);
        let step = &payload["testScript"]["steps"][0];
        assert_eq!(payload["testScript"]["type"], "STEP_BY_STEP");
        assert_eq!(step["description"], "Open the cart");
        assert_eq!(step["expectedResult"], "Cart is shown");
        assert!(step.get("testData").is_none());
        assert!(step.get("testCaseKey").is_none());
    }

    #[test]
    fn bdd_script_converts_markdown_to_canonical_steps() {
        let mut args = minimal_args();
        args.test_script = Some(TestScript::Bdd(
            "- given a cart\n- when checkout starts\n- then totals are shown".to_string(),
        ));
        let payload = build_create_payload(&args);
        assert_eq!(payload["testScript"]["type"], "BDD");
        assert_eq!(
            payload["testScript"]["text"],
            "Given a cart\nWhen checkout starts\nThen totals are shown"
        );
    }

    #[test]
    fn bdd_script_falls_back_to_raw_text_without_keywords() {
        let raw = "Check that checkout works end to end.";
        let mut args = minimal_args();
        args.test_script = Some(TestScript::Bdd(raw.to_string()));
        let payload = build_create_payload(&args);
        assert_eq!(payload["testScript"]["text"], raw);
    }

    #[test]
    fn plain_text_script_passes_through_unchanged() {
        let mut args = minimal_args();
        args.test_script = Some(TestScript::PlainText("given nothing special".to_string()));
        let payload = build_create_payload(&args);
        assert_eq!(payload["testScript"]["type"], "PLAIN_TEXT");
        assert_eq!(payload["testScript"]["text"], "given nothing special");
    }

    #[test]
    fn script_parse_rejects_unknown_type() {
        let err = TestScript::from_args(&json!({ "type": "MANUAL" })).unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("test_script.type"));
    }

    #[test]
    fn script_parse_requires_text_for_bdd() {
        let err = TestScript::from_args(&json!({ "type": "BDD" })).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("test_script.text"));
    }

    #[test]
    fn script_parse_reads_step_sub_fields() {
        let script = TestScript::from_args(&json!({
            "type": "STEP_BY_STEP",
            "steps": [
                { "description": "Log in", "testData": "user/secret" },
                { "expectedResult": "Dashboard visible" }
            ]
        }))
        .unwrap();
        assert_eq!(script.type_tag(), "STEP_BY_STEP");
        let TestScript::Steps(steps) = script else {
            panic!("expected step sequence");
        };
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].test_data.as_deref(), Some("user/secret"));
        assert!(steps[1].description.is_none());
    }

    #[test]
    fn update_fails_when_required_field_is_missing() {
        let existing = json!({
            "projectKey": "PROJ",
            "name": "Checkout totals",
            "status": "Approved"
        });
        let err = build_update_payload(&existing, "Given a cart").unwrap_err();
        assert_eq!(err.code, "validation_failed");
        assert_eq!(err.field.as_deref(), Some("priority"));
        assert!(err.message.contains("'priority'"));
    }

    #[test]
    fn update_fails_when_required_field_is_empty() {
        let existing = json!({
            "projectKey": "PROJ",
            "name": "",
            "status": "Approved",
            "priority": "Normal"
        });
        let err = build_update_payload(&existing, "Given a cart").unwrap_err();
        assert_eq!(err.field.as_deref(), Some("name"));
    }

    #[test]
    fn update_copies_present_optionals_and_skips_absent_ones() {
        let existing = json!({
            "projectKey": "PROJ",
            "name": "Checkout totals",
            "status": "Approved",
            "priority": "Normal",
            "folder": "/Checkout",
            "objective": null,
            "labels": ["smoke"],
            "customFields": { "Type": "Functional" }
        });
        let payload = build_update_payload(&existing, "Given a cart").unwrap();
        assert_eq!(payload["folder"], "/Checkout");
        assert!(payload.get("objective").is_none());
        assert!(payload.get("precondition").is_none());
        assert_eq!(payload["labels"], json!(["smoke"]));
        assert_eq!(payload["customFields"]["Type"], "Functional");
    }

    #[test]
    fn update_migrates_legacy_issue_key_when_links_absent() {
        let existing = json!({
            "projectKey": "PROJ",
            "name": "Checkout totals",
            "status": "Approved",
            "priority": "Normal",
            "issueKey": "PROJ-42"
        });
        let payload = build_update_payload(&existing, "Given a cart").unwrap();
        assert_eq!(payload["issueLinks"], json!(["PROJ-42"]));
    }

    #[test]
    fn update_prefers_issue_links_over_legacy_key() {
        let existing = json!({
            "projectKey": "PROJ",
            "name": "Checkout totals",
            "status": "Approved",
            "priority": "Normal",
            "issueKey": "PROJ-42",
            "issueLinks": ["PROJ-7", "PROJ-8"]
        });
        let payload = build_update_payload(&existing, "Given a cart").unwrap();
        assert_eq!(payload["issueLinks"], json!(["PROJ-7", "PROJ-8"]));
    }

    #[test]
    fn update_forces_bdd_script_with_converted_text() {
        let existing = json!({
            "projectKey": "PROJ",
            "name": "Checkout totals",
            "status": "Approved",
            "priority": "Normal",
            "testScript": { "type": "PLAIN_TEXT", "text": "old" }
        });
        let payload = build_update_payload(&existing, "given a cart\nwhen checkout").unwrap();
        assert_eq!(payload["testScript"]["type"], "BDD");
        assert_eq!(payload["testScript"]["text"], "Given a cart\nWhen checkout");
    }

    #[test]
    fn update_keeps_raw_text_when_conversion_is_empty() {
        let existing = json!({
            "projectKey": "PROJ",
            "name": "Checkout totals",
            "status": "Approved",
            "priority": "Normal"
        });
        let payload = build_update_payload(&existing, "no steps here").unwrap();
        assert_eq!(payload["testScript"]["text"], "no steps here");
    }
}
