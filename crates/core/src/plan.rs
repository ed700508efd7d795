use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::tools::{SchemaViolation, ToolRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanIntent {
    Identify,
    Faq,
    ReadData,
    WriteAction,
    Unknown,
}

impl PlanIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identify => "identify",
            Self::Faq => "faq",
            Self::ReadData => "read_data",
            Self::WriteAction => "write_action",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingSlot {
    CustomerRef,
    Period,
}

impl MissingSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerRef => "customer_ref",
            Self::Period => "period",
        }
    }

    pub fn question(&self) -> &'static str {
        match self {
            Self::CustomerRef => "Which customer is this about? (name or reference)",
            Self::Period => "Which period? (YYYY-MM, for example 2026-07)",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSlots {
    #[serde(default)]
    pub customer_ref: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// One validated planner output for a single turn. Immutable once
/// validated; discarded after dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub intent: PlanIntent,
    #[serde(default)]
    pub slots: PlanSlots,
    #[serde(default)]
    pub missing: Vec<MissingSlot>,
    #[serde(default)]
    pub tool_calls: Vec<PlannedToolCall>,
    #[serde(rename = "final", default)]
    pub final_reply: Option<String>,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum PlanError {
    #[error("planner output is malformed: {detail}")]
    Malformed { detail: String },
    #[error("plan references unknown tool `{name}`")]
    UnknownTool { name: String },
    #[error("arguments for tool `{tool}` do not match its schema: {violation}")]
    SchemaMismatch { tool: String, violation: SchemaViolation },
    #[error("plan confidence {value} is outside [0, 1]")]
    ConfidenceOutOfRange { value: f64 },
}

impl PlanError {
    /// Stable machine-readable reason code, for audit metadata.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed_structure",
            Self::UnknownTool { .. } => "unknown_tool",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::ConfidenceOutOfRange { .. } => "confidence_out_of_range",
        }
    }
}

/// Validates raw planner output against the plan schema and the tool
/// registry. Pure and side-effect-free; never executes tools.
pub fn validate_plan(registry: &ToolRegistry, raw: &str) -> Result<Plan, PlanError> {
    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|error| PlanError::Malformed { detail: error.to_string() })?;
    validate_plan_value(registry, value)
}

pub fn validate_plan_value(registry: &ToolRegistry, value: Value) -> Result<Plan, PlanError> {
    let plan: Plan = serde_json::from_value(value)
        .map_err(|error| PlanError::Malformed { detail: error.to_string() })?;

    if !(0.0..=1.0).contains(&plan.confidence) {
        return Err(PlanError::ConfidenceOutOfRange { value: plan.confidence });
    }

    for call in &plan.tool_calls {
        let schema = registry
            .schema_for(&call.name)
            .map_err(|_| PlanError::UnknownTool { name: call.name.clone() })?;
        schema
            .validate(&call.args)
            .map_err(|violation| PlanError::SchemaMismatch { tool: call.name.clone(), violation })?;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use super::{validate_plan, MissingSlot, PlanError, PlanIntent};
    use crate::tools::{
        ArgKind, ArgSchema, ArgSpec, SchemaViolation, ToolAccess, ToolContext, ToolDescriptor,
        ToolExecutor, ToolFailure, ToolRegistry,
    };

    struct NoopExecutor;

    #[async_trait]
    impl ToolExecutor for NoopExecutor {
        async fn execute(
            &self,
            _args: &Map<String, Value>,
            _ctx: &ToolContext,
        ) -> Result<Value, ToolFailure> {
            Ok(json!({"ok": true}))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::default();
        registry
            .register(ToolDescriptor::new(
                "get_report",
                "demo report",
                ArgSchema::new(vec![
                    ArgSpec::required("customer_ref", ArgKind::String, "customer reference"),
                    ArgSpec::required("period", ArgKind::String, "period YYYY-MM"),
                ]),
                ToolAccess::Read,
                Arc::new(NoopExecutor),
            ))
            .expect("register get_report");
        registry
    }

    #[test]
    fn accepts_minimal_final_plan() {
        let raw = r#"{
            "intent": "faq",
            "slots": {"customer_ref": null, "period": null, "extra": {}},
            "missing": [],
            "tool_calls": [],
            "final": "Hi, how can I help?",
            "confidence": 0.8
        }"#;

        let plan = validate_plan(&registry(), raw).expect("plan should validate");
        assert_eq!(plan.intent, PlanIntent::Faq);
        assert_eq!(plan.final_reply.as_deref(), Some("Hi, how can I help?"));
        assert!((0.0..=1.0).contains(&plan.confidence));
    }

    #[test]
    fn accepts_missing_slots_without_tool_calls() {
        let raw = r#"{
            "intent": "read_data",
            "missing": ["customer_ref"],
            "tool_calls": [],
            "confidence": 0.4
        }"#;

        let plan = validate_plan(&registry(), raw).expect("plan should validate");
        assert_eq!(plan.missing, vec![MissingSlot::CustomerRef]);
        assert!(plan.tool_calls.is_empty());
    }

    #[test]
    fn rejects_unknown_tool_references() {
        let raw = r#"{
            "intent": "read_data",
            "tool_calls": [{"name": "drop_database", "args": {}}],
            "confidence": 0.9
        }"#;

        let error = validate_plan(&registry(), raw).expect_err("unknown tool should fail");
        assert_eq!(error, PlanError::UnknownTool { name: "drop_database".to_string() });
        assert_eq!(error.reason_code(), "unknown_tool");
    }

    #[test]
    fn rejects_arguments_that_violate_the_tool_schema() {
        let raw = r#"{
            "intent": "read_data",
            "tool_calls": [{"name": "get_report", "args": {"customer_ref": "CUST_001"}}],
            "confidence": 0.9
        }"#;

        let error = validate_plan(&registry(), raw).expect_err("schema mismatch should fail");
        assert_eq!(
            error,
            PlanError::SchemaMismatch {
                tool: "get_report".to_string(),
                violation: SchemaViolation::MissingRequired { name: "period".to_string() },
            }
        );
    }

    #[test]
    fn rejects_malformed_structure() {
        let error = validate_plan(&registry(), "not json at all").expect_err("should fail");
        assert!(matches!(error, PlanError::Malformed { .. }));

        let error = validate_plan(&registry(), r#"{"intent": "faq"}"#)
            .expect_err("missing confidence should fail");
        assert!(matches!(error, PlanError::Malformed { .. }));
    }

    #[test]
    fn rejects_confidence_outside_unit_interval() {
        let raw = r#"{"intent": "faq", "confidence": 1.4}"#;
        let error = validate_plan(&registry(), raw).expect_err("confidence should fail");
        assert_eq!(error, PlanError::ConfidenceOutOfRange { value: 1.4 });
    }

    #[test]
    fn ignores_extra_top_level_fields() {
        let raw = r#"{
            "intent": "faq",
            "confidence": 0.7,
            "final": "hello",
            "reasoning": "models sometimes add this"
        }"#;

        let plan = validate_plan(&registry(), raw).expect("extra fields should be ignored");
        assert_eq!(plan.intent, PlanIntent::Faq);
    }
}
