use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use concierge_core::plan::{validate_plan, Plan, PlanError};
use concierge_core::tools::ToolRegistry;

use crate::llm::{LlmClient, LlmError};
use crate::prompts::{render, PLANNER_SYSTEM, PLANNER_USER_TEMPLATE, REPAIR_SYSTEM};

#[derive(Clone, Debug, PartialEq, Error)]
pub enum PlannerFailure {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("planner output invalid after repair: {0}")]
    InvalidAfterRepair(PlanError),
}

/// Drives the external planning model and turns its raw output into a
/// validated [`Plan`]. One repair round-trip is attempted when the first
/// output does not parse or does not validate.
pub struct Planner {
    client: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    pub async fn plan(
        &self,
        registry: &ToolRegistry,
        message: &str,
        session_summary: &str,
        request_id: &str,
    ) -> Result<Plan, PlannerFailure> {
        let catalog = registry.catalog();
        let user_prompt = render(
            PLANNER_USER_TEMPLATE,
            &[
                ("message", message),
                ("session_summary", session_summary),
                ("tools_catalog", &catalog),
            ],
        );
        let schema = plan_format_schema();

        let raw = self.client.chat_json(PLANNER_SYSTEM, &user_prompt, &schema).await?;

        match validate_plan(registry, &raw) {
            Ok(plan) => Ok(plan),
            Err(first_error) => {
                tracing::debug!(
                    event_name = "planner.repair_attempt",
                    request_id,
                    reason = first_error.reason_code(),
                    "first planner output rejected, attempting repair"
                );
                let repaired = self.repair(&raw, &schema).await?;
                validate_plan(registry, &repaired)
                    .map_err(PlannerFailure::InvalidAfterRepair)
            }
        }
    }

    async fn repair(&self, bad_output: &str, schema: &Value) -> Result<String, PlannerFailure> {
        let prompt = format!(
            "Return ONLY a valid JSON object, without markdown or extra text.\n\
             It must match EXACTLY this JSON schema:\n{schema}\n\n\
             Invalid output to repair:\n{bad_output}\n\n\
             Return only the valid JSON."
        );
        Ok(self.client.chat_json(REPAIR_SYSTEM, &prompt, schema).await?)
    }
}

/// JSON schema handed to the model as a structured-output constraint. Kept
/// in lockstep with [`concierge_core::plan::Plan`].
pub fn plan_format_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "intent": {
                "type": "string",
                "enum": ["identify", "faq", "read_data", "write_action", "unknown"]
            },
            "slots": {
                "type": "object",
                "properties": {
                    "customer_ref": {"type": ["string", "null"]},
                    "period": {"type": ["string", "null"]},
                    "extra": {"type": "object"}
                }
            },
            "missing": {
                "type": "array",
                "items": {"type": "string", "enum": ["customer_ref", "period"]}
            },
            "tool_calls": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "args": {"type": "object"}
                    },
                    "required": ["name"]
                }
            },
            "final": {"type": ["string", "null"]},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0}
        },
        "required": ["intent", "confidence"]
    })
}
