use std::sync::Arc;

use serde_json::{Map, Value};

use concierge_core::plan::Plan;

use crate::llm::{LlmClient, LlmError};
use crate::prompts::{render, ANSWERER_SYSTEM, ANSWERER_USER_TEMPLATE};

/// Composes the final reply from tool outputs. This is the optional
/// answer-composition collaborator; when it is disabled or fails, the
/// orchestrator falls back to [`fallback_reply`].
pub struct Answerer {
    client: Arc<dyn LlmClient>,
}

impl Answerer {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    pub async fn compose(
        &self,
        message: &str,
        plan: &Plan,
        tool_results: &Map<String, Value>,
        session_summary: &str,
    ) -> Result<String, LlmError> {
        let slots_json = serde_json::to_string(&plan.slots).unwrap_or_else(|_| "{}".to_string());
        let tool_results_json =
            serde_json::to_string(tool_results).unwrap_or_else(|_| "{}".to_string());

        let user_prompt = render(
            ANSWERER_USER_TEMPLATE,
            &[
                ("message", message),
                ("intent", plan.intent.as_str()),
                ("slots_json", &slots_json),
                ("tool_results_json", &tool_results_json),
                ("session_summary", session_summary),
            ],
        );

        let reply = self.client.chat_text(ANSWERER_SYSTEM, &user_prompt).await?;
        if reply.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(reply.trim().to_string())
    }
}

/// Deterministic reply used when the answerer is disabled or unavailable.
pub fn fallback_reply(intent: &str, tool_results: &Map<String, Value>) -> String {
    let results_json =
        serde_json::to_string(tool_results).unwrap_or_else(|_| "{}".to_string());
    format!("Intent: {intent}\nResults: {results_json}")
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::fallback_reply;

    #[test]
    fn fallback_reply_includes_intent_and_results() {
        let mut results = Map::new();
        results.insert("get_report".to_string(), json!({"ok": true, "metric_a": 123}));

        let reply = fallback_reply("read_data", &results);
        assert!(reply.contains("read_data"));
        assert!(reply.contains("metric_a"));
    }
}
