use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::time::timeout;
use uuid::Uuid;

use concierge_core::audit::{AuditEvent, AuditKind, AuditLog, AuditOutcome};
use concierge_core::config::{AgentConfig, LlmConfig};
use concierge_core::confirm::{ConfirmationManager, ConfirmedAction};
use concierge_core::dedupe::DedupeStore;
use concierge_core::errors::TurnError;
use concierge_core::plan::{Plan, PlanIntent};
use concierge_core::ratelimit::SlidingWindowLimiter;
use concierge_core::session::{SessionState, SessionStore};
use concierge_core::tools::{ToolContext, ToolRegistry};

use crate::answerer::{fallback_reply, Answerer};
use crate::planner::{Planner, PlannerFailure};

/// One inbound message, already past any channel boundary checks.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub message: String,
    pub session_id: Option<String>,
    pub channel: String,
    pub user_id: Option<String>,
    pub message_id: Option<String>,
    pub payload_hash: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentReply {
    pub intent: String,
    pub reply: String,
    pub missing: Vec<String>,
    pub data: Map<String, Value>,
}

impl AgentReply {
    fn simple(intent: impl Into<String>, reply: impl Into<String>) -> Self {
        Self { intent: intent.into(), reply: reply.into(), missing: Vec::new(), data: Map::new() }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub planner_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub dedupe_ttl_secs: u64,
    pub rate_limit_enabled: bool,
    pub rate_limit_session_max: u32,
    pub rate_limit_session_window_secs: u64,
}

impl OrchestratorSettings {
    pub fn from_config(agent: &AgentConfig, llm: &LlmConfig) -> Self {
        Self {
            planner_timeout_secs: llm.timeout_secs,
            tool_timeout_secs: agent.tool_timeout_secs,
            dedupe_ttl_secs: agent.dedupe_ttl_secs,
            rate_limit_enabled: agent.rate_limit.enabled,
            rate_limit_session_max: agent.rate_limit.session_max,
            rate_limit_session_window_secs: agent.rate_limit.session_window_secs,
        }
    }
}

pub struct OrchestratorParts {
    pub registry: Arc<ToolRegistry>,
    pub planner: Planner,
    pub answerer: Option<Answerer>,
    pub confirmations: ConfirmationManager,
    pub sessions: Arc<dyn SessionStore>,
    pub dedupe: Arc<dyn DedupeStore>,
    pub audit: Arc<dyn AuditLog>,
}

/// Composes the trust layer for one turn: dedupe, planning, validation,
/// confirmation gating, allowlisted dispatch, audit, response assembly.
/// Holds no lock across planner or executor calls; atomicity lives in the
/// dedupe claim and the confirmation transition.
pub struct AgentOrchestrator {
    registry: Arc<ToolRegistry>,
    planner: Planner,
    answerer: Option<Answerer>,
    confirmations: ConfirmationManager,
    sessions: Arc<dyn SessionStore>,
    dedupe: Arc<dyn DedupeStore>,
    audit: Arc<dyn AuditLog>,
    limiter: Option<SlidingWindowLimiter>,
    settings: OrchestratorSettings,
}

impl AgentOrchestrator {
    pub fn new(settings: OrchestratorSettings, parts: OrchestratorParts) -> Self {
        let limiter = settings.rate_limit_enabled.then(|| {
            SlidingWindowLimiter::new(
                settings.rate_limit_session_max,
                settings.rate_limit_session_window_secs,
            )
        });

        Self {
            registry: parts.registry,
            planner: parts.planner,
            answerer: parts.answerer,
            confirmations: parts.confirmations,
            sessions: parts.sessions,
            dedupe: parts.dedupe,
            audit: parts.audit,
            limiter,
            settings,
        }
    }

    pub async fn handle_message(&self, msg: InboundMessage) -> AgentReply {
        let request_id = Uuid::new_v4().to_string();
        let session_id = msg
            .session_id
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| request_id.clone());

        tracing::info!(
            event_name = "turn.received",
            request_id,
            session_id,
            channel = %msg.channel,
            "inbound message received"
        );

        if let Some(limiter) = &self.limiter {
            let decision = limiter.check(&format!("sess:{session_id}"));
            if !decision.allowed {
                tracing::warn!(
                    event_name = "turn.rate_limited",
                    request_id,
                    session_id,
                    retry_after_secs = decision.retry_after_secs,
                    "session over rate limit"
                );
                let mut data = Map::new();
                data.insert("retry_after_secs".to_string(), json!(decision.retry_after_secs));
                data.insert("scope".to_string(), json!("session"));
                return AgentReply {
                    intent: "rate_limited".to_string(),
                    reply: format!(
                        "You're sending messages too quickly. Try again in {}s.",
                        decision.retry_after_secs
                    ),
                    missing: Vec::new(),
                    data,
                };
            }
        }

        let mut claimed = false;
        if let Some(message_id) = &msg.message_id {
            let claim = self
                .dedupe
                .claim(
                    &msg.channel,
                    message_id,
                    msg.payload_hash.as_deref(),
                    Utc::now(),
                    chrono::Duration::seconds(self.settings.dedupe_ttl_secs.max(1) as i64),
                )
                .await;
            match claim {
                Ok(true) => claimed = true,
                Ok(false) => {
                    tracing::info!(
                        event_name = "turn.duplicate",
                        request_id,
                        session_id,
                        channel = %msg.channel,
                        message_id,
                        "duplicate delivery ignored"
                    );
                    return AgentReply::simple(
                        "duplicate",
                        "This message was already processed.",
                    );
                }
                Err(error) => {
                    return self
                        .reject(&msg, &session_id, &request_id, TurnError::Store(error), false)
                        .await;
                }
            }
        }
        tracing::debug!(event_name = "turn.dedupe_checked", request_id, session_id, claimed);

        match self.run_turn(&msg, &session_id, &request_id).await {
            Ok(reply) => reply,
            Err(error) => self.reject(&msg, &session_id, &request_id, error, claimed).await,
        }
    }

    async fn run_turn(
        &self,
        msg: &InboundMessage,
        session_id: &str,
        request_id: &str,
    ) -> Result<AgentReply, TurnError> {
        let mut session = self.sessions.load(session_id).await?.unwrap_or_default();
        let session_summary = session.summary();
        tracing::debug!(event_name = "turn.context_built", request_id, session_id);

        self.audit_soft(
            AuditEvent::new(
                request_id,
                session_id,
                &msg.channel,
                AuditKind::Inbound,
                AuditOutcome::Success,
            )
            .with_metadata("text_len", msg.message.len().to_string()),
        )
        .await;

        if let Some(token) = extract_confirm_token(&msg.message) {
            return self
                .handle_confirmation(msg, session_id, request_id, &token, &mut session)
                .await;
        }

        let plan = self.call_planner(msg, request_id, &session_summary).await?;

        self.audit_soft(
            AuditEvent::new(
                request_id,
                session_id,
                &msg.channel,
                AuditKind::Plan,
                AuditOutcome::Success,
            )
            .with_metadata("intent", plan.intent.as_str())
            .with_metadata("tool_calls", plan.tool_calls.len().to_string()),
        )
        .await;
        tracing::info!(
            event_name = "turn.plan_validated",
            request_id,
            session_id,
            intent = plan.intent.as_str(),
            tool_calls = plan.tool_calls.len(),
            "plan validated"
        );

        // A write intent that proposes no tool is a planner contract
        // violation, not something to answer from the model's text.
        if plan.intent == PlanIntent::WriteAction && plan.tool_calls.is_empty() {
            return Err(TurnError::WriteWithoutToolCall);
        }

        if !plan.missing.is_empty() {
            let questions = plan
                .missing
                .iter()
                .map(|slot| format!("- {}", slot.question()))
                .collect::<Vec<_>>()
                .join("\n");
            let missing =
                plan.missing.iter().map(|slot| slot.as_str().to_string()).collect::<Vec<_>>();
            let mut data = Map::new();
            data.insert("slots".to_string(), json!(plan.slots));
            return Ok(self
                .finalize(
                    msg,
                    session_id,
                    request_id,
                    &mut session,
                    plan.intent.as_str(),
                    format!("I need one more detail to help:\n{questions}"),
                    missing,
                    data,
                )
                .await);
        }

        if plan.tool_calls.is_empty() {
            if let Some(final_reply) = plan.final_reply.clone() {
                let mut data = Map::new();
                data.insert("slots".to_string(), json!(plan.slots));
                return Ok(self
                    .finalize(
                        msg,
                        session_id,
                        request_id,
                        &mut session,
                        plan.intent.as_str(),
                        final_reply,
                        Vec::new(),
                        data,
                    )
                    .await);
            }
        }

        let mut tool_results: Map<String, Value> = Map::new();
        for call in &plan.tool_calls {
            let descriptor = self.registry.lookup(&call.name)?;

            if descriptor.is_write() {
                // Never executed inline: park it behind a single-use token
                // and short-circuit the turn. Only one outstanding
                // confirmation ever drives the response.
                let token = self
                    .confirmations
                    .request(session_id, &call.name, call.args.clone())
                    .await?;
                tracing::info!(
                    event_name = "turn.awaiting_confirmation",
                    request_id,
                    session_id,
                    tool = %call.name,
                    "write action parked for confirmation"
                );

                let mut data = Map::new();
                data.insert(
                    "pending_confirmation".to_string(),
                    json!({"token": token, "tool": call.name, "args": call.args}),
                );
                if !tool_results.is_empty() {
                    data.insert("tool_results".to_string(), Value::Object(tool_results));
                }
                return Ok(self
                    .finalize(
                        msg,
                        session_id,
                        request_id,
                        &mut session,
                        plan.intent.as_str(),
                        format!("confirm {token}"),
                        Vec::new(),
                        data,
                    )
                    .await);
            }

            tracing::debug!(
                event_name = "tool.dispatched",
                request_id,
                session_id,
                tool = %call.name,
                confirmed = false
            );
            let ctx = ToolContext {
                request_id: request_id.to_string(),
                session_id: session_id.to_string(),
                channel: msg.channel.clone(),
                user_id: msg.user_id.clone(),
                confirmed: false,
            };
            match descriptor.executor.execute(&call.args, &ctx).await {
                Ok(result) => {
                    self.record_tool_event(
                        msg,
                        session_id,
                        request_id,
                        &call.name,
                        call.args.clone(),
                        AuditOutcome::Success,
                        None,
                        false,
                        None,
                    )
                    .await;
                    tool_results.insert(call.name.clone(), result);
                }
                Err(failure) => {
                    self.record_tool_event(
                        msg,
                        session_id,
                        request_id,
                        &call.name,
                        call.args.clone(),
                        AuditOutcome::Failure,
                        Some(failure.message.clone()),
                        false,
                        None,
                    )
                    .await;
                    tool_results.insert(
                        call.name.clone(),
                        json!({"ok": false, "error": failure.message}),
                    );
                    if failure.fatal {
                        tracing::warn!(
                            event_name = "tool.fatal_failure",
                            request_id,
                            session_id,
                            tool = %call.name,
                            "fatal tool failure, aborting remaining calls"
                        );
                        break;
                    }
                }
            }
        }

        let reply = self.compose_reply(msg, &plan, &tool_results, &session_summary).await;
        let mut data = Map::new();
        data.insert("slots".to_string(), json!(plan.slots));
        data.insert("tool_results".to_string(), Value::Object(tool_results));

        Ok(self
            .finalize(
                msg,
                session_id,
                request_id,
                &mut session,
                plan.intent.as_str(),
                reply,
                Vec::new(),
                data,
            )
            .await)
    }

    async fn call_planner(
        &self,
        msg: &InboundMessage,
        request_id: &str,
        session_summary: &str,
    ) -> Result<Plan, TurnError> {
        let bound = Duration::from_secs(self.settings.planner_timeout_secs.max(1));
        let planned = timeout(
            bound,
            self.planner.plan(&self.registry, &msg.message, session_summary, request_id),
        )
        .await;

        match planned {
            Err(_elapsed) => Err(TurnError::PlannerTimeout {
                timeout_secs: self.settings.planner_timeout_secs,
            }),
            Ok(Err(PlannerFailure::Llm(error))) => {
                Err(TurnError::Planner { detail: error.to_string() })
            }
            Ok(Err(PlannerFailure::InvalidAfterRepair(plan_error))) => Err(plan_error.into()),
            Ok(Ok(plan)) => Ok(plan),
        }
    }

    async fn handle_confirmation(
        &self,
        msg: &InboundMessage,
        session_id: &str,
        request_id: &str,
        token: &str,
        session: &mut SessionState,
    ) -> Result<AgentReply, TurnError> {
        // A write is about to run: refuse before touching the token when
        // the audit store cannot take the record.
        self.audit
            .ensure_available()
            .await
            .map_err(|source| TurnError::Unauditable { source })?;

        let action = self.confirmations.redeem(session_id, token, Utc::now()).await?;
        let descriptor = self.registry.lookup(&action.tool_name)?;

        tracing::info!(
            event_name = "turn.confirmation_redeemed",
            request_id,
            session_id,
            tool = %action.tool_name,
            "confirmation redeemed, dispatching write action"
        );

        let ctx = ToolContext {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            channel: msg.channel.clone(),
            user_id: msg.user_id.clone(),
            confirmed: true,
        };
        let bound = Duration::from_secs(self.settings.tool_timeout_secs.max(1));
        let outcome = timeout(bound, descriptor.executor.execute(&action.tool_args, &ctx)).await;

        match outcome {
            Err(_elapsed) => {
                self.record_tool_event(
                    msg,
                    session_id,
                    request_id,
                    &action.tool_name,
                    action.tool_args.clone(),
                    AuditOutcome::Failure,
                    Some("execution timed out".to_string()),
                    true,
                    Some(&action.token),
                )
                .await;
                Err(TurnError::ToolTimeout {
                    tool: action.tool_name.clone(),
                    timeout_secs: self.settings.tool_timeout_secs,
                })
            }
            Ok(Err(failure)) => {
                self.record_tool_event(
                    msg,
                    session_id,
                    request_id,
                    &action.tool_name,
                    action.tool_args.clone(),
                    AuditOutcome::Failure,
                    Some(failure.message.clone()),
                    true,
                    Some(&action.token),
                )
                .await;

                let mut results = Map::new();
                results.insert(
                    action.tool_name.clone(),
                    json!({"ok": false, "error": failure.message}),
                );
                let mut data = Map::new();
                data.insert("tool_results".to_string(), Value::Object(results));
                Ok(self
                    .finalize(
                        msg,
                        session_id,
                        request_id,
                        session,
                        "write_action",
                        format!("The action `{}` could not be completed.", action.tool_name),
                        Vec::new(),
                        data,
                    )
                    .await)
            }
            Ok(Ok(result)) => {
                self.record_tool_event(
                    msg,
                    session_id,
                    request_id,
                    &action.tool_name,
                    action.tool_args.clone(),
                    AuditOutcome::Success,
                    None,
                    true,
                    Some(&action.token),
                )
                .await;

                let reply = format_write_result(&action, &result);
                let mut results = Map::new();
                results.insert(action.tool_name.clone(), result);
                let mut data = Map::new();
                data.insert("tool_results".to_string(), Value::Object(results));
                Ok(self
                    .finalize(
                        msg,
                        session_id,
                        request_id,
                        session,
                        "write_action",
                        reply,
                        Vec::new(),
                        data,
                    )
                    .await)
            }
        }
    }

    async fn compose_reply(
        &self,
        msg: &InboundMessage,
        plan: &Plan,
        tool_results: &Map<String, Value>,
        session_summary: &str,
    ) -> String {
        let Some(answerer) = &self.answerer else {
            return fallback_reply(plan.intent.as_str(), tool_results);
        };

        match answerer.compose(&msg.message, plan, tool_results, session_summary).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(
                    event_name = "answerer.fallback",
                    error = %error,
                    "answerer unavailable, using deterministic reply"
                );
                fallback_reply(plan.intent.as_str(), tool_results)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        msg: &InboundMessage,
        session_id: &str,
        request_id: &str,
        session: &mut SessionState,
        intent: &str,
        reply: String,
        missing: Vec<String>,
        data: Map<String, Value>,
    ) -> AgentReply {
        session.push_turn(&msg.message, &reply, intent);
        if let Err(error) = self.sessions.save(session_id, session).await {
            tracing::warn!(
                event_name = "session.save_failed",
                request_id,
                session_id,
                error = %error,
                "session state could not be saved"
            );
        }

        self.audit_soft(
            AuditEvent::new(
                request_id,
                session_id,
                &msg.channel,
                AuditKind::Outbound,
                AuditOutcome::Success,
            )
            .with_metadata("intent", intent),
        )
        .await;
        tracing::info!(event_name = "turn.responded", request_id, session_id, intent);

        AgentReply { intent: intent.to_string(), reply, missing, data }
    }

    async fn reject(
        &self,
        msg: &InboundMessage,
        session_id: &str,
        request_id: &str,
        error: TurnError,
        claimed: bool,
    ) -> AgentReply {
        tracing::warn!(
            event_name = "turn.rejected",
            request_id,
            session_id,
            channel = %msg.channel,
            reason = error.reason_code(),
            error = %error,
            "turn rejected"
        );

        let kind = match &error {
            TurnError::Plan(_) | TurnError::WriteWithoutToolCall => AuditKind::Plan,
            _ => AuditKind::Error,
        };
        self.audit_soft(
            AuditEvent::new(request_id, session_id, &msg.channel, kind, AuditOutcome::Rejected)
                .with_metadata("reason", error.reason_code()),
        )
        .await;

        if claimed && error.releases_dedupe_claim() {
            if let Some(message_id) = &msg.message_id {
                if let Err(release_error) = self.dedupe.release(&msg.channel, message_id).await {
                    tracing::error!(
                        event_name = "dedupe.release_failed",
                        request_id,
                        message_id,
                        error = %release_error,
                        "could not release dedupe claim after infrastructure failure"
                    );
                }
            }
        }

        AgentReply::simple("error", error.user_message())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_tool_event(
        &self,
        msg: &InboundMessage,
        session_id: &str,
        request_id: &str,
        tool_name: &str,
        tool_args: Map<String, Value>,
        outcome: AuditOutcome,
        detail: Option<String>,
        confirmed: bool,
        token: Option<&str>,
    ) {
        let mut event =
            AuditEvent::new(request_id, session_id, &msg.channel, AuditKind::Tool, outcome)
                .for_tool(tool_name, tool_args)
                .with_metadata("confirmed", confirmed.to_string());
        if let Some(detail) = detail {
            event = event.with_metadata("error", detail);
        }
        if let Some(token) = token {
            event = event.with_confirmation_token(token);
        }
        self.audit_soft(event).await;
    }

    async fn audit_soft(&self, event: AuditEvent) {
        if let Err(error) = self.audit.record(event).await {
            tracing::warn!(
                event_name = "audit.soft_failure",
                error = %error,
                "audit record failed; continuing"
            );
        }
    }
}

fn extract_confirm_token(text: &str) -> Option<String> {
    let raw = text.trim();
    let lower = raw.to_ascii_lowercase();
    let rest = lower.strip_prefix("confirm ")?;
    let token = raw[raw.len() - rest.len()..].trim();
    (!token.is_empty() && !token.contains(char::is_whitespace)).then(|| token.to_string())
}

fn format_write_result(action: &ConfirmedAction, result: &Value) -> String {
    let ok = result.get("ok").and_then(Value::as_bool).unwrap_or(true);
    if !ok {
        let detail = result
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("the tool reported a failure");
        return format!("The action `{}` could not be completed ({detail}).", action.tool_name);
    }

    let reference = ["ticket_id", "customer_id", "id"]
        .iter()
        .find_map(|key| result.get(*key).and_then(Value::as_str));
    match reference {
        Some(reference) => {
            format!("Done. `{}` completed (reference: {reference}).", action.tool_name)
        }
        None => format!("Done. `{}` completed.", action.tool_name),
    }
}
