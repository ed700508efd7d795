//! Built-in demo toolset registered at startup. Read tools answer from
//! canned data; write tools are mocks that stand in for real business
//! integrations, but every tool declares a real, enforced argument schema.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use concierge_core::tools::{
    ArgKind, ArgSchema, ArgSpec, RegistryError, ToolAccess, ToolContext, ToolDescriptor,
    ToolExecutor, ToolFailure, ToolRegistry,
};

struct GetHelpTool;

#[async_trait]
impl ToolExecutor for GetHelpTool {
    async fn execute(
        &self,
        _args: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<Value, ToolFailure> {
        Ok(json!({
            "ok": true,
            "help": [
                "You can ask for: help, identifying a customer, a demo report, \
                 creating a ticket, or registering a customer (the last two need confirmation).",
                "Examples: 'help', 'identify Jane', 'report 2026-07 for customer 123', \
                 'open a ticket about problem X'",
            ],
        }))
    }
}

struct IdentifyCustomerTool;

#[async_trait]
impl ToolExecutor for IdentifyCustomerTool {
    async fn execute(
        &self,
        args: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<Value, ToolFailure> {
        let hint = args
            .get("customer_hint")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        if hint.is_empty() {
            return Ok(json!({"ok": true, "matched": false, "candidates": []}));
        }

        Ok(json!({
            "ok": true,
            "matched": true,
            "customer": {"id": "CUST_001", "display": hint},
            "confidence": 0.72,
        }))
    }
}

struct GetReportTool;

#[async_trait]
impl ToolExecutor for GetReportTool {
    async fn execute(
        &self,
        args: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<Value, ToolFailure> {
        let customer_ref = args.get("customer_ref").and_then(Value::as_str).unwrap_or_default();
        let period = args.get("period").and_then(Value::as_str).unwrap_or_default();
        let topic = args.get("topic").and_then(Value::as_str).unwrap_or("summary");

        Ok(json!({
            "ok": true,
            "topic": topic,
            "customer_ref": customer_ref,
            "period": period,
            "values": {
                "metric_a": 123,
                "metric_b": 456,
                "note": "demo values",
            },
        }))
    }
}

struct CreateTicketTool;

#[async_trait]
impl ToolExecutor for CreateTicketTool {
    async fn execute(
        &self,
        args: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<Value, ToolFailure> {
        // Reaching this executor means the confirmation step already passed.
        let title = args.get("title").and_then(Value::as_str).unwrap_or_default();
        Ok(json!({
            "ok": true,
            "ticket_id": "TCK-1001",
            "title": title,
            "status": "created",
        }))
    }
}

struct RegisterCustomerTool;

#[async_trait]
impl ToolExecutor for RegisterCustomerTool {
    async fn execute(
        &self,
        args: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<Value, ToolFailure> {
        let display_name =
            args.get("display_name").and_then(Value::as_str).unwrap_or_default().trim().to_string();
        let email = args
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if !is_plausible_email(&email) {
            return Ok(json!({"ok": false, "error": "invalid_email"}));
        }
        if display_name.len() < 2 {
            return Ok(json!({"ok": false, "error": "invalid_display_name"}));
        }

        Ok(json!({
            "ok": true,
            "customer_id": "CUST_NEW_001",
            "display_name": display_name,
            "email": email,
            "status": "pending",
        }))
    }
}

fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !email.contains(char::is_whitespace)
}

/// The allowlist handed to the orchestrator at startup.
pub fn builtin_registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::default();

    registry.register(ToolDescriptor::new(
        "get_help",
        "Returns general help about what the agent can do.",
        ArgSchema::empty(),
        ToolAccess::Read,
        Arc::new(GetHelpTool),
    ))?;

    registry.register(ToolDescriptor::new(
        "identify_customer",
        "Identifies a customer from a free-text hint.",
        ArgSchema::new(vec![ArgSpec::optional(
            "customer_hint",
            ArgKind::String,
            "any identifier or hint",
        )]),
        ToolAccess::Read,
        Arc::new(IdentifyCustomerTool),
    ))?;

    registry.register(ToolDescriptor::new(
        "get_report",
        "Returns a demo report; numbers come only from tools, never the model.",
        ArgSchema::new(vec![
            ArgSpec::required("customer_ref", ArgKind::String, "customer id or reference"),
            ArgSpec::required("period", ArgKind::String, "period YYYY-MM"),
            ArgSpec::optional("topic", ArgKind::String, "demo topic"),
        ]),
        ToolAccess::Read,
        Arc::new(GetReportTool),
    ))?;

    registry.register(ToolDescriptor::new(
        "create_ticket",
        "Creates a support ticket. Write action: requires two-step confirmation.",
        ArgSchema::new(vec![
            ArgSpec::required("title", ArgKind::String, "short ticket title"),
            ArgSpec::required("detail", ArgKind::String, "problem detail"),
        ]),
        ToolAccess::Write,
        Arc::new(CreateTicketTool),
    ))?;

    registry.register(ToolDescriptor::new(
        "register_customer",
        "Registers a customer as pending verification. Requires confirmation.",
        ArgSchema::new(vec![
            ArgSpec::required("display_name", ArgKind::String, "full display name"),
            ArgSpec::required("email", ArgKind::String, "contact email"),
            ArgSpec::optional("phone", ArgKind::String, "contact phone"),
        ]),
        ToolAccess::Write,
        Arc::new(RegisterCustomerTool),
    ))?;

    Ok(registry)
}
