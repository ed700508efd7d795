use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Inbound,
    Plan,
    Tool,
    Outbound,
    Error,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Plan => "plan",
            Self::Tool => "tool",
            Self::Outbound => "outbound",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbound" => Some(Self::Inbound),
            "plan" => Some(Self::Plan),
            "tool" => Some(Self::Tool),
            "outbound" => Some(Self::Outbound),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Rejected,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// An immutable fact about an attempted or completed action. Created once
/// per dispatch attempt, never mutated or deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub request_id: String,
    pub session_id: String,
    pub channel: String,
    pub kind: AuditKind,
    pub tool_name: Option<String>,
    pub tool_args: Option<Map<String, Value>>,
    pub outcome: AuditOutcome,
    pub confirmation_token: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        request_id: impl Into<String>,
        session_id: impl Into<String>,
        channel: impl Into<String>,
        kind: AuditKind,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            session_id: session_id.into(),
            channel: channel.into(),
            kind,
            tool_name: None,
            tool_args: None,
            outcome,
            confirmation_token: None,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn for_tool(mut self, tool_name: impl Into<String>, tool_args: Map<String, Value>) -> Self {
        self.tool_name = Some(tool_name.into());
        self.tool_args = Some(tool_args);
        self
    }

    pub fn with_confirmation_token(mut self, token: impl Into<String>) -> Self {
        self.confirmation_token = Some(token.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Append-only audit sink. `record` must never fail silently: callers
/// decide whether a store failure is fatal (write actions) or degradable
/// (read actions).
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError>;

    /// Pre-dispatch probe: write actions are not executed when the audit
    /// store cannot take the record.
    async fn ensure_available(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAuditLog {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditLog {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn tool_events(&self) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|event| event.kind == AuditKind::Tool).collect()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
        Ok(())
    }
}
