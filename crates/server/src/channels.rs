//! Inbound channel endpoints. Three entry points funnel into the
//! orchestrator: direct web submissions, shared-key "wa" submissions, and
//! provider webhook deliveries that must clear the webhook verifier
//! before any session logic runs.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use concierge_agent::{AgentOrchestrator, AgentReply, InboundMessage};
use concierge_core::webhook::{constant_time_eq, WebhookError, WebhookVerifier};

const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Clone)]
pub struct ChannelState {
    pub orchestrator: Arc<AgentOrchestrator>,
    pub verifier: WebhookVerifier,
    pub internal_api_key: Option<SecretString>,
}

#[derive(Debug, Serialize)]
pub struct ChannelError {
    error: String,
}

impl ChannelError {
    pub(crate) fn unavailable() -> (StatusCode, Json<ChannelError>) {
        reject(StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
    }
}

type ChannelRejection = (StatusCode, Json<ChannelError>);

fn reject(status: StatusCode, message: &str) -> ChannelRejection {
    (status, Json(ChannelError { error: message.to_string() }))
}

#[derive(Debug, Deserialize)]
pub struct AgentRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaAgentRequest {
    pub from_number: String,
    pub text: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

pub fn router(state: ChannelState) -> Router {
    Router::new()
        .route("/agent", post(web_agent))
        .route("/wa/agent", post(wa_agent))
        .route("/provider/inbound", post(provider_inbound))
        .with_state(state)
}

pub async fn web_agent(
    State(state): State<ChannelState>,
    Json(payload): Json<AgentRequest>,
) -> Json<AgentReply> {
    let reply = state
        .orchestrator
        .handle_message(InboundMessage {
            message: payload.message,
            session_id: payload.session_id,
            channel: "web".to_string(),
            user_id: None,
            message_id: None,
            payload_hash: None,
        })
        .await;
    Json(reply)
}

pub async fn wa_agent(
    State(state): State<ChannelState>,
    headers: HeaderMap,
    Json(payload): Json<WaAgentRequest>,
) -> Result<Json<AgentReply>, ChannelRejection> {
    require_internal_key(&state.internal_api_key, &headers)?;

    // The sender number doubles as the session identity on this channel.
    let session_id = payload.from_number.clone();
    let reply = state
        .orchestrator
        .handle_message(InboundMessage {
            message: payload.text,
            session_id: Some(session_id),
            channel: "wa".to_string(),
            user_id: Some(payload.from_number),
            message_id: payload.message_id,
            payload_hash: None,
        })
        .await;
    Ok(Json(reply))
}

pub async fn provider_inbound(
    State(state): State<ChannelState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AgentReply>, ChannelRejection> {
    let signature = header_value(&headers, "provider-signature");
    let timestamp = header_value(&headers, "provider-timestamp");

    if let Err(error) = state.verifier.verify(&body, &signature, &timestamp, Utc::now().timestamp())
    {
        tracing::warn!(
            event_name = "webhook.rejected",
            reason = error.reason_code(),
            body_len = body.len(),
            "provider webhook rejected at the boundary"
        );
        return Err(match error {
            WebhookError::PayloadTooLarge { .. } => {
                reject(StatusCode::PAYLOAD_TOO_LARGE, "payload too large")
            }
            WebhookError::InvalidTimestamp { .. } => {
                reject(StatusCode::BAD_REQUEST, "invalid timestamp")
            }
            _ => reject(StatusCode::UNAUTHORIZED, "unauthorized"),
        });
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| reject(StatusCode::BAD_REQUEST, "invalid json"))?;

    let mut text = payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if text.is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "missing message"));
    }
    text.truncate(floor_char_boundary(&text, MAX_MESSAGE_CHARS));

    let from_id = payload
        .get("from")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let payload_hash = sha256_hex(&body);
    let message_id = payload
        .get("message_id")
        .or_else(|| payload.get("id"))
        .and_then(value_as_id)
        .unwrap_or_else(|| payload_hash.clone());

    let reply = state
        .orchestrator
        .handle_message(InboundMessage {
            message: text,
            session_id: from_id.clone().or_else(|| Some("provider_session".to_string())),
            channel: "provider".to_string(),
            user_id: from_id,
            message_id: Some(message_id),
            payload_hash: Some(payload_hash),
        })
        .await;
    Ok(Json(reply))
}

pub fn require_internal_key(
    expected: &Option<SecretString>,
    headers: &HeaderMap,
) -> Result<(), ChannelRejection> {
    let Some(expected) = expected else {
        return Err(reject(StatusCode::UNAUTHORIZED, "unauthorized"));
    };

    let provided = header_value(headers, "x-api-key");
    if !constant_time_eq(provided.as_bytes(), expected.expose_secret().as_bytes()) {
        return Err(reject(StatusCode::UNAUTHORIZED, "unauthorized"));
    }
    Ok(())
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers.get(name).and_then(|value| value.to_str().ok()).unwrap_or_default().to_string()
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    if text.len() <= max {
        return text.len();
    }
    (0..=max).rev().find(|index| text.is_char_boundary(*index)).unwrap_or(0)
}
