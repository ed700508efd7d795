//! Key-protected maintenance surface: moves overdue confirmations to
//! `expired` and drops dedupe records past their TTL.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use secrecy::SecretString;
use serde::Serialize;

use concierge_core::confirm::ConfirmationManager;
use concierge_core::dedupe::DedupeStore;

use crate::channels::{require_internal_key, ChannelError};

#[derive(Clone)]
pub struct AdminState {
    pub confirmations: ConfirmationManager,
    pub dedupe: Arc<dyn DedupeStore>,
    pub internal_api_key: Option<SecretString>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub expired_confirmations: u64,
    pub purged_dedupe_records: u64,
}

pub fn router(state: AdminState) -> Router {
    Router::new().route("/admin/cleanup", post(cleanup)).with_state(state)
}

pub async fn cleanup(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<CleanupResponse>, (StatusCode, Json<ChannelError>)> {
    require_internal_key(&state.internal_api_key, &headers)?;

    let now = Utc::now();
    let expired_confirmations = state.confirmations.expire_overdue(now).await.map_err(|error| {
        tracing::error!(event_name = "admin.cleanup_failed", error = %error, "cleanup failed");
        ChannelError::unavailable()
    })?;
    let purged_dedupe_records = state.dedupe.purge_expired(now).await.map_err(|error| {
        tracing::error!(event_name = "admin.cleanup_failed", error = %error, "cleanup failed");
        ChannelError::unavailable()
    })?;

    tracing::info!(
        event_name = "admin.cleanup_completed",
        expired_confirmations,
        purged_dedupe_records,
        "cleanup completed"
    );
    Ok(Json(CleanupResponse { expired_confirmations, purged_dedupe_records }))
}
