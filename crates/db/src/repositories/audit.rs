use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::Row;

use concierge_core::audit::{AuditEvent, AuditKind, AuditLog, AuditOutcome};
use concierge_core::errors::StoreError;

use super::{format_ts, parse_ts, RepositoryError};
use crate::DbPool;

pub struct SqlAuditLog {
    pool: DbPool,
}

impl SqlAuditLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Read-back used by tests and operational queries; the trail itself is
    /// append-only.
    pub async fn events_for_session(&self, session_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT event_id, request_id, session_id, channel, kind, tool_name, tool_args_json,
                    outcome, confirmation_token, metadata_json, occurred_at
             FROM audit_events WHERE session_id = ? ORDER BY occurred_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let event_id: String =
        row.try_get("event_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let request_id: String =
        row.try_get("request_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let session_id: String =
        row.try_get("session_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let channel: String =
        row.try_get("channel").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let kind_str: String =
        row.try_get("kind").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tool_name: Option<String> =
        row.try_get("tool_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tool_args_json: Option<String> =
        row.try_get("tool_args_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let outcome_str: String =
        row.try_get("outcome").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let confirmation_token: Option<String> =
        row.try_get("confirmation_token").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let metadata_json: String =
        row.try_get("metadata_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let occurred_at_str: String =
        row.try_get("occurred_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let kind = AuditKind::parse(&kind_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown audit kind `{kind_str}`")))?;
    let outcome = AuditOutcome::parse(&outcome_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown audit outcome `{outcome_str}`")))?;
    let tool_args: Option<Map<String, Value>> = match tool_args_json {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| RepositoryError::Decode(format!("invalid tool args json: {e}")))?,
        ),
        None => None,
    };
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|e| RepositoryError::Decode(format!("invalid metadata json: {e}")))?;

    Ok(AuditEvent {
        event_id,
        request_id,
        session_id,
        channel,
        kind,
        tool_name,
        tool_args,
        outcome,
        confirmation_token,
        metadata,
        occurred_at: parse_ts(&occurred_at_str)?,
    })
}

#[async_trait]
impl AuditLog for SqlAuditLog {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        let tool_args_json = match &event.tool_args {
            Some(args) => Some(
                serde_json::to_string(args)
                    .map_err(|e| StoreError::new(format!("serialize tool args: {e}")))?,
            ),
            None => None,
        };
        let metadata_json = serde_json::to_string(&event.metadata)
            .map_err(|e| StoreError::new(format!("serialize metadata: {e}")))?;

        sqlx::query(
            "INSERT INTO audit_events
                 (event_id, request_id, session_id, channel, kind, tool_name, tool_args_json,
                  outcome, confirmation_token, metadata_json, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(&event.request_id)
        .bind(&event.session_id)
        .bind(&event.channel)
        .bind(event.kind.as_str())
        .bind(&event.tool_name)
        .bind(&tool_args_json)
        .bind(event.outcome.as_str())
        .bind(&event.confirmation_token)
        .bind(&metadata_json)
        .bind(format_ts(event.occurred_at))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn ensure_available(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use concierge_core::audit::{AuditEvent, AuditKind, AuditLog, AuditOutcome};

    use super::SqlAuditLog;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlAuditLog {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlAuditLog::new(pool)
    }

    #[tokio::test]
    async fn record_round_trips_tool_lineage() {
        let log = setup().await;

        let mut args = Map::new();
        args.insert("email".to_string(), json!("ada@example.com"));

        log.record(
            AuditEvent::new("req-1", "sess-1", "wa", AuditKind::Tool, AuditOutcome::Success)
                .for_tool("register_customer", args.clone())
                .with_confirmation_token("feedc0de")
                .with_metadata("confirmed", "true"),
        )
        .await
        .expect("record");

        let events = log.events_for_session("sess-1").await.expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::Tool);
        assert_eq!(events[0].tool_name.as_deref(), Some("register_customer"));
        assert_eq!(events[0].tool_args.as_ref(), Some(&args));
        assert_eq!(events[0].confirmation_token.as_deref(), Some("feedc0de"));
        assert_eq!(events[0].metadata.get("confirmed").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn ensure_available_probes_the_store() {
        let log = setup().await;
        log.ensure_available().await.expect("probe should pass");
    }

    #[tokio::test]
    async fn ensure_available_fails_once_the_pool_is_closed() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let log = SqlAuditLog::new(pool.clone());
        pool.close().await;

        log.ensure_available().await.expect_err("probe should fail on a closed pool");
    }
}
