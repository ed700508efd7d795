use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::Row;

use concierge_core::confirm::{ConfirmationStatus, ConfirmationStore, PendingConfirmation};
use concierge_core::errors::StoreError;

use super::{format_ts, parse_ts, RepositoryError};
use crate::DbPool;

pub struct SqlConfirmationStore {
    pool: DbPool,
}

impl SqlConfirmationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_pending(row: &sqlx::sqlite::SqliteRow) -> Result<PendingConfirmation, RepositoryError> {
    let token: String =
        row.try_get("token").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let session_id: String =
        row.try_get("session_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tool_name: String =
        row.try_get("tool_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tool_args_json: String =
        row.try_get("tool_args_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status_str: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let expires_at_str: String =
        row.try_get("expires_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let tool_args: Map<String, Value> = serde_json::from_str(&tool_args_json)
        .map_err(|e| RepositoryError::Decode(format!("invalid tool args json: {e}")))?;
    let status = ConfirmationStatus::parse(&status_str).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown confirmation status `{status_str}`"))
    })?;

    Ok(PendingConfirmation {
        token,
        session_id,
        tool_name,
        tool_args,
        created_at: parse_ts(&created_at_str)?,
        expires_at: parse_ts(&expires_at_str)?,
        status,
    })
}

#[async_trait]
impl ConfirmationStore for SqlConfirmationStore {
    async fn insert(&self, pending: PendingConfirmation) -> Result<(), StoreError> {
        let tool_args_json = serde_json::to_string(&pending.tool_args)
            .map_err(|e| StoreError::new(format!("serialize tool args: {e}")))?;

        sqlx::query(
            "INSERT INTO pending_confirmations
                 (token, session_id, tool_name, tool_args_json, status, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&pending.token)
        .bind(&pending.session_id)
        .bind(&pending.tool_name)
        .bind(&tool_args_json)
        .bind(pending.status.as_str())
        .bind(format_ts(pending.created_at))
        .bind(format_ts(pending.expires_at))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn fetch(&self, token: &str) -> Result<Option<PendingConfirmation>, StoreError> {
        let row = sqlx::query(
            "SELECT token, session_id, tool_name, tool_args_json, status, created_at, expires_at
             FROM pending_confirmations WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        match row {
            Some(ref r) => Ok(Some(row_to_pending(r)?)),
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        token: &str,
        to: ConfirmationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // The `status = 'pending'` guard is the whole point: a resolved
        // record can never transition again, and of two concurrent callers
        // exactly one sees rows_affected = 1.
        let consumed_at =
            matches!(to, ConfirmationStatus::Confirmed).then(|| format_ts(at));

        let result = sqlx::query(
            "UPDATE pending_confirmations
             SET status = ?, consumed_at = ?
             WHERE token = ? AND status = 'pending'",
        )
        .bind(to.as_str())
        .bind(consumed_at)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE pending_confirmations
             SET status = 'expired'
             WHERE status = 'pending' AND expires_at <= ?",
        )
        .bind(format_ts(now))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(result.rows_affected())
    }
}
