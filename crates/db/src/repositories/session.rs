use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use concierge_core::errors::StoreError;
use concierge_core::session::{SessionState, SessionStore};

use super::{format_ts, RepositoryError};
use crate::DbPool;

pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, StoreError> {
        let row = sqlx::query("SELECT state_json FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let state_json: String = row
            .try_get("state_json")
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;
        let state = serde_json::from_str(&state_json)
            .map_err(|e| RepositoryError::Decode(format!("invalid session state json: {e}")))?;
        Ok(Some(state))
    }

    async fn save(&self, session_id: &str, state: &SessionState) -> Result<(), StoreError> {
        let state_json = serde_json::to_string(state)
            .map_err(|e| StoreError::new(format!("serialize session state: {e}")))?;

        sqlx::query(
            "INSERT INTO sessions (session_id, state_json, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                 state_json = excluded.state_json,
                 updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(&state_json)
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }
}
