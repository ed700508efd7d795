use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use concierge_core::dedupe::DedupeStore;
use concierge_core::errors::StoreError;

use super::{format_ts, RepositoryError};
use crate::DbPool;

pub struct SqlDedupeStore {
    pool: DbPool,
}

impl SqlDedupeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupeStore for SqlDedupeStore {
    async fn claim(
        &self,
        channel: &str,
        message_id: &str,
        payload_hash: Option<&str>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        // The primary key on (channel, message_id) serializes concurrent
        // deliveries of the same identity: the loser fails the insert and
        // observes the message as a duplicate.
        let result = sqlx::query(
            "INSERT INTO dedupe_messages
                 (channel, message_id, first_seen_at, expires_at, payload_hash)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(channel)
        .bind(message_id)
        .bind(format_ts(now))
        .bind(format_ts(now + ttl))
        .bind(payload_hash)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => Ok(false),
            Err(error) => Err(RepositoryError::from(error).into()),
        }
    }

    async fn release(&self, channel: &str, message_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM dedupe_messages WHERE channel = ? AND message_id = ?")
            .bind(channel)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn seen(&self, channel: &str, message_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM dedupe_messages WHERE channel = ? AND message_id = ? LIMIT 1",
        )
        .bind(channel)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM dedupe_messages WHERE expires_at < ?")
            .bind(format_ts(now))
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use concierge_core::dedupe::DedupeStore;

    use super::SqlDedupeStore;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlDedupeStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlDedupeStore::new(pool)
    }

    #[tokio::test]
    async fn unique_key_makes_the_second_claim_a_duplicate() {
        let store = setup().await;
        let now = Utc::now();
        let ttl = Duration::hours(1);

        assert!(store.claim("provider", "msg-1", Some("abc123"), now, ttl).await.expect("claim"));
        assert!(!store.claim("provider", "msg-1", Some("abc123"), now, ttl).await.expect("claim"));
        assert!(store.seen("provider", "msg-1").await.expect("seen"));
    }

    #[tokio::test]
    async fn the_same_message_id_on_another_channel_is_distinct() {
        let store = setup().await;
        let now = Utc::now();
        let ttl = Duration::hours(1);

        assert!(store.claim("provider", "msg-1", None, now, ttl).await.expect("claim"));
        assert!(store.claim("wa", "msg-1", None, now, ttl).await.expect("claim"));
    }

    #[tokio::test]
    async fn release_and_purge_reopen_identities() {
        let store = setup().await;
        let now = Utc::now();

        assert!(store.claim("web", "msg-1", None, now, Duration::hours(1)).await.expect("claim"));
        store.release("web", "msg-1").await.expect("release");
        assert!(store.claim("web", "msg-1", None, now, Duration::hours(1)).await.expect("claim"));

        assert!(store
            .claim("web", "msg-old", None, now - Duration::hours(2), Duration::hours(1))
            .await
            .expect("claim expired"));
        let purged = store.purge_expired(now).await.expect("purge");
        assert_eq!(purged, 1);
        assert!(!store.seen("web", "msg-old").await.expect("seen"));
        assert!(store.seen("web", "msg-1").await.expect("seen"));
    }
}
