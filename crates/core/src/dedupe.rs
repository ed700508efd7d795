use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// Fingerprint of an inbound message identity that has already been
/// processed. Keys are scoped per channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeRecord {
    pub channel: String,
    pub message_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payload_hash: Option<String>,
}

/// At-most-once gate for inbound messages. `claim` is atomic
/// first-writer-wins: of two near-simultaneous deliveries of the same
/// identity, exactly one observes `true`.
#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Returns `true` when this caller is the first to process the
    /// identity, `false` when the message was already claimed.
    async fn claim(
        &self,
        channel: &str,
        message_id: &str,
        payload_hash: Option<&str>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Rollback hook for turns that fail for infrastructure reasons before
    /// any tool side effect, so a redelivery can retry.
    async fn release(&self, channel: &str, message_id: &str) -> Result<(), StoreError>;

    async fn seen(&self, channel: &str, message_id: &str) -> Result<bool, StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryDedupeStore {
    records: Arc<Mutex<HashMap<(String, String), DedupeRecord>>>,
}

impl InMemoryDedupeStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), DedupeRecord>> {
        match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl DedupeStore for InMemoryDedupeStore {
    async fn claim(
        &self,
        channel: &str,
        message_id: &str,
        payload_hash: Option<&str>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut records = self.lock();
        let key = (channel.to_string(), message_id.to_string());
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(
            key,
            DedupeRecord {
                channel: channel.to_string(),
                message_id: message_id.to_string(),
                first_seen_at: now,
                expires_at: now + ttl,
                payload_hash: payload_hash.map(str::to_string),
            },
        );
        Ok(true)
    }

    async fn release(&self, channel: &str, message_id: &str) -> Result<(), StoreError> {
        self.lock().remove(&(channel.to_string(), message_id.to_string()));
        Ok(())
    }

    async fn seen(&self, channel: &str, message_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().contains_key(&(channel.to_string(), message_id.to_string())))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}
