use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::errors::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Expired,
    Canceled,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "expired" => Some(Self::Expired),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A write action waiting for its second confirmation step. Persisted
/// independently of the conversation because the confirming message is a
/// separate, later request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub token: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_args: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ConfirmationStatus,
}

/// The action recovered from a successful redemption: exactly the tool and
/// arguments that were originally proposed.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmedAction {
    pub token: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_args: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConfirmationError {
    #[error("confirmation token not found")]
    TokenNotFound,
    #[error("confirmation token has expired")]
    TokenExpired,
    #[error("confirmation token was already used")]
    TokenAlreadyUsed,
    #[error("confirmation token belongs to a different session")]
    SessionMismatch,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait ConfirmationStore: Send + Sync {
    async fn insert(&self, pending: PendingConfirmation) -> Result<(), StoreError>;

    async fn fetch(&self, token: &str) -> Result<Option<PendingConfirmation>, StoreError>;

    /// Compare-and-set from `pending` to `to`. Returns whether this caller
    /// won the transition; a resolved record can never transition again.
    async fn transition(
        &self,
        token: &str,
        to: ConfirmationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Moves every overdue `pending` record to `expired`, returning the
    /// number of records touched.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Issues, redeems, and cancels single-use confirmation tokens gating
/// write-classified tool calls.
#[derive(Clone)]
pub struct ConfirmationManager {
    store: Arc<dyn ConfirmationStore>,
    ttl: Duration,
}

impl ConfirmationManager {
    pub fn new(store: Arc<dyn ConfirmationStore>, ttl_secs: u64) -> Self {
        Self { store, ttl: Duration::seconds(ttl_secs.max(1) as i64) }
    }

    pub async fn request(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_args: Map<String, Value>,
    ) -> Result<String, ConfirmationError> {
        let token = generate_token();
        let now = Utc::now();
        self.store
            .insert(PendingConfirmation {
                token: token.clone(),
                session_id: session_id.to_string(),
                tool_name: tool_name.to_string(),
                tool_args,
                created_at: now,
                expires_at: now + self.ttl,
                status: ConfirmationStatus::Pending,
            })
            .await?;
        Ok(token)
    }

    /// Exactly-once redemption: of any number of concurrent attempts for
    /// the same token, one wins the compare-and-set and every other caller
    /// observes `TokenAlreadyUsed`.
    pub async fn redeem(
        &self,
        session_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<ConfirmedAction, ConfirmationError> {
        let Some(pending) = self.store.fetch(token).await? else {
            return Err(ConfirmationError::TokenNotFound);
        };

        if pending.session_id != session_id {
            return Err(ConfirmationError::SessionMismatch);
        }

        match pending.status {
            ConfirmationStatus::Pending => {}
            ConfirmationStatus::Expired => return Err(ConfirmationError::TokenExpired),
            ConfirmationStatus::Confirmed | ConfirmationStatus::Canceled => {
                return Err(ConfirmationError::TokenAlreadyUsed);
            }
        }

        if pending.expires_at <= now {
            self.store.transition(token, ConfirmationStatus::Expired, now).await?;
            return Err(ConfirmationError::TokenExpired);
        }

        if !self.store.transition(token, ConfirmationStatus::Confirmed, now).await? {
            return Err(ConfirmationError::TokenAlreadyUsed);
        }

        Ok(ConfirmedAction {
            token: pending.token,
            session_id: pending.session_id,
            tool_name: pending.tool_name,
            tool_args: pending.tool_args,
        })
    }

    pub async fn cancel(&self, token: &str) -> Result<(), ConfirmationError> {
        let Some(pending) = self.store.fetch(token).await? else {
            return Err(ConfirmationError::TokenNotFound);
        };
        if pending.status.is_terminal() {
            return Err(ConfirmationError::TokenAlreadyUsed);
        }
        if !self.store.transition(token, ConfirmationStatus::Canceled, Utc::now()).await? {
            return Err(ConfirmationError::TokenAlreadyUsed);
        }
        Ok(())
    }

    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, ConfirmationError> {
        Ok(self.store.expire_overdue(now).await?)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    encode_hex(&bytes)
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[derive(Clone, Default)]
pub struct InMemoryConfirmationStore {
    records: Arc<Mutex<HashMap<String, PendingConfirmation>>>,
}

impl InMemoryConfirmationStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingConfirmation>> {
        match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ConfirmationStore for InMemoryConfirmationStore {
    async fn insert(&self, pending: PendingConfirmation) -> Result<(), StoreError> {
        self.lock().insert(pending.token.clone(), pending);
        Ok(())
    }

    async fn fetch(&self, token: &str) -> Result<Option<PendingConfirmation>, StoreError> {
        Ok(self.lock().get(token).cloned())
    }

    async fn transition(
        &self,
        token: &str,
        to: ConfirmationStatus,
        _at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.lock();
        match records.get_mut(token) {
            Some(record) if record.status == ConfirmationStatus::Pending => {
                record.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.lock();
        let mut touched = 0;
        for record in records.values_mut() {
            if record.status == ConfirmationStatus::Pending && record.expires_at <= now {
                record.status = ConfirmationStatus::Expired;
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::{json, Map};

    use super::{
        ConfirmationError, ConfirmationManager, ConfirmationStatus, ConfirmationStore,
        InMemoryConfirmationStore, PendingConfirmation,
    };

    fn args() -> Map<String, serde_json::Value> {
        let mut args = Map::new();
        args.insert("display_name".to_string(), json!("Ada Lovelace"));
        args.insert("email".to_string(), json!("ada@example.com"));
        args
    }

    fn manager() -> (ConfirmationManager, Arc<InMemoryConfirmationStore>) {
        let store = Arc::new(InMemoryConfirmationStore::default());
        (ConfirmationManager::new(store.clone(), 600), store)
    }

    #[tokio::test]
    async fn request_then_redeem_returns_proposed_action() {
        let (manager, _store) = manager();
        let token = manager.request("sess-1", "register_customer", args()).await.expect("request");
        assert_eq!(token.len(), 32, "token should be 16 random bytes hex encoded");

        let action = manager.redeem("sess-1", &token, Utc::now()).await.expect("redeem");
        assert_eq!(action.tool_name, "register_customer");
        assert_eq!(action.tool_args, args());
        assert_eq!(action.session_id, "sess-1");
    }

    #[tokio::test]
    async fn second_redemption_fails_with_already_used() {
        let (manager, _store) = manager();
        let token = manager.request("sess-1", "create_ticket", args()).await.expect("request");

        manager.redeem("sess-1", &token, Utc::now()).await.expect("first redeem");
        let error = manager
            .redeem("sess-1", &token, Utc::now())
            .await
            .expect_err("second redeem should fail");
        assert_eq!(error, ConfirmationError::TokenAlreadyUsed);
    }

    #[tokio::test]
    async fn concurrent_redemptions_yield_exactly_one_success() {
        let (manager, _store) = manager();
        let token = manager.request("sess-1", "create_ticket", args()).await.expect("request");

        let now = Utc::now();
        let (first, second) = tokio::join!(
            manager.redeem("sess-1", &token, now),
            manager.redeem("sess-1", &token, now),
        );

        let successes = [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1, "exactly one concurrent redemption may win");
    }

    #[tokio::test]
    async fn mismatched_session_is_rejected_without_consuming_the_token() {
        let (manager, _store) = manager();
        let token = manager.request("sess-1", "create_ticket", args()).await.expect("request");

        let error = manager
            .redeem("sess-2", &token, Utc::now())
            .await
            .expect_err("wrong session should fail");
        assert_eq!(error, ConfirmationError::SessionMismatch);

        manager.redeem("sess-1", &token, Utc::now()).await.expect("owner can still redeem");
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let (manager, _store) = manager();
        let error = manager
            .redeem("sess-1", "deadbeef", Utc::now())
            .await
            .expect_err("unknown token should fail");
        assert_eq!(error, ConfirmationError::TokenNotFound);
    }

    #[tokio::test]
    async fn overdue_token_expires_on_redemption() {
        let (manager, store) = manager();
        let now = Utc::now();
        store
            .insert(PendingConfirmation {
                token: "aabbccdd".to_string(),
                session_id: "sess-1".to_string(),
                tool_name: "create_ticket".to_string(),
                tool_args: args(),
                created_at: now - Duration::minutes(30),
                expires_at: now - Duration::minutes(20),
                status: ConfirmationStatus::Pending,
            })
            .await
            .expect("seed pending record");

        let error =
            manager.redeem("sess-1", "aabbccdd", now).await.expect_err("expired should fail");
        assert_eq!(error, ConfirmationError::TokenExpired);

        let record = store.fetch("aabbccdd").await.expect("fetch").expect("record");
        assert_eq!(record.status, ConfirmationStatus::Expired);

        let error = manager
            .redeem("sess-1", "aabbccdd", now)
            .await
            .expect_err("expired stays expired");
        assert_eq!(error, ConfirmationError::TokenExpired);
    }

    #[tokio::test]
    async fn cancel_invalidates_a_pending_token() {
        let (manager, _store) = manager();
        let token = manager.request("sess-1", "create_ticket", args()).await.expect("request");

        manager.cancel(&token).await.expect("cancel");
        let error = manager
            .redeem("sess-1", &token, Utc::now())
            .await
            .expect_err("canceled token cannot be redeemed");
        assert_eq!(error, ConfirmationError::TokenAlreadyUsed);
    }

    #[tokio::test]
    async fn expire_overdue_touches_only_overdue_pending_records() {
        let (manager, store) = manager();
        let token = manager.request("sess-1", "create_ticket", args()).await.expect("request");

        let now = Utc::now();
        store
            .insert(PendingConfirmation {
                token: "11223344".to_string(),
                session_id: "sess-2".to_string(),
                tool_name: "create_ticket".to_string(),
                tool_args: args(),
                created_at: now - Duration::hours(2),
                expires_at: now - Duration::hours(1),
                status: ConfirmationStatus::Pending,
            })
            .await
            .expect("seed overdue record");

        let touched = manager.expire_overdue(now).await.expect("expire");
        assert_eq!(touched, 1);

        manager.redeem("sess-1", &token, now).await.expect("fresh token still redeemable");
    }

    #[tokio::test]
    async fn tokens_are_unique_across_requests() {
        let (manager, _store) = manager();
        let first = manager.request("sess-1", "create_ticket", args()).await.expect("request");
        let second = manager.request("sess-1", "create_ticket", args()).await.expect("request");
        assert_ne!(first, second);
    }
}
