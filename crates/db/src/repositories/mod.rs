use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use concierge_core::errors::StoreError;

pub mod audit;
pub mod confirmation;
pub mod dedupe;
pub mod session;

pub use audit::SqlAuditLog;
pub use confirmation::SqlConfirmationStore;
pub use dedupe::SqlDedupeStore;
pub use session::SqlSessionStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        StoreError::new(error.to_string())
    }
}

/// Fixed-width UTC timestamps so that lexicographic comparison in SQL
/// matches chronological order.
pub(crate) fn format_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid timestamp `{raw}`: {error}")))
}
