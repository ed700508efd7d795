use thiserror::Error;

use crate::confirm::ConfirmationError;
use crate::plan::PlanError;
use crate::tools::RegistryError;

/// Persistence failure reported by a store implementation. Engine detail
/// stays in the message; callers only branch on "the store is down".
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("store failure: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// Why a turn failed. User-visible text comes from `user_message` only;
/// internal detail goes to tracing and audit metadata, never back into a
/// channel the counterparty controls.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum TurnError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),
    #[error("planner call failed: {detail}")]
    Planner { detail: String },
    #[error("planner call timed out after {timeout_secs}s")]
    PlannerTimeout { timeout_secs: u64 },
    #[error("tool `{tool}` timed out after {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },
    #[error("write action is not auditable: {source}")]
    Unauditable { source: StoreError },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("write action requested without any tool call")]
    WriteWithoutToolCall,
}

impl TurnError {
    /// Generic by design: validation detail is never echoed to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Plan(_) | Self::WriteWithoutToolCall => {
                "I couldn't understand that request. Please rephrase it and try again."
            }
            Self::Registry(_) => {
                "I couldn't understand that request. Please rephrase it and try again."
            }
            Self::Confirmation(ConfirmationError::TokenExpired) => {
                "That confirmation has expired. Please start the request again."
            }
            Self::Confirmation(ConfirmationError::Store(_)) => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Confirmation(_) => {
                "That confirmation is no longer valid. Please start the request again."
            }
            Self::Planner { .. } | Self::PlannerTimeout { .. } => {
                "I couldn't process your message right now. Please try again."
            }
            Self::ToolTimeout { .. } => {
                "That action took too long and was not completed. Please try again."
            }
            Self::Unauditable { .. } | Self::Store(_) => {
                "The service is temporarily unavailable. Please retry shortly."
            }
        }
    }

    /// Infrastructure failures release the dedupe claim so a redelivery can
    /// retry; deterministic rejections keep it.
    pub fn releases_dedupe_claim(&self) -> bool {
        matches!(
            self,
            Self::Planner { .. }
                | Self::PlannerTimeout { .. }
                | Self::Unauditable { .. }
                | Self::Store(_)
                | Self::Confirmation(ConfirmationError::Store(_))
        )
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Plan(error) => error.reason_code(),
            Self::Registry(RegistryError::DuplicateTool { .. }) => "duplicate_tool",
            Self::Registry(RegistryError::UnknownTool { .. }) => "unknown_tool",
            Self::Confirmation(ConfirmationError::TokenNotFound) => "confirmation_not_found",
            Self::Confirmation(ConfirmationError::TokenExpired) => "confirmation_expired",
            Self::Confirmation(ConfirmationError::TokenAlreadyUsed) => "confirmation_used",
            Self::Confirmation(ConfirmationError::SessionMismatch) => "confirmation_mismatch",
            Self::Confirmation(ConfirmationError::Store(_)) => "store_unavailable",
            Self::Planner { .. } => "planner_failure",
            Self::PlannerTimeout { .. } => "planner_timeout",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::Unauditable { .. } => "audit_unavailable",
            Self::Store(_) => "store_unavailable",
            Self::WriteWithoutToolCall => "write_without_tool_call",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{StoreError, TurnError};
    use crate::confirm::ConfirmationError;
    use crate::plan::PlanError;

    #[test]
    fn plan_failures_map_to_a_generic_user_message() {
        let error = TurnError::from(PlanError::UnknownTool { name: "drop_database".to_string() });
        assert_eq!(
            error.user_message(),
            "I couldn't understand that request. Please rephrase it and try again."
        );
        assert_eq!(error.reason_code(), "unknown_tool");
        assert!(!error.releases_dedupe_claim());
    }

    #[test]
    fn expired_confirmations_get_a_dedicated_message() {
        let error = TurnError::from(ConfirmationError::TokenExpired);
        assert!(error.user_message().contains("expired"));
        assert_eq!(error.reason_code(), "confirmation_expired");
    }

    #[test]
    fn infrastructure_failures_release_the_dedupe_claim() {
        assert!(TurnError::PlannerTimeout { timeout_secs: 30 }.releases_dedupe_claim());
        assert!(TurnError::Store(StoreError::new("database is gone")).releases_dedupe_claim());
        assert!(!TurnError::WriteWithoutToolCall.releases_dedupe_claim());
    }

    #[test]
    fn user_messages_never_leak_internal_detail() {
        let error = TurnError::Store(StoreError::new("sqlite: disk I/O error at /var/db"));
        assert!(!error.user_message().contains("sqlite"));
        assert!(!error.user_message().contains("/var/db"));
    }
}
