pub mod audit;
pub mod config;
pub mod confirm;
pub mod dedupe;
pub mod errors;
pub mod plan;
pub mod ratelimit;
pub mod session;
pub mod tools;
pub mod webhook;

pub use audit::{AuditEvent, AuditKind, AuditLog, AuditOutcome, InMemoryAuditLog};
pub use confirm::{
    ConfirmationError, ConfirmationManager, ConfirmationStatus, ConfirmationStore, ConfirmedAction,
    InMemoryConfirmationStore, PendingConfirmation,
};
pub use dedupe::{DedupeRecord, DedupeStore, InMemoryDedupeStore};
pub use errors::{StoreError, TurnError};
pub use plan::{
    validate_plan, validate_plan_value, MissingSlot, Plan, PlanError, PlanIntent, PlanSlots,
    PlannedToolCall,
};
pub use ratelimit::{RateDecision, SlidingWindowLimiter};
pub use session::{InMemorySessionStore, SessionState, SessionStore, SessionTurn};
pub use tools::{
    ArgKind, ArgSchema, ArgSpec, RegistryError, SchemaViolation, ToolAccess, ToolContext,
    ToolDescriptor, ToolExecutor, ToolFailure, ToolRegistry,
};
pub use webhook::{constant_time_eq, signature_hex, WebhookError, WebhookVerifier};
