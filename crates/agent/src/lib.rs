//! Agent runtime - planning, confirmation gating, and tool dispatch.
//!
//! This crate is the trust boundary between the LLM and the registered
//! tools:
//! 1. **Planning** (`planner`) - the model proposes a structured plan,
//!    validated against the tool registry before anything runs
//! 2. **Confirmation gating** (`orchestrator`) - write actions park behind
//!    a single-use token and only run after `confirm <token>`
//! 3. **Dispatch** (`orchestrator`) - allowlisted lookup, per-call
//!    auditing, per-call failure isolation
//! 4. **Reply composition** (`answerer`) - optional LLM summarization of
//!    tool results, with a deterministic fallback
//!
//! # Safety principle
//!
//! The model is strictly a proposer. It can only ever reference tools in
//! the registry, with arguments their schemas accept, and it can never
//! trigger a side effect without the user's explicit second confirmation.

pub mod answerer;
pub mod llm;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod toolkit;

pub use answerer::Answerer;
pub use llm::{LlmClient, LlmError, OllamaClient};
pub use orchestrator::{
    AgentOrchestrator, AgentReply, InboundMessage, OrchestratorParts, OrchestratorSettings,
};
pub use planner::{plan_format_schema, Planner, PlannerFailure};
pub use toolkit::builtin_registry;
