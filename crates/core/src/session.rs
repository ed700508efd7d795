use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// One completed exchange within a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTurn {
    pub incoming: String,
    pub reply: String,
    pub intent: String,
}

/// Conversation thread state: turn history plus accumulated facts.
/// Sessions are never hard-deleted; archival is an external concern.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub history: Vec<SessionTurn>,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
}

impl SessionState {
    pub fn push_turn(
        &mut self,
        incoming: impl Into<String>,
        reply: impl Into<String>,
        intent: impl Into<String>,
    ) {
        self.history.push(SessionTurn {
            incoming: incoming.into(),
            reply: reply.into(),
            intent: intent.into(),
        });
    }

    /// Planner context: the last few exchanges, most recent last.
    pub fn summary(&self) -> String {
        if self.history.is_empty() {
            return "No prior history.".to_string();
        }

        let mut output = String::new();
        let start = self.history.len().saturating_sub(3);
        for turn in &self.history[start..] {
            let _ = writeln!(output, "- IN: {}", turn.incoming);
            let _ = writeln!(output, "  OUT: {}", turn.reply);
        }
        output.trim_end().to_string()
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, StoreError>;
    async fn save(&self, session_id: &str, state: &SessionState) -> Result<(), StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, StoreError> {
        let sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(sessions.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, state: &SessionState) -> Result<(), StoreError> {
        let mut sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.insert(session_id.to_string(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemorySessionStore, SessionState, SessionStore};

    #[test]
    fn summary_of_an_empty_session_is_explicit() {
        assert_eq!(SessionState::default().summary(), "No prior history.");
    }

    #[test]
    fn summary_keeps_only_the_last_three_turns() {
        let mut state = SessionState::default();
        for index in 0..5 {
            state.push_turn(format!("question {index}"), format!("answer {index}"), "faq");
        }

        let summary = state.summary();
        assert!(!summary.contains("question 0"));
        assert!(!summary.contains("question 1"));
        assert!(summary.contains("question 2"));
        assert!(summary.contains("- IN: question 4"));
        assert!(summary.contains("  OUT: answer 4"));
    }

    #[tokio::test]
    async fn store_round_trips_state() {
        let store = InMemorySessionStore::default();
        assert!(store.load("sess-1").await.expect("load").is_none());

        let mut state = SessionState::default();
        state.push_turn("hola", "hello", "faq");
        state.facts.insert("customer_ref".to_string(), "CUST_001".to_string());
        store.save("sess-1", &state).await.expect("save");

        let loaded = store.load("sess-1").await.expect("load").expect("state");
        assert_eq!(loaded, state);
    }
}
