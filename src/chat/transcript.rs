//! Transcript store and session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::core::{Role, SessionId, Turn};

/// Ordered, append-only turn history.
///
/// The first turn is always the seed system turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    /// Seed a transcript with the persona and the greeting.
    #[must_use]
    pub fn seeded(system: &str, greeting: &str) -> Self {
        Self {
            turns: vec![Turn::system(system), Turn::assistant(greeting)],
        }
    }

    /// Append a turn to the end.
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Every turn, system turn included.
    #[must_use]
    pub fn all(&self) -> &[Turn] {
        &self.turns
    }

    /// Turns shown to the end user: everything after the seed system turn.
    #[must_use]
    pub fn visible(&self) -> &[Turn] {
        match self.turns.first() {
            Some(first) if first.role == Role::System => &self.turns[1..],
            _ => &self.turns,
        }
    }

    /// Number of turns, system turn included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Always false for a seeded transcript.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Most recent turn.
    #[must_use]
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }
}

/// Where a session is in the current exchange.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    /// Waiting for input.
    #[default]
    Idle,
    /// Input received, attachment being processed.
    AwaitingAttachmentOrText,
    /// Outbound request assembled.
    RequestBuilt,
    /// Receiving fragments.
    Streaming,
    /// Reply appended.
    Completed,
    /// Exchange failed; transcript keeps the user turn only.
    Failed,
}

impl ExchangeState {
    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingAttachmentOrText => "awaiting_attachment_or_text",
            Self::RequestBuilt => "request_built",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed or Failed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One live conversation.
#[derive(Clone, Debug)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Conversation history.
    pub transcript: Transcript,
    /// Current exchange state.
    pub state: ExchangeState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time an action touched the session.
    pub last_active: DateTime<Utc>,
}

impl Session {
    /// New session with a seeded transcript.
    #[must_use]
    pub fn new(system: &str, greeting: &str) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            transcript: Transcript::seeded(system, greeting),
            state: ExchangeState::Idle,
            created_at: now,
            last_active: now,
        }
    }

    /// Move to `next`, logging the transition.
    pub fn transition(&mut self, next: ExchangeState) {
        tracing::debug!(
            session = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "exchange state"
        );
        self.state = next;
    }

    /// Record activity.
    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_transcript() {
        let transcript = Transcript::seeded("persona", "hello");
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.all()[0].role, Role::System);
        assert_eq!(transcript.all()[1].role, Role::Assistant);
        assert_eq!(transcript.visible().len(), 1);
        assert_eq!(transcript.visible()[0].text(), "hello");
    }

    #[test]
    fn test_append_keeps_order() {
        let mut transcript = Transcript::seeded("persona", "hello");
        transcript.append(Turn::user("q"));
        transcript.append(Turn::assistant("a"));
        let roles: Vec<Role> = transcript.all().iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(transcript.last().map(Turn::text), Some("a"));
        assert!(transcript.visible().iter().all(|t| t.role != Role::System));
    }

    #[test]
    fn test_session_transitions() {
        let mut session = Session::new("persona", "hello");
        assert_eq!(session.state, ExchangeState::Idle);
        session.transition(ExchangeState::Streaming);
        assert!(!session.state.is_terminal());
        session.transition(ExchangeState::Failed);
        assert!(session.state.is_terminal());
        assert_eq!(
            serde_json::to_value(session.state).unwrap(),
            serde_json::json!("failed")
        );
    }
}
