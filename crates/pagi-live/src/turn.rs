//! Turn aggregation: streamed transcript fragments → finalized utterances.
//!
//! User-spoken and agent-spoken text accumulate in separate buffers; a
//! turn-complete signal for one role flushes only that role's buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Who spoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
        }
    }
}

/// One finalized turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub role: Role,
    pub text: String,
    pub completed_at: DateTime<Utc>,
}

/// Exactly one active buffer per role.
#[derive(Debug, Default)]
pub struct TurnAggregator {
    user: String,
    agent: String,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment, in receipt order.
    pub fn on_delta(&mut self, role: Role, text: &str) {
        self.buffer_mut(role).push_str(text);
    }

    /// Flush the role's buffer. Returns an utterance when the trimmed text is
    /// non-empty; the buffer is reset either way, so repeated completions
    /// never produce a duplicate.
    pub fn on_turn_complete(&mut self, role: Role) -> Option<Utterance> {
        let raw = std::mem::take(self.buffer_mut(role));
        let text = raw.trim();
        if text.is_empty() {
            debug!(%role, "turn complete with empty buffer");
            return None;
        }
        debug!(%role, chars = text.len(), "turn finalized");
        Some(Utterance {
            role,
            text: text.to_string(),
            completed_at: Utc::now(),
        })
    }

    /// Text accumulated so far for the role.
    pub fn pending(&self, role: Role) -> &str {
        match role {
            Role::User => &self.user,
            Role::Agent => &self.agent,
        }
    }

    fn buffer_mut(&mut self, role: Role) -> &mut String {
        match role {
            Role::User => &mut self.user,
            Role::Agent => &mut self.agent,
        }
    }
}
