use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::reconcile::TurnId;
use crate::transcript::Role;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One turn's worth of work for the chat backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub turn: TurnId,
    pub messages: Vec<ChatMessage>,
    /// Absent when the server supplies its own key.
    pub api_key: Option<String>,
}

/// Streams an assistant reply. `on_snapshot` receives the cumulative reply text
/// each time it grows; returning `Ok` means the stream finished cleanly.
pub trait ChatTransport: Send + Sync {
    fn stream(
        &self,
        request: &ChatRequest,
        on_snapshot: &mut dyn FnMut(&str),
    ) -> Result<(), TransportError>;
}
