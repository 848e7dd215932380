//! Request payloads and non-streaming response envelopes.

use serde::{Deserialize, Serialize};

use crate::message::{Message, Role};

/// What the client sends to open one exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub message: String,
    /// Opaque client session identity, owned by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Whole-body JSON answer from a non-streaming backend.
///
/// Two shapes are accepted: `{"messages": [{"text": ...}, ...]}`, where the
/// first message is the answer, and `{"reply": "..."}`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ChatResponse {
    Messages { messages: Vec<EnvelopeMessage> },
    Reply { reply: String },
}

/// A message inside the `messages` envelope. The role is optional on the wire.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EnvelopeMessage {
    #[serde(default)]
    pub role: Role,
    pub text: String,
}

impl ChatResponse {
    /// The assistant answer carried by the envelope, if any.
    pub fn into_answer(self) -> Option<Message> {
        match self {
            Self::Messages { messages } => messages
                .into_iter()
                .next()
                .map(|m| Message::assistant(m.text)),
            Self::Reply { reply } => Some(Message::assistant(reply)),
        }
    }
}
