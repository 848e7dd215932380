//! Transcript messages and decoded stream frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Author of a transcript entry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
}

/// One entry of the transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }

    /// The empty assistant entry that holds the in-flight answer.
    pub fn placeholder() -> Self {
        Self::assistant(String::new())
    }
}

/// A single unit of the response protocol, as produced by the frame decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Text to append to the in-flight assistant answer.
    TextDelta(String),

    /// End-of-stream sentinel. Nothing follows it.
    Done,

    /// A complete answer from a non-streaming backend.
    Final(Message),

    /// A frame that could not be decoded. Carries no content; decoding
    /// continues with the next frame.
    Malformed(DecodeError),
}

impl Frame {
    /// Returns true for the frames that end the exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Final(_))
    }
}

/// Recoverable decoding failure for a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid UTF-8 ({len} bytes dropped)")]
    InvalidUtf8 { len: usize },

    #[error("unrecognized line: {0:?}")]
    UnrecognizedLine(String),

    #[error("invalid JSON document: {0}")]
    InvalidDocument(String),

    #[error("response document carries no message")]
    EmptyDocument,
}
