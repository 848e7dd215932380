//! cs-core: Session driving and transcript state for chatstream.
//!
//! This crate owns the transcript, runs one exchange at a time against a
//! transport, and loads configuration. Exposed as a library for integration
//! testing and for the `chatstream` binary.

pub mod chat;
pub mod config;
pub mod session;
pub mod transcript;

pub use chat::Chat;
pub use config::{Config, ConfigError};
pub use session::{
    ChatEvent, SessionHandle, SessionId, SessionOutcome, SessionState, StreamSession,
};
pub use transcript::TranscriptAccumulator;
