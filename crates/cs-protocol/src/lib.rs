//! cs-protocol: Shared types for chatstream.
//!
//! This crate defines the transcript data model, the decoded frame type,
//! and the request/response shapes exchanged with chat backends.

pub mod message;
pub mod request;

pub use message::{DecodeError, Frame, Message, Role};
pub use request::{ChatRequest, ChatResponse};
