//! cs-backend: Stream decoding and transports for chatstream.
//!
//! This crate turns a chat backend's response channel into decoded frames:
//! a pull-based HTTP body reader, a push-based event source, and a scripted
//! mock, all normalized to the same fragment producer.

pub mod decode;
pub mod eventsource;
pub mod http;
pub mod mock;
pub mod sse;
pub mod transport;

pub use decode::{DecodeMode, FrameDecoder, DEFAULT_SENTINEL};
pub use eventsource::{EventSource, EventSourceTransport, SourceEvent};
pub use http::{HttpTransport, RequestMethod};
pub use mock::{MockStep, MockTransport};
pub use transport::{Fragments, Transport, TransportError, TransportEvent};
