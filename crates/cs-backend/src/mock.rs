//! Mock transport for testing.
//!
//! Replays a scripted sequence of fragments through the same [`Fragments`]
//! interface the HTTP and event-source transports use, so tests at every
//! layer can run without a backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use cs_protocol::ChatRequest;
use tokio::time::sleep;

use crate::transport::{Fragments, Transport, TransportError, TransportEvent};

/// One scripted transport action.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Deliver a text fragment.
    Chunk(String),
    /// Deliver raw bytes, for encoding edge cases.
    Bytes(Vec<u8>),
    /// Fail the transport. Nothing follows.
    Fail { message: String },
    /// Delay before the next step.
    Delay { ms: u64 },
    /// Never deliver anything again.
    Stall,
}

/// Scripted transport. Every `open` replays the same script and records the
/// request it was opened with.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    steps: Vec<MockStep>,
    chunk_delay_ms: Option<u64>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_steps(mut self, steps: Vec<MockStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_chunk_delay(mut self, ms: u64) -> Self {
        self.chunk_delay_ms = Some(ms);
        self
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Transport for MockTransport {
    fn open(&self, request: &ChatRequest) -> Fragments {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let steps = self.steps.clone();
        let chunk_delay_ms = self.chunk_delay_ms;

        Fragments::new(stream! {
            for step in steps {
                if let Some(delay_ms) = chunk_delay_ms {
                    sleep(Duration::from_millis(delay_ms)).await;
                }

                match step {
                    MockStep::Chunk(text) => {
                        yield TransportEvent::Fragment(Bytes::from(text));
                    }
                    MockStep::Bytes(bytes) => {
                        yield TransportEvent::Fragment(Bytes::from(bytes));
                    }
                    MockStep::Fail { message } => {
                        yield TransportEvent::Error(TransportError::Aborted(message));
                        return;
                    }
                    MockStep::Delay { ms } => sleep(Duration::from_millis(ms)).await,
                    MockStep::Stall => futures::future::pending::<()>().await,
                }
            }

            yield TransportEvent::End;
        })
    }
}

/// Built-in scripts for common scenarios.
pub mod fixtures {
    use super::*;

    /// `data: `-framed deltas, one per fragment, closed by the sentinel.
    pub fn event_lines(deltas: &[&str]) -> MockTransport {
        let mut steps: Vec<MockStep> = deltas
            .iter()
            .map(|delta| MockStep::Chunk(format!("data: {delta}\n\n")))
            .collect();
        steps.push(MockStep::Chunk("data: [DONE]\n\n".to_string()));
        MockTransport::new().with_steps(steps)
    }

    /// Unframed text chunks.
    pub fn raw_chunks(chunks: &[&str]) -> MockTransport {
        let steps = chunks
            .iter()
            .map(|chunk| MockStep::Chunk((*chunk).to_string()))
            .collect();
        MockTransport::new().with_steps(steps)
    }

    /// A whole-body JSON answer, delivered in two fragments.
    pub fn json_answer(text: &str) -> MockTransport {
        let body = serde_json::json!({ "messages": [{ "role": "assistant", "text": text }] })
            .to_string();
        let (head, tail) = body.as_bytes().split_at(body.len() / 2);
        MockTransport::new().with_steps(vec![
            MockStep::Bytes(head.to_vec()),
            MockStep::Bytes(tail.to_vec()),
        ])
    }

    /// Framed deltas followed by a transport failure.
    pub fn error_mid_stream(deltas: &[&str], error: &str) -> MockTransport {
        let mut steps: Vec<MockStep> = deltas
            .iter()
            .map(|delta| MockStep::Chunk(format!("data: {delta}\n\n")))
            .collect();
        steps.push(MockStep::Fail {
            message: error.to_string(),
        });
        MockTransport::new().with_steps(steps)
    }
}
