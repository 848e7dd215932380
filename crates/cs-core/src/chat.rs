//! Chat facade: one transcript, one transport, one live session at a time.
//!
//! [`Chat::start`] and [`Chat::run`] both take `&mut self`, so a second
//! exchange cannot begin while one is running. Starting a new exchange
//! before an earlier one has run supersedes it: each session writes only to
//! its own transcript slot, and a superseded slot keeps what it had. Cancel a
//! running exchange through the [`SessionHandle`] obtained before calling
//! `run`.

use cs_backend::{DecodeMode, FrameDecoder, Transport, DEFAULT_SENTINEL};
use cs_protocol::{ChatRequest, Message};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{Config, ConfigError};
use crate::session::{ChatEvent, EventSender, SessionId, SessionOutcome, StreamSession};
use crate::transcript::TranscriptAccumulator;

pub struct Chat {
    transport: Box<dyn Transport>,
    mode: DecodeMode,
    sentinel: String,
    /// Opaque client identity passed through to the backend.
    client_id: Option<String>,
    transcript: TranscriptAccumulator,
    events: Option<EventSender>,
    next_id: u64,
}

impl Chat {
    pub fn new(transport: impl Transport + 'static, mode: DecodeMode) -> Self {
        Self {
            transport: Box::new(transport),
            mode,
            sentinel: DEFAULT_SENTINEL.to_string(),
            client_id: None,
            transcript: TranscriptAccumulator::new(),
            events: None,
            next_id: 1,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mode = config.backend.decode_mode()?;
        let transport = config.backend.build_transport()?;
        Ok(Self::new(transport, mode)
            .with_sentinel(&config.backend.sentinel)
            .with_client_id(config.session.resolve_id()))
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Receive transcript and state notifications. A new subscription
    /// replaces the previous one.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ChatEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn transcript(&self) -> &[Message] {
        self.transcript.messages()
    }

    /// Begin an exchange. The user message and the assistant placeholder are
    /// in the transcript when this returns.
    pub fn start(&mut self, text: impl Into<String>) -> StreamSession {
        let id = SessionId(self.next_id);
        self.next_id += 1;

        let request = ChatRequest::new(text).with_session_id(self.client_id.clone());
        let decoder = FrameDecoder::new(self.mode).with_sentinel(self.sentinel.clone());
        info!(session = %id, mode = ?self.mode, "starting exchange");

        StreamSession::start(
            id,
            &mut self.transcript,
            self.transport.as_ref(),
            request,
            decoder,
            self.events.clone(),
        )
    }

    pub async fn run(&mut self, session: StreamSession) -> SessionOutcome {
        let outcome = session.run(&mut self.transcript).await;
        info!(
            session = %outcome.id,
            state = %outcome.state,
            chars = outcome.answer.chars().count(),
            "exchange finished"
        );
        outcome
    }

    /// Start an exchange and drive it to the end.
    pub async fn send(&mut self, text: impl Into<String>) -> SessionOutcome {
        let session = self.start(text);
        self.run(session).await
    }

    /// Drop every message. Session ids keep counting.
    pub fn clear(&mut self) {
        self.transcript.clear();
        if let Some(ref events) = self.events {
            let _ = events.send(ChatEvent::Transcript(Vec::new()));
        }
    }
}
