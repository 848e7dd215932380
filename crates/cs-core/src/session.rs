//! Stream session: drives one question/answer exchange.
//!
//! ```text
//! Idle -> Sending -> Streaming -> Completed
//!            |           |------> Cancelled
//!            |           '------> Failed
//!            '------------------> Completed | Cancelled | Failed
//! ```
//!
//! The only suspension point is waiting for the transport's next fragment.
//! Cancellation is observed there and before each frame is applied.

use std::fmt;

use cs_backend::{FrameDecoder, Fragments, Transport, TransportError, TransportEvent};
use cs_protocol::{ChatRequest, Frame, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transcript::TranscriptAccumulator;

/// Local identifier of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The transcript changed; this is the full new value.
    Transcript(Vec<Message>),
    /// A session moved to a new state.
    State {
        session: SessionId,
        state: SessionState,
    },
    /// A session failed. Sent right before its `Failed` state event.
    Failed { session: SessionId, error: String },
}

pub type EventSender = mpsc::UnboundedSender<ChatEvent>;

/// Cloneable handle used to cancel a session from elsewhere.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Request cancellation. Takes effect at the next fragment or frame
    /// boundary; accumulated text is kept.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionOutcome {
    pub id: SessionId,
    pub state: SessionState,
    /// The assistant text as it stands in the transcript.
    pub answer: String,
    /// Set when the state is `Failed`.
    pub error: Option<TransportError>,
    /// Number of frames dropped as undecodable.
    pub malformed: usize,
}

pub struct StreamSession {
    id: SessionId,
    state: SessionState,
    /// Transcript index of this exchange's assistant message.
    slot: usize,
    fragments: Fragments,
    decoder: FrameDecoder,
    cancel: CancellationToken,
    events: Option<EventSender>,
    malformed: usize,
}

impl StreamSession {
    /// Record the user message, open the transport, and return the session
    /// in the `Sending` state. Nothing is read until [`StreamSession::run`].
    pub fn start(
        id: SessionId,
        transcript: &mut TranscriptAccumulator,
        transport: &dyn Transport,
        request: ChatRequest,
        decoder: FrameDecoder,
        events: Option<EventSender>,
    ) -> Self {
        let slot = transcript.begin_exchange(request.message.clone());

        let mut session = Self {
            id,
            state: SessionState::Idle,
            slot,
            fragments: transport.open(&request),
            decoder,
            cancel: CancellationToken::new(),
            events,
            malformed: 0,
        };
        session.notify(ChatEvent::Transcript(transcript.snapshot()));
        session.transition(SessionState::Sending);
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            cancel: self.cancel.clone(),
        }
    }

    /// Drive the exchange to a terminal state.
    pub async fn run(mut self, transcript: &mut TranscriptAccumulator) -> SessionOutcome {
        let mut error = None;

        let state = loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break SessionState::Cancelled,
                event = self.fragments.next() => event,
            };

            match event {
                TransportEvent::Fragment(bytes) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    if self.state == SessionState::Sending {
                        self.transition(SessionState::Streaming);
                    }
                    let frames = self.decoder.feed(&bytes);
                    if let Some(state) = self.apply_frames(frames, transcript) {
                        break state;
                    }
                }
                TransportEvent::End => {
                    let frames = self.decoder.finish();
                    break self
                        .apply_frames(frames, transcript)
                        .unwrap_or(SessionState::Completed);
                }
                TransportEvent::Error(e) => {
                    warn!(session = %self.id, error = %e, "transport failed");
                    error = Some(e);
                    break SessionState::Failed;
                }
            }
        };

        self.fragments.close();
        let answer = transcript
            .message(self.slot)
            .map(|m| m.text.clone())
            .unwrap_or_default();
        transcript.finish_exchange(self.slot);

        if let Some(ref e) = error {
            self.notify(ChatEvent::Failed {
                session: self.id,
                error: e.to_string(),
            });
        }
        self.transition(state);

        SessionOutcome {
            id: self.id,
            state,
            answer,
            error,
            malformed: self.malformed,
        }
    }

    /// Apply decoded frames in order. Returns the terminal state if one of
    /// them ends the exchange.
    fn apply_frames(
        &mut self,
        frames: Vec<Frame>,
        transcript: &mut TranscriptAccumulator,
    ) -> Option<SessionState> {
        for frame in frames {
            if self.cancel.is_cancelled() {
                return Some(SessionState::Cancelled);
            }

            if let Frame::Malformed(ref e) = frame {
                self.malformed += 1;
                warn!(session = %self.id, error = %e, "dropping malformed frame");
            }

            let terminal = frame.is_terminal();
            if transcript.apply(self.slot, frame) {
                self.notify(ChatEvent::Transcript(transcript.snapshot()));
            }
            if terminal {
                return Some(SessionState::Completed);
            }
        }
        None
    }

    fn transition(&mut self, state: SessionState) {
        debug!(session = %self.id, from = %self.state, to = %state, "session state");
        self.state = state;
        self.notify(ChatEvent::State {
            session: self.id,
            state,
        });
    }

    fn notify(&self, event: ChatEvent) {
        if let Some(ref events) = self.events {
            // A dropped receiver only means nobody is watching.
            let _ = events.send(event);
        }
    }
}
