//! Transcript accumulator.
//!
//! The transcript is an append-only log of messages. Each exchange appends
//! exactly two entries, the user message and an assistant placeholder, and
//! the accumulator keeps the index of that placeholder while the answer
//! streams in. Every frame *replaces* the slot with a full new message built
//! from the cumulative answer, so the log length depends only on the number
//! of exchanges, never on the number of frames.

use cs_protocol::{Frame, Message, Role};
use tracing::{trace, warn};

#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    messages: Vec<Message>,
    /// Index of the assistant slot of the exchange in flight.
    inflight: Option<usize>,
    /// Everything received for the in-flight answer so far.
    answer: String,
    exchanges: usize,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of exchanges started since the last clear.
    pub fn exchanges(&self) -> usize {
        self.exchanges
    }

    /// The assistant message currently being streamed, if any.
    pub fn in_flight(&self) -> Option<&Message> {
        self.inflight.map(|slot| &self.messages[slot])
    }

    /// Append the user message and the empty assistant placeholder.
    ///
    /// Both entries go in together so the length stays `2 * exchanges`.
    pub fn begin_exchange(&mut self, user_text: impl Into<String>) -> usize {
        if self.inflight.is_some() {
            warn!("exchange started while another is in flight; finalizing the previous answer");
            self.release();
        }

        self.messages.push(Message::user(user_text));
        self.messages.push(Message::placeholder());
        self.exchanges += 1;

        let slot = self.messages.len() - 1;
        self.inflight = Some(slot);
        slot
    }

    /// The message at `slot`, if the log has one there.
    pub fn message(&self, slot: usize) -> Option<&Message> {
        self.messages.get(slot)
    }

    /// Apply one decoded frame to the answer in `slot`.
    ///
    /// Frames addressed to a slot that is no longer in flight are dropped.
    /// Returns true if the transcript changed.
    pub fn apply(&mut self, slot: usize, frame: Frame) -> bool {
        if self.inflight != Some(slot) {
            trace!(slot, ?frame, "slot not in flight; frame dropped");
            return false;
        }

        match frame {
            Frame::TextDelta(delta) => {
                if delta.is_empty() {
                    return false;
                }
                self.answer.push_str(&delta);
                self.messages[slot] = Message::assistant(self.answer.clone());
                true
            }
            Frame::Final(message) => {
                self.answer = message.text;
                self.messages[slot] = Message {
                    role: Role::Assistant,
                    text: self.answer.clone(),
                };
                true
            }
            Frame::Done | Frame::Malformed(_) => false,
        }
    }

    /// Release `slot` if it is still in flight. Its text stays as the final
    /// answer.
    pub fn finish_exchange(&mut self, slot: usize) {
        if self.inflight == Some(slot) {
            self.release();
        }
    }

    fn release(&mut self) {
        self.inflight = None;
        self.answer.clear();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.release();
        self.exchanges = 0;
    }
}
