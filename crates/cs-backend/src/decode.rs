//! Frame decoder: raw response fragments in, protocol frames out.
//!
//! The wire format is chosen by configuration, never sniffed from the data:
//!
//! - `Lines`: a chunked body of `data: `-prefixed lines ending in a sentinel.
//! - `Raw`: a chunked body of plain text; each fragment is one delta.
//! - `Messages`: event payloads already split by an event source.
//! - `Document`: one JSON body, decoded once the transport ends.
//!
//! The decoder is finite and not restartable. Once it has produced the
//! sentinel, or `finish` has been called, further input is ignored.

use cs_protocol::{ChatResponse, DecodeError, Frame};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::sse::LineBuffer;

/// End-of-stream marker used by OpenAI-style event streams.
pub const DEFAULT_SENTINEL: &str = "[DONE]";

/// How response fragments are framed on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeMode {
    #[default]
    Lines,
    Raw,
    Messages,
    Document,
}

/// Incremental decoder for one response.
#[derive(Debug)]
pub struct FrameDecoder {
    mode: DecodeMode,
    sentinel: String,
    lines: LineBuffer,
    /// Undecoded bytes: an incomplete UTF-8 tail in raw mode, the whole body
    /// in document mode.
    pending: Vec<u8>,
    finished: bool,
}

impl FrameDecoder {
    pub fn new(mode: DecodeMode) -> Self {
        Self {
            mode,
            sentinel: DEFAULT_SENTINEL.to_string(),
            lines: LineBuffer::default(),
            pending: Vec::new(),
            finished: false,
        }
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decode one fragment as delivered by the transport.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        if self.finished {
            trace!(bytes = chunk.len(), "ignoring input after end of stream");
            return Vec::new();
        }

        match self.mode {
            DecodeMode::Lines => {
                let mut frames = Vec::new();
                for line in self.lines.push(chunk) {
                    if let Some(frame) = self.decode_line(&line) {
                        let done = frame == Frame::Done;
                        frames.push(frame);
                        if done {
                            self.finished = true;
                            break;
                        }
                    }
                }
                frames
            }
            DecodeMode::Raw => self.decode_raw(chunk),
            DecodeMode::Messages => self.decode_message(chunk).into_iter().collect(),
            DecodeMode::Document => {
                self.pending.extend_from_slice(chunk);
                Vec::new()
            }
        }
    }

    /// Signal end of input and flush whatever is still buffered.
    pub fn finish(&mut self) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        match self.mode {
            DecodeMode::Lines => self
                .lines
                .finish()
                .and_then(|line| self.decode_line(&line))
                .into_iter()
                .collect(),
            DecodeMode::Raw => {
                if self.pending.is_empty() {
                    return Vec::new();
                }
                // A multi-byte character cut off by the end of the body.
                let len = std::mem::take(&mut self.pending).len();
                vec![Frame::Malformed(DecodeError::InvalidUtf8 { len })]
            }
            DecodeMode::Messages => Vec::new(),
            DecodeMode::Document => {
                let body = std::mem::take(&mut self.pending);
                vec![decode_document(&body)]
            }
        }
    }

    fn decode_line(&self, line: &[u8]) -> Option<Frame> {
        if line.is_empty() {
            return None;
        }
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(_) => {
                return Some(Frame::Malformed(DecodeError::InvalidUtf8 { len: line.len() }));
            }
        };

        let (field, value) = match line.split_once(':') {
            // comment
            Some(("", _)) => return None,
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => {
                return Some(Frame::Malformed(DecodeError::UnrecognizedLine(
                    line.to_string(),
                )));
            }
        };

        match field {
            "data" if value == self.sentinel => Some(Frame::Done),
            "data" if value.is_empty() => None,
            "data" => Some(Frame::TextDelta(value.to_string())),
            "event" | "id" | "retry" => None,
            _ => Some(Frame::Malformed(DecodeError::UnrecognizedLine(
                line.to_string(),
            ))),
        }
    }

    fn decode_raw(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut text = String::new();
        let mut rest = &buf[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            if !text.is_empty() {
                                frames.push(Frame::TextDelta(std::mem::take(&mut text)));
                            }
                            frames.push(Frame::Malformed(DecodeError::InvalidUtf8 { len }));
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end: wait for the next fragment.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        if !text.is_empty() {
            frames.push(Frame::TextDelta(text));
        }
        frames
    }

    fn decode_message(&mut self, payload: &[u8]) -> Option<Frame> {
        let payload = match std::str::from_utf8(payload) {
            Ok(payload) => payload,
            Err(_) => {
                return Some(Frame::Malformed(DecodeError::InvalidUtf8 {
                    len: payload.len(),
                }));
            }
        };

        if payload == self.sentinel {
            self.finished = true;
            Some(Frame::Done)
        } else if payload.is_empty() {
            None
        } else {
            Some(Frame::TextDelta(payload.to_string()))
        }
    }
}

fn decode_document(body: &[u8]) -> Frame {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Frame::Malformed(DecodeError::EmptyDocument);
    }
    match serde_json::from_slice::<ChatResponse>(body) {
        Ok(response) => match response.into_answer() {
            Some(message) => Frame::Final(message),
            None => Frame::Malformed(DecodeError::EmptyDocument),
        },
        Err(e) => Frame::Malformed(DecodeError::InvalidDocument(e.to_string())),
    }
}
