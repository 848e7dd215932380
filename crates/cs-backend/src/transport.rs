//! Transport abstraction: one fragment producer for every backend shape.
//!
//! Pull-based bodies and push-based event sources both end up as a stream of
//! [`TransportEvent`]s: zero or more fragments followed by exactly one `End`
//! or `Error`.

use std::pin::Pin;

use async_stream::stream;
use bytes::Bytes;
use cs_protocol::ChatRequest;
use futures::{Stream, StreamExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response body error: {0}")]
    Body(String),
    #[error("event source error: {0}")]
    EventSource(String),
    #[error("stream aborted: {0}")]
    Aborted(String),
}

/// What a transport delivers.
#[derive(Debug)]
pub enum TransportEvent {
    /// Raw response data, in arrival order.
    Fragment(Bytes),
    /// The response ended normally.
    End,
    /// The response failed. Nothing follows.
    Error(TransportError),
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// An open response channel.
///
/// After `End`, `Error`, or [`Fragments::close`], every further call to
/// [`Fragments::next`] returns `End` without touching the transport.
pub struct Fragments {
    inner: Option<FragmentStream>,
}

impl Fragments {
    pub fn new(stream: impl Stream<Item = TransportEvent> + Send + 'static) -> Self {
        Self {
            inner: Some(Box::pin(stream)),
        }
    }

    /// Wait for the next delivery.
    pub async fn next(&mut self) -> TransportEvent {
        let Some(inner) = self.inner.as_mut() else {
            return TransportEvent::End;
        };
        match inner.next().await {
            Some(TransportEvent::Fragment(bytes)) => TransportEvent::Fragment(bytes),
            Some(TransportEvent::Error(e)) => {
                self.close();
                TransportEvent::Error(e)
            }
            Some(TransportEvent::End) | None => {
                self.close();
                TransportEvent::End
            }
        }
    }

    /// Drop the underlying connection. Dropping the stream aborts any
    /// request or reader task still in flight.
    pub fn close(&mut self) {
        self.inner = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl std::fmt::Debug for Fragments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragments")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A way of reaching a chat backend.
pub trait Transport: Send + Sync {
    /// Open a response channel for one request. Connection failures are
    /// reported as the channel's first event, not here.
    fn open(&self, request: &ChatRequest) -> Fragments;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&self, request: &ChatRequest) -> Fragments {
        (**self).open(request)
    }
}

/// Adapt a pull-based body (a stream of chunk results) to transport events.
pub(crate) fn pull_fragments<S, E>(body: S) -> impl Stream<Item = TransportEvent> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    stream! {
        futures::pin_mut!(body);
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    yield TransportEvent::Fragment(bytes);
                }
                Err(e) => {
                    yield TransportEvent::Error(TransportError::Body(e.to_string()));
                    return;
                }
            }
        }
        yield TransportEvent::End;
    }
}
