//! Push-based event source transport.
//!
//! An [`EventSource`] owns a reader task that parses an SSE response and hands
//! each event to a registered handler as it arrives. [`EventSourceTransport`]
//! registers a handler that forwards into a channel and drains that channel
//! as the usual fragment producer, so the session never sees the difference.

use async_stream::stream;
use bytes::Bytes;
use cs_protocol::ChatRequest;
use futures::{Stream, StreamExt};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::http::{send_request, RequestMethod};
use crate::sse::SseParser;
use crate::transport::{Fragments, Transport, TransportError, TransportEvent};

/// Events delivered by an [`EventSource`] to its handler.
#[derive(Debug)]
pub enum SourceEvent {
    /// The connection is established and the status was 2xx.
    Open,
    /// A dispatched event. Unnamed events are called `message`.
    Message { event: String, data: String },
    /// The connection failed. Nothing follows.
    Error(TransportError),
    /// The server closed the stream. Nothing follows.
    Closed,
}

/// A running event source. Dropping it stops the reader.
pub struct EventSource {
    task: JoinHandle<()>,
}

impl EventSource {
    /// Connect and start delivering events to `handler`.
    ///
    /// Must be called within a tokio runtime.
    pub fn connect<F>(http: Client, url: String, request: ChatRequest, mut handler: F) -> Self
    where
        F: FnMut(SourceEvent) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            match send_request(&http, &url, RequestMethod::GetQuery, &request).await {
                Ok(response) => {
                    handler(SourceEvent::Open);
                    dispatch_body(response.bytes_stream(), &mut handler).await;
                }
                Err(e) => handler(SourceEvent::Error(e)),
            }
        });
        Self { task }
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Parse an SSE body and hand every event to `handler`, then `Closed` or
/// `Error`.
async fn dispatch_body<S, E, F>(body: S, handler: &mut F)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
    F: FnMut(SourceEvent),
{
    futures::pin_mut!(body);
    let mut parser = SseParser::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for event in parser.feed(&bytes) {
                    handler(SourceEvent::Message {
                        event: event.name().to_string(),
                        data: event.data,
                    });
                }
            }
            Err(e) => {
                handler(SourceEvent::Error(TransportError::Body(e.to_string())));
                return;
            }
        }
    }
    if let Some(event) = parser.finish() {
        handler(SourceEvent::Message {
            event: event.name().to_string(),
            data: event.data,
        });
    }
    handler(SourceEvent::Closed);
}

/// Turn handler deliveries back into transport events.
///
/// Only `message` events carry payload. A server-sent `error` event fails the
/// exchange, matching what a browser event source surfaces to `onerror`.
fn push_fragments(
    mut events: mpsc::UnboundedReceiver<SourceEvent>,
) -> impl Stream<Item = TransportEvent> + Send {
    stream! {
        while let Some(event) = events.recv().await {
            match event {
                SourceEvent::Open => debug!("event source open"),
                SourceEvent::Message { event, data } => match event.as_str() {
                    "message" => {
                        yield TransportEvent::Fragment(Bytes::from(data));
                    }
                    "error" => {
                        yield TransportEvent::Error(TransportError::EventSource(data));
                        return;
                    }
                    other => debug!(event = other, "ignoring named event"),
                },
                SourceEvent::Error(e) => {
                    yield TransportEvent::Error(e);
                    return;
                }
                SourceEvent::Closed => break,
            }
        }
        yield TransportEvent::End;
    }
}

/// Event-source transport. Requests go out as `GET` with query parameters.
#[derive(Debug, Clone)]
pub struct EventSourceTransport {
    http: Client,
    url: String,
}

impl EventSourceTransport {
    pub fn new(http: Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

impl Transport for EventSourceTransport {
    fn open(&self, request: &ChatRequest) -> Fragments {
        let http = self.http.clone();
        let url = self.url.clone();
        let request = request.clone();

        // The source is started on first poll so opening needs no runtime.
        // It lives inside the stream: closing the fragments drops it, which
        // stops the reader.
        Fragments::new(stream! {
            let (tx, rx) = mpsc::unbounded_channel();
            let _source = EventSource::connect(http, url, request, move |event| {
                let _ = tx.send(event);
            });

            let events = push_fragments(rx);
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                yield event;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(
        chunks: Vec<Result<&'static str, &'static str>>,
    ) -> impl Stream<Item = Result<Bytes, String>> {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| c.map(Bytes::from).map_err(str::to_string)),
        )
    }

    async fn dispatch_all(chunks: Vec<Result<&'static str, &'static str>>) -> Vec<SourceEvent> {
        let mut events = Vec::new();
        dispatch_body(body(chunks), &mut |e: SourceEvent| events.push(e)).await;
        events
    }

    async fn collect(events: Vec<SourceEvent>) -> Vec<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        drop(tx);
        push_fragments(rx).collect().await
    }

    #[tokio::test]
    async fn dispatch_delivers_messages_then_closed() {
        let events = dispatch_all(vec![
            Ok("data: test\n\ndata:  \n\n"),
            Ok("data: [DONE]\n\n"),
        ])
        .await;

        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[0],
            SourceEvent::Message { event, data } if event == "message" && data == "test"
        ));
        assert!(matches!(&events[1], SourceEvent::Message { data, .. } if data == " "));
        assert!(matches!(&events[2], SourceEvent::Message { data, .. } if data == "[DONE]"));
        assert!(matches!(events[3], SourceEvent::Closed));
    }

    #[tokio::test]
    async fn dispatch_reports_body_error() {
        let events = dispatch_all(vec![Ok("data: a\n\n"), Err("reset")]).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], SourceEvent::Error(TransportError::Body(m)) if m == "reset"));
    }

    #[tokio::test]
    async fn dispatch_flushes_unterminated_event() {
        let events = dispatch_all(vec![Ok("event: status\ndata: last")]).await;
        assert!(matches!(
            &events[0],
            SourceEvent::Message { event, data } if event == "status" && data == "last"
        ));
        assert!(matches!(events[1], SourceEvent::Closed));
    }

    #[tokio::test]
    async fn push_normalizes_close_to_end() {
        let out = collect(vec![
            SourceEvent::Open,
            SourceEvent::Message {
                event: "message".to_string(),
                data: "Hel".to_string(),
            },
            SourceEvent::Message {
                event: "ping".to_string(),
                data: "ignored".to_string(),
            },
            SourceEvent::Message {
                event: "message".to_string(),
                data: "lo".to_string(),
            },
            SourceEvent::Closed,
        ])
        .await;

        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], TransportEvent::Fragment(b) if b == "Hel"));
        assert!(matches!(&out[1], TransportEvent::Fragment(b) if b == "lo"));
        assert!(matches!(out[2], TransportEvent::End));
    }

    #[tokio::test]
    async fn push_dropped_sender_is_end() {
        let out = collect(vec![SourceEvent::Message {
            event: "message".to_string(),
            data: "x".to_string(),
        }])
        .await;
        assert!(matches!(out.last(), Some(TransportEvent::End)));
    }

    #[tokio::test]
    async fn push_error_event_fails() {
        let out = collect(vec![
            SourceEvent::Message {
                event: "error".to_string(),
                data: "model overloaded".to_string(),
            },
            SourceEvent::Closed,
        ])
        .await;

        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            TransportEvent::Error(TransportError::EventSource(m)) if m == "model overloaded"
        ));
    }

    #[tokio::test]
    async fn push_transport_error_is_forwarded() {
        let out = collect(vec![SourceEvent::Error(TransportError::Status {
            status: 500,
            body: "oops".to_string(),
        })])
        .await;
        assert!(matches!(
            out[..],
            [TransportEvent::Error(TransportError::Status { status: 500, .. })]
        ));
    }

    #[tokio::test]
    async fn connect_failure_reaches_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _source = EventSource::connect(
            Client::new(),
            "http://127.0.0.1:9/stream".to_string(),
            ChatRequest::new("hi"),
            move |e| {
                let _ = tx.send(e);
            },
        );
        assert!(matches!(
            rx.recv().await,
            Some(SourceEvent::Error(TransportError::Request(_)))
        ));
    }
}
