//! Pull-based HTTP transport: the response body is read chunk by chunk.

use std::time::Duration;

use async_stream::stream;
use cs_protocol::ChatRequest;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::{pull_fragments, Fragments, Transport, TransportError, TransportEvent};

/// How the request payload is put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMethod {
    /// `POST` with a JSON body `{"message": ..., "session_id": ...}`.
    #[default]
    PostJson,
    /// `GET` with `message` and `session_id` query parameters.
    GetQuery,
}

/// Build an HTTP client with the given timeouts. `None` disables the total
/// request timeout, which bounds the whole streamed body.
pub fn build_http_client(
    connect_timeout: Duration,
    timeout: Option<Duration>,
) -> Result<Client, TransportError> {
    let mut builder = Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(2);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

/// Chunked-body transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    url: String,
    method: RequestMethod,
}

impl HttpTransport {
    pub fn new(http: Client, url: impl Into<String>, method: RequestMethod) -> Self {
        Self {
            http,
            url: url.into(),
            method,
        }
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: &ChatRequest) -> Fragments {
        let http = self.http.clone();
        let url = self.url.clone();
        let method = self.method;
        let request = request.clone();

        Fragments::new(stream! {
            match send_request(&http, &url, method, &request).await {
                Ok(response) => {
                    debug!(status = %response.status(), url = %url, "response headers received");
                    let body = pull_fragments(response.bytes_stream());
                    futures::pin_mut!(body);
                    while let Some(event) = body.next().await {
                        yield event;
                    }
                }
                Err(e) => {
                    yield TransportEvent::Error(e);
                }
            }
        })
    }
}

/// Send the request and check the status. Shared with the event source.
pub(crate) async fn send_request(
    http: &Client,
    url: &str,
    method: RequestMethod,
    request: &ChatRequest,
) -> Result<Response, TransportError> {
    let builder = match method {
        RequestMethod::PostJson => http.post(url).json(request),
        RequestMethod::GetQuery => http.get(url).query(&query_pairs(request)),
    };

    let response = builder.send().await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status { status, body });
    }

    Ok(response)
}

fn query_pairs(request: &ChatRequest) -> Vec<(&'static str, &str)> {
    let mut pairs = vec![("message", request.message.as_str())];
    if let Some(ref id) = request.session_id {
        pairs.push(("session_id", id.as_str()));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_include_session_id() {
        let req = ChatRequest::new("hi there").with_session_id(Some("s1".to_string()));
        assert_eq!(
            query_pairs(&req),
            vec![("message", "hi there"), ("session_id", "s1")]
        );
    }

    #[test]
    fn query_pairs_without_session_id() {
        let req = ChatRequest::new("hi");
        assert_eq!(query_pairs(&req), vec![("message", "hi")]);
    }

    #[test]
    fn get_query_request_encodes_parameters() {
        let http = Client::new();
        let req = ChatRequest::new("a b&c").with_session_id(Some("xyz".to_string()));
        let built = http
            .get("http://localhost:8000/stream")
            .query(&query_pairs(&req))
            .build()
            .unwrap();
        assert_eq!(
            built.url().as_str(),
            "http://localhost:8000/stream?message=a+b%26c&session_id=xyz"
        );
    }

    #[test]
    fn post_json_request_body() {
        let http = Client::new();
        let req = ChatRequest::new("hello");
        let built = http
            .post("http://localhost:8000/chat/basic")
            .json(&req)
            .build()
            .unwrap();
        let body = built.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(body, br#"{"message":"hello"}"#);
        assert_eq!(built.headers()["content-type"], "application/json");
    }

    #[test]
    fn build_http_client_does_not_fail() {
        assert!(build_http_client(Duration::from_secs(5), None).is_ok());
        assert!(
            build_http_client(Duration::from_secs(5), Some(Duration::from_secs(60))).is_ok()
        );
    }

    #[tokio::test]
    async fn connection_refused_is_reported_as_first_event() {
        let http = build_http_client(Duration::from_secs(2), None).unwrap();
        // Port 9 (discard) is essentially never listening for HTTP.
        let transport =
            HttpTransport::new(http, "http://127.0.0.1:9/chat", RequestMethod::PostJson);
        let mut fragments = transport.open(&ChatRequest::new("hi"));
        assert!(matches!(
            fragments.next().await,
            TransportEvent::Error(TransportError::Request(_))
        ));
        assert!(fragments.is_closed());
    }

    #[test]
    fn method_parses_from_kebab_case() {
        let m: RequestMethod = serde_json::from_str(r#""get-query""#).unwrap();
        assert_eq!(m, RequestMethod::GetQuery);
    }
}
