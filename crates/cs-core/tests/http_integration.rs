//! Integration tests against a loopback HTTP server.
//!
//! Each test binds a listener on an ephemeral port, serves one canned
//! response, and drives a `Chat` built from configuration, so the real
//! reqwest transports and both request shapes are exercised.

use std::time::Duration;

use cs_backend::{DecodeMode, RequestMethod, TransportError};
use cs_core::config::TransportKind;
use cs_core::{Chat, Config, SessionState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const STREAM_HEAD: &str =
    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";

/// Serve one connection: read the request, write `head`, then each chunk
/// with a short pause so they arrive as separate fragments.
async fn serve_once(
    head: &'static str,
    chunks: Vec<&'static str>,
) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/chat", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let _ = tx.send(request);

        socket.write_all(head.as_bytes()).await.unwrap();
        for chunk in chunks {
            socket.write_all(chunk.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _ = socket.shutdown().await;
    });

    (url, rx)
}

/// Read the request head and a `content-length` body, if any.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < end + 4 + body_len {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        break;
    }

    String::from_utf8_lossy(&buf).into_owned()
}

fn config(url: String) -> Config {
    let mut config = Config::default();
    config.backend.url = url;
    config.backend.connect_timeout_secs = 2;
    config.backend.timeout_secs = Some(10);
    config.session.id = Some("abc".to_string());
    config
}

#[tokio::test]
async fn post_json_with_framed_lines() {
    let (url, request) = serve_once(
        STREAM_HEAD,
        vec!["data: Hel\n\n", "data: lo, \n\n", "data: world\n\ndata: [DONE]\n\n"],
    )
    .await;
    let mut chat = Chat::from_config(&config(url)).unwrap();

    let outcome = chat.send("hi").await;

    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.answer, "Hello, world");

    let request = request.await.unwrap();
    assert!(request.starts_with("POST /chat HTTP/1.1"));
    assert!(request.contains(r#""message":"hi""#));
    assert!(request.contains(r#""session_id":"abc""#));
}

#[tokio::test]
async fn get_query_with_raw_chunks() {
    let (url, request) = serve_once(STREAM_HEAD, vec!["The answer is ", "42."]).await;
    let mut config = config(url);
    config.backend.method = RequestMethod::GetQuery;
    config.backend.decode = Some(DecodeMode::Raw);
    let mut chat = Chat::from_config(&config).unwrap();

    let outcome = chat.send("what is 6*7").await;

    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.answer, "The answer is 42.");

    let request = request.await.unwrap();
    assert!(request.starts_with("GET /chat?message=what+is+6*7&session_id=abc "));
}

#[tokio::test]
async fn document_body() {
    let (url, _request) = serve_once(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nconnection: close\r\n\r\n",
        vec![r#"{"messages":[{"text":"Pa"#, r#"ris"}]}"#],
    )
    .await;
    let mut config = config(url);
    config.backend.decode = Some(DecodeMode::Document);
    let mut chat = Chat::from_config(&config).unwrap();

    let outcome = chat.send("capital of France?").await;

    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.answer, "Paris");
}

#[tokio::test]
async fn event_source_messages() {
    let (url, request) = serve_once(
        STREAM_HEAD,
        vec![
            ": keep-alive\n\nevent: ping\ndata: ignored\n\n",
            "data: Hel\n\ndata: lo\n\n",
            "data: [DONE]\n\n",
        ],
    )
    .await;
    let mut config = config(url);
    config.backend.transport = TransportKind::EventSource;
    let mut chat = Chat::from_config(&config).unwrap();

    let outcome = chat.send("hi there").await;

    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.answer, "Hello");

    let request = request.await.unwrap();
    assert!(request.starts_with("GET /chat?message=hi+there&session_id=abc "));
}

#[tokio::test]
async fn event_source_close_without_sentinel_completes() {
    let (url, _request) = serve_once(STREAM_HEAD, vec!["data: only\n\n"]).await;
    let mut config = config(url);
    config.backend.transport = TransportKind::EventSource;
    let mut chat = Chat::from_config(&config).unwrap();

    let outcome = chat.send("q").await;

    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.answer, "only");
}

#[tokio::test]
async fn error_status_fails_the_session() {
    let (url, _request) = serve_once(
        "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 4\r\nconnection: close\r\n\r\noops",
        vec![],
    )
    .await;
    let mut chat = Chat::from_config(&config(url)).unwrap();

    let outcome = chat.send("q").await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(matches!(
        outcome.error,
        Some(TransportError::Status { status: 500, ref body }) if body == "oops"
    ));
    assert_eq!(chat.transcript().len(), 2);
}

#[tokio::test]
async fn connection_refused_fails_the_session() {
    let mut chat = Chat::from_config(&config("http://127.0.0.1:9/chat".to_string())).unwrap();

    let outcome = chat.send("q").await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(matches!(outcome.error, Some(TransportError::Request(_))));
}

#[tokio::test]
async fn cancel_closes_the_connection() {
    let (url, _request) = serve_once(STREAM_HEAD, vec!["data: first\n\n"]).await;
    let mut chat = Chat::from_config(&config(url)).unwrap();
    let mut rx = chat.subscribe();

    let session = chat.start("q");
    let handle = session.handle();
    let canceller = async move {
        while let Some(event) = rx.recv().await {
            if let cs_core::ChatEvent::Transcript(messages) = event {
                if messages[1].text == "first" {
                    handle.cancel();
                    return;
                }
            }
        }
    };

    let (outcome, ()) = tokio::join!(chat.run(session), canceller);

    assert_eq!(outcome.state, SessionState::Cancelled);
    assert_eq!(outcome.answer, "first");
}
