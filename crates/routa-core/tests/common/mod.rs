#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use parking_lot::Mutex;
use routa_core::{CoreConfig, NotificationEnvelope, Subscription};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Serve `router` on an ephemeral port and return its base URL
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn sse_body(payloads: &[Value]) -> String {
    let mut body = String::new();
    for payload in payloads {
        body.push_str(&format!("data: {}\n\n", payload));
    }
    body
}

pub fn chat_config(base_url: &str) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.providers.chat_base_url = base_url.to_string();
    config.providers.chat_api_key = Some("sk-test".to_string());
    config
}

/// Receive until a `turn_complete` arrives or nothing shows up for a second
pub async fn until_turn_complete(subscription: &mut Subscription) -> Vec<NotificationEnvelope> {
    let mut seen = Vec::new();
    while let Ok(Some(envelope)) =
        tokio::time::timeout(Duration::from_secs(1), subscription.receiver.recv()).await
    {
        let done = matches!(
            envelope.update,
            routa_core::SessionUpdate::TurnComplete { .. }
        );
        seen.push(envelope);
        if done {
            break;
        }
    }
    seen
}

pub fn text_of(envelope: &NotificationEnvelope) -> Option<&str> {
    match &envelope.update {
        routa_core::SessionUpdate::AgentMessageChunk { content } => content.as_text(),
        _ => None,
    }
}

/// Chat-completions endpoint replying "Hello" in two chunks
#[derive(Clone, Default)]
pub struct ChatMock {
    pub requests: Arc<Mutex<Vec<Value>>>,
    pub in_flight: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub delay: Duration,
    /// Send the first chunk, then never finish
    pub hang: bool,
    /// Requests still to be answered with an error payload
    pub failures: Arc<AtomicUsize>,
}

impl ChatMock {
    pub fn router(self) -> Router {
        Router::new()
            .route("/chat/completions", post(completions))
            .with_state(self)
    }

    pub fn request(&self, index: usize) -> Value {
        self.requests.lock()[index].clone()
    }
}

pub fn reply_chunks() -> Vec<Value> {
    vec![
        json!({ "choices": [{ "delta": { "content": "Hel" } }] }),
        json!({ "choices": [{ "delta": { "content": "lo" }, "finish_reason": "stop" }] }),
        json!({ "choices": [], "usage": { "prompt_tokens": 3, "completion_tokens": 2 } }),
    ]
}

async fn completions(State(mock): State<ChatMock>, Json(body): Json<Value>) -> Response {
    mock.requests.lock().push(body);

    let failing = mock
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        let body = sse_body(&[json!({ "error": { "message": "overloaded" } })]);
        return ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response();
    }

    if mock.hang {
        let first = format!("data: {}\n\n", reply_chunks()[0]);
        let chunks = futures::stream::iter(vec![Ok::<_, std::io::Error>(first)])
            .chain(futures::stream::pending());
        return (
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(chunks),
        )
            .into_response();
    }

    let now = mock.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    mock.peak.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(mock.delay).await;
    mock.in_flight.fetch_sub(1, Ordering::SeqCst);

    let mut body = sse_body(&reply_chunks());
    body.push_str("data: [DONE]\n\n");
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}
