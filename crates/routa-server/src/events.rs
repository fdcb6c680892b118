//! Per-session event channel, `GET /api/acp?sessionId=...`

use crate::rpc::json_event;
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use routa_core::bus::SubscriberId;
use routa_core::types::JsonRpcError;
use routa_core::SessionService;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub session_id: String,
}

/// Detaches the subscriber when the client goes away
struct Attachment {
    service: Arc<SessionService>,
    session_id: String,
    subscriber: SubscriberId,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        debug!(
            "Event channel for session {} closed (subscriber {})",
            self.session_id, self.subscriber
        );
        self.service.detach(&self.session_id, self.subscriber);
    }
}

pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    if let Err(e) = state.service.get_session(&query.session_id) {
        return (StatusCode::NOT_FOUND, Json(JsonRpcError::from(&e))).into_response();
    }

    let mut subscription = state.service.attach(&query.session_id);
    info!(
        "Event channel opened for session {} (subscriber {})",
        query.session_id, subscription.id
    );
    let attachment = Attachment {
        service: Arc::clone(&state.service),
        session_id: query.session_id,
        subscriber: subscription.id,
    };

    let frames = async_stream::stream! {
        let _attachment = attachment;
        while let Some(envelope) = subscription.receiver.recv().await {
            yield Ok::<Event, Infallible>(json_event(&envelope));
        }
    };

    Sse::new(frames)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response()
}
