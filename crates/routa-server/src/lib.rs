//! Routa server
//!
//! HTTP front end for the session protocol:
//!
//! - `POST /api/acp` - JSON-RPC 2.0 requests; `session/prompt` may answer as
//!   an event stream when the client accepts one
//! - `GET /api/acp?sessionId=...` - per-session event channel (SSE)

pub mod events;
pub mod rpc;
mod state;

pub use state::AppState;

use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/acp", get(events::subscribe).post(rpc::handle))
        .route("/api/health", get(|| async { "ok" }))
        .layer(cors)
        .with_state(state)
}

/// CORS policy for `--allow-origin` values; `*` allows any origin
pub fn build_cors(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return Ok(layer.allow_origin(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .map_err(|e| anyhow::anyhow!("invalid --allow-origin value {}: {}", origin, e))?,
        );
    }
    Ok(layer.allow_origin(AllowOrigin::list(headers)))
}
