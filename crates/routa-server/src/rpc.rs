//! JSON-RPC 2.0 dispatcher for `POST /api/acp`

use crate::AppState;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use routa_core::error::SessionError;
use routa_core::types::{
    AgentRole, ContentBlock, DelegationTask, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    NewSessionOptions, SessionUpdate, ACP_PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;

type RpcResult = Result<Value, JsonRpcError>;

/// Prompt text as a plain string or ACP content blocks
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl PromptInput {
    pub fn into_text(self) -> String {
        match self {
            PromptInput::Text(text) => text,
            PromptInput::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptParams {
    session_id: String,
    prompt: PromptInput,
    #[serde(default)]
    skill_name: Option<String>,
    #[serde(default)]
    skill_content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetModeParams {
    session_id: String,
    mode_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    #[serde(default)]
    workspace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegateParams {
    agent_id: String,
    prompt: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    role: Option<AgentRole>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportParams {
    agent_id: String,
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    summary: Option<String>,
}

fn default_success() -> bool {
    true
}

fn params<T: DeserializeOwned>(request: &JsonRpcRequest) -> Result<T, JsonRpcError> {
    let raw = request.params.clone().unwrap_or_else(|| json!({}));
    serde_json::from_value(raw).map_err(|e| {
        let error = routa_core::Error::from(SessionError::InvalidParams(format!(
            "{}: {}",
            request.method, e
        )));
        JsonRpcError::from(error)
    })
}

/// `POST /api/acp`
pub async fn handle(State(state): State<Arc<AppState>>, headers: HeaderMap, body: String) -> Response {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("Unparseable JSON-RPC body: {}", e);
            return Json(JsonRpcResponse::failure(
                None,
                JsonRpcError::new(PARSE_ERROR, format!("Parse error: {}", e)),
            ))
            .into_response();
        }
    };

    if request.method == "session/prompt" && accepts_event_stream(&headers) {
        if let Ok(prompt) = params::<PromptParams>(&request) {
            if is_network_backed(&state, &prompt.session_id) {
                return stream_prompt(state, request.id, prompt).await;
            }
        }
    }

    Json(dispatch(&state, request).await).into_response()
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream"))
}

/// Only network-backed sessions answer prompts in-band
fn is_network_backed(state: &AppState, session_id: &str) -> bool {
    let Ok(record) = state.service.get_session(session_id) else {
        return false;
    };
    state
        .service
        .registry()
        .get(&record.provider)
        .map(|d| !d.protocol.is_process())
        .unwrap_or(false)
}

async fn stream_prompt(state: Arc<AppState>, id: Option<Value>, prompt: PromptParams) -> Response {
    let session_id = prompt.session_id.clone();
    let stream = match state
        .service
        .prompt_in_band(
            &prompt.session_id,
            &prompt.prompt.into_text(),
            prompt.skill_name.as_deref(),
            prompt.skill_content.as_deref(),
        )
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!("In-band prompt for {} failed: {}", session_id, e);
            return Json(JsonRpcResponse::failure(id, JsonRpcError::from(&e))).into_response();
        }
    };
    info!("Streaming prompt for session {} in-band", session_id);

    let frames = async_stream::stream! {
        let mut stream = stream;
        let mut outcome = json!({ "stopReason": "error" });
        while let Some(envelope) = stream.next().await {
            if let SessionUpdate::TurnComplete { stop_reason, usage } = &envelope.update {
                outcome = json!({ "stopReason": stop_reason, "usage": usage });
            }
            let notification = JsonRpcRequest::notification(
                "session/update",
                serde_json::to_value(&envelope).ok(),
            );
            yield Ok::<Event, Infallible>(json_event(&notification));
        }
        yield Ok(json_event(&JsonRpcResponse::success(id, outcome)));
    };
    Sse::new(frames).into_response()
}

pub(crate) fn json_event<T: serde::Serialize>(value: &T) -> Event {
    Event::default()
        .json_data(value)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

/// Handle one request and produce its response
pub async fn dispatch(state: &AppState, request: JsonRpcRequest) -> JsonRpcResponse {
    if request.jsonrpc != "2.0" {
        return JsonRpcResponse::failure(
            request.id,
            JsonRpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
        );
    }
    debug!("RPC {}", request.method);

    match call(state, &request).await {
        Ok(result) => JsonRpcResponse::success(request.id, result),
        Err(error) => {
            if error.code != METHOD_NOT_FOUND {
                warn!("RPC {} failed: {}", request.method, error.message);
            }
            JsonRpcResponse::failure(request.id, error)
        }
    }
}

async fn call(state: &AppState, request: &JsonRpcRequest) -> RpcResult {
    let service = &state.service;
    match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": ACP_PROTOCOL_VERSION,
            "capabilities": {
                "streaming": true,
                "loadSession": false,
                "promptCapabilities": { "image": false, "embeddedContext": false }
            },
            "agentInfo": {
                "name": "routa",
                "version": env!("CARGO_PKG_VERSION")
            }
        })),

        "session/new" => {
            let opts: NewSessionOptions = params(request)?;
            let workspace_id = opts.workspace_id.clone().unwrap_or_else(|| "default".to_string());
            let mut result = service.new_session(opts).await?;
            if result.role == AgentRole::Coordinator {
                let agent = state
                    .orchestrator
                    .ensure_agent(&result.session_id, result.role, &workspace_id);
                result.routa_agent_id = Some(agent.agent_id);
            }
            Ok(to_value(&result)?)
        }

        "session/prompt" => {
            let prompt: PromptParams = params(request)?;
            let response = service
                .prompt(
                    &prompt.session_id,
                    &prompt.prompt.into_text(),
                    prompt.skill_name.as_deref(),
                    prompt.skill_content.as_deref(),
                )
                .await?;
            Ok(json!({ "stopReason": response.stop_reason, "usage": response.usage }))
        }

        "session/cancel" => {
            let p: SessionParams = params(request)?;
            service.cancel(&p.session_id).await?;
            Ok(json!({}))
        }

        "session/set_mode" => {
            let p: SetModeParams = params(request)?;
            service.set_mode(&p.session_id, &p.mode_id).await?;
            Ok(json!({}))
        }

        "session/list" => {
            let p: ListParams = params(request)?;
            let sessions = service.list_sessions(p.workspace_id.as_deref())?;
            Ok(json!({ "sessions": sessions }))
        }

        "session/kill" => {
            let p: SessionParams = params(request)?;
            let killed = service.kill(&p.session_id).await;
            Ok(json!({ "killed": killed }))
        }

        "_providers/list" => {
            let providers = service.list_providers().await;
            Ok(json!({ "providers": providers }))
        }

        "_routa/delegate" => {
            let p: DelegateParams = params(request)?;
            let task = DelegationTask {
                prompt: p.prompt,
                provider: p.provider,
                title: p.title,
            };
            let record = match p.role {
                Some(AgentRole::Verifier) => state.orchestrator.spawn_verifier(&p.agent_id, task).await?,
                _ => state.orchestrator.delegate(&p.agent_id, task).await?,
            };
            Ok(to_value(&record)?)
        }

        "_routa/report" => {
            let p: ReportParams = params(request)?;
            let record = state
                .orchestrator
                .report_to_parent(&p.agent_id, p.success, p.summary)?;
            Ok(to_value(&record)?)
        }

        "_routa/delegations" => {
            let p: SessionParams = params(request)?;
            Ok(json!({ "delegations": state.orchestrator.list_delegations(&p.session_id) }))
        }

        other => Err(JsonRpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        )),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::from(routa_core::Error::from(e)))
}
