//! Remote agent server adapter
//!
//! Talks to an OpenCode server: sessions and prompts over HTTP, output over
//! the server's global `/event` SSE stream. The stream carries events for
//! every session on the server, so each event is matched against our remote
//! session id before translation.

use super::{AdapterContext, PromptStream, ProviderDescriptor, SseAccumulator, TurnSlot};
use crate::config::ProviderSettings;
use crate::error::{Error, ProviderError, Result};
use crate::types::{
    AuthMethod, NotificationEnvelope, SessionUpdate, StopReason, TokenUsage, ToolCallContent,
    ToolCallStatus,
};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BASIC_AUTH_USER: &str = "opencode";

pub struct RemoteSdkAdapter {
    provider_id: String,
    session_id: String,
    client: Client,
    base_url: String,
    password: Option<String>,
    remote_session_id: Mutex<Option<String>>,
    mode_id: Mutex<Option<String>>,
    model: Option<String>,
    alive: AtomicBool,
    turn: Arc<TurnSlot>,
}

enum Step {
    Cancelled,
    Chunk(Option<reqwest::Result<Vec<u8>>>),
}

impl RemoteSdkAdapter {
    pub fn new(descriptor: &ProviderDescriptor, ctx: AdapterContext, settings: &ProviderSettings) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            provider_id: descriptor.id.clone(),
            session_id: ctx.session_id,
            client,
            base_url: settings
                .opencode_server_url
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            password: settings.opencode_server_password.clone(),
            remote_session_id: Mutex::new(None),
            mode_id: Mutex::new(ctx.mode_id),
            model: ctx.model,
            alive: AtomicBool::new(false),
            turn: TurnSlot::new(),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn turn(&self) -> &TurnSlot {
        &self.turn
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.password {
            Some(password) => builder.basic_auth(BASIC_AUTH_USER, Some(password)),
            None => builder,
        }
    }

    /// Verify the server is reachable and accepts our credentials
    pub async fn connect(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(ProviderError::connection("OPENCODE_SERVER_URL is not set").into());
        }
        let response = self
            .authed(self.client.get(self.url("/config")))
            .send()
            .await
            .map_err(|e| ProviderError::connection(format!("OpenCode server unreachable: {}", e)))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::Connection {
                message: "OpenCode server rejected the credentials".to_string(),
                auth_methods: vec![AuthMethod {
                    id: "opencode-password".to_string(),
                    name: "OpenCode server password".to_string(),
                    description: Some("Set OPENCODE_SERVER_PASSWORD".to_string()),
                }],
            }
            .into()),
            status if !status.is_success() => Err(ProviderError::connection(format!(
                "OpenCode server returned {}",
                status
            ))
            .into()),
            _ => {
                debug!("OpenCode server at {} reachable", self.base_url);
                Ok(())
            }
        }
    }

    pub async fn create_session(&self, title: Option<&str>) -> Result<String> {
        self.connect().await?;
        let body = json!({ "title": title.unwrap_or(&self.session_id) });
        let created: Value = self
            .authed(self.client.post(self.url("/session")).json(&body))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ProviderError::connection(format!("Failed to create session: {}", e)))?
            .json()
            .await?;

        let remote = created["id"]
            .as_str()
            .ok_or_else(|| ProviderError::InvalidMessage("session response has no id".to_string()))?
            .to_string();
        info!("Session {} bound to OpenCode session {}", self.session_id, remote);
        *self.remote_session_id.lock() = Some(remote.clone());
        self.alive.store(true, Ordering::Release);
        Ok(remote)
    }

    /// Re-attach after a restart. Without a known remote session a fresh one
    /// is opened under the same local identity.
    pub async fn resume(&self, remote_session_id: Option<&str>) -> Result<()> {
        match remote_session_id {
            Some(id) => {
                self.connect().await?;
                *self.remote_session_id.lock() = Some(id.to_string());
                self.alive.store(true, Ordering::Release);
                info!("Resumed OpenCode session {} for {}", id, self.session_id);
                Ok(())
            }
            None => self.create_session(None).await.map(|_| ()),
        }
    }

    fn live_remote(&self) -> Result<String> {
        match self.remote_session_id.lock().clone() {
            Some(id) if self.alive.load(Ordering::Acquire) => Ok(id),
            _ => Err(ProviderError::ProcessNotRunning(self.session_id.clone()).into()),
        }
    }

    fn prompt_body(&self, text: &str) -> Value {
        let mut body = json!({ "parts": [{ "type": "text", "text": text }] });
        if let Some(mode) = self.mode_id.lock().clone() {
            body["agent"] = Value::String(mode);
        }
        if let Some((provider, model)) = self.model.as_deref().and_then(|m| m.split_once('/')) {
            body["model"] = json!({ "providerID": provider, "modelID": model });
        }
        body
    }

    pub async fn prompt_stream(&self, text: String) -> Result<PromptStream> {
        let remote = self.live_remote()?;
        let ticket = self.turn.begin(&self.session_id)?;

        // Open the event stream first so the start of the turn isn't missed.
        let events = self
            .authed(self.client.get(self.url("/event")))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        if !events.status().is_success() {
            return Err(ProviderError::Prompt(format!(
                "event stream returned {}",
                events.status()
            ))
            .into());
        }

        self.authed(
            self.client
                .post(self.url(&format!("/session/{}/prompt_async", remote)))
                .json(&self.prompt_body(&text)),
        )
        .send()
        .await?
        .error_for_status()
        .map_err(|e| ProviderError::Prompt(e.to_string()))?;

        let abort = self.authed(
            self.client
                .post(self.url(&format!("/session/{}/abort", remote))),
        );
        let session_id = self.session_id.clone();

        let stream = async_stream::stream! {
            let mut chunks = events.bytes_stream();
            let mut sse = SseAccumulator::new();
            let mut translator = RemoteEventTranslator::new(remote.clone());

            'turn: loop {
                let step = tokio::select! {
                    biased;
                    _ = ticket.cancelled() => Step::Cancelled,
                    chunk = chunks.next() => Step::Chunk(chunk.map(|c| c.map(|b| b.to_vec()))),
                };

                match step {
                    Step::Cancelled => {
                        if let Err(e) = abort.send().await {
                            warn!("Remote abort failed for {}: {}", session_id, e);
                        }
                        yield Ok(NotificationEnvelope::turn_complete(
                            session_id.as_str(),
                            StopReason::Cancelled,
                            None,
                        ));
                        break 'turn;
                    }
                    Step::Chunk(Some(Ok(bytes))) => {
                        for payload in sse.push(&bytes) {
                            let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                                debug!("Skipping unparsable event payload");
                                continue;
                            };
                            let step = translator.translate(&value);
                            for update in step.updates {
                                yield Ok(NotificationEnvelope::new(session_id.as_str(), update));
                            }
                            if let Some(stop_reason) = step.finished {
                                yield Ok(NotificationEnvelope::turn_complete(
                                    session_id.as_str(),
                                    stop_reason,
                                    translator.usage(),
                                ));
                                break 'turn;
                            }
                        }
                    }
                    Step::Chunk(Some(Err(e))) => {
                        yield Err(Error::from(ProviderError::Prompt(format!(
                            "event stream failed: {}",
                            e
                        ))));
                        break 'turn;
                    }
                    Step::Chunk(None) => {
                        yield Err(Error::from(ProviderError::Prompt(
                            "event stream closed before the turn finished".to_string(),
                        )));
                        break 'turn;
                    }
                }
            }
            drop(ticket);
        };

        Ok(stream.boxed())
    }

    /// Recorded locally; sent as the agent name with the next prompt
    pub fn set_mode(&self, mode_id: &str) {
        *self.mode_id.lock() = Some(mode_id.to_string());
    }

    pub fn cancel(&self) {
        if self.turn.cancel() {
            debug!("Cancel requested for session {}", self.session_id);
        }
    }

    pub fn kill(&self) {
        self.turn.cancel();
        self.alive.store(false, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Output of translating one server event
#[derive(Debug, Default)]
pub struct RemoteStep {
    pub updates: Vec<SessionUpdate>,
    /// Set once the server reports the session idle or failed
    pub finished: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Text,
    Reasoning,
    Tool,
    Other,
}

/// Stateful translator for one turn of server events.
///
/// Text and reasoning arrive both as `message.part.delta` increments and as
/// `message.part.updated` snapshots. The byte length already emitted per part
/// is tracked so a snapshot only contributes its unseen suffix.
#[derive(Debug)]
pub struct RemoteEventTranslator {
    remote_session_id: String,
    part_kinds: HashMap<String, PartKind>,
    emitted: HashMap<String, usize>,
    user_messages: HashSet<String>,
    tool_status: HashMap<String, String>,
    usage: Option<TokenUsage>,
}

impl RemoteEventTranslator {
    pub fn new(remote_session_id: impl Into<String>) -> Self {
        Self {
            remote_session_id: remote_session_id.into(),
            part_kinds: HashMap::new(),
            emitted: HashMap::new(),
            user_messages: HashSet::new(),
            tool_status: HashMap::new(),
            usage: None,
        }
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    pub fn translate(&mut self, event: &Value) -> RemoteStep {
        let mut step = RemoteStep::default();
        let event_type = event["type"].as_str().unwrap_or_default();
        let properties = &event["properties"];

        match extract_session_id(event) {
            Some(id) if id != self.remote_session_id => return step,
            None if event_type != "session.error" => return step,
            _ => {}
        }

        match event_type {
            "message.updated" => {
                let info = &properties["info"];
                let Some(message_id) = info["id"].as_str() else {
                    return step;
                };
                if info["role"] == "user" {
                    self.user_messages.insert(message_id.to_string());
                } else if let Some(tokens) = info.get("tokens") {
                    let usage = TokenUsage::new(
                        tokens["input"].as_u64().unwrap_or(0),
                        tokens["output"].as_u64().unwrap_or(0),
                    );
                    if !usage.is_empty() {
                        self.usage = Some(usage);
                    }
                }
            }
            "message.part.updated" => {
                let part = &properties["part"];
                let Some(part_id) = part["id"].as_str() else {
                    return step;
                };
                let kind = match part["type"].as_str().unwrap_or_default() {
                    "text" => PartKind::Text,
                    "reasoning" => PartKind::Reasoning,
                    "tool" => PartKind::Tool,
                    _ => PartKind::Other,
                };
                self.part_kinds.insert(part_id.to_string(), kind);
                if part["messageID"]
                    .as_str()
                    .is_some_and(|m| self.user_messages.contains(m))
                {
                    return step;
                }

                match kind {
                    PartKind::Text | PartKind::Reasoning => {
                        let chunk = match properties["delta"].as_str() {
                            Some(delta) => self.record_delta(part_id, delta),
                            None => self.unseen_suffix(part_id, part["text"].as_str().unwrap_or("")),
                        };
                        if let Some(text) = chunk {
                            step.updates.push(text_update(kind, text));
                        }
                    }
                    PartKind::Tool => {
                        if let Some(update) = self.tool_update(part) {
                            step.updates.push(update);
                        }
                    }
                    PartKind::Other => {}
                }
            }
            "message.part.delta" => {
                let (Some(part_id), Some(delta)) =
                    (properties["partID"].as_str(), properties["delta"].as_str())
                else {
                    return step;
                };
                if properties["messageID"]
                    .as_str()
                    .is_some_and(|m| self.user_messages.contains(m))
                {
                    return step;
                }
                let kind = match self.part_kinds.get(part_id) {
                    Some(kind) => *kind,
                    None if properties["field"] == "text" => {
                        self.part_kinds.insert(part_id.to_string(), PartKind::Text);
                        PartKind::Text
                    }
                    None => return step,
                };
                if matches!(kind, PartKind::Text | PartKind::Reasoning) {
                    if let Some(text) = self.record_delta(part_id, delta) {
                        step.updates.push(text_update(kind, text));
                    }
                }
            }
            "session.idle" => step.finished = Some(StopReason::EndTurn),
            "session.status" => {
                if properties["status"]["type"] == "idle" {
                    step.finished = Some(StopReason::EndTurn);
                }
            }
            "session.error" => {
                let error = &properties["error"];
                let message = error["data"]["message"]
                    .as_str()
                    .or_else(|| error["message"].as_str())
                    .or_else(|| error["name"].as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                step.updates.push(SessionUpdate::Error { message });
                step.finished = Some(StopReason::Error);
            }
            _ => {}
        }
        step
    }

    fn record_delta(&mut self, part_id: &str, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        *self.emitted.entry(part_id.to_string()).or_insert(0) += delta.len();
        Some(delta.to_string())
    }

    fn unseen_suffix(&mut self, part_id: &str, full: &str) -> Option<String> {
        let seen = self.emitted.get(part_id).copied().unwrap_or(0);
        if full.len() <= seen || !full.is_char_boundary(seen) {
            return None;
        }
        self.emitted.insert(part_id.to_string(), full.len());
        Some(full[seen..].to_string())
    }

    /// One update per lifecycle state; repeated snapshots of the same state
    /// are suppressed
    fn tool_update(&mut self, part: &Value) -> Option<SessionUpdate> {
        let call_id = part["callID"].as_str().or_else(|| part["id"].as_str())?;
        let state = &part["state"];
        let status = state["status"].as_str().unwrap_or("pending");
        let previous = self
            .tool_status
            .insert(call_id.to_string(), status.to_string());
        if previous.as_deref() == Some(status) {
            return None;
        }

        let title = part["tool"].as_str().map(str::to_string);
        let raw_input = state.get("input").filter(|v| !v.is_null()).cloned();
        match (status, previous.is_some()) {
            ("pending", _) | ("running", false) => Some(SessionUpdate::ToolCall {
                tool_call_id: call_id.to_string(),
                title,
                kind: None,
                status: if status == "pending" {
                    ToolCallStatus::Pending
                } else {
                    ToolCallStatus::InProgress
                },
                raw_input,
            }),
            ("running", true) => Some(SessionUpdate::ToolCallUpdate {
                tool_call_id: call_id.to_string(),
                title,
                status: Some(ToolCallStatus::InProgress),
                content: None,
                raw_input,
                raw_output: None,
            }),
            ("completed", _) => {
                let output = state["output"].as_str().unwrap_or_default().to_string();
                Some(SessionUpdate::ToolCallUpdate {
                    tool_call_id: call_id.to_string(),
                    title,
                    status: Some(ToolCallStatus::Completed),
                    content: Some(vec![ToolCallContent::text(output.clone())]),
                    raw_input,
                    raw_output: Some(Value::String(output)),
                })
            }
            ("error", _) => Some(SessionUpdate::ToolCallUpdate {
                tool_call_id: call_id.to_string(),
                title,
                status: Some(ToolCallStatus::Failed),
                content: None,
                raw_input,
                raw_output: state.get("error").cloned(),
            }),
            _ => None,
        }
    }
}

fn text_update(kind: PartKind, text: String) -> SessionUpdate {
    match kind {
        PartKind::Reasoning => SessionUpdate::thought(text),
        _ => SessionUpdate::message(text),
    }
}

fn extract_session_id(value: &Value) -> Option<String> {
    let candidates = [
        &value["properties"]["sessionID"],
        &value["properties"]["part"]["sessionID"],
        &value["properties"]["info"]["sessionID"],
        &value["properties"]["session"]["id"],
        &value["sessionID"],
    ];
    candidates
        .iter()
        .find_map(|v| v.as_str())
        .map(str::to_string)
}
