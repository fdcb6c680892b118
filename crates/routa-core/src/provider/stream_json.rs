//! Streamed-JSON CLI adapter
//!
//! Drives a CLI that reads user messages as JSON lines on stdin and writes
//! `system` / `assistant` / `user` / `result` events on stdout. Tool calls are
//! rendered in two phases: a `tool_use` block is staged, and only surfaces as
//! a `tool_call_update` once the matching `tool_result` comes back.

use super::{AdapterContext, PromptStream, ProviderDescriptor, TurnSlot};
use crate::config::CoreConfig;
use crate::error::{Error, ProviderError, Result};
use crate::transport::{ProcessCommand, Transport};
use crate::types::{
    AuthMethod, NotificationEnvelope, SessionUpdate, StopReason, TokenUsage, ToolCallContent,
    ToolCallStatus,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

pub struct StreamJsonAdapter {
    provider_id: String,
    session_id: String,
    command: ProcessCommand,
    has_api_key: bool,
    transport: Mutex<Option<Arc<Transport>>>,
    child: Mutex<Option<Child>>,
    cli_session_id: Arc<Mutex<Option<String>>>,
    alive: Arc<AtomicBool>,
    turn: Arc<TurnSlot>,
    request_counter: AtomicU64,
}

enum Step {
    Cancelled,
    Line(Option<String>),
}

impl StreamJsonAdapter {
    pub fn new(descriptor: &ProviderDescriptor, ctx: AdapterContext, config: &CoreConfig) -> Self {
        let mut command = ProcessCommand::new(descriptor.command.clone().unwrap_or_default())
            .args(descriptor.args.iter().cloned())
            .env(descriptor.env.clone())
            .cwd(ctx.cwd.clone());
        if let Some(model) = &ctx.model {
            command = command.args(["--model".to_string(), model.clone()]);
        }
        if let Some(mode) = &ctx.mode_id {
            command = command.args(["--permission-mode".to_string(), mode.clone()]);
        }
        if let Some(key) = &config.providers.anthropic_api_key {
            command
                .env
                .insert("ANTHROPIC_API_KEY".to_string(), key.clone());
        }

        Self {
            provider_id: descriptor.id.clone(),
            session_id: ctx.session_id,
            command,
            has_api_key: config.providers.anthropic_api_key.is_some()
                || std::env::var_os("ANTHROPIC_API_KEY").is_some(),
            transport: Mutex::new(None),
            child: Mutex::new(None),
            cli_session_id: Arc::new(Mutex::new(None)),
            alive: Arc::new(AtomicBool::new(false)),
            turn: TurnSlot::new(),
            request_counter: AtomicU64::new(0),
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

    fn next_request_id(&self, prefix: &str) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", prefix, n)
    }

    pub async fn connect(&self) -> Result<()> {
        if self.transport.lock().is_some() {
            return Ok(());
        }
        let (transport, child) = Transport::spawn(&self.command).await?;
        *self.child.lock() = Some(child);
        *self.transport.lock() = Some(Arc::new(transport));
        self.alive.store(true, Ordering::Release);
        info!("Spawned {} for session {}", self.provider_id, self.session_id);
        Ok(())
    }

    fn live_transport(&self) -> Result<Arc<Transport>> {
        match self.transport.lock().as_ref() {
            Some(t) if self.is_alive() => Ok(Arc::clone(t)),
            _ => Err(ProviderError::ProcessNotRunning(self.session_id.clone()).into()),
        }
    }

    fn login_error(&self, message: String) -> Error {
        let auth_methods = if self.has_api_key {
            Vec::new()
        } else {
            vec![AuthMethod {
                id: "claude-login".to_string(),
                name: "Log in with Claude".to_string(),
                description: Some("Run `claude login` or set ANTHROPIC_API_KEY".to_string()),
            }]
        };
        ProviderError::Connection {
            message,
            auth_methods,
        }
        .into()
    }

    /// Run the `initialize` control handshake. A CLI that never answers but
    /// stays up is accepted; one that exits is reported as a login problem.
    pub async fn create_session(&self, _title: Option<&str>) -> Result<Option<String>> {
        self.connect().await?;
        let transport = self.live_transport()?;
        let request_id = self.next_request_id("init");
        transport
            .send(&json!({
                "type": "control_request",
                "request_id": request_id,
                "request": { "subtype": "initialize" }
            }))
            .await?;

        let cli_session_id = Arc::clone(&self.cli_session_id);
        let handshake = async {
            while let Some(line) = transport.recv_line().await {
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    debug!("Ignoring non-JSON CLI output: {}", line);
                    continue;
                };
                if let Some(id) = system_session_id(&value) {
                    *cli_session_id.lock() = Some(id);
                }
                if value["type"] == "control_response"
                    && value["response"]["request_id"] == request_id.as_str()
                {
                    return Some(value);
                }
            }
            None
        };

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Some(response)) => {
                if response["response"]["subtype"] == "error" {
                    let message = response["response"]["error"]
                        .as_str()
                        .unwrap_or("initialize rejected")
                        .to_string();
                    return Err(self.login_error(message));
                }
                debug!("Handshake complete for {}", self.session_id);
            }
            Ok(None) => {
                self.alive.store(false, Ordering::Release);
                return Err(self.login_error(format!(
                    "{} exited during initialize",
                    self.provider_id
                )));
            }
            Err(_) => {
                if !self.is_alive() {
                    return Err(self.login_error(format!(
                        "{} exited during initialize",
                        self.provider_id
                    )));
                }
                warn!(
                    "No initialize response from {} for {}; continuing",
                    self.provider_id, self.session_id
                );
            }
        }

        Ok(self.cli_session_id.lock().clone())
    }

    pub async fn prompt_stream(&self, text: String) -> Result<PromptStream> {
        let transport = self.live_transport()?;
        let ticket = self.turn.begin(&self.session_id)?;

        let cli_session = self
            .cli_session_id
            .lock()
            .clone()
            .unwrap_or_else(|| "default".to_string());
        transport
            .send(&json!({
                "type": "user",
                "message": {
                    "role": "user",
                    "content": [{ "type": "text", "text": text }]
                },
                "parent_tool_use_id": null,
                "session_id": cli_session
            }))
            .await?;

        let interrupt_id = self.next_request_id("interrupt");
        let session_id = self.session_id.clone();
        let provider_id = self.provider_id.clone();
        let cli_session_id = Arc::clone(&self.cli_session_id);
        let alive = Arc::clone(&self.alive);

        let stream = async_stream::stream! {
            let mut translator = StreamJsonTranslator::new();
            loop {
                let step = tokio::select! {
                    biased;
                    _ = ticket.cancelled() => Step::Cancelled,
                    line = transport.recv_line() => Step::Line(line),
                };

                match step {
                    Step::Cancelled => {
                        let interrupt = json!({
                            "type": "control_request",
                            "request_id": interrupt_id,
                            "request": { "subtype": "interrupt" }
                        });
                        if let Err(e) = transport.send(&interrupt).await {
                            warn!("Failed to interrupt {}: {}", session_id, e);
                        }
                        // Swallow the rest of the turn so it can't leak into the next one.
                        let drained = tokio::time::timeout(INTERRUPT_GRACE, async {
                            while let Some(line) = transport.recv_line().await {
                                if is_result_line(&line) {
                                    break;
                                }
                            }
                        })
                        .await;
                        if drained.is_err() {
                            debug!("CLI did not finish the interrupted turn for {}", session_id);
                        }
                        yield Ok(NotificationEnvelope::turn_complete(
                            session_id.as_str(),
                            StopReason::Cancelled,
                            None,
                        ));
                        break;
                    }
                    Step::Line(Some(line)) => {
                        let Ok(value) = serde_json::from_str::<Value>(&line) else {
                            debug!("Ignoring non-JSON CLI output: {}", line);
                            continue;
                        };
                        let output = translator.translate(&value);
                        if let Some(id) = output.session_id {
                            *cli_session_id.lock() = Some(id);
                        }
                        for update in output.updates {
                            yield Ok(NotificationEnvelope::new(session_id.as_str(), update));
                        }
                        if output.finished {
                            break;
                        }
                    }
                    Step::Line(None) => {
                        alive.store(false, Ordering::Release);
                        yield Err(Error::from(ProviderError::Prompt(format!(
                            "{} exited mid-turn",
                            provider_id
                        ))));
                        break;
                    }
                }
            }
            drop(ticket);
        };

        Ok(stream.boxed())
    }

    /// Forward a permission-mode change to the running CLI
    pub async fn set_mode(&self, mode_id: &str) -> Result<()> {
        let transport = self.live_transport()?;
        let request_id = self.next_request_id("mode");
        transport
            .send(&json!({
                "type": "control_request",
                "request_id": request_id,
                "request": { "subtype": "set_permission_mode", "mode": mode_id }
            }))
            .await
    }

    pub fn cancel(&self) {
        if self.turn.cancel() {
            debug!("Cancel requested for session {}", self.session_id);
        }
    }

    pub fn kill(&self) {
        self.turn.cancel();
        self.alive.store(false, Ordering::Release);
        self.transport.lock().take();
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.start_kill() {
                debug!("CLI for {} already gone: {}", self.session_id, e);
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

fn system_session_id(value: &Value) -> Option<String> {
    if value["type"] == "system" && value["subtype"] == "init" {
        value["session_id"].as_str().map(str::to_string)
    } else {
        None
    }
}

fn is_result_line(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .map(|v| v["type"] == "result")
        .unwrap_or(false)
}

/// What one CLI event turns into
#[derive(Debug, Default)]
pub struct StreamJsonOutput {
    pub updates: Vec<SessionUpdate>,
    pub session_id: Option<String>,
    /// The turn's `result` event was seen
    pub finished: bool,
}

#[derive(Debug)]
struct StagedTool {
    name: String,
    input: Value,
}

/// Per-turn translator from CLI events to normalized updates
#[derive(Debug, Default)]
pub struct StreamJsonTranslator {
    staged: HashMap<String, StagedTool>,
}

impl StreamJsonTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, value: &Value) -> StreamJsonOutput {
        let mut out = StreamJsonOutput::default();
        match value["type"].as_str().unwrap_or_default() {
            "system" => out.session_id = system_session_id(value),
            "assistant" => {
                for block in content_blocks(value) {
                    match block["type"].as_str().unwrap_or_default() {
                        "text" => {
                            if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                                out.updates.push(SessionUpdate::message(text));
                            }
                        }
                        "thinking" => {
                            if let Some(text) = block["thinking"].as_str().filter(|t| !t.is_empty()) {
                                out.updates.push(SessionUpdate::thought(text));
                            }
                        }
                        "tool_use" => {
                            if let Some(id) = block["id"].as_str() {
                                self.staged.insert(
                                    id.to_string(),
                                    StagedTool {
                                        name: block["name"].as_str().unwrap_or("tool").to_string(),
                                        input: block["input"].clone(),
                                    },
                                );
                            }
                        }
                        _ => {}
                    }
                }
            }
            "user" => {
                for block in content_blocks(value) {
                    if block["type"] != "tool_result" {
                        continue;
                    }
                    let Some(id) = block["tool_use_id"].as_str() else {
                        continue;
                    };
                    let staged = self.staged.remove(id);
                    let failed = block["is_error"].as_bool().unwrap_or(false);
                    let text = tool_result_text(&block["content"]);
                    out.updates.push(SessionUpdate::ToolCallUpdate {
                        tool_call_id: id.to_string(),
                        title: staged.as_ref().map(|s| s.name.clone()),
                        status: Some(if failed {
                            ToolCallStatus::Failed
                        } else {
                            ToolCallStatus::Completed
                        }),
                        content: Some(vec![ToolCallContent::text(text.clone())]),
                        raw_input: staged.map(|s| s.input),
                        raw_output: Some(Value::String(text)),
                    });
                }
            }
            "result" => {
                let failed = value["is_error"].as_bool().unwrap_or(false)
                    || value["subtype"].as_str().is_some_and(|s| s != "success");
                if failed {
                    let message = value["result"]
                        .as_str()
                        .or_else(|| value["subtype"].as_str())
                        .unwrap_or("turn failed")
                        .to_string();
                    out.updates.push(SessionUpdate::Error { message });
                }
                let usage = value.get("usage").map(|u| {
                    TokenUsage::new(
                        u["input_tokens"].as_u64().unwrap_or(0),
                        u["output_tokens"].as_u64().unwrap_or(0),
                    )
                });
                out.updates.push(SessionUpdate::TurnComplete {
                    stop_reason: if failed {
                        StopReason::Error
                    } else {
                        StopReason::EndTurn
                    },
                    usage,
                });
                if let Some(id) = value["session_id"].as_str() {
                    out.session_id = Some(id.to_string());
                }
                out.finished = true;
                self.staged.clear();
            }
            // Partial-message events, control responses, keep-alives.
            _ => {}
        }
        out
    }
}

fn content_blocks(value: &Value) -> impl Iterator<Item = &Value> {
    value["message"]["content"]
        .as_array()
        .into_iter()
        .flatten()
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_text_and_thinking_forwarded_immediately() {
        let mut t = StreamJsonTranslator::new();
        let out = t.translate(&json!({
            "type": "assistant",
            "message": { "content": [
                { "type": "thinking", "thinking": "let me look" },
                { "type": "text", "text": "Hello" }
            ]}
        }));
        assert_eq!(
            out.updates,
            vec![SessionUpdate::thought("let me look"), SessionUpdate::message("Hello")]
        );
        assert!(!out.finished);
    }

    #[test]
    fn test_tool_use_surfaces_only_with_result() {
        let mut t = StreamJsonTranslator::new();
        let staged = t.translate(&json!({
            "type": "assistant",
            "message": { "content": [
                { "type": "tool_use", "id": "tu1", "name": "Bash", "input": { "command": "ls" } }
            ]}
        }));
        assert!(staged.updates.is_empty());

        let out = t.translate(&json!({
            "type": "user",
            "message": { "content": [
                { "type": "tool_result", "tool_use_id": "tu1",
                  "content": [{ "type": "text", "text": "a.rs" }], "is_error": false }
            ]}
        }));
        match &out.updates[..] {
            [SessionUpdate::ToolCallUpdate { tool_call_id, title, status, raw_input, .. }] => {
                assert_eq!(tool_call_id, "tu1");
                assert_eq!(title.as_deref(), Some("Bash"));
                assert_eq!(*status, Some(ToolCallStatus::Completed));
                assert_eq!(raw_input.as_ref().unwrap()["command"], "ls");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_result_ends_turn() {
        let mut t = StreamJsonTranslator::new();
        let init = t.translate(&json!({ "type": "system", "subtype": "init", "session_id": "cli-1" }));
        assert_eq!(init.session_id.as_deref(), Some("cli-1"));

        let ok = t.translate(&json!({
            "type": "result", "subtype": "success", "is_error": false,
            "usage": { "input_tokens": 10, "output_tokens": 4 }
        }));
        assert!(ok.finished);
        assert_eq!(
            ok.updates,
            vec![SessionUpdate::TurnComplete {
                stop_reason: StopReason::EndTurn,
                usage: Some(TokenUsage::new(10, 4)),
            }]
        );

        let failed = t.translate(&json!({
            "type": "result", "subtype": "error_max_turns", "is_error": true
        }));
        assert_eq!(failed.updates.len(), 2);
        assert!(matches!(failed.updates[0], SessionUpdate::Error { .. }));
        assert!(matches!(
            failed.updates[1],
            SessionUpdate::TurnComplete { stop_reason: StopReason::Error, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_cli_fails_connect() {
        let descriptor =
            ProviderDescriptor::custom_acp("claude", "Claude", "claude-cli-missing-4242", vec![]);
        let adapter = StreamJsonAdapter::new(
            &descriptor,
            AdapterContext {
                session_id: "s1".to_string(),
                cwd: ".".to_string(),
                ..Default::default()
            },
            &CoreConfig::default(),
        );
        assert!(adapter.connect().await.is_err());
        assert!(!adapter.is_alive());
        adapter.kill();
    }
}
