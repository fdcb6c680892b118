//! Chat-completions adapter
//!
//! No session exists server side: the conversation history lives here and
//! is replayed in full on every request.

use super::{AdapterContext, PromptStream, ProviderDescriptor, SseAccumulator, TurnSlot};
use crate::config::ProviderSettings;
use crate::error::{Error, ProviderError, Result};
use crate::types::{AuthMethod, NotificationEnvelope, SessionUpdate, StopReason, TokenUsage};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

pub struct DirectChatAdapter {
    provider_id: String,
    session_id: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    history: Arc<Mutex<Vec<ChatMessage>>>,
    alive: AtomicBool,
    turn: Arc<TurnSlot>,
}

enum Step {
    Cancelled,
    Chunk(Option<reqwest::Result<Vec<u8>>>),
}

impl DirectChatAdapter {
    pub fn new(descriptor: &ProviderDescriptor, ctx: AdapterContext, settings: &ProviderSettings) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            provider_id: descriptor.id.clone(),
            session_id: ctx.session_id,
            client,
            base_url: settings.chat_base_url.trim_end_matches('/').to_string(),
            api_key: settings.chat_api_key.clone(),
            model: ctx.model.unwrap_or_else(|| settings.chat_model.clone()),
            history: Arc::new(Mutex::new(Vec::new())),
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

    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().clone()
    }

    fn auth_error(message: impl Into<String>) -> Error {
        ProviderError::Connection {
            message: message.into(),
            auth_methods: vec![AuthMethod {
                id: "api-key".to_string(),
                name: "API key".to_string(),
                description: Some("Set ROUTA_CHAT_API_KEY or OPENAI_API_KEY".to_string()),
            }],
        }
        .into()
    }

    pub async fn connect(&self) -> Result<()> {
        if self.api_key.is_none() {
            return Err(Self::auth_error("No chat API key configured"));
        }
        self.alive.store(true, Ordering::Release);
        Ok(())
    }

    /// Start over with an empty history
    pub async fn create_session(&self, _title: Option<&str>) -> Result<()> {
        self.connect().await?;
        self.history.lock().clear();
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.connect().await
    }

    pub async fn prompt_stream(&self, text: String) -> Result<PromptStream> {
        if !self.is_alive() {
            return Err(ProviderError::ProcessNotRunning(self.session_id.clone()).into());
        }
        let ticket = self.turn.begin(&self.session_id)?;

        let messages = {
            let mut history = self.history.lock();
            history.push(ChatMessage::user(text));
            history.clone()
        };
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true }
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.history.lock().pop();
                return Err(e.into());
            }
        };
        let status = response.status();
        if !status.is_success() {
            self.history.lock().pop();
            let detail = response.text().await.unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED {
                return Err(Self::auth_error(format!("Chat endpoint rejected the key: {}", detail)));
            }
            return Err(ProviderError::Prompt(format!("chat endpoint returned {}: {}", status, detail)).into());
        }

        let session_id = self.session_id.clone();
        let history = Arc::clone(&self.history);

        let stream = async_stream::stream! {
            let mut chunks = response.bytes_stream();
            let mut sse = SseAccumulator::new();
            let mut splitter = ChatDeltaSplitter::new();

            'turn: loop {
                let step = tokio::select! {
                    biased;
                    _ = ticket.cancelled() => Step::Cancelled,
                    chunk = chunks.next() => Step::Chunk(chunk.map(|c| c.map(|b| b.to_vec()))),
                };

                let payloads = match step {
                    Step::Cancelled => {
                        settle_history(&history, splitter.content());
                        yield Ok(NotificationEnvelope::turn_complete(
                            session_id.as_str(),
                            StopReason::Cancelled,
                            splitter.usage(),
                        ));
                        break 'turn;
                    }
                    Step::Chunk(Some(Ok(bytes))) => sse.push(&bytes),
                    Step::Chunk(Some(Err(e))) => {
                        settle_history(&history, splitter.content());
                        yield Err(Error::from(ProviderError::Prompt(format!(
                            "chat stream failed: {}",
                            e
                        ))));
                        break 'turn;
                    }
                    Step::Chunk(None) => {
                        let tail: Vec<String> = sse.finish().into_iter().collect();
                        if tail.is_empty() && splitter.finish_reason().is_none() {
                            settle_history(&history, splitter.content());
                            yield Err(Error::from(ProviderError::Prompt(
                                "chat stream closed before completion".to_string(),
                            )));
                            break 'turn;
                        }
                        let mut tail = tail;
                        tail.push("[DONE]".to_string());
                        tail
                    }
                };

                for payload in payloads {
                    if payload.trim() == "[DONE]" {
                        history.lock().push(ChatMessage::assistant(splitter.content()));
                        yield Ok(NotificationEnvelope::turn_complete(
                            session_id.as_str(),
                            splitter.stop_reason(),
                            splitter.usage(),
                        ));
                        break 'turn;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        debug!("Skipping unparsable chat chunk");
                        continue;
                    };
                    if let Some(message) = value["error"]["message"].as_str() {
                        warn!("Chat endpoint reported an error for {}: {}", session_id, message);
                        settle_history(&history, splitter.content());
                        yield Ok(NotificationEnvelope::error(session_id.as_str(), message));
                        yield Ok(NotificationEnvelope::turn_complete(
                            session_id.as_str(),
                            StopReason::Error,
                            splitter.usage(),
                        ));
                        break 'turn;
                    }
                    for update in splitter.split(&value) {
                        yield Ok(NotificationEnvelope::new(session_id.as_str(), update));
                    }
                }
            }
            drop(ticket);
        };

        Ok(stream.boxed())
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

/// Close out a turn that ended early. A partial reply is kept; a turn that
/// produced nothing drops its user message so the history keeps alternating.
fn settle_history(history: &Mutex<Vec<ChatMessage>>, reply: &str) {
    let mut history = history.lock();
    if !reply.is_empty() {
        history.push(ChatMessage::assistant(reply));
    } else if history.last().is_some_and(|m| m.role == "user") {
        history.pop();
    }
}

/// Routes streamed chat deltas to the thought or message channel and keeps
/// what the turn needs at the end: the reply text, usage and finish reason.
#[derive(Debug, Default)]
pub struct ChatDeltaSplitter {
    content: String,
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
}

impl ChatDeltaSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn split(&mut self, chunk: &Value) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();

        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            self.usage = Some(TokenUsage::new(
                usage["prompt_tokens"].as_u64().unwrap_or(0),
                usage["completion_tokens"].as_u64().unwrap_or(0),
            ));
        }

        for choice in chunk["choices"].as_array().into_iter().flatten() {
            let delta = &choice["delta"];
            if let Some(reasoning) = delta["reasoning_content"]
                .as_str()
                .or_else(|| delta["reasoning"].as_str())
                .filter(|s| !s.is_empty())
            {
                updates.push(SessionUpdate::thought(reasoning));
            }
            if let Some(content) = delta["content"].as_str().filter(|s| !s.is_empty()) {
                self.content.push_str(content);
                updates.push(SessionUpdate::message(content));
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                self.finish_reason = Some(reason.to_string());
            }
        }
        updates
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn stop_reason(&self) -> StopReason {
        match self.finish_reason.as_deref() {
            Some("length") => StopReason::MaxTokens,
            Some("content_filter") => StopReason::Refusal,
            _ => StopReason::EndTurn,
        }
    }
}
