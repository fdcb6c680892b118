//! ACP subprocess adapter
//!
//! One agent process per session. Updates the agent writes to stdout map one
//! to one onto envelopes; the `session/prompt` response closes the turn.

use super::{AdapterContext, PromptStream, ProviderDescriptor, TurnSlot};
use crate::acp::{AcpConnection, AcpEvent};
use crate::error::{Error, ProviderError, Result};
use crate::transport::ProcessCommand;
use crate::types::{
    AgentUpdate, ContentBlock, JsonRpcResponse, NotificationEnvelope, SessionUpdate, StopReason,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// How long a cancelled turn waits for the agent to acknowledge
const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub struct AcpProcessAdapter {
    provider_id: String,
    session_id: String,
    cwd: String,
    mode_id: Option<String>,
    command: ProcessCommand,
    request_timeout: Duration,
    connection: Mutex<Option<Arc<AcpConnection>>>,
    remote_session_id: Mutex<Option<String>>,
    alive: Arc<AtomicBool>,
    turn: Arc<TurnSlot>,
}

enum Step {
    Cancelled,
    Event(std::result::Result<AcpEvent, broadcast::error::RecvError>),
    Done(std::result::Result<JsonRpcResponse, oneshot::error::RecvError>),
}

impl AcpProcessAdapter {
    pub fn new(descriptor: &ProviderDescriptor, ctx: AdapterContext, request_timeout: Duration) -> Self {
        let command = ProcessCommand::new(descriptor.command.clone().unwrap_or_default())
            .args(descriptor.args.iter().cloned())
            .env(descriptor.env.clone())
            .cwd(ctx.cwd.clone());

        Self {
            provider_id: descriptor.id.clone(),
            session_id: ctx.session_id,
            cwd: ctx.cwd,
            mode_id: ctx.mode_id,
            command,
            request_timeout,
            connection: Mutex::new(None),
            remote_session_id: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
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

    pub fn remote_session_id(&self) -> Option<String> {
        self.remote_session_id.lock().clone()
    }

    /// Spawn the agent and run `initialize`. Calling again on a connected
    /// adapter is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.connection.lock().is_some() {
            return Ok(());
        }

        let connection =
            AcpConnection::spawn(&self.provider_id, &self.command, self.request_timeout).await?;
        if let Err(e) = connection.initialize().await {
            let _ = connection.terminate().await;
            return Err(e);
        }

        let connection = Arc::new(connection);
        let mut events = connection.subscribe();
        let alive = Arc::clone(&self.alive);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AcpEvent::Disconnected) | Err(broadcast::error::RecvError::Closed) => {
                        debug!("Agent process for session {} went away", session_id);
                        alive.store(false, Ordering::Release);
                        break;
                    }
                    _ => {}
                }
            }
        });

        self.alive.store(true, Ordering::Release);
        *self.connection.lock() = Some(connection);
        Ok(())
    }

    fn live_connection(&self) -> Result<Arc<AcpConnection>> {
        match self.connection.lock().as_ref() {
            Some(conn) if self.alive.load(Ordering::Acquire) => Ok(Arc::clone(conn)),
            _ => Err(ProviderError::ProcessNotRunning(self.session_id.clone()).into()),
        }
    }

    /// Open the agent-side session; returns the agent's session id
    pub async fn create_session(&self, _title: Option<&str>) -> Result<String> {
        self.connect().await?;
        let conn = self.live_connection()?;
        let remote = conn.new_session(&self.cwd).await?;
        info!(
            "Session {} bound to {} session {}",
            self.session_id, self.provider_id, remote
        );
        *self.remote_session_id.lock() = Some(remote.clone());

        if let Some(mode) = &self.mode_id {
            if let Err(e) = conn.set_mode(&remote, mode).await {
                warn!("Initial mode {} rejected for {}: {}", mode, self.session_id, e);
            }
        }
        Ok(remote)
    }

    pub async fn prompt_stream(&self, text: String) -> Result<PromptStream> {
        let conn = self.live_connection()?;
        let remote = self
            .remote_session_id()
            .ok_or_else(|| Error::from(ProviderError::ProcessNotRunning(self.session_id.clone())))?;
        let ticket = self.turn.begin(&self.session_id)?;

        // Subscribe before sending so no early update is lost.
        let mut events = conn.subscribe();
        let mut response_rx = conn.prompt(&remote, vec![ContentBlock::text(text)]).await?;

        let session_id = self.session_id.clone();
        let provider_id = self.provider_id.clone();
        let alive = Arc::clone(&self.alive);

        let stream = async_stream::stream! {
            loop {
                let step = tokio::select! {
                    biased;
                    _ = ticket.cancelled() => Step::Cancelled,
                    event = events.recv() => Step::Event(event),
                    response = &mut response_rx => Step::Done(response),
                };

                match step {
                    Step::Cancelled => {
                        if let Err(e) = conn.cancel(&remote).await {
                            warn!("Failed to send cancel for {}: {}", session_id, e);
                        }
                        if tokio::time::timeout(CANCEL_GRACE, &mut response_rx).await.is_err() {
                            debug!("Agent did not acknowledge cancel for {}", session_id);
                        }
                        yield Ok(NotificationEnvelope::turn_complete(
                            session_id.as_str(),
                            StopReason::Cancelled,
                            None,
                        ));
                        break;
                    }
                    Step::Event(Ok(AcpEvent::Update(notification))) => {
                        if notification.session_id != remote {
                            continue;
                        }
                        if let Some(update) = normalize_update(notification.update) {
                            yield Ok(NotificationEnvelope::new(session_id.as_str(), update));
                        }
                    }
                    Step::Event(Ok(AcpEvent::Disconnected))
                    | Step::Event(Err(broadcast::error::RecvError::Closed)) => {
                        alive.store(false, Ordering::Release);
                        yield Err(Error::from(ProviderError::Prompt(format!(
                            "{} exited mid-turn",
                            provider_id
                        ))));
                        break;
                    }
                    Step::Event(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        warn!("Session {} dropped {} agent updates", session_id, skipped);
                        yield Ok(NotificationEnvelope::error(
                            session_id.as_str(),
                            format!("{} agent updates were dropped", skipped),
                        ));
                    }
                    Step::Done(Ok(response)) => {
                        // Updates written before the response are already buffered.
                        while let Ok(event) = events.try_recv() {
                            if let AcpEvent::Update(notification) = event {
                                if notification.session_id != remote {
                                    continue;
                                }
                                if let Some(update) = normalize_update(notification.update) {
                                    yield Ok(NotificationEnvelope::new(session_id.as_str(), update));
                                }
                            }
                        }
                        match conn.protocol().parse_prompt_response(&response) {
                            Ok(result) => {
                                yield Ok(NotificationEnvelope::turn_complete(
                                    session_id.as_str(),
                                    result.stop_reason,
                                    result.usage,
                                ));
                            }
                            Err(e) => yield Err(e),
                        }
                        break;
                    }
                    Step::Done(Err(_)) => {
                        alive.store(false, Ordering::Release);
                        yield Err(Error::from(ProviderError::Prompt(format!(
                            "{} closed the connection before finishing the turn",
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

    pub async fn set_mode(&self, mode_id: &str) -> Result<()> {
        let conn = self.live_connection()?;
        let remote = self
            .remote_session_id()
            .ok_or_else(|| Error::from(ProviderError::ProcessNotRunning(self.session_id.clone())))?;
        conn.set_mode(&remote, mode_id).await
    }

    pub fn cancel(&self) {
        if self.turn.cancel() {
            debug!("Cancel requested for session {}", self.session_id);
        }
    }

    pub async fn kill(&self) {
        self.turn.cancel();
        self.alive.store(false, Ordering::Release);
        let connection = self.connection.lock().take();
        if let Some(conn) = connection {
            if let Err(e) = conn.terminate().await {
                warn!("Failed to terminate agent for {}: {}", self.session_id, e);
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && self.connection.lock().is_some()
    }
}

/// Map an ACP update onto the normalized set. Plans, mode changes, command
/// lists and echoed user chunks have no envelope kind and are dropped.
pub fn normalize_update(update: AgentUpdate) -> Option<SessionUpdate> {
    match update {
        AgentUpdate::AgentMessageChunk { content } => Some(SessionUpdate::AgentMessageChunk { content }),
        AgentUpdate::AgentThoughtChunk { content } => Some(SessionUpdate::AgentThoughtChunk { content }),
        AgentUpdate::ToolCall {
            tool_call_id,
            title,
            kind,
            status,
            raw_input,
        } => Some(SessionUpdate::ToolCall {
            tool_call_id,
            title,
            kind,
            status,
            raw_input,
        }),
        AgentUpdate::ToolCallUpdate {
            tool_call_id,
            status,
            title,
            content,
            raw_input,
            raw_output,
        } => Some(SessionUpdate::ToolCallUpdate {
            tool_call_id,
            title,
            status,
            content,
            raw_input,
            raw_output,
        }),
        AgentUpdate::UserMessageChunk { .. }
        | AgentUpdate::Plan { .. }
        | AgentUpdate::CurrentModeUpdate { .. }
        | AgentUpdate::AvailableCommandsUpdate { .. }
        | AgentUpdate::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentNotification, ToolCallStatus};
    use std::collections::HashMap;

    fn descriptor(command: &str) -> ProviderDescriptor {
        ProviderDescriptor::custom_acp("test-agent", "Test Agent", command, vec![])
            .with_env(HashMap::new())
    }

    #[test]
    fn test_normalize_update() {
        let n: AgentNotification = serde_json::from_value(serde_json::json!({
            "sessionId": "r1",
            "update": {
                "sessionUpdate": "tool_call",
                "toolCallId": "t1",
                "title": "read_file",
                "kind": "read",
                "status": "in_progress"
            }
        }))
        .unwrap();
        match normalize_update(n.update) {
            Some(SessionUpdate::ToolCall { tool_call_id, status, .. }) => {
                assert_eq!(tool_call_id, "t1");
                assert_eq!(status, ToolCallStatus::InProgress);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let plan: AgentNotification = serde_json::from_value(serde_json::json!({
            "sessionId": "r1",
            "sessionUpdate": "plan",
            "entries": []
        }))
        .unwrap();
        assert!(normalize_update(plan.update).is_none());
    }

    #[tokio::test]
    async fn test_prompt_without_process() {
        let adapter = AcpProcessAdapter::new(
            &descriptor("agent-that-does-not-exist-987"),
            AdapterContext {
                session_id: "s1".to_string(),
                cwd: ".".to_string(),
                ..Default::default()
            },
            Duration::from_secs(1),
        );

        assert!(!adapter.is_alive());
        assert!(matches!(
            adapter.prompt_stream("hi".to_string()).await,
            Err(Error::Provider(ProviderError::ProcessNotRunning(_)))
        ));
        assert!(matches!(
            adapter.connect().await,
            Err(Error::Provider(ProviderError::Connection { .. }))
        ));

        // Never connected: both are no-ops.
        adapter.cancel();
        adapter.kill().await;
        assert!(!adapter.is_alive());
    }
}
