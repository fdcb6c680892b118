//! ACP connection to one agent process
//!
//! Owns the child process, correlates JSON-RPC responses with pending
//! requests, fans `session/update` notifications out over a broadcast channel
//! and answers agent-originated requests.

use super::protocol::{AcpMessage, ProtocolHandler};
use crate::error::{Error, ProviderError, Result};
use crate::transport::{ProcessCommand, Transport};
use crate::types::{
    AgentNotification, AuthMethod, ContentBlock, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, RequestPermissionParams,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Events fanned out to prompt streams
#[derive(Debug, Clone)]
pub enum AcpEvent {
    Update(AgentNotification),
    /// The agent closed stdout (exited or crashed)
    Disconnected,
}

/// ACP Connection for communicating with an agent
pub struct AcpConnection {
    name: String,
    protocol: ProtocolHandler,
    transport: Arc<Transport>,
    child: Mutex<Child>,
    init: RwLock<Option<InitializeResult>>,
    pending_requests: PendingRequests,
    event_tx: broadcast::Sender<AcpEvent>,
    request_timeout: Duration,
    _message_task: tokio::task::JoinHandle<()>,
}

impl AcpConnection {
    /// Spawn the agent process and start the message loop
    pub async fn spawn(
        name: impl Into<String>,
        command: &ProcessCommand,
        request_timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        info!("Connecting to agent: {} ({})", name, command.program);

        let (transport, child) = Transport::spawn(command).await?;
        let transport = Arc::new(transport);
        let pending_requests: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, _) = broadcast::channel(256);

        let message_task = tokio::spawn(Self::message_loop(
            Arc::clone(&transport),
            Arc::clone(&pending_requests),
            event_tx.clone(),
        ));

        Ok(Self {
            name,
            protocol: ProtocolHandler::new(),
            transport,
            child: Mutex::new(child),
            init: RwLock::new(None),
            pending_requests,
            event_tx,
            request_timeout,
            _message_task: message_task,
        })
    }

    /// Run the initialize handshake
    pub async fn initialize(&self) -> Result<InitializeResult> {
        info!("Initializing ACP connection for {}", self.name);

        let request = self.protocol.create_initialize_request()?;
        let response = self.send_request(request).await?;
        let init = self.protocol.parse_initialize_response(&response)?;

        *self.init.write().await = Some(init.clone());
        info!("ACP connection initialized for {}", self.name);
        Ok(init)
    }

    /// Auth methods advertised during initialize
    pub async fn auth_methods(&self) -> Vec<AuthMethod> {
        self.init
            .read()
            .await
            .as_ref()
            .map(|i| i.auth_methods.clone())
            .unwrap_or_default()
    }

    /// Create a session on the agent; returns the agent's session id
    pub async fn new_session(&self, cwd: &str) -> Result<String> {
        debug!("Creating new session (cwd: {})", cwd);
        let request = self.protocol.create_session_new_request(cwd)?;
        let response = self.send_request(request).await?;
        let auth_methods = self.auth_methods().await;
        let result = self
            .protocol
            .parse_session_new_response(&response, &auth_methods)?;
        Ok(result.session_id)
    }

    /// Send session/prompt; the returned receiver resolves when the turn ends.
    /// No timeout is applied since a turn can run arbitrarily long.
    pub async fn prompt(
        &self,
        session_id: &str,
        content: Vec<ContentBlock>,
    ) -> Result<oneshot::Receiver<JsonRpcResponse>> {
        debug!("Sending prompt to session: {}", session_id);
        let request = self
            .protocol
            .create_session_prompt_request(session_id, content)?;
        self.send_request_with_receiver(request).await
    }

    pub fn protocol(&self) -> &ProtocolHandler {
        &self.protocol
    }

    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        debug!("Cancelling session: {}", session_id);
        let notification = self.protocol.create_session_cancel_notification(session_id);
        self.transport.send(&notification).await
    }

    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<()> {
        debug!("Setting mode for session {}: {}", session_id, mode_id);
        let request = self
            .protocol
            .create_session_set_mode_request(session_id, mode_id)?;
        let response = self.send_request(request).await?;
        self.protocol.parse_void_response(&response)
    }

    /// Subscribe to agent events. Subscribe before sending the request whose
    /// updates you want, or early notifications are missed.
    pub fn subscribe(&self) -> broadcast::Receiver<AcpEvent> {
        self.event_tx.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    pub async fn terminate(&self) -> Result<()> {
        info!("Terminating agent: {}", self.name);
        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            debug!("Agent {} already exited: {}", self.name, status);
            return Ok(());
        }
        child.kill().await.map_err(|e| {
            Error::Provider(ProviderError::connection(format!(
                "Failed to kill agent: {}",
                e
            )))
        })
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let rx = self.send_request_with_receiver(request).await?;

        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| Error::Provider(ProviderError::Timeout))?
            .map_err(|_| {
                Error::Provider(ProviderError::connection(format!(
                    "{} exited before responding",
                    self.name
                )))
            })
    }

    async fn send_request_with_receiver(
        &self,
        request: JsonRpcRequest,
    ) -> Result<oneshot::Receiver<JsonRpcResponse>> {
        let request_id = request.id.as_ref().and_then(|v| v.as_u64()).ok_or_else(|| {
            ProviderError::InvalidMessage("Request missing ID".to_string())
        })?;

        debug!("Sending request {} method={}", request_id, request.method);

        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().await.insert(request_id, tx);

        if let Err(e) = self.transport.send(&request).await {
            self.pending_requests.lock().await.remove(&request_id);
            return Err(e);
        }

        Ok(rx)
    }

    async fn message_loop(
        transport: Arc<Transport>,
        pending_requests: PendingRequests,
        event_tx: broadcast::Sender<AcpEvent>,
    ) {
        let protocol = ProtocolHandler::new();
        let mut buffer = String::new();

        loop {
            let line = match transport.recv_line().await {
                Some(line) => line,
                None => {
                    debug!("Transport closed");
                    // Dropping the senders wakes every waiting request.
                    pending_requests.lock().await.clear();
                    let _ = event_tx.send(AcpEvent::Disconnected);
                    break;
                }
            };

            let Some(value) = Self::accumulate_json(&mut buffer, &line) else {
                continue;
            };

            match protocol.parse_message(&value) {
                Ok(AcpMessage::Response(response)) => {
                    if let Some(id) = response.id.as_ref().and_then(|v| v.as_u64()) {
                        match pending_requests.lock().await.remove(&id) {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => warn!("Received response for unknown request: {}", id),
                        }
                    }
                }
                Ok(AcpMessage::SessionUpdate(notification)) => {
                    trace!(
                        "Session update for {}: {:?}",
                        notification.session_id,
                        notification.update
                    );
                    if event_tx.send(AcpEvent::Update(notification)).is_err() {
                        trace!("No receivers for session update");
                    }
                }
                Ok(AcpMessage::AgentRequest(request)) => {
                    let response = Self::handle_agent_request(&protocol, &request);
                    if let Err(e) = transport.send(&response).await {
                        error!("Failed to send response: {}", e);
                    }
                }
                Ok(AcpMessage::Unknown(value)) => {
                    trace!("Unknown message: {}", value);
                }
                Err(e) => {
                    error!("Failed to parse message: {}", e);
                }
            }
        }
    }

    /// Buffer stdout lines until they form one JSON value. Agents sometimes
    /// pretty-print or prefix log noise; oversized garbage is dropped.
    fn accumulate_json(buffer: &mut String, line: &str) -> Option<serde_json::Value> {
        if !buffer.is_empty() {
            buffer.push('\n');
        }
        buffer.push_str(line);

        if buffer.len() > 1024 * 1024 {
            warn!("Dropping oversized stdout buffer ({} bytes)", buffer.len());
            buffer.clear();
            return None;
        }

        match serde_json::from_str::<serde_json::Value>(buffer) {
            Ok(v) => {
                buffer.clear();
                Some(v)
            }
            Err(e) if e.is_eof() => None,
            Err(e) => {
                debug!("Ignoring non-JSON agent output ({})", e);
                buffer.clear();
                let start = line.find(['{', '['])?;
                buffer.push_str(&line[start..]);
                match serde_json::from_str::<serde_json::Value>(buffer) {
                    Ok(v) => {
                        buffer.clear();
                        Some(v)
                    }
                    Err(e) if e.is_eof() => None,
                    Err(_) => {
                        buffer.clear();
                        None
                    }
                }
            }
        }
    }

    /// Tool execution is external: permissions are granted, anything else
    /// the agent asks of the client is reported as unsupported.
    fn handle_agent_request(protocol: &ProtocolHandler, request: &JsonRpcRequest) -> JsonRpcResponse {
        let request_id = request.id.clone().unwrap_or(serde_json::Value::Null);
        let params = request.params.clone().unwrap_or(serde_json::Value::Null);

        match request.method.as_str() {
            "session/request_permission" => {
                match serde_json::from_value::<RequestPermissionParams>(params) {
                    Ok(p) => protocol.create_permission_response(request_id, &p),
                    Err(e) => protocol.create_error_response(request_id, -32602, &e.to_string()),
                }
            }
            other => protocol.create_error_response(
                request_id,
                -32601,
                &format!("Unsupported method: {}", other),
            ),
        }
    }
}

impl Drop for AcpConnection {
    fn drop(&mut self) {
        self._message_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_multiline_json() {
        let mut buffer = String::new();
        assert!(AcpConnection::accumulate_json(&mut buffer, "{\"a\":").is_none());
        let value = AcpConnection::accumulate_json(&mut buffer, "1}").unwrap();
        assert_eq!(value["a"], 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_accumulate_skips_log_prefix() {
        let mut buffer = String::new();
        let value =
            AcpConnection::accumulate_json(&mut buffer, "ready: {\"jsonrpc\":\"2.0\"}").unwrap();
        assert_eq!(value["jsonrpc"], "2.0");

        let mut buffer = String::new();
        assert!(AcpConnection::accumulate_json(&mut buffer, "plain log line").is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unsupported_agent_request() {
        let protocol = ProtocolHandler::new();
        let request = JsonRpcRequest::new(
            7,
            "fs/write_text_file",
            Some(serde_json::json!({ "sessionId": "s", "path": "/x", "content": "" })),
        );
        let response = AcpConnection::handle_agent_request(&protocol, &request);
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let result = AcpConnection::spawn(
            "missing",
            &ProcessCommand::new("definitely-not-an-acp-agent-1234"),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(
            result,
            Err(Error::Provider(ProviderError::Connection { .. }))
        ));
    }
}
