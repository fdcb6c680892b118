//! ACP Protocol message handling

use crate::error::{Error, ProviderError, Result};
use crate::types::{
    AgentNotification, AuthMethod, ClientCapabilities, ClientInfo, ContentBlock,
    InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    PromptResponse, RequestPermissionParams, SessionNewParams, SessionNewResult,
    SessionPromptParams, ACP_PROTOCOL_VERSION,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// JSON-RPC code agents use for "authentication required"
pub const AUTH_REQUIRED_CODE: i32 = -32000;

/// Protocol handler for ACP messages
pub struct ProtocolHandler {
    request_id: AtomicU64,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            request_id: AtomicU64::new(1),
        }
    }

    /// Generate next request ID
    pub fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn request<P: serde::Serialize>(&self, method: &str, params: P) -> Result<JsonRpcRequest> {
        Ok(JsonRpcRequest::new(
            self.next_id(),
            method,
            Some(serde_json::to_value(params)?),
        ))
    }

    pub fn create_initialize_request(&self) -> Result<JsonRpcRequest> {
        self.request(
            "initialize",
            InitializeParams {
                protocol_version: ACP_PROTOCOL_VERSION,
                client_info: ClientInfo::default(),
                client_capabilities: ClientCapabilities::default(),
            },
        )
    }

    pub fn create_session_new_request(&self, cwd: &str) -> Result<JsonRpcRequest> {
        self.request(
            "session/new",
            SessionNewParams {
                cwd: cwd.to_string(),
                mcp_servers: Vec::new(),
            },
        )
    }

    pub fn create_session_prompt_request(
        &self,
        session_id: &str,
        prompt: Vec<ContentBlock>,
    ) -> Result<JsonRpcRequest> {
        self.request(
            "session/prompt",
            SessionPromptParams {
                session_id: session_id.to_string(),
                prompt,
            },
        )
    }

    /// session/cancel is a notification; agents answer the pending prompt instead
    pub fn create_session_cancel_notification(&self, session_id: &str) -> JsonRpcRequest {
        JsonRpcRequest::notification(
            "session/cancel",
            Some(serde_json::json!({ "sessionId": session_id })),
        )
    }

    pub fn create_session_set_mode_request(
        &self,
        session_id: &str,
        mode_id: &str,
    ) -> Result<JsonRpcRequest> {
        self.request(
            "session/set_mode",
            serde_json::json!({
                "sessionId": session_id,
                "modeId": mode_id,
            }),
        )
    }

    fn check_error(
        &self,
        response: &JsonRpcResponse,
        what: &str,
        auth_methods: &[AuthMethod],
    ) -> Result<()> {
        if let Some(error) = &response.error {
            if error.code == AUTH_REQUIRED_CODE {
                return Err(Error::Provider(ProviderError::Connection {
                    message: format!("{} requires authentication: {}", what, error.message),
                    auth_methods: auth_methods.to_vec(),
                }));
            }
            return Err(Error::Provider(ProviderError::InvalidMessage(format!(
                "{} failed: {} (code {})",
                what, error.message, error.code
            ))));
        }
        Ok(())
    }

    fn result<'a>(&self, response: &'a JsonRpcResponse, what: &str) -> Result<&'a serde_json::Value> {
        response.result.as_ref().ok_or_else(|| {
            Error::Provider(ProviderError::InvalidMessage(format!(
                "Missing result in {} response",
                what
            )))
        })
    }

    pub fn parse_initialize_response(&self, response: &JsonRpcResponse) -> Result<InitializeResult> {
        if let Some(error) = &response.error {
            return Err(Error::Provider(ProviderError::connection(format!(
                "Initialize failed: {} (code {})",
                error.message, error.code
            ))));
        }
        let init: InitializeResult =
            serde_json::from_value(self.result(response, "initialize")?.clone())?;

        if init.protocol_version != ACP_PROTOCOL_VERSION {
            warn!(
                "Protocol version mismatch: expected {}, got {}",
                ACP_PROTOCOL_VERSION, init.protocol_version
            );
        }
        match &init.agent_info {
            Some(info) => debug!("Agent initialized: {} v{}", info.name, info.version),
            None => debug!("Agent initialized (no agent info provided)"),
        }

        Ok(init)
    }

    /// Parse session/new; auth failures carry the methods advertised at initialize
    pub fn parse_session_new_response(
        &self,
        response: &JsonRpcResponse,
        auth_methods: &[AuthMethod],
    ) -> Result<SessionNewResult> {
        self.check_error(response, "Session creation", auth_methods)?;
        let result: SessionNewResult =
            serde_json::from_value(self.result(response, "session/new")?.clone())?;
        debug!("Session created: {}", result.session_id);
        Ok(result)
    }

    pub fn parse_prompt_response(&self, response: &JsonRpcResponse) -> Result<PromptResponse> {
        if let Some(error) = &response.error {
            return Err(Error::Provider(ProviderError::Prompt(format!(
                "{} (code {})",
                error.message, error.code
            ))));
        }
        Ok(serde_json::from_value(
            self.result(response, "session/prompt")?.clone(),
        )?)
    }

    pub fn parse_void_response(&self, response: &JsonRpcResponse) -> Result<()> {
        self.check_error(response, "Request", &[])
    }

    /// Parse incoming message (could be response, notification, or request)
    pub fn parse_message(&self, value: &serde_json::Value) -> Result<AcpMessage> {
        if value.get("id").is_some()
            && (value.get("result").is_some() || value.get("error").is_some())
        {
            let response: JsonRpcResponse = serde_json::from_value(value.clone())?;
            return Ok(AcpMessage::Response(response));
        }

        if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
            if value.get("id").is_none() {
                return self.parse_notification(method, value);
            }
            let request: JsonRpcRequest = serde_json::from_value(value.clone())?;
            return Ok(AcpMessage::AgentRequest(request));
        }

        Err(Error::Provider(ProviderError::InvalidMessage(format!(
            "Unknown message type: {}",
            value
        ))))
    }

    fn parse_notification(&self, method: &str, value: &serde_json::Value) -> Result<AcpMessage> {
        match method {
            "session/update" => {
                let params = value.get("params").ok_or_else(|| {
                    ProviderError::InvalidMessage("Missing params in session/update".to_string())
                })?;
                let notification: AgentNotification = serde_json::from_value(params.clone())?;
                Ok(AcpMessage::SessionUpdate(notification))
            }
            _ => {
                trace!("Ignoring notification: {}", method);
                Ok(AcpMessage::Unknown(value.clone()))
            }
        }
    }

    /// Answer session/request_permission with the first allowing option
    pub fn create_permission_response(
        &self,
        request_id: serde_json::Value,
        params: &RequestPermissionParams,
    ) -> JsonRpcResponse {
        let chosen = params
            .options
            .iter()
            .find(|o| o.kind.as_deref().is_some_and(|k| k.starts_with("allow")))
            .or_else(|| params.options.first());

        let outcome = match chosen {
            Some(option) => serde_json::json!({
                "outcome": { "outcome": "selected", "optionId": option.option_id }
            }),
            None => serde_json::json!({ "outcome": { "outcome": "cancelled" } }),
        };
        JsonRpcResponse::success(Some(request_id), outcome)
    }

    pub fn create_error_response(
        &self,
        request_id: serde_json::Value,
        code: i32,
        message: &str,
    ) -> JsonRpcResponse {
        JsonRpcResponse::failure(Some(request_id), JsonRpcError::new(code, message))
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed ACP message types
#[derive(Debug, Clone)]
pub enum AcpMessage {
    /// Response to our request
    Response(JsonRpcResponse),
    /// Session update notification
    SessionUpdate(AgentNotification),
    /// Request from agent (permissions, fs/*, terminal/*)
    AgentRequest(JsonRpcRequest),
    Unknown(serde_json::Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentUpdate, PermissionOption};

    #[test]
    fn test_protocol_handler_request_ids() {
        let handler = ProtocolHandler::new();
        assert_eq!(handler.next_id(), 1);
        assert_eq!(handler.next_id(), 2);
        assert_eq!(handler.next_id(), 3);
    }

    #[test]
    fn test_create_initialize_request() {
        let handler = ProtocolHandler::new();
        let request = handler.create_initialize_request().unwrap();

        assert_eq!(request.method, "initialize");
        let params = request.params.unwrap();
        assert_eq!(params["protocolVersion"], ACP_PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], "Routa");
        assert_eq!(params["clientCapabilities"]["terminal"], false);
    }

    #[test]
    fn test_cancel_is_notification() {
        let handler = ProtocolHandler::new();
        let cancel = handler.create_session_cancel_notification("s1");
        assert!(cancel.id.is_none());
        let json = serde_json::to_value(&cancel).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["params"]["sessionId"], "s1");
    }

    #[test]
    fn test_session_new_auth_error() {
        let handler = ProtocolHandler::new();
        let response = JsonRpcResponse::failure(
            Some(serde_json::json!(2)),
            JsonRpcError::new(AUTH_REQUIRED_CODE, "Authentication required"),
        );
        let methods = vec![AuthMethod {
            id: "login".to_string(),
            name: "Log in with Google".to_string(),
            description: None,
        }];

        match handler.parse_session_new_response(&response, &methods) {
            Err(Error::Provider(p)) => assert!(p.needs_authentication()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_prompt_response() {
        let handler = ProtocolHandler::new();
        let response = JsonRpcResponse::success(
            Some(serde_json::json!(3)),
            serde_json::json!({ "stopReason": "end_turn" }),
        );
        let parsed = handler.parse_prompt_response(&response).unwrap();
        assert_eq!(parsed.stop_reason, crate::types::StopReason::EndTurn);
        assert!(parsed.usage.is_none());
    }

    #[test]
    fn test_parse_message_session_update() {
        let handler = ProtocolHandler::new();
        let value = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {
                "sessionId": "test-session",
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": { "type": "text", "text": "Hello" }
                }
            }
        });

        match handler.parse_message(&value).unwrap() {
            AcpMessage::SessionUpdate(n) => {
                assert_eq!(n.session_id, "test-session");
                assert!(matches!(n.update, AgentUpdate::AgentMessageChunk { .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_message_agent_request() {
        let handler = ProtocolHandler::new();
        let value = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "fs/read_text_file",
            "params": { "sessionId": "test-session", "path": "/home/user/file.txt" }
        });

        let msg = handler.parse_message(&value).unwrap();
        assert!(matches!(msg, AcpMessage::AgentRequest(_)));
    }

    #[test]
    fn test_permission_prefers_allow_option() {
        let handler = ProtocolHandler::new();
        let params = RequestPermissionParams {
            session_id: "s1".to_string(),
            options: vec![
                PermissionOption {
                    option_id: "reject".to_string(),
                    name: None,
                    kind: Some("reject_once".to_string()),
                },
                PermissionOption {
                    option_id: "allow".to_string(),
                    name: None,
                    kind: Some("allow_once".to_string()),
                },
            ],
        };
        let response = handler.create_permission_response(serde_json::json!(9), &params);
        let result = response.result.unwrap();
        assert_eq!(result["outcome"]["optionId"], "allow");
    }
}
