//! ACP (Agent Client Protocol) type definitions
//!
//! Based on the ACP specification at https://agentclientprotocol.com

use serde::{de, Deserialize, Deserializer, Serialize};

/// ACP Protocol version supported by this client
pub const ACP_PROTOCOL_VERSION: u32 = 1;

/// Client information sent during initialization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "Routa".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Client capabilities declared during initialization.
///
/// Tool execution lives outside this process, so file system and terminal
/// access are never advertised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub fs: FsCapability,
    pub terminal: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            fs: FsCapability {
                read_text_file: false,
                write_text_file: false,
            },
            terminal: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FsCapability {
    pub read_text_file: bool,
    pub write_text_file: bool,
}

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(
        id: impl Into<serde_json::Value>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<serde_json::Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&crate::Error> for JsonRpcError {
    fn from(err: &crate::Error) -> Self {
        Self {
            code: err.rpc_code(),
            message: err.to_string(),
            data: err.rpc_data(),
        }
    }
}

impl From<crate::Error> for JsonRpcError {
    fn from(err: crate::Error) -> Self {
        Self::from(&err)
    }
}

/// Authentication option advertised by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethod {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Initialize request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: u32,
    pub client_info: ClientInfo,
    pub client_capabilities: ClientCapabilities,
}

/// Initialize response
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: u32,
    #[serde(default)]
    pub agent_info: Option<AgentInfo>,
    #[serde(default)]
    pub agent_capabilities: Option<serde_json::Value>,
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
}

/// Agent information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Session/new request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewParams {
    pub cwd: String,
    /// Gemini CLI requires this to be an array (not undefined)
    #[serde(default)]
    pub mcp_servers: Vec<serde_json::Value>,
}

/// Session/new response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewResult {
    pub session_id: String,
}

/// Session/prompt request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPromptParams {
    pub session_id: String,
    pub prompt: Vec<super::ContentBlock>,
}

/// Prompt response (completion)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub stop_reason: StopReason,
    #[serde(default)]
    pub usage: Option<super::TokenUsage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
    Error,
}

impl StopReason {
    /// Whether a turn ending this way counts as a successful completion
    pub fn is_success(self) -> bool {
        matches!(
            self,
            StopReason::EndTurn | StopReason::MaxTokens | StopReason::MaxTurnRequests
        )
    }
}

/// Session update notification sent by an ACP agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNotification {
    pub session_id: String,
    pub update: AgentUpdate,
}

impl<'de> Deserialize<'de> for AgentNotification {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;

        // ACP shape:
        // { "sessionId": "...", "update": { "sessionUpdate": "...", ... } }
        if value.get("update").is_some() {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Wrapped {
                session_id: String,
                update: AgentUpdate,
            }

            let wrapped: Wrapped = serde_json::from_value(value).map_err(de::Error::custom)?;
            Ok(Self {
                session_id: wrapped.session_id,
                update: wrapped.update,
            })
        } else {
            // Some agents flatten the union at the top level:
            // { "sessionId": "...", "sessionUpdate": "...", ... }
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Flat {
                session_id: String,
                #[serde(flatten)]
                update: AgentUpdate,
            }

            let flat: Flat = serde_json::from_value(value).map_err(de::Error::custom)?;
            Ok(Self {
                session_id: flat.session_id,
                update: flat.update,
            })
        }
    }
}

/// Session update union as produced by ACP agents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum AgentUpdate {
    AgentMessageChunk {
        content: super::ContentBlock,
    },
    UserMessageChunk {
        content: super::ContentBlock,
    },
    #[serde(alias = "thought")]
    AgentThoughtChunk {
        content: super::ContentBlock,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        kind: Option<ToolCallKind>,
        #[serde(default)]
        status: ToolCallStatus,
        #[serde(default, rename = "rawInput")]
        raw_input: Option<serde_json::Value>,
    },
    ToolCallUpdate {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default)]
        status: Option<ToolCallStatus>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        content: Option<Vec<ToolCallContent>>,
        #[serde(default, rename = "rawInput")]
        raw_input: Option<serde_json::Value>,
        #[serde(default, rename = "rawOutput")]
        raw_output: Option<serde_json::Value>,
    },
    Plan {
        entries: Vec<super::PlanEntry>,
    },
    CurrentModeUpdate {
        #[serde(rename = "currentModeId", alias = "modeId")]
        mode_id: String,
    },
    AvailableCommandsUpdate {
        #[serde(rename = "availableCommands")]
        available_commands: Vec<AvailableCommand>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    Read,
    Edit,
    Delete,
    Move,
    Search,
    Execute,
    Think,
    Fetch,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    Content {
        content: super::ContentBlock,
    },
    Diff {
        path: String,
        #[serde(default, rename = "oldText")]
        old_text: Option<String>,
        #[serde(rename = "newText")]
        new_text: String,
    },
    Terminal {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
}

impl ToolCallContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Content {
            content: super::ContentBlock::text(text),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableCommand {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// session/request_permission request from agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    pub session_id: String,
    #[serde(default)]
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}
