//! Normalized notification envelope
//!
//! Every provider variant translates its own wire events into
//! [`SessionUpdate`]; the envelope adds the session and, for re-routed child
//! output, the originating agent.

use super::{ContentBlock, StopReason, TokenUsage, ToolCallContent, ToolCallKind, ToolCallStatus};
use serde::{Deserialize, Serialize};

/// One unit of streamed agent output for a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_session_id: Option<String>,
    pub update: SessionUpdate,
}

impl NotificationEnvelope {
    pub fn new(session_id: impl Into<String>, update: SessionUpdate) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: None,
            child_session_id: None,
            update,
        }
    }

    pub fn connected(session_id: impl Into<String>) -> Self {
        Self::new(session_id, SessionUpdate::Connected)
    }

    pub fn turn_complete(
        session_id: impl Into<String>,
        stop_reason: StopReason,
        usage: Option<TokenUsage>,
    ) -> Self {
        Self::new(session_id, SessionUpdate::TurnComplete { stop_reason, usage })
    }

    pub fn error(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            session_id,
            SessionUpdate::Error {
                message: message.into(),
            },
        )
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.update.kind()
    }

    /// Re-addresses a child envelope onto its parent's stream
    pub fn rerouted(&self, parent_session_id: &str, agent_id: &str) -> Self {
        Self {
            session_id: parent_session_id.to_string(),
            agent_id: Some(agent_id.to_string()),
            child_session_id: Some(self.session_id.clone()),
            update: self.update.clone(),
        }
    }
}

/// The closed set of normalized update kinds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    AgentMessageChunk {
        content: ContentBlock,
    },
    AgentThoughtChunk {
        content: ContentBlock,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ToolCallKind>,
        status: ToolCallStatus,
        #[serde(default, rename = "rawInput", skip_serializing_if = "Option::is_none")]
        raw_input: Option<serde_json::Value>,
    },
    ToolCallUpdate {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ToolCallStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Vec<ToolCallContent>>,
        #[serde(default, rename = "rawInput", skip_serializing_if = "Option::is_none")]
        raw_input: Option<serde_json::Value>,
        #[serde(default, rename = "rawOutput", skip_serializing_if = "Option::is_none")]
        raw_output: Option<serde_json::Value>,
    },
    TurnComplete {
        #[serde(rename = "stopReason")]
        stop_reason: StopReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    Error {
        message: String,
    },
    Connected,
}

impl SessionUpdate {
    pub fn message(text: impl Into<String>) -> Self {
        Self::AgentMessageChunk {
            content: ContentBlock::text(text),
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self::AgentThoughtChunk {
            content: ContentBlock::text(text),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::AgentMessageChunk { .. } => EnvelopeKind::MessageChunk,
            Self::AgentThoughtChunk { .. } => EnvelopeKind::ThoughtChunk,
            Self::ToolCall { .. } => EnvelopeKind::ToolCallStart,
            Self::ToolCallUpdate { .. } => EnvelopeKind::ToolCallUpdate,
            Self::TurnComplete { .. } => EnvelopeKind::TurnComplete,
            Self::Error { .. } => EnvelopeKind::Error,
            Self::Connected => EnvelopeKind::Connected,
        }
    }

    /// Tool name and input when this update describes a tool invocation
    pub fn tool_invocation(&self) -> Option<(&str, Option<&serde_json::Value>)> {
        match self {
            Self::ToolCall {
                title: Some(title),
                raw_input,
                ..
            }
            | Self::ToolCallUpdate {
                title: Some(title),
                raw_input,
                ..
            } => Some((title.as_str(), raw_input.as_ref())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    MessageChunk,
    ThoughtChunk,
    ToolCallStart,
    ToolCallUpdate,
    TurnComplete,
    Error,
    Connected,
}
