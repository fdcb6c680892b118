//! Session metadata types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role an agent session plays in a delegation hierarchy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    Coordinator,
    Worker,
    Verifier,
    #[default]
    Plain,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => "COORDINATOR",
            AgentRole::Worker => "WORKER",
            AgentRole::Verifier => "VERIFIER",
            AgentRole::Plain => "PLAIN",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COORDINATOR" | "ROUTA" => Ok(AgentRole::Coordinator),
            "WORKER" | "CRAFTER" => Ok(AgentRole::Worker),
            "VERIFIER" | "GATE" => Ok(AgentRole::Verifier),
            "PLAIN" | "" => Ok(AgentRole::Plain),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Persisted metadata for one session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub provider: String,
    /// Session id on the backend side, when the backend keeps one
    #[serde(default)]
    pub provider_session_id: Option<String>,
    pub cwd: String,
    pub workspace_id: String,
    pub role: AgentRole,
    #[serde(default)]
    pub mode_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub parent_session_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Options for creating a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionOptions {
    pub provider: String,
    pub cwd: String,
    #[serde(default)]
    pub mode_id: Option<String>,
    #[serde(default)]
    pub role: Option<AgentRole>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_session_id: Option<String>,
}

impl NewSessionOptions {
    pub fn new(provider: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_parent(mut self, parent_session_id: impl Into<String>) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of creating (or re-resolving) a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    pub session_id: String,
    pub provider: String,
    pub role: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routa_agent_id: Option<String>,
}
