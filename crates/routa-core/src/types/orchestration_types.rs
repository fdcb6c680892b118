//! Agent and delegation records kept by the orchestrator

use super::AgentRole;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Completed,
    Failed,
}

/// One agent bound to one session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: String,
    pub role: AgentRole,
    pub workspace_id: String,
    pub bound_session_id: String,
    #[serde(default)]
    pub parent_agent_id: Option<String>,
    pub status: AgentStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Created,
    Delegated,
    Running,
    Completed,
    Failed,
}

impl DelegationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DelegationStatus::Completed | DelegationStatus::Failed)
    }
}

/// Link between a delegated task, its caller and the worker running it.
///
/// A `created` task has no worker yet. Both ids are filled in together when
/// the child session exists, and stay empty if it never could be created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DelegationRecord {
    pub task_id: String,
    pub caller_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_session_id: Option<String>,
    pub parent_session_id: String,
    pub role: AgentRole,
    pub status: DelegationStatus,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A sub-task a coordinator hands to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationTask {
    pub prompt: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl DelegationTask {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            provider: None,
            title: None,
        }
    }
}
