//! Error types for Routa Core

use crate::types::AuthMethod;
use thiserror::Error;

/// Main error type for Routa operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by provider adapters and the process manager
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Credentials missing or handshake rejected. A non-empty `auth_methods`
    /// means the backend asked for authentication.
    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        auth_methods: Vec<AuthMethod>,
    },

    #[error("Provider {provider} is unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("No running process for session {0}")]
    ProcessNotRunning(String),

    #[error("Prompt failed: {0}")]
    Prompt(String),

    #[error("Prompt cancelled")]
    Cancelled,

    #[error("A prompt is already in flight for session {0}")]
    PromptInFlight(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

impl ProviderError {
    /// Plain connection failure without remediation options
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            auth_methods: Vec::new(),
        }
    }

    pub fn needs_authentication(&self) -> bool {
        matches!(self, Self::Connection { auth_methods, .. } if !auth_methods.is_empty())
    }
}

/// Session lookup and request validation errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),
}

/// Delegation bookkeeping errors
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Agent {agent_id} cannot {action} as {role}")]
    InvalidRole {
        agent_id: String,
        role: String,
        action: String,
    },
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Connection pool error: {0}")]
    Pool(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Error::Storage(StorageError::Pool(err.to_string()))
    }
}

impl Error {
    /// JSON-RPC error code reported to clients
    pub fn rpc_code(&self) -> i32 {
        match self {
            Error::Provider(ProviderError::Connection { .. }) => -32000,
            Error::Provider(ProviderError::Unavailable { .. }) => -32001,
            Error::Provider(ProviderError::UnknownProvider(_)) => -32602,
            Error::Provider(ProviderError::ProcessNotRunning(_)) => -32002,
            Error::Provider(ProviderError::Prompt(_)) => -32003,
            Error::Provider(ProviderError::Cancelled) => -32003,
            Error::Provider(ProviderError::PromptInFlight(_)) => -32005,
            Error::Provider(ProviderError::Timeout) => -32003,
            Error::Provider(ProviderError::InvalidMessage(_)) => -32003,
            Error::Session(SessionError::NotFound(_)) => -32004,
            Error::Session(SessionError::InvalidParams(_)) => -32602,
            Error::Orchestration(OrchestrationError::AgentNotFound(_))
            | Error::Orchestration(OrchestrationError::TaskNotFound(_)) => -32004,
            Error::Orchestration(OrchestrationError::InvalidRole { .. }) => -32602,
            _ => -32603,
        }
    }

    /// Structured error data, used to surface auth remediation options
    pub fn rpc_data(&self) -> Option<serde_json::Value> {
        match self {
            Error::Provider(ProviderError::Connection { auth_methods, .. })
                if !auth_methods.is_empty() =>
            {
                Some(serde_json::json!({ "authMethods": auth_methods }))
            }
            Error::Provider(ProviderError::Unavailable { provider, .. }) => {
                Some(serde_json::json!({ "provider": provider }))
            }
            _ => None,
        }
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
