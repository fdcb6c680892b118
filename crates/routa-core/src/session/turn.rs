//! Turn bookkeeping shared by out-of-band and in-band delivery

use crate::error::Error;
use crate::storage::SessionStore;
use crate::types::{NotificationEnvelope, PromptResponse, SessionUpdate, StopReason};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RENAME_TOOL: &str = "set_agent_name";

/// Guarantees a turn ends with exactly one `turn_complete`.
///
/// Adapter items go in; the envelopes to deliver come out. A mid-stream
/// failure becomes an `error` envelope followed by `turn_complete{error}`,
/// anything after the terminal frame is dropped, and `finish` synthesizes a
/// terminal frame for a stream that ended without one.
pub struct TurnDriver {
    session_id: String,
    store: Arc<dyn SessionStore>,
    terminal: Option<PromptResponse>,
}

impl TurnDriver {
    pub fn new(session_id: impl Into<String>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            terminal: None,
        }
    }

    pub fn observe(&mut self, item: Result<NotificationEnvelope, Error>) -> Vec<NotificationEnvelope> {
        if self.terminal.is_some() {
            debug!("Dropping output after turn end for {}", self.session_id);
            return Vec::new();
        }
        match item {
            Ok(envelope) => {
                self.detect_rename(&envelope);
                if let SessionUpdate::TurnComplete { stop_reason, usage } = &envelope.update {
                    self.terminal = Some(PromptResponse {
                        stop_reason: *stop_reason,
                        usage: *usage,
                    });
                }
                vec![envelope]
            }
            Err(e) => {
                warn!("Turn failed for session {}: {}", self.session_id, e);
                self.fail(e.to_string())
            }
        }
    }

    pub fn finish(&mut self) -> Vec<NotificationEnvelope> {
        if self.terminal.is_some() {
            return Vec::new();
        }
        self.fail("turn ended without completing".to_string())
    }

    fn fail(&mut self, message: String) -> Vec<NotificationEnvelope> {
        self.terminal = Some(PromptResponse {
            stop_reason: StopReason::Error,
            usage: None,
        });
        vec![
            NotificationEnvelope::error(self.session_id.as_str(), message),
            NotificationEnvelope::turn_complete(self.session_id.as_str(), StopReason::Error, None),
        ]
    }

    pub fn is_done(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn response(&self) -> PromptResponse {
        self.terminal.clone().unwrap_or(PromptResponse {
            stop_reason: StopReason::Error,
            usage: None,
        })
    }

    /// Agents name themselves through a `set_agent_name` tool call
    fn detect_rename(&self, envelope: &NotificationEnvelope) {
        let Some((tool, input)) = envelope.update.tool_invocation() else {
            return;
        };
        if !tool.ends_with(RENAME_TOOL) {
            return;
        }
        let Some(name) = input.and_then(|i| i["name"].as_str()).filter(|n| !n.trim().is_empty()) else {
            return;
        };
        match self.store.rename_session(&self.session_id, name.trim()) {
            Ok(()) => info!("Session {} renamed to {}", self.session_id, name.trim()),
            Err(e) => warn!("Failed to rename session {}: {}", self.session_id, e),
        }
    }
}
