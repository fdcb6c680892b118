//! Short-lived de-duplication of session creation
//!
//! Client retries of `session/new` with the same key resolve to the session
//! the first call created. Best effort: two truly simultaneous creates can
//! both miss.

use crate::config::DEFAULT_IDEMPOTENCY_TTL_SECS;
use crate::types::AgentRole;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyEntry {
    pub session_id: String,
    pub provider: String,
    pub role: AgentRole,
    pub created_at: Instant,
}

pub struct IdempotencyCache {
    entries: Mutex<HashMap<String, IdempotencyEntry>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(DEFAULT_IDEMPOTENCY_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// The live entry for `key`, if any. Expired entries are swept on every
    /// call.
    pub fn check_or_reserve(&self, key: &str) -> Option<IdempotencyEntry> {
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at.elapsed() < ttl);
        if entries.len() < before {
            debug!("Expired {} idempotency entries", before - entries.len());
        }
        entries.get(key).cloned()
    }

    pub fn record(&self, key: &str, session_id: &str, provider: &str, role: AgentRole) {
        self.entries.lock().insert(
            key.to_string(),
            IdempotencyEntry {
                session_id: session_id.to_string(),
                provider: provider.to_string(),
                role,
                created_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}
