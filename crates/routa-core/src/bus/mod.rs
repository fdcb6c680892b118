//! Session notification bus
//!
//! Decouples when an adapter produces output from when a client observes it.
//! Each session gets its own channel state behind its own lock; unrelated
//! sessions never contend.
//!
//! ```text
//! push ──► streaming? ──yes──► held ──(exit)──┐
//!             │ no                            │
//!             ▼                               ▼
//!        subscribers? ──no──► backlog ◄── full sink
//!             │ yes              │
//!             ▼                  ▼ (attach)
//!        mpsc sinks ◄───── connected + replay
//! ```

use crate::config::BusConfig;
use crate::types::NotificationEnvelope;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

pub type SubscriberId = u64;

/// A live attachment to one session's envelope stream
pub struct Subscription {
    pub id: SubscriberId,
    pub session_id: String,
    pub receiver: mpsc::Receiver<NotificationEnvelope>,
}

#[derive(Default)]
struct SessionChannel {
    subscribers: Vec<(SubscriberId, mpsc::Sender<NotificationEnvelope>)>,
    backlog: VecDeque<NotificationEnvelope>,
    streaming: usize,
    held: VecDeque<NotificationEnvelope>,
    evicted: u64,
}

/// Append to a queue capped at `limit`, evicting the oldest entries
fn push_bounded(
    queue: &mut VecDeque<NotificationEnvelope>,
    envelope: NotificationEnvelope,
    limit: usize,
    evicted: &mut u64,
    session_id: &str,
) {
    if limit == 0 {
        return;
    }
    while queue.len() >= limit {
        queue.pop_front();
        *evicted += 1;
        if *evicted == 1 || *evicted % 100 == 0 {
            warn!(
                "Buffer for session {} is full; {} envelopes evicted so far",
                session_id, evicted
            );
        }
    }
    queue.push_back(envelope);
}

impl SessionChannel {
    fn buffer(&mut self, session_id: &str, envelope: NotificationEnvelope, limit: usize) {
        push_bounded(&mut self.backlog, envelope, limit, &mut self.evicted, session_id);
    }

    fn hold(&mut self, session_id: &str, envelope: NotificationEnvelope, limit: usize) {
        push_bounded(&mut self.held, envelope, limit, &mut self.evicted, session_id);
    }

    fn deliver(&mut self, session_id: &str, envelope: NotificationEnvelope, limit: usize) {
        if self.subscribers.is_empty() {
            self.buffer(session_id, envelope, limit);
            return;
        }

        let mut delivered = false;
        let mut overflowed = false;
        self.subscribers.retain(|(id, tx)| match tx.try_send(envelope.clone()) {
            Ok(()) => {
                delivered = true;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("Subscriber {} on session {} is full; detaching", id, session_id);
                overflowed = true;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Subscriber {} on session {} went away", id, session_id);
                false
            }
        });

        if overflowed || !delivered {
            self.buffer(session_id, envelope, limit);
        }
    }
}

/// Per-session buffer and subscriber registry
pub struct NotificationBus {
    channels: DashMap<String, Arc<Mutex<SessionChannel>>>,
    config: BusConfig,
    next_subscriber: AtomicU64,
}

impl NotificationBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            channels: DashMap::new(),
            config,
            next_subscriber: AtomicU64::new(1),
        }
    }

    fn channel(&self, session_id: &str) -> Arc<Mutex<SessionChannel>> {
        if let Some(channel) = self.channels.get(session_id) {
            return Arc::clone(channel.value());
        }
        Arc::clone(
            self.channels
                .entry(session_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Register a sink. It first sees a synthetic `connected` frame, then the
    /// buffered backlog in push order, then live envelopes.
    pub fn attach(&self, session_id: &str) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let channel = self.channel(session_id);
        let mut channel = channel.lock();

        let backlog: Vec<_> = channel.backlog.drain(..).collect();
        let capacity = self.config.subscriber_capacity.max(backlog.len() + 1).max(1);
        let (tx, rx) = mpsc::channel(capacity);

        // Capacity covers the replay, so these sends cannot fail.
        let _ = tx.try_send(NotificationEnvelope::connected(session_id));
        for envelope in backlog {
            let _ = tx.try_send(envelope);
        }
        channel.subscribers.push((id, tx));
        debug!("Subscriber {} attached to session {}", id, session_id);

        Subscription {
            id,
            session_id: session_id.to_string(),
            receiver: rx,
        }
    }

    /// Forward to attached sinks, or buffer for the next attach
    pub fn push(&self, envelope: NotificationEnvelope) {
        let session_id = envelope.session_id.clone();
        let channel = self.channel(&session_id);
        let mut channel = channel.lock();
        trace!("Push {:?} to session {}", envelope.kind(), session_id);

        if channel.streaming > 0 {
            channel.hold(&session_id, envelope, self.config.backlog_limit);
        } else {
            channel.deliver(&session_id, envelope, self.config.backlog_limit);
        }
    }

    /// Suppress out-of-band delivery while the caller streams in-band. The
    /// returned guard leaves streaming mode when dropped.
    pub fn enter_streaming_mode(self: &Arc<Self>, session_id: &str) -> StreamingGuard {
        self.channel(session_id).lock().streaming += 1;
        debug!("Session {} entered streaming mode", session_id);
        StreamingGuard {
            bus: Arc::clone(self),
            session_id: session_id.to_string(),
        }
    }

    /// Leave streaming mode; envelopes held meanwhile go through the normal
    /// path in order
    pub fn exit_streaming_mode(&self, session_id: &str) {
        let channel = self.channel(session_id);
        let mut channel = channel.lock();
        channel.streaming = channel.streaming.saturating_sub(1);
        if channel.streaming > 0 {
            return;
        }
        let held = std::mem::take(&mut channel.held);
        if !held.is_empty() {
            debug!(
                "Flushing {} envelopes held for session {}",
                held.len(),
                session_id
            );
        }
        for envelope in held {
            channel.deliver(session_id, envelope, self.config.backlog_limit);
        }
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.channels
            .get(session_id)
            .map(|c| c.lock().streaming > 0)
            .unwrap_or(false)
    }

    /// Idempotent
    pub fn detach(&self, session_id: &str, subscriber: SubscriberId) {
        if let Some(channel) = self.channels.get(session_id) {
            channel.lock().subscribers.retain(|(id, _)| *id != subscriber);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .get(session_id)
            .map(|c| c.lock().subscribers.len())
            .unwrap_or(0)
    }

    pub fn backlog_len(&self, session_id: &str) -> usize {
        self.channels
            .get(session_id)
            .map(|c| c.lock().backlog.len())
            .unwrap_or(0)
    }

    /// Drop all state for a session; attached receivers see end of stream
    pub fn remove_session(&self, session_id: &str) {
        self.channels.remove(session_id);
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Keeps a session in streaming mode while alive
pub struct StreamingGuard {
    bus: Arc<NotificationBus>,
    session_id: String,
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        self.bus.exit_streaming_mode(&self.session_id);
    }
}
