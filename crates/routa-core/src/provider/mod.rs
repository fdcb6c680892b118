//! Provider adapters
//!
//! Four backend protocol families behind one closed enum:
//!
//! - `AcpProcess`  - line-delimited JSON-RPC over a child process (ACP)
//! - `StreamJson`  - streamed-JSON CLI protocol over a child process
//! - `RemoteSdk`   - remote agent server, prompts over HTTP, output over SSE
//! - `DirectChat`  - chat-completions endpoint with local history
//!
//! Every variant yields the same [`NotificationEnvelope`] shapes and ends a
//! turn with exactly one `turn_complete`, or with an `Err` item on transport
//! failure.

mod acp_process;
mod direct_chat;
mod registry;
mod remote_sdk;
mod sse;
mod stream_json;

pub use acp_process::{normalize_update, AcpProcessAdapter};
pub use direct_chat::{ChatDeltaSplitter, ChatMessage, DirectChatAdapter};
pub use registry::{
    ProviderDescriptor, ProviderInfo, ProviderProtocol, ProviderRegistry, ProviderSource,
    ProviderStatus,
};
pub use remote_sdk::{RemoteEventTranslator, RemoteSdkAdapter, RemoteStep};
pub use sse::SseAccumulator;
pub use stream_json::{StreamJsonAdapter, StreamJsonOutput, StreamJsonTranslator};

use crate::config::CoreConfig;
use crate::error::{ProviderError, Result};
use crate::types::NotificationEnvelope;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Lazy, finite, non-restartable sequence of frames for one turn
pub type PromptStream = BoxStream<'static, Result<NotificationEnvelope>>;

/// Per-session facts an adapter needs at construction
#[derive(Debug, Clone, Default)]
pub struct AdapterContext {
    pub session_id: String,
    pub cwd: String,
    pub mode_id: Option<String>,
    pub model: Option<String>,
}

/// One live backend for one session
pub enum ProviderAdapter {
    AcpProcess(AcpProcessAdapter),
    StreamJson(StreamJsonAdapter),
    RemoteSdk(RemoteSdkAdapter),
    DirectChat(DirectChatAdapter),
}

impl ProviderAdapter {
    /// Build the variant a provider descriptor asks for. Nothing is spawned
    /// or dialed until `connect`.
    pub fn build(descriptor: &ProviderDescriptor, ctx: AdapterContext, config: &CoreConfig) -> Self {
        match descriptor.protocol {
            ProviderProtocol::Acp => ProviderAdapter::AcpProcess(AcpProcessAdapter::new(
                descriptor,
                ctx,
                config.request_timeout(),
            )),
            ProviderProtocol::StreamJson => {
                ProviderAdapter::StreamJson(StreamJsonAdapter::new(descriptor, ctx, config))
            }
            ProviderProtocol::RemoteSdk => {
                ProviderAdapter::RemoteSdk(RemoteSdkAdapter::new(descriptor, ctx, &config.providers))
            }
            ProviderProtocol::DirectChat => ProviderAdapter::DirectChat(DirectChatAdapter::new(
                descriptor,
                ctx,
                &config.providers,
            )),
        }
    }

    pub fn protocol(&self) -> ProviderProtocol {
        match self {
            ProviderAdapter::AcpProcess(_) => ProviderProtocol::Acp,
            ProviderAdapter::StreamJson(_) => ProviderProtocol::StreamJson,
            ProviderAdapter::RemoteSdk(_) => ProviderProtocol::RemoteSdk,
            ProviderAdapter::DirectChat(_) => ProviderProtocol::DirectChat,
        }
    }

    pub fn provider_id(&self) -> &str {
        match self {
            ProviderAdapter::AcpProcess(a) => a.provider_id(),
            ProviderAdapter::StreamJson(a) => a.provider_id(),
            ProviderAdapter::RemoteSdk(a) => a.provider_id(),
            ProviderAdapter::DirectChat(a) => a.provider_id(),
        }
    }

    /// Spawn the process or verify the endpoint and credentials
    pub async fn connect(&self) -> Result<()> {
        match self {
            ProviderAdapter::AcpProcess(a) => a.connect().await,
            ProviderAdapter::StreamJson(a) => a.connect().await,
            ProviderAdapter::RemoteSdk(a) => a.connect().await,
            ProviderAdapter::DirectChat(a) => a.connect().await,
        }
    }

    /// Open the backend session; returns the backend's own session id when
    /// it keeps one
    pub async fn create_session(&self, title: Option<&str>) -> Result<Option<String>> {
        match self {
            ProviderAdapter::AcpProcess(a) => a.create_session(title).await.map(Some),
            ProviderAdapter::StreamJson(a) => a.create_session(title).await,
            ProviderAdapter::RemoteSdk(a) => a.create_session(title).await.map(Some),
            ProviderAdapter::DirectChat(a) => a.create_session(title).await.map(|_| None),
        }
    }

    /// Re-attach to an existing backend session after a restart. Only the
    /// network variants can do this.
    pub async fn resume(&self, provider_session_id: Option<&str>) -> Result<()> {
        match self {
            ProviderAdapter::RemoteSdk(a) => a.resume(provider_session_id).await,
            ProviderAdapter::DirectChat(a) => a.resume().await,
            ProviderAdapter::AcpProcess(a) => Err(ProviderError::ProcessNotRunning(
                a.session_id().to_string(),
            )
            .into()),
            ProviderAdapter::StreamJson(a) => Err(ProviderError::ProcessNotRunning(
                a.session_id().to_string(),
            )
            .into()),
        }
    }

    /// Start a turn. Fails with `PromptInFlight` while another turn on this
    /// adapter has not finished.
    pub async fn prompt_stream(&self, text: &str, skill_content: Option<&str>) -> Result<PromptStream> {
        let text = compose_prompt(text, skill_content);
        match self {
            ProviderAdapter::AcpProcess(a) => a.prompt_stream(text).await,
            ProviderAdapter::StreamJson(a) => a.prompt_stream(text).await,
            ProviderAdapter::RemoteSdk(a) => a.prompt_stream(text).await,
            ProviderAdapter::DirectChat(a) => a.prompt_stream(text).await,
        }
    }

    /// Best-effort and idempotent
    pub fn cancel(&self) {
        match self {
            ProviderAdapter::AcpProcess(a) => a.cancel(),
            ProviderAdapter::StreamJson(a) => a.cancel(),
            ProviderAdapter::RemoteSdk(a) => a.cancel(),
            ProviderAdapter::DirectChat(a) => a.cancel(),
        }
    }

    /// Safe to call on an adapter that never connected
    pub async fn kill(&self) {
        match self {
            ProviderAdapter::AcpProcess(a) => a.kill().await,
            ProviderAdapter::StreamJson(a) => a.kill(),
            ProviderAdapter::RemoteSdk(a) => a.kill(),
            ProviderAdapter::DirectChat(a) => a.kill(),
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            ProviderAdapter::AcpProcess(a) => a.is_alive(),
            ProviderAdapter::StreamJson(a) => a.is_alive(),
            ProviderAdapter::RemoteSdk(a) => a.is_alive(),
            ProviderAdapter::DirectChat(a) => a.is_alive(),
        }
    }

    pub fn is_busy(&self) -> bool {
        match self {
            ProviderAdapter::AcpProcess(a) => a.turn().is_busy(),
            ProviderAdapter::StreamJson(a) => a.turn().is_busy(),
            ProviderAdapter::RemoteSdk(a) => a.turn().is_busy(),
            ProviderAdapter::DirectChat(a) => a.turn().is_busy(),
        }
    }

    pub async fn set_mode(&self, mode_id: &str) -> Result<()> {
        match self {
            ProviderAdapter::AcpProcess(a) => a.set_mode(mode_id).await,
            ProviderAdapter::StreamJson(a) => a.set_mode(mode_id).await,
            ProviderAdapter::RemoteSdk(a) => {
                a.set_mode(mode_id);
                Ok(())
            }
            ProviderAdapter::DirectChat(_) => Ok(()),
        }
    }

    /// Whether the manager may rebuild this adapter from persisted metadata
    pub fn is_recreatable(&self) -> bool {
        self.protocol().is_recreatable()
    }
}

impl std::fmt::Debug for ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("provider", &self.provider_id())
            .field("protocol", &self.protocol())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Skill text goes ahead of the user's prompt
pub fn compose_prompt(text: &str, skill_content: Option<&str>) -> String {
    match skill_content.map(str::trim).filter(|s| !s.is_empty()) {
        Some(skill) => format!("{}\n\n---\n\n{}", skill, text),
        None => text.to_string(),
    }
}

/// Single-occupancy slot for the in-flight turn of one adapter
#[derive(Default)]
pub struct TurnSlot {
    busy: AtomicBool,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl TurnSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot; the ticket frees it when dropped
    pub fn begin(self: &Arc<Self>, session_id: &str) -> Result<TurnTicket> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProviderError::PromptInFlight(session_id.to_string()).into());
        }
        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        Ok(TurnTicket {
            slot: Arc::clone(self),
            token,
        })
    }

    /// Cancel the running turn, if any. Returns false when there was nothing
    /// to cancel or it was already cancelled.
    pub fn cancel(&self) -> bool {
        match self.cancel.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof of an in-flight turn; moved into the prompt stream
pub struct TurnTicket {
    slot: Arc<TurnSlot>,
    token: CancellationToken,
}

impl TurnTicket {
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TurnTicket {
    fn drop(&mut self) {
        self.slot.cancel.lock().take();
        self.slot.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_compose_prompt() {
        assert_eq!(compose_prompt("hello", None), "hello");
        assert_eq!(compose_prompt("hello", Some("  ")), "hello");
        assert_eq!(
            compose_prompt("hello", Some("# Skill\nBe terse")),
            "# Skill\nBe terse\n\n---\n\nhello"
        );
    }

    #[test]
    fn test_turn_slot_rejects_second_turn() {
        let slot = TurnSlot::new();
        let ticket = slot.begin("s1").unwrap();
        assert!(slot.is_busy());
        assert!(matches!(
            slot.begin("s1"),
            Err(Error::Provider(ProviderError::PromptInFlight(_)))
        ));

        drop(ticket);
        assert!(!slot.is_busy());
        assert!(slot.begin("s1").is_ok());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let slot = TurnSlot::new();
        assert!(!slot.cancel());

        let ticket = slot.begin("s1").unwrap();
        assert!(slot.cancel());
        assert!(ticket.is_cancelled());
        assert!(!slot.cancel());
    }
}
