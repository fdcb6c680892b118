//! Routa Core Library
//!
//! Agent process orchestration and the session protocol layer:
//! - Provider adapters for ACP agents, streamed-JSON CLIs, a remote agent
//!   server and chat-completion endpoints
//! - Agent process management, one live adapter per session
//! - Per-session notification bus with backlog replay
//! - Coordinator/worker delegation
//! - SQLite-based session persistence
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        routa-core                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  session/      - Session service, turn driving              │
//! │  orchestrator/ - Delegation state machine, re-routing       │
//! │  process/      - Live adapter table                         │
//! │  provider/     - Adapters, provider registry                │
//! │  acp/          - ACP JSON-RPC connection                    │
//! │  bus/          - Notification bus                           │
//! │  storage/      - SQLite database, queries                   │
//! │  types/        - Shared type definitions                    │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod acp;
pub mod bus;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod orchestrator;
pub mod process;
pub mod provider;
pub mod session;
pub mod skills;
pub mod storage;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;

pub use bus::{NotificationBus, Subscription};
pub use config::CoreConfig;
pub use idempotency::IdempotencyCache;
pub use orchestrator::Orchestrator;
pub use process::AgentProcessManager;
pub use provider::{
    PromptStream, ProviderAdapter, ProviderDescriptor, ProviderInfo, ProviderProtocol,
    ProviderRegistry,
};
pub use session::{InBandStream, SessionService};
pub use skills::{DirectorySkillResolver, SkillResolver};
pub use storage::{SessionStore, Storage};
