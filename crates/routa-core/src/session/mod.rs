//! Session lifecycle
//!
//! `SessionService` is what the JSON-RPC surface talks to. It ties together
//! the process manager, the notification bus, the idempotency cache, the
//! session store and skill lookup.

mod service;
mod turn;

pub use service::{InBandStream, SessionService, TurnTap};
pub use turn::TurnDriver;
