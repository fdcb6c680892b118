//! ACP (Agent Client Protocol) client
//!
//! JSON-RPC 2.0 over line-delimited stdin/stdout. `AcpConnection` owns one
//! agent process; `ProtocolHandler` builds requests and classifies messages.

mod connection;
mod protocol;

pub use connection::{AcpConnection, AcpEvent};
pub use protocol::{AcpMessage, ProtocolHandler, AUTH_REQUIRED_CODE};
