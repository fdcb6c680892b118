//! Agent process management

mod manager;

pub use manager::AgentProcessManager;
