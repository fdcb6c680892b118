//! Provider registry
//!
//! Static providers ship with the crate; custom ACP agents can be registered
//! at runtime. Availability is checked before anything is spawned: process
//! providers need their binary on `PATH`, network providers need an endpoint
//! and credentials.

use crate::config::ProviderSettings;
use crate::error::{ProviderError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderProtocol {
    Acp,
    StreamJson,
    RemoteSdk,
    DirectChat,
}

impl ProviderProtocol {
    pub fn is_process(self) -> bool {
        matches!(self, ProviderProtocol::Acp | ProviderProtocol::StreamJson)
    }

    /// Network variants hold no state the manager can't rebuild
    pub fn is_recreatable(self) -> bool {
        !self.is_process()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSource {
    Static,
    Registry,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Available,
    Unavailable,
}

/// How to reach one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub protocol: ProviderProtocol,
    /// Binary for process providers
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub source: ProviderSource,
}

impl ProviderDescriptor {
    fn builtin(id: &str, name: &str, description: &str, protocol: ProviderProtocol) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: Some(description.to_string()),
            protocol,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            source: ProviderSource::Static,
        }
    }

    fn with_command(mut self, command: &str, args: &[&str]) -> Self {
        self.command = Some(command.to_string());
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    /// A runtime-registered ACP agent
    pub fn custom_acp(
        id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            protocol: ProviderProtocol::Acp,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            source: ProviderSource::Registry,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Provider listing entry for `_providers/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub protocol: ProviderProtocol,
    pub status: ProviderStatus,
    pub source: ProviderSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Registry of static and custom providers
pub struct ProviderRegistry {
    providers: RwLock<Vec<ProviderDescriptor>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
        }
    }

    /// Registry with all builtin providers
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for descriptor in Self::builtin_descriptors() {
            registry.register(descriptor);
        }
        registry
    }

    fn builtin_descriptors() -> Vec<ProviderDescriptor> {
        use ProviderProtocol::*;
        vec![
            ProviderDescriptor::builtin("opencode", "OpenCode", "OpenCode agent over ACP", Acp)
                .with_command("opencode", &["acp"]),
            ProviderDescriptor::builtin("gemini", "Gemini CLI", "Google's Gemini CLI agent", Acp)
                .with_command("gemini", &["--experimental-acp"]),
            ProviderDescriptor::builtin("codex", "Codex", "OpenAI Codex through codex-acp", Acp)
                .with_command("codex-acp", &[]),
            ProviderDescriptor::builtin("goose", "Goose", "Block's Goose agent", Acp)
                .with_command("goose", &["acp"]),
            ProviderDescriptor::builtin(
                "claude",
                "Claude Code",
                "Claude Code CLI in streamed-JSON mode",
                StreamJson,
            )
            .with_command(
                "claude",
                &[
                    "-p",
                    "--output-format",
                    "stream-json",
                    "--input-format",
                    "stream-json",
                    "--verbose",
                ],
            ),
            ProviderDescriptor::builtin(
                "opencode-sdk",
                "OpenCode Server",
                "Remote OpenCode server over HTTP and server-sent events",
                RemoteSdk,
            ),
            ProviderDescriptor::builtin(
                "openai",
                "Chat Completions",
                "OpenAI-compatible chat-completions endpoint",
                DirectChat,
            ),
        ]
    }

    /// Add a provider, replacing any existing one with the same id
    pub fn register(&self, descriptor: ProviderDescriptor) {
        let mut providers = self.providers.write();
        providers.retain(|p| p.id != descriptor.id);
        providers.push(descriptor);
    }

    pub fn register_custom(&self, descriptor: ProviderDescriptor) {
        info!("Registering custom provider: {}", descriptor.id);
        self.register(ProviderDescriptor {
            source: ProviderSource::Registry,
            ..descriptor
        });
    }

    pub fn get(&self, id: &str) -> Option<ProviderDescriptor> {
        self.providers.read().iter().find(|p| p.id == id).cloned()
    }

    /// Resolve a provider id or fail with `UnknownProvider`
    pub fn resolve(&self, id: &str) -> Result<ProviderDescriptor> {
        self.get(id)
            .ok_or_else(|| ProviderError::UnknownProvider(id.to_string()).into())
    }

    pub fn all(&self) -> Vec<ProviderDescriptor> {
        self.providers.read().clone()
    }

    /// Check prerequisites without spawning or dialing anything
    pub async fn check_available(
        &self,
        descriptor: &ProviderDescriptor,
        settings: &ProviderSettings,
    ) -> std::result::Result<(), String> {
        match descriptor.protocol {
            ProviderProtocol::Acp | ProviderProtocol::StreamJson => {
                let command = descriptor
                    .command
                    .as_deref()
                    .ok_or_else(|| "no command configured".to_string())?;
                if command_exists(command).await {
                    Ok(())
                } else {
                    Err(format!("`{}` not found on PATH", command))
                }
            }
            ProviderProtocol::RemoteSdk => match &settings.opencode_server_url {
                Some(_) => Ok(()),
                None => Err("OPENCODE_SERVER_URL is not set".to_string()),
            },
            ProviderProtocol::DirectChat => match &settings.chat_api_key {
                Some(_) => Ok(()),
                None => Err("no chat API key configured".to_string()),
            },
        }
    }

    /// Fail fast with `ProviderUnavailable`
    pub async fn ensure_available(
        &self,
        descriptor: &ProviderDescriptor,
        settings: &ProviderSettings,
    ) -> Result<()> {
        self.check_available(descriptor, settings)
            .await
            .map_err(|reason| {
                ProviderError::Unavailable {
                    provider: descriptor.id.clone(),
                    reason,
                }
                .into()
            })
    }

    pub async fn list(&self, settings: &ProviderSettings) -> Vec<ProviderInfo> {
        let mut infos = Vec::new();
        for descriptor in self.all() {
            let check = self.check_available(&descriptor, settings).await;
            debug!("Provider {} available: {}", descriptor.id, check.is_ok());
            infos.push(ProviderInfo {
                id: descriptor.id,
                name: descriptor.name,
                description: descriptor.description,
                protocol: descriptor.protocol,
                status: if check.is_ok() {
                    ProviderStatus::Available
                } else {
                    ProviderStatus::Unavailable
                },
                source: descriptor.source,
                reason: check.err(),
            });
        }
        infos
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

async fn command_exists(command: &str) -> bool {
    if command.contains(std::path::MAIN_SEPARATOR) {
        return std::path::Path::new(command).is_file();
    }
    tokio::process::Command::new("which")
        .arg(command)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}
