//! Runtime configuration
//!
//! Defaults are overridden by environment variables; the server binary layers
//! its command line flags on top.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BACKLOG_LIMIT: usize = 1000;
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub skills_dir: Option<PathBuf>,
    pub bus: BusConfig,
    pub idempotency_ttl_secs: u64,
    /// Timeout for ACP control requests (initialize, session/new, set_mode)
    pub request_timeout_secs: u64,
    pub providers: ProviderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    /// Envelopes retained per session while nobody is attached
    pub backlog_limit: usize,
    pub subscriber_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    pub opencode_server_url: Option<String>,
    pub opencode_server_password: Option<String>,
    pub chat_base_url: String,
    pub chat_api_key: Option<String>,
    pub chat_model: String,
    pub anthropic_api_key: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            skills_dir: None,
            bus: BusConfig::default(),
            idempotency_ttl_secs: DEFAULT_IDEMPOTENCY_TTL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            providers: ProviderSettings::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            opencode_server_url: None,
            opencode_server_password: None,
            chat_base_url: "https://api.openai.com/v1".to_string(),
            chat_api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            anthropic_api_key: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("routa"))
        .unwrap_or_else(|| PathBuf::from(".routa"))
}

impl CoreConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get("ROUTA_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.skills_dir = get("ROUTA_SKILLS_DIR").map(PathBuf::from);

        if let Some(limit) = get("ROUTA_BUS_BACKLOG").and_then(|v| v.parse().ok()) {
            config.bus.backlog_limit = limit;
        }
        if let Some(ttl) = get("ROUTA_IDEMPOTENCY_TTL_SECS").and_then(|v| v.parse().ok()) {
            config.idempotency_ttl_secs = ttl;
        }

        let providers = &mut config.providers;
        providers.opencode_server_url = get("OPENCODE_SERVER_URL");
        providers.opencode_server_password = get("OPENCODE_SERVER_PASSWORD");
        if let Some(url) = get("ROUTA_CHAT_BASE_URL").or_else(|| get("OPENAI_BASE_URL")) {
            providers.chat_base_url = url;
        }
        providers.chat_api_key = get("ROUTA_CHAT_API_KEY").or_else(|| get("OPENAI_API_KEY"));
        if let Some(model) = get("ROUTA_CHAT_MODEL") {
            providers.chat_model = model;
        }
        providers.anthropic_api_key = get("ANTHROPIC_API_KEY");

        config
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.bus.backlog_limit, DEFAULT_BACKLOG_LIMIT);
        assert_eq!(config.idempotency_ttl(), Duration::from_secs(30));
        assert!(config.providers.chat_api_key.is_none());
        assert!(config.data_dir.ends_with("routa"));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("ROUTA_DATA_DIR", "/tmp/routa-test"),
            ("ROUTA_BUS_BACKLOG", "42"),
            ("OPENCODE_SERVER_URL", "http://127.0.0.1:4096"),
            ("OPENAI_API_KEY", "sk-fallback"),
            ("ROUTA_CHAT_MODEL", "deepseek-reasoner"),
            ("ANTHROPIC_API_KEY", ""),
        ]
        .into_iter()
        .collect();

        let config = CoreConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/routa-test"));
        assert_eq!(config.bus.backlog_limit, 42);
        assert_eq!(
            config.providers.opencode_server_url.as_deref(),
            Some("http://127.0.0.1:4096")
        );
        assert_eq!(config.providers.chat_api_key.as_deref(), Some("sk-fallback"));
        assert_eq!(config.providers.chat_model, "deepseek-reasoner");
        assert!(config.providers.anthropic_api_key.is_none());
    }
}
