//! Agent process manager
//!
//! Single authority over which adapter is live for which session. Holds at
//! most one adapter per session id; replacing one kills the old first.

use crate::config::CoreConfig;
use crate::error::Result;
use crate::provider::{AdapterContext, ProviderAdapter, ProviderRegistry};
use crate::storage::SessionStore;
use crate::types::{NewSessionOptions, SessionRecord};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct AgentProcessManager {
    registry: Arc<ProviderRegistry>,
    config: Arc<CoreConfig>,
    store: Arc<dyn SessionStore>,
    live: DashMap<String, Arc<ProviderAdapter>>,
    /// Serializes create/recreate/kill per session. An entry is only
    /// dropped while nobody else holds it.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AgentProcessManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        config: Arc<CoreConfig>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            registry,
            config,
            store,
            live: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(session_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Drop the lock entry for `session_id` unless another caller still
    /// holds or waits on it
    fn release_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(session_id, |_, held| Arc::strong_count(held) == 1);
    }

    /// Build, connect and register an adapter for `session_id`. Returns the
    /// adapter and the backend's own session id, if it keeps one.
    ///
    /// Prerequisites are checked before anything is spawned.
    pub async fn create_session(
        &self,
        session_id: &str,
        opts: &NewSessionOptions,
    ) -> Result<(Arc<ProviderAdapter>, Option<String>)> {
        let descriptor = self.registry.resolve(&opts.provider)?;
        self.registry
            .ensure_available(&descriptor, &self.config.providers)
            .await?;

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        if let Some((_, previous)) = self.live.remove(session_id) {
            info!("Replacing live adapter for session {}", session_id);
            previous.kill().await;
        }

        let ctx = AdapterContext {
            session_id: session_id.to_string(),
            cwd: opts.cwd.clone(),
            mode_id: opts.mode_id.clone(),
            model: opts.model.clone(),
        };
        let adapter = ProviderAdapter::build(&descriptor, ctx, &self.config);

        if let Err(e) = adapter.connect().await {
            adapter.kill().await;
            return Err(e);
        }
        let provider_session_id = match adapter.create_session(opts.name.as_deref()).await {
            Ok(id) => id,
            Err(e) => {
                adapter.kill().await;
                return Err(e);
            }
        };

        let adapter = Arc::new(adapter);
        self.live.insert(session_id.to_string(), Arc::clone(&adapter));
        info!(
            "Session {} live on provider {} ({:?})",
            session_id,
            descriptor.id,
            adapter.protocol()
        );
        Ok((adapter, provider_session_id))
    }

    /// The live adapter for a session, transparently rebuilding network
    /// adapters from the persisted record. `None` means no process is
    /// running and none can be recreated.
    pub async fn get_or_recreate(&self, session_id: &str) -> Result<Option<Arc<ProviderAdapter>>> {
        if let Some(adapter) = self.get(session_id) {
            if adapter.is_alive() {
                return Ok(Some(adapter));
            }
        }

        if self.get(session_id).is_none() && self.store.get_session_record(session_id)?.is_none() {
            return Ok(None);
        }

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        if let Some(adapter) = self.get(session_id) {
            if adapter.is_alive() {
                return Ok(Some(adapter));
            }
            debug!("Dropping dead adapter for session {}", session_id);
            self.live.remove(session_id);
            adapter.kill().await;
        }

        let Some(record) = self.store.get_session_record(session_id)? else {
            return Ok(None);
        };
        self.recreate(&record).await
    }

    async fn recreate(&self, record: &SessionRecord) -> Result<Option<Arc<ProviderAdapter>>> {
        let Some(descriptor) = self.registry.get(&record.provider) else {
            warn!(
                "Session {} references unknown provider {}",
                record.id, record.provider
            );
            return Ok(None);
        };
        if !descriptor.protocol.is_recreatable() {
            return Ok(None);
        }

        let ctx = AdapterContext {
            session_id: record.id.clone(),
            cwd: record.cwd.clone(),
            mode_id: record.mode_id.clone(),
            model: record.model.clone(),
        };
        let adapter = ProviderAdapter::build(&descriptor, ctx, &self.config);
        adapter.resume(record.provider_session_id.as_deref()).await?;

        let adapter = Arc::new(adapter);
        self.live.insert(record.id.clone(), Arc::clone(&adapter));
        info!("Recreated {} adapter for session {}", descriptor.id, record.id);
        Ok(Some(adapter))
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ProviderAdapter>> {
        self.live.get(session_id).map(|a| Arc::clone(a.value()))
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.live
            .get(session_id)
            .map(|a| a.is_alive())
            .unwrap_or(false)
    }

    /// Kill and unregister; returns whether an adapter was registered
    pub async fn kill(&self, session_id: &str) -> bool {
        let lock = self.session_lock(session_id);
        let removed = {
            let _guard = lock.lock().await;
            self.live.remove(session_id)
        };
        self.release_lock(session_id, lock);

        match removed {
            Some((_, adapter)) => {
                info!("Killing adapter for session {}", session_id);
                adapter.kill().await;
                true
            }
            None => false,
        }
    }

    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.live.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.kill(&id).await;
        }
    }

    pub fn live_sessions(&self) -> Vec<String> {
        self.live.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ProviderError};
    use crate::provider::{ProviderDescriptor, ProviderProtocol};
    use crate::storage::MockSessionStore;
    use crate::types::AgentRole;

    fn config_with_chat_key() -> Arc<CoreConfig> {
        let mut config = CoreConfig::default();
        config.providers.chat_api_key = Some("sk-test".to_string());
        Arc::new(config)
    }

    fn manager(store: MockSessionStore, config: Arc<CoreConfig>) -> AgentProcessManager {
        AgentProcessManager::new(
            Arc::new(ProviderRegistry::with_builtins()),
            config,
            Arc::new(store),
        )
    }

    fn record(id: &str, provider: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            name: None,
            provider: provider.to_string(),
            provider_session_id: None,
            cwd: "/repo".to_string(),
            workspace_id: "default".to_string(),
            role: AgentRole::Plain,
            mode_id: None,
            model: None,
            parent_session_id: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unavailable_provider_fails_before_spawn() {
        let manager = manager(MockSessionStore::new(), Arc::new(CoreConfig::default()));
        manager.registry().register_custom(ProviderDescriptor::custom_acp(
            "ghost",
            "Ghost",
            "ghost-agent-binary-404",
            vec![],
        ));

        let err = manager
            .create_session("s1", &NewSessionOptions::new("ghost", "/repo"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::Unavailable { .. })));
        assert!(!manager.is_live("s1"));

        let err = manager
            .create_session("s1", &NewSessionOptions::new("nope", "/repo"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::UnknownProvider(_))));
    }

    #[tokio::test]
    async fn test_second_create_kills_first() {
        let manager = manager(MockSessionStore::new(), config_with_chat_key());
        let opts = NewSessionOptions::new("openai", "/repo");

        let (first, _) = manager.create_session("s1", &opts).await.unwrap();
        assert!(first.is_alive());
        let (second, _) = manager.create_session("s1", &opts).await.unwrap();

        assert!(!first.is_alive());
        assert!(second.is_alive());
        assert_eq!(manager.live_sessions(), vec!["s1".to_string()]);
        assert!(Arc::ptr_eq(&manager.get("s1").unwrap(), &second));
    }

    #[tokio::test]
    async fn test_get_or_recreate() {
        let mut store = MockSessionStore::new();
        store
            .expect_get_session_record()
            .returning(|id| match id {
                "chat" => Ok(Some(record("chat", "openai"))),
                "proc" => Ok(Some(record("proc", "opencode"))),
                _ => Ok(None),
            });
        let manager = manager(store, config_with_chat_key());

        assert!(manager.get_or_recreate("unknown").await.unwrap().is_none());
        assert!(manager.get_or_recreate("proc").await.unwrap().is_none());

        let adapter = manager.get_or_recreate("chat").await.unwrap().unwrap();
        assert_eq!(adapter.protocol(), ProviderProtocol::DirectChat);
        assert!(manager.is_live("chat"));

        let again = manager.get_or_recreate("chat").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&adapter, &again));
    }

    #[tokio::test]
    async fn test_kill_is_safe_to_repeat() {
        let manager = manager(MockSessionStore::new(), config_with_chat_key());
        manager
            .create_session("s1", &NewSessionOptions::new("openai", "/repo"))
            .await
            .unwrap();

        assert!(manager.kill("s1").await);
        assert!(!manager.kill("s1").await);
        assert!(!manager.is_live("s1"));
    }

    #[tokio::test]
    async fn test_kill_keeps_a_lock_someone_holds() {
        let manager = manager(MockSessionStore::new(), config_with_chat_key());
        manager
            .create_session("s1", &NewSessionOptions::new("openai", "/repo"))
            .await
            .unwrap();

        let waiting = manager.session_lock("s1");
        assert!(manager.kill("s1").await);
        assert!(Arc::ptr_eq(&waiting, &manager.session_lock("s1")));

        drop(waiting);
        assert!(!manager.kill("s1").await);
        assert!(manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_leave_no_lock_behind() {
        let mut store = MockSessionStore::new();
        store.expect_get_session_record().returning(|_| Ok(None));
        let manager = manager(store, config_with_chat_key());

        for i in 0..10 {
            let id = format!("ghost-{}", i);
            assert!(manager.get_or_recreate(&id).await.unwrap().is_none());
        }
        assert!(manager.locks.is_empty());
    }
}
