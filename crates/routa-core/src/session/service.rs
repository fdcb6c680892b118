//! Session service

use super::turn::TurnDriver;
use crate::bus::{NotificationBus, StreamingGuard, Subscription, SubscriberId};
use crate::config::CoreConfig;
use crate::error::{Error, ProviderError, Result, SessionError};
use crate::idempotency::IdempotencyCache;
use crate::process::AgentProcessManager;
use crate::provider::{PromptStream, ProviderAdapter, ProviderInfo, ProviderRegistry};
use crate::skills::{DirectorySkillResolver, NoSkills, SkillResolver};
use crate::storage::SessionStore;
use crate::types::{
    NewSessionOptions, NewSessionResult, NotificationEnvelope, PromptResponse, SessionRecord,
};
use dashmap::DashSet;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_WORKSPACE: &str = "default";

/// Envelopes of one turn delivered as the caller's own response body
pub type InBandStream = BoxStream<'static, NotificationEnvelope>;

/// Observer called with every envelope of a turn before it is delivered
pub type TurnTap = Box<dyn FnMut(&NotificationEnvelope) + Send>;

pub struct SessionService {
    config: Arc<CoreConfig>,
    registry: Arc<ProviderRegistry>,
    manager: Arc<AgentProcessManager>,
    bus: Arc<NotificationBus>,
    idempotency: IdempotencyCache,
    store: Arc<dyn SessionStore>,
    skills: Arc<dyn SkillResolver>,
    /// Sessions whose first prompt has gone out
    prompted: DashSet<String>,
}

impl SessionService {
    pub fn new(config: CoreConfig, store: Arc<dyn SessionStore>) -> Self {
        Self::with_registry(config, Arc::new(ProviderRegistry::with_builtins()), store)
    }

    pub fn with_registry(
        config: CoreConfig,
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let config = Arc::new(config);
        let skills: Arc<dyn SkillResolver> = match &config.skills_dir {
            Some(dir) => Arc::new(DirectorySkillResolver::new(dir.clone())),
            None => Arc::new(NoSkills),
        };
        let manager = Arc::new(AgentProcessManager::new(
            Arc::clone(&registry),
            Arc::clone(&config),
            Arc::clone(&store),
        ));
        Self {
            bus: Arc::new(NotificationBus::new(config.bus.clone())),
            idempotency: IdempotencyCache::with_ttl(config.idempotency_ttl()),
            config,
            registry,
            manager,
            store,
            skills,
            prompted: DashSet::new(),
        }
    }

    pub fn with_skill_resolver(mut self, skills: Arc<dyn SkillResolver>) -> Self {
        self.skills = skills;
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<AgentProcessManager> {
        &self.manager
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Create a session and its live adapter. A repeated idempotency key
    /// within the TTL returns the session created the first time.
    pub async fn new_session(&self, opts: NewSessionOptions) -> Result<NewSessionResult> {
        if opts.provider.trim().is_empty() {
            return Err(SessionError::InvalidParams("provider is required".into()).into());
        }
        if opts.cwd.trim().is_empty() {
            return Err(SessionError::InvalidParams("cwd is required".into()).into());
        }

        if let Some(key) = opts.idempotency_key.as_deref() {
            if let Some(entry) = self.idempotency.check_or_reserve(key) {
                info!("Idempotency key {} resolved to session {}", key, entry.session_id);
                return Ok(NewSessionResult {
                    session_id: entry.session_id,
                    provider: entry.provider,
                    role: entry.role,
                    routa_agent_id: None,
                });
            }
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let role = opts.role.unwrap_or_default();
        let (adapter, provider_session_id) =
            self.manager.create_session(&session_id, &opts).await?;

        let record = SessionRecord {
            id: session_id.clone(),
            name: opts.name.clone(),
            provider: opts.provider.clone(),
            provider_session_id,
            cwd: opts.cwd.clone(),
            workspace_id: opts
                .workspace_id
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string()),
            role,
            mode_id: opts.mode_id.clone(),
            model: opts.model.clone(),
            parent_session_id: opts.parent_session_id.clone(),
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.store.upsert_session_record(&record) {
            warn!("Failed to persist session {}: {}", session_id, e);
            self.manager.kill(&session_id).await;
            return Err(e);
        }

        if let Some(key) = opts.idempotency_key.as_deref() {
            self.idempotency.record(key, &session_id, &opts.provider, role);
        }
        info!(
            "Created session {} ({} via {}, role {})",
            session_id,
            opts.provider,
            adapter.provider_id(),
            role
        );

        Ok(NewSessionResult {
            session_id,
            provider: opts.provider,
            role,
            routa_agent_id: None,
        })
    }

    async fn live_adapter(&self, session_id: &str) -> Result<Arc<ProviderAdapter>> {
        if let Some(adapter) = self.manager.get_or_recreate(session_id).await? {
            return Ok(adapter);
        }
        if self.store.get_session_record(session_id)?.is_some() {
            Err(ProviderError::ProcessNotRunning(session_id.to_string()).into())
        } else {
            Err(SessionError::NotFound(session_id.to_string()).into())
        }
    }

    /// Open a turn on the session's adapter. Skill text, given literally or
    /// resolved by name, only rides along with the first prompt.
    pub async fn start_turn(
        &self,
        session_id: &str,
        text: &str,
        skill_name: Option<&str>,
        skill_content: Option<&str>,
    ) -> Result<PromptStream> {
        let adapter = self.live_adapter(session_id).await?;

        let skill = match (self.prompted.contains(session_id), skill_content, skill_name) {
            (true, _, _) => None,
            (false, Some(content), _) => Some(content.to_string()),
            (false, None, Some(name)) => self.skills.resolve(name).await,
            (false, None, None) => None,
        };
        if skill.is_some() {
            debug!("Injecting skill into first prompt of session {}", session_id);
        }

        let stream = adapter.prompt_stream(text, skill.as_deref()).await?;
        self.prompted.insert(session_id.to_string());
        Ok(stream)
    }

    /// Drive a turn to its end on a background task, delivering through the
    /// bus. The turn keeps running if the caller stops waiting.
    pub fn spawn_turn(
        &self,
        session_id: &str,
        stream: PromptStream,
        tap: Option<TurnTap>,
    ) -> JoinHandle<PromptResponse> {
        let output = TurnOutput {
            bus: Arc::clone(&self.bus),
            tap,
            in_band: None,
            _guard: None,
        };
        let driver = TurnDriver::new(session_id, Arc::clone(&self.store));
        tokio::spawn(run_turn(stream, driver, output))
    }

    /// Prompt and wait for the turn to end; output goes out of band
    pub async fn prompt(
        &self,
        session_id: &str,
        text: &str,
        skill_name: Option<&str>,
        skill_content: Option<&str>,
    ) -> Result<PromptResponse> {
        let stream = self
            .start_turn(session_id, text, skill_name, skill_content)
            .await?;
        self.spawn_turn(session_id, stream, None)
            .await
            .map_err(|e| Error::Internal(format!("turn task for {} failed: {}", session_id, e)))
    }

    /// Prompt and hand the turn's envelopes back to the caller. The bus holds
    /// out-of-band pushes for the session until the turn ends; if the caller
    /// drops the stream early, the rest of the turn goes to the bus.
    pub async fn prompt_in_band(
        &self,
        session_id: &str,
        text: &str,
        skill_name: Option<&str>,
        skill_content: Option<&str>,
    ) -> Result<InBandStream> {
        let guard = self.bus.enter_streaming_mode(session_id);
        let stream = self
            .start_turn(session_id, text, skill_name, skill_content)
            .await?;

        let (tx, rx) = mpsc::channel(self.config.bus.subscriber_capacity.max(1));
        let handoff = Arc::new(Mutex::new(()));
        let output = TurnOutput {
            bus: Arc::clone(&self.bus),
            tap: None,
            in_band: Some(InBandSender {
                tx,
                handoff: Arc::clone(&handoff),
            }),
            _guard: Some(guard),
        };
        let driver = TurnDriver::new(session_id, Arc::clone(&self.store));
        tokio::spawn(run_turn(stream, driver, output));

        let mut receiver = InBandReceiver {
            rx,
            bus: Arc::clone(&self.bus),
            handoff,
        };
        Ok(async_stream::stream! {
            while let Some(envelope) = receiver.rx.recv().await {
                yield envelope;
            }
        }
        .boxed())
    }

    /// Cancel the in-flight turn, if any. Succeeds for a known session with
    /// nothing running.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        if let Some(adapter) = self.manager.get(session_id) {
            info!("Cancelling turn for session {}", session_id);
            adapter.cancel();
            return Ok(());
        }
        if self.store.get_session_record(session_id)?.is_some() {
            debug!("Cancel for session {} with no live adapter", session_id);
            return Ok(());
        }
        Err(SessionError::NotFound(session_id.to_string()).into())
    }

    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<()> {
        let adapter = self.live_adapter(session_id).await?;
        adapter.set_mode(mode_id).await?;

        if let Some(mut record) = self.store.get_session_record(session_id)? {
            record.mode_id = Some(mode_id.to_string());
            self.store.upsert_session_record(&record)?;
        }
        Ok(())
    }

    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        self.registry.list(&self.config.providers).await
    }

    pub fn list_sessions(&self, workspace_id: Option<&str>) -> Result<Vec<SessionRecord>> {
        self.store
            .list_session_records(workspace_id.map(str::to_string))
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.store
            .get_session_record(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()).into())
    }

    pub fn attach(&self, session_id: &str) -> Subscription {
        self.bus.attach(session_id)
    }

    pub fn detach(&self, session_id: &str, subscriber: SubscriberId) {
        self.bus.detach(session_id, subscriber);
    }

    /// Kill the adapter; the session record and any backlog stay
    pub async fn kill(&self, session_id: &str) -> bool {
        self.prompted.remove(session_id);
        self.manager.kill(session_id).await
    }

    pub async fn shutdown(&self) {
        info!("Shutting down {} live sessions", self.manager.live_sessions().len());
        self.manager.kill_all().await;
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.manager.is_live(session_id)
    }
}

/// Turn side of an in-band delivery
struct InBandSender {
    tx: mpsc::Sender<NotificationEnvelope>,
    /// Taken before falling back to the bus, so envelopes the reader left
    /// queued are pushed first
    handoff: Arc<Mutex<()>>,
}

/// Caller side of an in-band delivery. Dropping it early hands whatever is
/// still queued to the bus.
struct InBandReceiver {
    rx: mpsc::Receiver<NotificationEnvelope>,
    bus: Arc<NotificationBus>,
    handoff: Arc<Mutex<()>>,
}

impl Drop for InBandReceiver {
    fn drop(&mut self) {
        let _handoff = self.handoff.lock();
        self.rx.close();
        let mut handed = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            self.bus.push(envelope);
            handed += 1;
        }
        if handed > 0 {
            debug!("In-band reader dropped; handed {} queued envelopes to the bus", handed);
        }
    }
}

/// Where a running turn's envelopes go
struct TurnOutput {
    bus: Arc<NotificationBus>,
    tap: Option<TurnTap>,
    in_band: Option<InBandSender>,
    /// Held for in-band turns; dropping it flushes what the bus held back
    _guard: Option<StreamingGuard>,
}

impl TurnOutput {
    async fn emit(&mut self, envelope: NotificationEnvelope) {
        if let Some(tap) = self.tap.as_mut() {
            tap(&envelope);
        }
        let envelope = match &self.in_band {
            Some(sender) => match sender.tx.send(envelope).await {
                Ok(()) => return,
                Err(SendError(envelope)) => envelope,
            },
            None => envelope,
        };
        if let Some(sender) = self.in_band.take() {
            debug!(
                "In-band reader for session {} went away; continuing on the bus",
                envelope.session_id
            );
            let _handoff = sender.handoff.lock();
            self.bus.push(envelope);
            return;
        }
        self.bus.push(envelope);
    }
}

async fn run_turn(
    mut stream: PromptStream,
    mut driver: TurnDriver,
    mut output: TurnOutput,
) -> PromptResponse {
    while let Some(item) = stream.next().await {
        for envelope in driver.observe(item) {
            output.emit(envelope).await;
        }
        if driver.is_done() {
            break;
        }
    }
    for envelope in driver.finish() {
        output.emit(envelope).await;
    }
    driver.response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderDescriptor;
    use crate::skills::MockSkillResolver;
    use crate::storage::{MockSessionStore, Storage};
    use crate::types::{AgentRole, EnvelopeKind, SessionUpdate, StopReason};
    use std::time::Duration;

    fn chat_config() -> CoreConfig {
        let mut config = CoreConfig::default();
        config.providers.chat_api_key = Some("sk-test".to_string());
        config.providers.chat_base_url = "http://127.0.0.1:9".to_string();
        config
    }

    fn service() -> SessionService {
        let store = Arc::new(Storage::in_memory().unwrap());
        SessionService::new(chat_config(), store)
    }

    fn stream_of(items: Vec<Result<NotificationEnvelope>>) -> PromptStream {
        futures::stream::iter(items).boxed()
    }

    async fn drain(subscription: &mut Subscription) -> Vec<EnvelopeKind> {
        let mut kinds = Vec::new();
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(50), subscription.receiver.recv()).await
        {
            kinds.push(envelope.kind());
        }
        kinds
    }

    #[tokio::test]
    async fn test_new_session_persists_record() {
        let service = service();
        let result = service
            .new_session(
                NewSessionOptions::new("openai", "/repo")
                    .with_role(AgentRole::Coordinator)
                    .with_workspace("ws-1"),
            )
            .await
            .unwrap();

        assert_eq!(result.provider, "openai");
        assert_eq!(result.role, AgentRole::Coordinator);
        assert!(service.is_live(&result.session_id));

        let record = service.get_session(&result.session_id).unwrap();
        assert_eq!(record.cwd, "/repo");
        assert_eq!(record.workspace_id, "ws-1");
        assert_eq!(service.list_sessions(Some("ws-1")).unwrap().len(), 1);
        assert!(service.list_sessions(Some("other")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idempotency_key_reuses_session() {
        let service = service();
        let opts = NewSessionOptions::new("openai", "/repo").with_idempotency_key("abc");

        let first = service.new_session(opts.clone()).await.unwrap();
        let second = service.new_session(opts).await.unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(service.manager().live_sessions().len(), 1);

        let third = service
            .new_session(NewSessionOptions::new("openai", "/repo").with_idempotency_key("xyz"))
            .await
            .unwrap();
        assert_ne!(first.session_id, third.session_id);
    }

    #[tokio::test]
    async fn test_new_session_validates_params() {
        let service = service();
        let err = service
            .new_session(NewSessionOptions::new("", "/repo"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn test_failed_persist_kills_adapter() {
        let mut store = MockSessionStore::new();
        store
            .expect_upsert_session_record()
            .returning(|_| Err(Error::Internal("disk full".into())));
        let service = SessionService::new(chat_config(), Arc::new(store));

        assert!(service
            .new_session(NewSessionOptions::new("openai", "/repo"))
            .await
            .is_err());
        assert!(service.manager().live_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_unknown_and_dead_sessions() {
        let service = service();
        let err = service.prompt("missing", "hi", None, None).await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::NotFound(_))));

        service.registry().register_custom(ProviderDescriptor::custom_acp(
            "local",
            "Local",
            "sh",
            vec![],
        ));
        let record = SessionRecord {
            id: "proc-1".into(),
            name: None,
            provider: "local".into(),
            provider_session_id: None,
            cwd: "/repo".into(),
            workspace_id: DEFAULT_WORKSPACE.into(),
            role: AgentRole::Plain,
            mode_id: None,
            model: None,
            parent_session_id: None,
            created_at: chrono::Utc::now(),
        };
        service.store().upsert_session_record(&record).unwrap();

        let err = service.prompt("proc-1", "hi", None, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Provider(ProviderError::ProcessNotRunning(_))
        ));
        assert!(service.cancel("proc-1").await.is_ok());
        assert!(service.cancel("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_spawned_turn_reaches_the_bus_in_order() {
        let service = service();
        let stream = stream_of(vec![
            Ok(NotificationEnvelope::new("s1", SessionUpdate::message("a"))),
            Ok(NotificationEnvelope::new("s1", SessionUpdate::thought("b"))),
            Ok(NotificationEnvelope::turn_complete("s1", StopReason::EndTurn, None)),
            Ok(NotificationEnvelope::new("s1", SessionUpdate::message("late"))),
        ]);

        let response = service.spawn_turn("s1", stream, None).await.unwrap();
        assert_eq!(response.stop_reason, StopReason::EndTurn);

        let mut subscription = service.attach("s1");
        assert_eq!(
            drain(&mut subscription).await,
            vec![
                EnvelopeKind::Connected,
                EnvelopeKind::MessageChunk,
                EnvelopeKind::ThoughtChunk,
                EnvelopeKind::TurnComplete,
            ]
        );
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_reported() {
        let service = service();
        let mut subscription = service.attach("s1");
        let stream = stream_of(vec![
            Ok(NotificationEnvelope::new("s1", SessionUpdate::message("partial"))),
            Err(ProviderError::Prompt("connection reset".into()).into()),
        ]);

        let response = service.spawn_turn("s1", stream, None).await.unwrap();
        assert_eq!(response.stop_reason, StopReason::Error);
        assert_eq!(
            drain(&mut subscription).await,
            vec![
                EnvelopeKind::Connected,
                EnvelopeKind::MessageChunk,
                EnvelopeKind::Error,
                EnvelopeKind::TurnComplete,
            ]
        );
    }

    #[tokio::test]
    async fn test_tap_sees_every_envelope() {
        let service = service();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let stream = stream_of(vec![
            Ok(NotificationEnvelope::new("s1", SessionUpdate::message("a"))),
            Ok(NotificationEnvelope::turn_complete("s1", StopReason::Cancelled, None)),
        ]);

        service
            .spawn_turn("s1", stream, Some(Box::new(move |e| sink.lock().push(e.kind()))))
            .await
            .unwrap();
        assert_eq!(
            *seen.lock(),
            vec![EnvelopeKind::MessageChunk, EnvelopeKind::TurnComplete]
        );
    }

    #[tokio::test]
    async fn test_skill_resolved_by_name() {
        let mut skills = MockSkillResolver::new();
        skills
            .expect_resolve()
            .with(mockall::predicate::eq("review"))
            .times(1)
            .returning(|_| Some("Review carefully".to_string()));
        let service = service().with_skill_resolver(Arc::new(skills));
        let session = service
            .new_session(NewSessionOptions::new("openai", "/repo"))
            .await
            .unwrap();

        // The chat endpoint is unreachable, so the turn fails after the
        // skill lookup and the session is not marked as prompted.
        assert!(service
            .start_turn(&session.session_id, "hi", Some("review"), None)
            .await
            .is_err());
        assert!(!service.prompted.contains(&session.session_id));
    }
}
