use routa_core::{CoreConfig, Orchestrator, SessionService, SessionStore};
use std::sync::Arc;

/// Shared by every request handler
pub struct AppState {
    pub service: Arc<SessionService>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: CoreConfig, store: Arc<dyn SessionStore>) -> Arc<Self> {
        let service = Arc::new(SessionService::new(config, store));
        Arc::new(Self {
            orchestrator: Orchestrator::new(Arc::clone(&service)),
            service,
        })
    }
}
