//! Delegation orchestrator
//!
//! Coordinators hand sub-tasks to worker (or verifier) sessions. Each task
//! moves `created -> delegated -> running -> completed | failed`; the worker's
//! output is re-published on the coordinator's session until the task ends.
//!
//! Agents and tasks live in id-keyed tables. Nothing holds a reference to a
//! parent or child session; lookups go through the session service.

use crate::error::{OrchestrationError, Result};
use crate::session::{SessionService, TurnTap};
use crate::types::{
    AgentRecord, AgentRole, AgentStatus, DelegationRecord, DelegationStatus, DelegationTask,
    NewSessionOptions, NewSessionResult, NotificationEnvelope, PromptResponse,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REPORT_TOOL: &str = "report_to_parent";

pub struct Orchestrator {
    service: Arc<SessionService>,
    agents: DashMap<String, AgentRecord>,
    delegations: DashMap<String, DelegationRecord>,
    watchers: DashMap<String, watch::Sender<DelegationStatus>>,
}

impl Orchestrator {
    pub fn new(service: Arc<SessionService>) -> Arc<Self> {
        Arc::new(Self {
            service,
            agents: DashMap::new(),
            delegations: DashMap::new(),
            watchers: DashMap::new(),
        })
    }

    pub fn service(&self) -> &Arc<SessionService> {
        &self.service
    }

    /// Create a COORDINATOR session and the agent bound to it
    pub async fn create_coordinator(
        &self,
        provider: &str,
        cwd: &str,
        workspace_id: &str,
    ) -> Result<NewSessionResult> {
        let mut result = self
            .service
            .new_session(
                NewSessionOptions::new(provider, cwd)
                    .with_role(AgentRole::Coordinator)
                    .with_workspace(workspace_id),
            )
            .await?;

        let agent = self.ensure_agent(&result.session_id, AgentRole::Coordinator, workspace_id);
        result.routa_agent_id = Some(agent.agent_id);
        Ok(result)
    }

    /// The agent bound to `session_id`, registering one on first use
    pub fn ensure_agent(&self, session_id: &str, role: AgentRole, workspace_id: &str) -> AgentRecord {
        if let Some(agent) = self.agent_for_session(session_id) {
            return agent;
        }
        let agent = self.register_agent(role, workspace_id, session_id, None);
        info!("{} {} bound to session {}", role, agent.agent_id, session_id);
        agent
    }

    fn register_agent(
        &self,
        role: AgentRole,
        workspace_id: &str,
        session_id: &str,
        parent_agent_id: Option<&str>,
    ) -> AgentRecord {
        let agent = AgentRecord {
            agent_id: uuid::Uuid::new_v4().to_string(),
            role,
            workspace_id: workspace_id.to_string(),
            bound_session_id: session_id.to_string(),
            parent_agent_id: parent_agent_id.map(str::to_string),
            status: AgentStatus::Active,
            created_at: chrono::Utc::now(),
        };
        self.agents.insert(agent.agent_id.clone(), agent.clone());
        agent
    }

    /// Spawn a WORKER for `task` and start it. Returns once the worker is
    /// running; completion is tracked in the background.
    pub async fn delegate(
        self: &Arc<Self>,
        caller_agent_id: &str,
        task: DelegationTask,
    ) -> Result<DelegationRecord> {
        self.delegate_as(caller_agent_id, task, AgentRole::Worker).await
    }

    /// Same as `delegate`, with a VERIFIER checking the work
    pub async fn spawn_verifier(
        self: &Arc<Self>,
        caller_agent_id: &str,
        task: DelegationTask,
    ) -> Result<DelegationRecord> {
        self.delegate_as(caller_agent_id, task, AgentRole::Verifier).await
    }

    async fn delegate_as(
        self: &Arc<Self>,
        caller_agent_id: &str,
        task: DelegationTask,
        role: AgentRole,
    ) -> Result<DelegationRecord> {
        let caller = self.delegating_agent(caller_agent_id)?;
        let record = self.register_task(&caller, role);
        self.launch(&record.task_id, &caller, task).await?;
        self.get_delegation(&record.task_id)
    }

    /// Delegate several tasks with at most `concurrency` of them running at
    /// once. Queued tasks stay `created` until a slot frees.
    pub fn delegate_batch(
        self: &Arc<Self>,
        caller_agent_id: &str,
        tasks: Vec<DelegationTask>,
        concurrency: usize,
    ) -> Result<Vec<DelegationRecord>> {
        let caller = self.delegating_agent(caller_agent_id)?;
        let slots = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut created = Vec::with_capacity(tasks.len());

        for task in tasks {
            let record = self.register_task(&caller, AgentRole::Worker);
            created.push(record.clone());

            let this = Arc::clone(self);
            let caller = caller.clone();
            let slots = Arc::clone(&slots);
            tokio::spawn(async move {
                let Ok(_permit) = slots.acquire_owned().await else {
                    return;
                };
                match this.launch(&record.task_id, &caller, task).await {
                    Ok(completion) => {
                        if let Err(e) = completion.await {
                            error!("Completion watcher for task {} failed: {}", record.task_id, e);
                        }
                    }
                    Err(e) => warn!("Task {} failed to start: {}", record.task_id, e),
                }
            });
        }

        info!(
            "Queued {} tasks from {} with concurrency {}",
            created.len(),
            caller_agent_id,
            concurrency.max(1)
        );
        Ok(created)
    }

    fn delegating_agent(&self, agent_id: &str) -> Result<AgentRecord> {
        let agent = self.get_agent(agent_id)?;
        if agent.role != AgentRole::Coordinator {
            return Err(OrchestrationError::InvalidRole {
                agent_id: agent_id.to_string(),
                role: agent.role.to_string(),
                action: "delegate".to_string(),
            }
            .into());
        }
        Ok(agent)
    }

    fn register_task(&self, caller: &AgentRecord, role: AgentRole) -> DelegationRecord {
        let now = chrono::Utc::now();
        let record = DelegationRecord {
            task_id: uuid::Uuid::new_v4().to_string(),
            caller_agent_id: caller.agent_id.clone(),
            worker_agent_id: None,
            child_session_id: None,
            parent_session_id: caller.bound_session_id.clone(),
            role,
            status: DelegationStatus::Created,
            summary: None,
            created_at: now,
            updated_at: now,
        };
        let (tx, _) = watch::channel(DelegationStatus::Created);
        self.watchers.insert(record.task_id.clone(), tx);
        self.delegations.insert(record.task_id.clone(), record.clone());
        record
    }

    /// Take a `created` task through `delegated` to `running`. The returned
    /// handle resolves once the task reached a terminal state.
    async fn launch(
        self: &Arc<Self>,
        task_id: &str,
        caller: &AgentRecord,
        task: DelegationTask,
    ) -> Result<JoinHandle<()>> {
        match self.try_launch(task_id, caller, task).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.finish_task(task_id, false, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn try_launch(
        self: &Arc<Self>,
        task_id: &str,
        caller: &AgentRecord,
        task: DelegationTask,
    ) -> Result<JoinHandle<()>> {
        let parent = self.service.get_session(&caller.bound_session_id)?;
        let role = self.get_delegation(task_id)?.role;

        let mut opts = NewSessionOptions::new(
            task.provider.clone().unwrap_or_else(|| parent.provider.clone()),
            parent.cwd.clone(),
        )
        .with_role(role)
        .with_workspace(caller.workspace_id.clone())
        .with_parent(parent.id.clone());
        opts.name = task.title.clone();
        opts.model = parent.model.clone();

        let child = self.service.new_session(opts).await?;
        let worker = self.register_agent(
            role,
            &caller.workspace_id,
            &child.session_id,
            Some(&caller.agent_id),
        );
        self.update_delegation(task_id, |record| {
            record.worker_agent_id = Some(worker.agent_id.clone());
            record.child_session_id = Some(child.session_id.clone());
            record.status = DelegationStatus::Delegated;
        });
        info!(
            "Task {} delegated to {} {} on session {}",
            task_id, role, worker.agent_id, child.session_id
        );

        let stream = self
            .service
            .start_turn(&child.session_id, &task.prompt, None, None)
            .await?;
        self.update_delegation(task_id, |record| record.status = DelegationStatus::Running);

        let tap = self.reroute_tap(task_id, &parent.id, &worker.agent_id);
        let turn = self.service.spawn_turn(&child.session_id, stream, Some(tap));

        let this = Arc::clone(self);
        let task_id = task_id.to_string();
        Ok(tokio::spawn(async move {
            match turn.await {
                Ok(response) => this.complete_from_turn(&task_id, &response),
                Err(e) => this.finish_task(&task_id, false, Some(format!("worker turn aborted: {}", e))),
            }
        }))
    }

    /// Re-publishes child output on the parent session and watches for an
    /// explicit report from the worker
    fn reroute_tap(self: &Arc<Self>, task_id: &str, parent_session_id: &str, agent_id: &str) -> TurnTap {
        let this = Arc::clone(self);
        let task_id = task_id.to_string();
        let parent_session_id = parent_session_id.to_string();
        let agent_id = agent_id.to_string();

        Box::new(move |envelope: &NotificationEnvelope| {
            if this.is_terminal(&task_id) {
                return;
            }
            this.service
                .bus()
                .push(envelope.rerouted(&parent_session_id, &agent_id));

            if let Some((tool, Some(input))) = envelope.update.tool_invocation() {
                if tool.ends_with(REPORT_TOOL) {
                    let success = input["success"].as_bool().unwrap_or(true);
                    let summary = input["summary"].as_str().map(str::to_string);
                    this.finish_task(&task_id, success, summary);
                }
            }
        })
    }

    fn complete_from_turn(&self, task_id: &str, response: &PromptResponse) {
        if self.is_terminal(task_id) {
            return;
        }
        let success = response.stop_reason.is_success();
        let summary = (!success).then(|| format!("worker stopped: {:?}", response.stop_reason));
        self.finish_task(task_id, success, summary);
    }

    /// Explicit completion signal from a worker agent
    pub fn report_to_parent(&self, worker_agent_id: &str, success: bool, summary: Option<String>) -> Result<DelegationRecord> {
        self.get_agent(worker_agent_id)?;
        let task_id = self
            .delegations
            .iter()
            .find(|d| d.worker_agent_id.as_deref() == Some(worker_agent_id) && !d.status.is_terminal())
            .map(|d| d.task_id.clone())
            .ok_or_else(|| OrchestrationError::TaskNotFound(format!("open task for {}", worker_agent_id)))?;

        self.finish_task(&task_id, success, summary);
        self.get_delegation(&task_id)
    }

    /// Move a task to its terminal state and release the worker's adapter.
    /// Later calls for the same task are ignored.
    fn finish_task(&self, task_id: &str, success: bool, summary: Option<String>) {
        let status = if success {
            DelegationStatus::Completed
        } else {
            DelegationStatus::Failed
        };

        let (worker, child) = {
            let Some(mut record) = self.delegations.get_mut(task_id) else {
                warn!("Completion for unknown task {}", task_id);
                return;
            };
            if record.status.is_terminal() {
                debug!("Task {} already {:?}", task_id, record.status);
                return;
            }
            record.status = status;
            record.summary = summary;
            record.updated_at = chrono::Utc::now();
            (record.worker_agent_id.clone(), record.child_session_id.clone())
        };

        if let Some(mut agent) = worker.and_then(|id| self.agents.get_mut(&id)) {
            agent.status = if success {
                AgentStatus::Completed
            } else {
                AgentStatus::Failed
            };
        }
        if let Some(child) = child {
            self.release_worker(child);
        }
        if let Some(tx) = self.watchers.get(task_id) {
            tx.send_replace(status);
        }
        info!("Task {} {:?}", task_id, status);
    }

    /// Kill a finished worker's adapter; its session record stays listed
    fn release_worker(&self, child_session_id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to release worker session {}", child_session_id);
            return;
        };
        let service = Arc::clone(&self.service);
        runtime.spawn(async move {
            if service.kill(&child_session_id).await {
                debug!("Released worker session {}", child_session_id);
            }
        });
    }

    fn update_delegation(&self, task_id: &str, apply: impl FnOnce(&mut DelegationRecord)) {
        let status = match self.delegations.get_mut(task_id) {
            Some(mut record) => {
                apply(&mut record);
                record.updated_at = chrono::Utc::now();
                record.status
            }
            None => return,
        };
        if let Some(tx) = self.watchers.get(task_id) {
            tx.send_replace(status);
        }
    }

    fn is_terminal(&self, task_id: &str) -> bool {
        self.delegations
            .get(task_id)
            .map(|d| d.status.is_terminal())
            .unwrap_or(true)
    }

    /// Resolve once the task completes or fails
    pub async fn wait_for_task(&self, task_id: &str) -> Result<DelegationRecord> {
        let mut rx = self
            .watchers
            .get(task_id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| OrchestrationError::TaskNotFound(task_id.to_string()))?;

        if rx.wait_for(|status| status.is_terminal()).await.is_err() {
            return Err(OrchestrationError::TaskNotFound(task_id.to_string()).into());
        }
        self.get_delegation(task_id)
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<AgentRecord> {
        self.agents
            .get(agent_id)
            .map(|a| a.clone())
            .ok_or_else(|| OrchestrationError::AgentNotFound(agent_id.to_string()).into())
    }

    pub fn get_delegation(&self, task_id: &str) -> Result<DelegationRecord> {
        self.delegations
            .get(task_id)
            .map(|d| d.clone())
            .ok_or_else(|| OrchestrationError::TaskNotFound(task_id.to_string()).into())
    }

    pub fn list_agents(&self, workspace_id: Option<&str>) -> Vec<AgentRecord> {
        let mut agents: Vec<_> = self
            .agents
            .iter()
            .filter(|a| workspace_id.map_or(true, |w| a.workspace_id == w))
            .map(|a| a.clone())
            .collect();
        agents.sort_by_key(|a| a.created_at);
        agents
    }

    /// Tasks whose worker reports to `parent_session_id`
    pub fn list_delegations(&self, parent_session_id: &str) -> Vec<DelegationRecord> {
        let mut tasks: Vec<_> = self
            .delegations
            .iter()
            .filter(|d| d.parent_session_id == parent_session_id)
            .map(|d| d.clone())
            .collect();
        tasks.sort_by_key(|d| d.created_at);
        tasks
    }

    /// The agent bound to a session, if any
    pub fn agent_for_session(&self, session_id: &str) -> Option<AgentRecord> {
        self.agents
            .iter()
            .find(|a| a.bound_session_id == session_id)
            .map(|a| a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::error::Error;
    use crate::storage::Storage;

    fn orchestrator() -> Arc<Orchestrator> {
        let mut config = CoreConfig::default();
        config.providers.chat_api_key = Some("sk-test".to_string());
        config.providers.chat_base_url = "http://127.0.0.1:9".to_string();
        let store = Arc::new(Storage::in_memory().unwrap());
        Orchestrator::new(Arc::new(SessionService::new(config, store)))
    }

    #[tokio::test]
    async fn test_create_coordinator_binds_agent() {
        let orch = orchestrator();
        let result = orch.create_coordinator("openai", "/repo", "ws").await.unwrap();

        let agent_id = result.routa_agent_id.clone().unwrap();
        let agent = orch.get_agent(&agent_id).unwrap();
        assert_eq!(agent.role, AgentRole::Coordinator);
        assert_eq!(agent.bound_session_id, result.session_id);
        assert_eq!(result.role, AgentRole::Coordinator);
        assert_eq!(orch.agent_for_session(&result.session_id).unwrap().agent_id, agent_id);
        assert_eq!(orch.list_agents(Some("ws")).len(), 1);
    }

    #[tokio::test]
    async fn test_only_coordinators_delegate() {
        let orch = orchestrator();
        let err = orch
            .delegate("nobody", DelegationTask::new("work"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Orchestration(OrchestrationError::AgentNotFound(_))
        ));

        let coordinator = orch.create_coordinator("openai", "/repo", "ws").await.unwrap();
        let worker = orch.register_agent(
            AgentRole::Worker,
            "ws",
            "child",
            coordinator.routa_agent_id.as_deref(),
        );
        let err = orch
            .delegate(&worker.agent_id, DelegationTask::new("work"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Orchestration(OrchestrationError::InvalidRole { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_start_marks_task_failed() {
        let orch = orchestrator();
        let coordinator = orch.create_coordinator("openai", "/repo", "ws").await.unwrap();
        let caller = coordinator.routa_agent_id.unwrap();

        // The chat endpoint is unreachable, so the worker's first turn fails.
        assert!(orch.delegate(&caller, DelegationTask::new("work")).await.is_err());

        let tasks = orch.list_delegations(&coordinator.session_id);
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.status, DelegationStatus::Failed);
        assert!(task.summary.is_some());

        let child_id = task.child_session_id.clone().unwrap();
        let child = orch.service().get_session(&child_id).unwrap();
        assert_eq!(child.role, AgentRole::Worker);
        assert_eq!(child.parent_session_id.as_deref(), Some(coordinator.session_id.as_str()));
        assert_eq!(
            orch.get_agent(task.worker_agent_id.as_deref().unwrap()).unwrap().status,
            AgentStatus::Failed
        );

        let done = orch.wait_for_task(&task.task_id).await.unwrap();
        assert_eq!(done.status, DelegationStatus::Failed);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!orch.service().is_live(&child_id));
        assert!(orch.service().is_live(&coordinator.session_id));
    }

    #[tokio::test]
    async fn test_report_to_parent_is_terminal_once() {
        let orch = orchestrator();
        let coordinator = orch.create_coordinator("openai", "/repo", "ws").await.unwrap();
        let caller = orch.get_agent(coordinator.routa_agent_id.as_deref().unwrap()).unwrap();

        let task = orch.register_task(&caller, AgentRole::Worker);
        let worker = orch.register_agent(AgentRole::Worker, "ws", "child-1", Some(&caller.agent_id));
        orch.update_delegation(&task.task_id, |r| {
            r.worker_agent_id = Some(worker.agent_id.clone());
            r.child_session_id = Some("child-1".into());
            r.status = DelegationStatus::Running;
        });

        let done = orch
            .report_to_parent(&worker.agent_id, true, Some("all green".into()))
            .unwrap();
        assert_eq!(done.status, DelegationStatus::Completed);
        assert_eq!(done.summary.as_deref(), Some("all green"));

        orch.complete_from_turn(
            &task.task_id,
            &PromptResponse {
                stop_reason: crate::types::StopReason::Error,
                usage: None,
            },
        );
        assert_eq!(
            orch.get_delegation(&task.task_id).unwrap().status,
            DelegationStatus::Completed
        );
        assert!(orch.report_to_parent(&worker.agent_id, false, None).is_err());
    }

    #[tokio::test]
    async fn test_reroute_stops_after_terminal() {
        let orch = orchestrator();
        let coordinator = orch.create_coordinator("openai", "/repo", "ws").await.unwrap();
        let caller = orch.get_agent(coordinator.routa_agent_id.as_deref().unwrap()).unwrap();
        let task = orch.register_task(&caller, AgentRole::Worker);
        let mut parent = orch.service().attach(&coordinator.session_id);

        let mut tap = orch.reroute_tap(&task.task_id, &coordinator.session_id, "worker-1");
        tap(&NotificationEnvelope::new(
            "child-1",
            crate::types::SessionUpdate::message("working"),
        ));
        orch.finish_task(&task.task_id, true, None);
        tap(&NotificationEnvelope::new(
            "child-1",
            crate::types::SessionUpdate::message("ignored"),
        ));

        let connected = parent.receiver.recv().await.unwrap();
        assert_eq!(connected.kind(), crate::types::EnvelopeKind::Connected);
        let rerouted = parent.receiver.recv().await.unwrap();
        assert_eq!(rerouted.session_id, coordinator.session_id);
        assert_eq!(rerouted.agent_id.as_deref(), Some("worker-1"));
        assert_eq!(rerouted.child_session_id.as_deref(), Some("child-1"));
        assert!(parent.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unstartable_worker_leaves_no_child() {
        let orch = orchestrator();
        let coordinator = orch.create_coordinator("openai", "/repo", "ws").await.unwrap();
        let caller = coordinator.routa_agent_id.unwrap();

        let task = DelegationTask {
            provider: Some("no-such-provider".into()),
            ..DelegationTask::new("work")
        };
        assert!(orch.delegate(&caller, task).await.is_err());

        let tasks = orch.list_delegations(&coordinator.session_id);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, DelegationStatus::Failed);
        assert!(tasks[0].child_session_id.is_none());
        assert!(tasks[0].worker_agent_id.is_none());
        assert_eq!(orch.list_agents(Some("ws")).len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_unknown_task() {
        let orch = orchestrator();
        assert!(orch.wait_for_task("missing").await.is_err());
        assert!(orch.list_delegations("nobody").is_empty());
    }
}
