//! Shared fixtures for the orchestrator integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::Value as JsonValue;

use agentops_access::{
    AgentInstance, BillingPeriod, Entitlement, GateRecords, PermissionRecord,
};
use agentops_agents::AgentExecutor;
use agentops_core::{AgentInstanceId, Clock, ManualClock, QueueItemId, RunId, RunnerId, WorkspaceId};
use agentops_infra::{
    AgentRun, AttemptResult, ErrorReport, InMemoryStore, NewAgentRun, NewQueueItem, Orchestrator,
    OrchestratorConfig, OrchestratorStore, QueueItem, QueueStats, RunCompletion, StoreError,
    SystemEvent,
};

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn runner(id: &str) -> RunnerId {
    RunnerId::new(id).unwrap()
}

/// An in-memory store seeded with one fully authorized agent.
pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub workspace_id: WorkspaceId,
    pub agent: AgentInstance,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_store(InMemoryStore::new())
    }

    pub fn with_store(store: InMemoryStore) -> Self {
        Self::with_agent_type(store, "sales.follow_up")
    }

    pub fn with_agent_type(store: InMemoryStore, agent_type: &str) -> Self {
        let store = Arc::new(store);
        let workspace_id = WorkspaceId::new();
        let agent = AgentInstance::new(workspace_id, agent_type);

        store.insert_agent_instance(agent.clone()).unwrap();
        store
            .insert_entitlement(Entitlement::active(
                workspace_id,
                "growth",
                BillingPeriod {
                    starts_at: start() - ChronoDuration::days(10),
                    ends_at: start() + ChronoDuration::days(20),
                },
            ))
            .unwrap();
        store
            .insert_permission_record(
                PermissionRecord::new(agent.id, workspace_id).with_scope("crm.read"),
            )
            .unwrap();

        Self {
            store,
            clock: Arc::new(ManualClock::new(start())),
            workspace_id,
            agent,
        }
    }

    pub fn orchestrator<E>(&self, runner_id: &str, executor: Arc<E>) -> Orchestrator<Arc<InMemoryStore>, E>
    where
        E: AgentExecutor + ?Sized + 'static,
    {
        Orchestrator::new(
            Arc::clone(&self.store),
            executor,
            OrchestratorConfig::new(runner(runner_id)).with_environment("test"),
        )
        .with_clock(self.clock.clone())
    }

    pub fn new_item(&self, job_type: &str, payload: JsonValue) -> NewQueueItem {
        NewQueueItem::new(self.workspace_id, self.agent.id, job_type, payload)
    }

    pub async fn enqueue(&self, job_type: &str, payload: JsonValue) -> QueueItem {
        self.store
            .enqueue_queue_item(self.new_item(job_type, payload), self.clock.now())
            .await
            .unwrap()
    }

    /// Insert an item in an arbitrary state, bypassing the enqueue path.
    pub fn insert(&self, edit: impl FnOnce(&mut QueueItem)) -> QueueItem {
        let mut item = self
            .new_item("follow_up.draft", serde_json::json!({ "lead": "ada" }))
            .into_queue_item(start())
            .unwrap();
        edit(&mut item);
        self.store.insert_queue_item(item.clone()).unwrap();
        item
    }

    pub async fn item(&self, id: QueueItemId) -> QueueItem {
        self.store.get_queue_item(id).await.unwrap().unwrap()
    }
}

/// When the rival runner grabs the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Race {
    /// Right after our fetch returns, so our lock attempt loses.
    AfterFetch,
    /// Between our lock and our `mark_queue_item_running`.
    BeforeStart,
}

/// Delegating store that lets a rival runner win a race at a chosen point.
pub struct RacingStore {
    pub inner: Arc<InMemoryStore>,
    pub rival: RunnerId,
    pub race: Race,
}

#[async_trait]
impl GateRecords for RacingStore {
    type Error = StoreError;

    async fn get_agent_instance(
        &self,
        id: AgentInstanceId,
    ) -> Result<Option<AgentInstance>, StoreError> {
        self.inner.get_agent_instance(id).await
    }

    async fn get_active_entitlement(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Option<Entitlement>, StoreError> {
        self.inner.get_active_entitlement(workspace_id).await
    }

    async fn get_permission_record(
        &self,
        agent_instance_id: AgentInstanceId,
    ) -> Result<Option<PermissionRecord>, StoreError> {
        self.inner.get_permission_record(agent_instance_id).await
    }
}

#[async_trait]
impl OrchestratorStore for RacingStore {
    async fn enqueue_queue_item(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        self.inner.enqueue_queue_item(item, now).await
    }

    async fn get_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        self.inner.get_queue_item(id).await
    }

    async fn fetch_next_queue_item(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        let item = self.inner.fetch_next_queue_item(now).await?;
        if let (Some(item), Race::AfterFetch) = (&item, self.race) {
            self.inner.lock_queue_item(item.id, &self.rival, now).await?;
        }
        Ok(item)
    }

    async fn lock_queue_item(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.lock_queue_item(id, runner_id, now).await
    }

    async fn mark_queue_item_running(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if self.race == Race::BeforeStart {
            self.inner.release_lock(id, runner_id, now).await?;
            self.inner.lock_queue_item(id, &self.rival, now).await?;
        }
        self.inner.mark_queue_item_running(id, runner_id, now).await
    }

    async fn mark_queue_item_result(
        &self,
        id: QueueItemId,
        result: AttemptResult,
    ) -> Result<QueueItem, StoreError> {
        self.inner.mark_queue_item_result(id, result).await
    }

    async fn release_lock(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.release_lock(id, runner_id, now).await
    }

    async fn renew_lease(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.renew_lease(id, runner_id, now).await
    }

    async fn requeue_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.requeue_expired_leases(now).await
    }

    async fn cancel_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.cancel_queue_item(id, now).await
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        self.inner.queue_stats().await
    }

    async fn create_agent_run(&self, run: NewAgentRun) -> Result<AgentRun, StoreError> {
        self.inner.create_agent_run(run).await
    }

    async fn complete_agent_run(
        &self,
        id: RunId,
        completion: RunCompletion,
    ) -> Result<AgentRun, StoreError> {
        self.inner.complete_agent_run(id, completion).await
    }

    async fn get_agent_run(&self, id: RunId) -> Result<Option<AgentRun>, StoreError> {
        self.inner.get_agent_run(id).await
    }

    async fn list_runs_for_queue_item(
        &self,
        queue_item_id: QueueItemId,
    ) -> Result<Vec<AgentRun>, StoreError> {
        self.inner.list_runs_for_queue_item(queue_item_id).await
    }

    async fn record_system_event(&self, event: SystemEvent) -> Result<(), StoreError> {
        self.inner.record_system_event(event).await
    }

    async fn record_error_report(&self, report: ErrorReport) -> Result<(), StoreError> {
        self.inner.record_error_report(report).await
    }
}
