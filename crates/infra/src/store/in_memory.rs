//! In-memory adapter for tests, benchmarks and single-process dev runs.
//!
//! Each operation takes the write lock it needs for its whole duration, so
//! the lock compare-and-set is atomic with respect to every other call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use agentops_access::{AgentInstance, Entitlement, GateRecords, PermissionRecord};
use agentops_core::{AgentInstanceId, QueueItemId, RunId, RunnerId, WorkspaceId};

use super::{OrchestratorStore, QueueStats, StoreError};
use crate::queue::{
    AttemptResult, LEASE_DURATION, NewQueueItem, QueueItem, QueueStatus, RetryPolicy,
};
use crate::records::{AgentRun, ErrorReport, NewAgentRun, RunCompletion, SystemEvent};

#[derive(Debug)]
pub struct InMemoryStore {
    queue: RwLock<HashMap<QueueItemId, QueueItem>>,
    agents: RwLock<HashMap<AgentInstanceId, AgentInstance>>,
    entitlements: RwLock<HashMap<WorkspaceId, Entitlement>>,
    permissions: RwLock<HashMap<AgentInstanceId, PermissionRecord>>,
    runs: RwLock<HashMap<RunId, AgentRun>>,
    events: RwLock<Vec<SystemEvent>>,
    error_reports: RwLock<Vec<ErrorReport>>,
    /// One-shot injected failures, keyed by operation name.
    faults: Mutex<HashSet<&'static str>>,
    lease: Duration,
    retry_policy: RetryPolicy,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            queue: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            entitlements: RwLock::new(HashMap::new()),
            permissions: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            error_reports: RwLock::new(Vec::new()),
            faults: Mutex::new(HashSet::new()),
            lease: LEASE_DURATION,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    // Seeding (test/dev helpers)

    pub fn insert_agent_instance(&self, agent: AgentInstance) -> Result<(), StoreError> {
        write(&self.agents)?.insert(agent.id, agent);
        Ok(())
    }

    /// Replaces any entitlement already held by the same workspace.
    pub fn insert_entitlement(&self, entitlement: Entitlement) -> Result<(), StoreError> {
        write(&self.entitlements)?.insert(entitlement.workspace_id, entitlement);
        Ok(())
    }

    pub fn insert_permission_record(&self, record: PermissionRecord) -> Result<(), StoreError> {
        write(&self.permissions)?.insert(record.agent_instance_id, record);
        Ok(())
    }

    /// Insert an item as-is, bypassing `NewQueueItem` validation.
    pub fn insert_queue_item(&self, item: QueueItem) -> Result<(), StoreError> {
        write(&self.queue)?.insert(item.id, item);
        Ok(())
    }

    /// Make the next call to `operation` fail with a storage error.
    pub fn fail_next(&self, operation: &'static str) {
        self.faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(operation);
    }

    // Inspection (test/dev helpers)

    pub fn queue_items(&self) -> Vec<QueueItem> {
        read(&self.queue)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn runs(&self) -> Vec<AgentRun> {
        let mut runs: Vec<AgentRun> = read(&self.runs)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        runs.sort_by_key(|r| (r.started_at, r.id));
        runs
    }

    pub fn system_events(&self) -> Vec<SystemEvent> {
        read(&self.events).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn error_reports(&self) -> Vec<ErrorReport> {
        read(&self.error_reports).map(|v| v.clone()).unwrap_or_default()
    }

    fn check_fault(&self, operation: &'static str) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        if faults.remove(operation) {
            return Err(StoreError::Storage(format!("injected failure in {operation}")));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Storage("in-memory store lock poisoned".into()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Storage("in-memory store lock poisoned".into()))
}

fn not_found(what: &str, id: impl core::fmt::Display) -> StoreError {
    StoreError::NotFound(format!("{what} {id}"))
}

#[async_trait]
impl GateRecords for InMemoryStore {
    type Error = StoreError;

    async fn get_agent_instance(
        &self,
        id: AgentInstanceId,
    ) -> Result<Option<AgentInstance>, StoreError> {
        self.check_fault("get_agent_instance")?;
        Ok(read(&self.agents)?.get(&id).cloned())
    }

    async fn get_active_entitlement(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Option<Entitlement>, StoreError> {
        self.check_fault("get_active_entitlement")?;
        Ok(read(&self.entitlements)?
            .get(&workspace_id)
            .filter(|e| e.is_active())
            .cloned())
    }

    async fn get_permission_record(
        &self,
        agent_instance_id: AgentInstanceId,
    ) -> Result<Option<PermissionRecord>, StoreError> {
        self.check_fault("get_permission_record")?;
        Ok(read(&self.permissions)?.get(&agent_instance_id).cloned())
    }
}

#[async_trait]
impl OrchestratorStore for InMemoryStore {
    async fn enqueue_queue_item(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        self.check_fault("enqueue_queue_item")?;
        let item = item.into_queue_item(now)?;
        let mut queue = write(&self.queue)?;
        if queue.contains_key(&item.id) {
            return Err(StoreError::Conflict(format!("queue item {} exists", item.id)));
        }
        queue.insert(item.id, item.clone());
        Ok(item)
    }

    async fn get_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        self.check_fault("get_queue_item")?;
        Ok(read(&self.queue)?.get(&id).cloned())
    }

    async fn fetch_next_queue_item(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        self.check_fault("fetch_next_queue_item")?;
        let queue = read(&self.queue)?;
        let next = queue
            .values()
            .filter(|item| item.is_eligible(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_at.cmp(&b.scheduled_at))
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .cloned();
        Ok(next)
    }

    async fn lock_queue_item(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_fault("lock_queue_item")?;
        let mut queue = write(&self.queue)?;
        match queue.get_mut(&id) {
            Some(item) => Ok(item.try_lock(runner_id, now, self.lease)),
            None => Ok(false),
        }
    }

    async fn mark_queue_item_running(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_fault("mark_queue_item_running")?;
        let mut queue = write(&self.queue)?;
        let item = queue.get_mut(&id).ok_or_else(|| not_found("queue item", id))?;
        Ok(item.start_running(runner_id, now))
    }

    async fn mark_queue_item_result(
        &self,
        id: QueueItemId,
        result: AttemptResult,
    ) -> Result<QueueItem, StoreError> {
        self.check_fault("mark_queue_item_result")?;
        let mut queue = write(&self.queue)?;
        let item = queue.get_mut(&id).ok_or_else(|| not_found("queue item", id))?;
        item.apply_result(&result, &self.retry_policy)?;
        Ok(item.clone())
    }

    async fn release_lock(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_fault("release_lock")?;
        let mut queue = write(&self.queue)?;
        match queue.get_mut(&id) {
            Some(item) => Ok(item.release(runner_id, now)),
            None => Ok(false),
        }
    }

    async fn renew_lease(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_fault("renew_lease")?;
        let mut queue = write(&self.queue)?;
        match queue.get_mut(&id) {
            Some(item) => Ok(item.renew_lease(runner_id, now)),
            None => Ok(false),
        }
    }

    async fn requeue_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_fault("requeue_expired_leases")?;
        let mut queue = write(&self.queue)?;
        let moved = queue
            .values_mut()
            .map(|item| item.requeue_if_expired(now, self.lease))
            .filter(|moved| *moved)
            .count();
        Ok(moved as u64)
    }

    async fn cancel_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_fault("cancel_queue_item")?;
        let mut queue = write(&self.queue)?;
        let item = queue.get_mut(&id).ok_or_else(|| not_found("queue item", id))?;
        Ok(item.cancel(now))
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        self.check_fault("queue_stats")?;
        let queue = read(&self.queue)?;
        let mut stats = QueueStats::default();
        for item in queue.values() {
            match item.status {
                QueueStatus::Queued => stats.queued += 1,
                QueueStatus::Locked => stats.locked += 1,
                QueueStatus::Running => stats.running += 1,
                QueueStatus::Succeeded => stats.succeeded += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::Canceled => stats.canceled += 1,
            }
        }
        Ok(stats)
    }

    async fn create_agent_run(&self, run: NewAgentRun) -> Result<AgentRun, StoreError> {
        self.check_fault("create_agent_run")?;
        let run = run.into_run();
        write(&self.runs)?.insert(run.id, run.clone());
        Ok(run)
    }

    async fn complete_agent_run(
        &self,
        id: RunId,
        completion: RunCompletion,
    ) -> Result<AgentRun, StoreError> {
        self.check_fault("complete_agent_run")?;
        let mut runs = write(&self.runs)?;
        let run = runs.get_mut(&id).ok_or_else(|| not_found("run", id))?;
        run.complete(completion)?;
        Ok(run.clone())
    }

    async fn get_agent_run(&self, id: RunId) -> Result<Option<AgentRun>, StoreError> {
        self.check_fault("get_agent_run")?;
        Ok(read(&self.runs)?.get(&id).cloned())
    }

    async fn list_runs_for_queue_item(
        &self,
        queue_item_id: QueueItemId,
    ) -> Result<Vec<AgentRun>, StoreError> {
        self.check_fault("list_runs_for_queue_item")?;
        let mut runs: Vec<AgentRun> = read(&self.runs)?
            .values()
            .filter(|r| r.queue_item_id == queue_item_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| (r.started_at, r.id));
        Ok(runs)
    }

    async fn record_system_event(&self, event: SystemEvent) -> Result<(), StoreError> {
        self.check_fault("record_system_event")?;
        write(&self.events)?.push(event);
        Ok(())
    }

    async fn record_error_report(&self, report: ErrorReport) -> Result<(), StoreError> {
        self.check_fault("record_error_report")?;
        write(&self.error_reports)?.push(report);
        Ok(())
    }
}
