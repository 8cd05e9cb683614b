//! Persistence adapter contract and its implementations.
//!
//! Every operation is one logical atomic step. `lock_queue_item` is the only
//! read-check-write that needs true compare-and-set semantics; adapters must
//! not implement it as an unguarded read followed by a write.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use agentops_access::GateRecords;
use agentops_core::{DomainError, QueueItemId, RunId, RunnerId};

use crate::queue::{AttemptResult, NewQueueItem, QueueItem};
use crate::records::{AgentRun, ErrorReport, NewAgentRun, RunCompletion, SystemEvent};

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Persistence error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvariantViolation(msg) => StoreError::Conflict(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                StoreError::Serialization(msg)
            }
        }
    }
}

/// Queue counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub locked: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.queued + self.locked + self.running + self.succeeded + self.failed + self.canceled
    }
}

/// Everything the orchestrator needs from storage.
///
/// Gate record lookups (`get_agent_instance`, `get_active_entitlement`,
/// `get_permission_record`) come from the `GateRecords` supertrait.
#[async_trait]
pub trait OrchestratorStore: GateRecords<Error = StoreError> {
    /// Insert a new `queued` item.
    async fn enqueue_queue_item(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError>;

    async fn get_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError>;

    /// Highest priority eligible item, earliest `scheduled_at` first. Read-only.
    async fn fetch_next_queue_item(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError>;

    /// Atomic compare-and-set lock acquisition.
    async fn lock_queue_item(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `locked → running`. False when this runner no longer holds the lock.
    async fn mark_queue_item_running(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Terminal transition for one attempt; applies the retry policy on failure.
    async fn mark_queue_item_result(
        &self,
        id: QueueItemId,
        result: AttemptResult,
    ) -> Result<QueueItem, StoreError>;

    /// Idempotent. Clears the lock only while `runner_id` holds it; `now`
    /// stamps `updated_at` when something changed.
    async fn release_lock(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Heartbeat: refresh `locked_at` while `runner_id` holds the lock.
    async fn renew_lease(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Return abandoned held items to `queued`. Returns how many moved.
    async fn requeue_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// `queued → canceled`. False for held or terminal items.
    async fn cancel_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn queue_stats(&self) -> Result<QueueStats, StoreError>;

    async fn create_agent_run(&self, run: NewAgentRun) -> Result<AgentRun, StoreError>;

    /// Fails with `Conflict` if the run was already completed.
    async fn complete_agent_run(
        &self,
        id: RunId,
        completion: RunCompletion,
    ) -> Result<AgentRun, StoreError>;

    async fn get_agent_run(&self, id: RunId) -> Result<Option<AgentRun>, StoreError>;

    /// Runs for one queue item, oldest first.
    async fn list_runs_for_queue_item(
        &self,
        queue_item_id: QueueItemId,
    ) -> Result<Vec<AgentRun>, StoreError>;

    async fn record_system_event(&self, event: SystemEvent) -> Result<(), StoreError>;

    async fn record_error_report(&self, report: ErrorReport) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: OrchestratorStore + ?Sized> OrchestratorStore for Arc<S> {
    async fn enqueue_queue_item(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        (**self).enqueue_queue_item(item, now).await
    }

    async fn get_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        (**self).get_queue_item(id).await
    }

    async fn fetch_next_queue_item(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        (**self).fetch_next_queue_item(now).await
    }

    async fn lock_queue_item(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).lock_queue_item(id, runner_id, now).await
    }

    async fn mark_queue_item_running(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).mark_queue_item_running(id, runner_id, now).await
    }

    async fn mark_queue_item_result(
        &self,
        id: QueueItemId,
        result: AttemptResult,
    ) -> Result<QueueItem, StoreError> {
        (**self).mark_queue_item_result(id, result).await
    }

    async fn release_lock(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).release_lock(id, runner_id, now).await
    }

    async fn renew_lease(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).renew_lease(id, runner_id, now).await
    }

    async fn requeue_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).requeue_expired_leases(now).await
    }

    async fn cancel_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).cancel_queue_item(id, now).await
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        (**self).queue_stats().await
    }

    async fn create_agent_run(&self, run: NewAgentRun) -> Result<AgentRun, StoreError> {
        (**self).create_agent_run(run).await
    }

    async fn complete_agent_run(
        &self,
        id: RunId,
        completion: RunCompletion,
    ) -> Result<AgentRun, StoreError> {
        (**self).complete_agent_run(id, completion).await
    }

    async fn get_agent_run(&self, id: RunId) -> Result<Option<AgentRun>, StoreError> {
        (**self).get_agent_run(id).await
    }

    async fn list_runs_for_queue_item(
        &self,
        queue_item_id: QueueItemId,
    ) -> Result<Vec<AgentRun>, StoreError> {
        (**self).list_runs_for_queue_item(queue_item_id).await
    }

    async fn record_system_event(&self, event: SystemEvent) -> Result<(), StoreError> {
        (**self).record_system_event(event).await
    }

    async fn record_error_report(&self, report: ErrorReport) -> Result<(), StoreError> {
        (**self).record_error_report(report).await
    }
}
