//! Queue item model and its state transitions.
//!
//! Transitions are plain methods so every adapter applies the same rules;
//! adapters are responsible for making each call atomic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use agentops_core::{AgentInstanceId, DomainError, QueueItemId, RunnerId, WorkspaceId};

use super::retry::{RetryDecision, RetryPolicy};

/// How long a lock is honoured before another runner may reclaim it.
pub const LEASE_DURATION: Duration = Duration::from_millis(300_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Locked,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Locked => "locked",
            QueueStatus::Running => "running",
            QueueStatus::Succeeded => "succeeded",
            QueueStatus::Failed => "failed",
            QueueStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(QueueStatus::Queued),
            "locked" => Some(QueueStatus::Locked),
            "running" => Some(QueueStatus::Running),
            "succeeded" => Some(QueueStatus::Succeeded),
            "failed" => Some(QueueStatus::Failed),
            "canceled" => Some(QueueStatus::Canceled),
            _ => None,
        }
    }

    /// Held under a lease (`locked` or `running`).
    pub fn is_held(&self) -> bool {
        matches!(self, QueueStatus::Locked | QueueStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Succeeded | QueueStatus::Failed | QueueStatus::Canceled
        )
    }
}

impl core::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine code plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl core::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Result of one attempt, as handed to `mark_queue_item_result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Succeeded {
        finished_at: DateTime<Utc>,
    },
    Failed {
        error: ErrorDetail,
        finished_at: DateTime<Utc>,
    },
}

/// One unit of requested agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub workspace_id: WorkspaceId,
    pub agent_instance_id: AgentInstanceId,
    pub job_type: String,
    pub payload: JsonValue,
    /// Higher runs first.
    pub priority: i32,
    /// Invisible to selection until this instant.
    pub scheduled_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub locked_by: Option<RunnerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Queued && self.scheduled_at <= now
    }

    /// True when a held lock is older than `lease`.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match self.locked_at {
            Some(locked_at) => {
                let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
                now.signed_duration_since(locked_at) >= lease
            }
            None => true,
        }
    }

    pub fn is_held_by(&self, runner_id: &RunnerId) -> bool {
        self.status.is_held() && self.locked_by.as_ref() == Some(runner_id)
    }

    /// Lock compare-and-set condition.
    pub fn can_lock(&self, runner_id: &RunnerId, now: DateTime<Utc>, lease: Duration) -> bool {
        match self.status {
            QueueStatus::Queued => true,
            QueueStatus::Locked | QueueStatus::Running => {
                self.locked_by.as_ref() != Some(runner_id) && self.lease_expired(now, lease)
            }
            _ => false,
        }
    }

    /// Apply the lock if `can_lock` holds. Returns whether it did.
    pub fn try_lock(&mut self, runner_id: &RunnerId, now: DateTime<Utc>, lease: Duration) -> bool {
        if !self.can_lock(runner_id, now, lease) {
            return false;
        }
        self.status = QueueStatus::Locked;
        self.locked_by = Some(runner_id.clone());
        self.locked_at = Some(now);
        self.updated_at = now;
        true
    }

    /// `locked → running`, refreshing the lease. False if the lock was lost.
    pub fn start_running(&mut self, runner_id: &RunnerId, now: DateTime<Utc>) -> bool {
        if self.status != QueueStatus::Locked || self.locked_by.as_ref() != Some(runner_id) {
            return false;
        }
        self.status = QueueStatus::Running;
        self.locked_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Heartbeat. False if the lock is no longer held by `runner_id`.
    pub fn renew_lease(&mut self, runner_id: &RunnerId, now: DateTime<Utc>) -> bool {
        if !self.is_held_by(runner_id) {
            return false;
        }
        self.locked_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Terminal transition for one attempt.
    ///
    /// Fails on items that already reached a terminal status.
    pub fn apply_result(
        &mut self,
        result: &AttemptResult,
        policy: &RetryPolicy,
    ) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "queue item {} is already {}",
                self.id, self.status
            )));
        }

        match result {
            AttemptResult::Succeeded { finished_at } => {
                self.status = QueueStatus::Succeeded;
                self.updated_at = *finished_at;
            }
            AttemptResult::Failed { error, finished_at } => {
                self.last_error = Some(error.clone());
                self.updated_at = *finished_at;
                match policy.decide(self.attempts, self.max_attempts, *finished_at) {
                    RetryDecision::Requeue {
                        attempts,
                        scheduled_at,
                        ..
                    } => {
                        self.attempts = attempts;
                        self.status = QueueStatus::Queued;
                        self.scheduled_at = scheduled_at;
                    }
                    RetryDecision::Exhausted { attempts } => {
                        self.attempts = attempts;
                        self.status = QueueStatus::Failed;
                    }
                }
            }
        }

        self.locked_by = None;
        self.locked_at = None;
        Ok(())
    }

    /// Clear the lock if `runner_id` still holds it.
    ///
    /// A still-held item goes back to `queued`. Returns whether anything
    /// changed.
    pub fn release(&mut self, runner_id: &RunnerId, now: DateTime<Utc>) -> bool {
        if self.locked_by.as_ref() != Some(runner_id) {
            return false;
        }
        if self.status.is_held() {
            self.status = QueueStatus::Queued;
        }
        self.locked_by = None;
        self.locked_at = None;
        self.updated_at = now;
        true
    }

    /// Return an abandoned item to `queued` without consuming an attempt.
    pub fn requeue_if_expired(&mut self, now: DateTime<Utc>, lease: Duration) -> bool {
        if !self.status.is_held() || !self.lease_expired(now, lease) {
            return false;
        }
        let holder = self
            .locked_by
            .as_ref()
            .map(|r| r.as_str().to_string())
            .unwrap_or_default();
        self.status = QueueStatus::Queued;
        self.locked_by = None;
        self.locked_at = None;
        self.last_error = Some(ErrorDetail::new(
            "lease_expired",
            format!("lease held by '{holder}' expired"),
        ));
        self.updated_at = now;
        true
    }

    /// `queued → canceled`. False for held or terminal items.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != QueueStatus::Queued {
            return false;
        }
        self.status = QueueStatus::Canceled;
        self.updated_at = now;
        true
    }
}

/// Builder for externally enqueued work.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
    pub workspace_id: WorkspaceId,
    pub agent_instance_id: AgentInstanceId,
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: i32,
    /// `None` means eligible immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

impl NewQueueItem {
    pub fn new(
        workspace_id: WorkspaceId,
        agent_instance_id: AgentInstanceId,
        job_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            workspace_id,
            agent_instance_id,
            job_type: job_type.into(),
            payload,
            priority: 0,
            scheduled_at: None,
            max_attempts: 3,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job_type cannot be empty"));
        }
        Ok(())
    }

    pub fn into_queue_item(self, now: DateTime<Utc>) -> Result<QueueItem, DomainError> {
        self.validate()?;
        Ok(QueueItem {
            id: QueueItemId::new(),
            workspace_id: self.workspace_id,
            agent_instance_id: self.agent_instance_id,
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            scheduled_at: self.scheduled_at.unwrap_or(now),
            status: QueueStatus::Queued,
            locked_by: None,
            locked_at: None,
            attempts: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }
}
