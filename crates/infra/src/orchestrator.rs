//! Orchestrator core loop: one attempt cycle per `run_once`.
//!
//! ```text
//! fetch ─▶ lock ─▶ gate ─▶ mark running ─▶ create run ─▶ execute ─▶ record ─▶ release
//!   │        │       │           │
//!   ▼        ▼       ▼           ▼
//!  Idle  Contended  Failed    Skipped
//! ```
//!
//! Only failures of the initial fetch and lock escape `run_once`. Everything
//! after the lock is caught and turned into a failed attempt, and the lock is
//! released before returning.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use agentops_access::{AgentInstance, GateError, GateFailure, run_gates};
use agentops_agents::{AgentExecutor, AgentJob, ExecutionResult, ExecutionStep, ExecutorError};
use agentops_core::{Clock, QueueItemId, RunId, RunnerId, SystemClock};

use crate::queue::{AttemptResult, ErrorDetail, QueueItem, QueueStatus};
use crate::records::{
    ErrorReport, NewAgentRun, RunCompletion, Severity, SystemEvent, error_chain,
};
use crate::store::{OrchestratorStore, StoreError};

pub const EVENT_RUN_SUCCEEDED: &str = "agent_run_succeeded";
pub const EVENT_RUN_FAILED: &str = "agent_run_failed";
pub const EVENT_LEASES_REQUEUED: &str = "queue_leases_requeued";

const REPORT_SOURCE: &str = "orchestrator.run_once";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub runner_id: RunnerId,
    /// Stamped on error reports.
    pub environment: String,
    /// Renew the lease on this cadence while the executor runs. Off by default.
    pub heartbeat_interval: Option<Duration>,
}

impl OrchestratorConfig {
    pub fn new(runner_id: RunnerId) -> Self {
        Self {
            runner_id,
            environment: "development".to_string(),
            heartbeat_interval: None,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new(RunnerId::generate())
    }
}

/// Result of one `run_once` call.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Nothing eligible.
    Idle,
    /// Another runner won the lock.
    Contended { queue_item_id: QueueItemId },
    /// The lock was lost between acquisition and `running`.
    Skipped { queue_item_id: QueueItemId },
    Succeeded {
        queue_item_id: QueueItemId,
        run_id: RunId,
    },
    /// `run_id` is `None` when the attempt failed before a run was created
    /// (gating failures, early store faults).
    Failed {
        queue_item_id: QueueItemId,
        run_id: Option<RunId>,
        error: ErrorDetail,
    },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Idle => "idle",
            RunOutcome::Contended { .. } => "contended",
            RunOutcome::Skipped { .. } => "skipped",
            RunOutcome::Succeeded { .. } => "succeeded",
            RunOutcome::Failed { .. } => "failed",
        }
    }

    pub fn queue_item_id(&self) -> Option<QueueItemId> {
        match self {
            RunOutcome::Idle => None,
            RunOutcome::Contended { queue_item_id }
            | RunOutcome::Skipped { queue_item_id }
            | RunOutcome::Succeeded { queue_item_id, .. }
            | RunOutcome::Failed { queue_item_id, .. } => Some(*queue_item_id),
        }
    }

    /// True when an attempt was actually recorded against an item.
    pub fn processed_item(&self) -> bool {
        matches!(
            self,
            RunOutcome::Succeeded { .. } | RunOutcome::Failed { .. }
        )
    }
}

/// Progress through one attempt, consulted when recovering from a fault.
#[derive(Debug, Default)]
struct AttemptState {
    run: Option<(RunId, DateTime<Utc>)>,
    item_settled: bool,
    run_settled: bool,
}

#[derive(Debug)]
enum AttemptFault {
    Store(StoreError),
    Executor(ExecutorError),
}

impl AttemptFault {
    fn code(&self) -> &'static str {
        match self {
            AttemptFault::Store(_) => "store_error",
            AttemptFault::Executor(err) => err.code(),
        }
    }

    fn severity(&self) -> Severity {
        match self {
            AttemptFault::Executor(ExecutorError::Panicked(_)) => Severity::Critical,
            _ => Severity::Error,
        }
    }

    /// Stored as the error report's `stack`: the panic payload, or the
    /// fault's debug form followed by its source chain.
    fn stack(&self) -> String {
        match self {
            AttemptFault::Executor(ExecutorError::Panicked(payload)) => {
                format!("executor task panicked: {payload}")
            }
            AttemptFault::Executor(err) => error_chain(err),
            AttemptFault::Store(err) => error_chain(err),
        }
    }
}

impl std::fmt::Display for AttemptFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFault::Store(err) => write!(f, "{err}"),
            AttemptFault::Executor(err) => write!(f, "{err}"),
        }
    }
}

impl From<StoreError> for AttemptFault {
    fn from(err: StoreError) -> Self {
        AttemptFault::Store(err)
    }
}

/// Polls one queue and drives each item through an attempt cycle.
pub struct Orchestrator<S, E: ?Sized = dyn AgentExecutor> {
    store: S,
    executor: Arc<E>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl<S, E: ?Sized> std::fmt::Debug for Orchestrator<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runner_id", &self.config.runner_id)
            .field("environment", &self.config.environment)
            .field("heartbeat_interval", &self.config.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl<S, E> Orchestrator<S, E>
where
    S: OrchestratorStore,
    E: AgentExecutor + ?Sized + 'static,
{
    pub fn new(store: S, executor: Arc<E>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            executor,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn runner_id(&self) -> &RunnerId {
        &self.config.runner_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run one attempt cycle.
    ///
    /// Returns `Err` only when fetching or locking the candidate fails.
    #[instrument(skip_all, fields(runner_id = %self.config.runner_id))]
    pub async fn run_once(&self) -> Result<RunOutcome, StoreError> {
        let now = self.clock.now();
        let Some(item) = self.store.fetch_next_queue_item(now).await? else {
            debug!("no eligible queue item");
            return Ok(RunOutcome::Idle);
        };

        if !self
            .store
            .lock_queue_item(item.id, &self.config.runner_id, now)
            .await?
        {
            debug!(queue_item_id = %item.id, "queue item locked by another runner");
            return Ok(RunOutcome::Contended {
                queue_item_id: item.id,
            });
        }

        let outcome = self.attempt(&item).await;
        self.release(item.id).await;

        match &outcome {
            RunOutcome::Failed { run_id, error, .. } => info!(
                queue_item_id = %item.id,
                run_id = ?run_id,
                outcome = outcome.label(),
                error_code = %error.code,
                "attempt finished"
            ),
            _ => info!(
                queue_item_id = %item.id,
                outcome = outcome.label(),
                "attempt finished"
            ),
        }
        Ok(outcome)
    }

    /// Return items whose lease expired to `queued`. Returns how many moved.
    pub async fn sweep_expired_leases(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let requeued = self.store.requeue_expired_leases(now).await?;
        if requeued > 0 {
            warn!(
                runner_id = %self.config.runner_id,
                requeued,
                "requeued queue items with expired leases"
            );
            self.emit(SystemEvent::new(
                EVENT_LEASES_REQUEUED,
                true,
                json!({ "runner_id": self.config.runner_id, "count": requeued }),
                now,
            ))
            .await;
        }
        Ok(requeued)
    }

    /// Record an error report. Failures to record are logged and dropped.
    pub async fn report_error(&self, report: ErrorReport) {
        if let Err(err) = self.store.record_error_report(report).await {
            warn!(error = %err, "failed to record error report");
        }
    }

    async fn emit(&self, event: SystemEvent) {
        let event_type = event.event_type.clone();
        if let Err(err) = self.store.record_system_event(event).await {
            warn!(error = %err, event_type = %event_type, "failed to record system event");
        }
    }

    async fn release(&self, id: QueueItemId) {
        let now = self.clock.now();
        match self.store.release_lock(id, &self.config.runner_id, now).await {
            Ok(released) => debug!(queue_item_id = %id, released, "lock released"),
            Err(err) => warn!(queue_item_id = %id, error = %err, "failed to release lock"),
        }
    }

    async fn attempt(&self, item: &QueueItem) -> RunOutcome {
        let mut state = AttemptState::default();
        match self.try_attempt(item, &mut state).await {
            Ok(outcome) => outcome,
            Err(fault) => self.recover(item, &state, fault).await,
        }
    }

    async fn try_attempt(
        &self,
        item: &QueueItem,
        state: &mut AttemptState,
    ) -> Result<RunOutcome, AttemptFault> {
        let runner_id = &self.config.runner_id;

        let pass = match run_gates(&self.store, item.workspace_id, item.agent_instance_id).await {
            Ok(pass) => pass,
            Err(GateError::Denied(failure)) => return self.fail_gate(item, failure, state).await,
            Err(GateError::Source(err)) => return Err(AttemptFault::Store(err)),
        };

        let started_at = self.clock.now();
        if !self
            .store
            .mark_queue_item_running(item.id, runner_id, started_at)
            .await?
        {
            warn!(queue_item_id = %item.id, "lock lost before execution; skipping");
            return Ok(RunOutcome::Skipped {
                queue_item_id: item.id,
            });
        }

        let run = self
            .store
            .create_agent_run(NewAgentRun {
                queue_item_id: item.id,
                workspace_id: item.workspace_id,
                agent_instance_id: item.agent_instance_id,
                job_type: item.job_type.clone(),
                runner_id: runner_id.clone(),
                input: item.payload.clone(),
                started_at,
            })
            .await?;
        state.run = Some((run.id, started_at));

        let job = AgentJob {
            queue_item_id: item.id,
            workspace_id: item.workspace_id,
            agent_instance_id: item.agent_instance_id,
            job_type: item.job_type.clone(),
            payload: item.payload.clone(),
            attempt: item.attempts.saturating_add(1),
            max_attempts: item.max_attempts,
        };

        let result = self
            .execute_guarded(&job, &pass.agent)
            .await
            .map_err(AttemptFault::Executor)?;
        log_steps(run.id, result.steps());

        let finished_at = self.clock.now();
        match result {
            ExecutionResult::Succeeded { output, usage, .. } => {
                self.store
                    .mark_queue_item_result(item.id, AttemptResult::Succeeded { finished_at })
                    .await?;
                state.item_settled = true;

                let completed = self
                    .store
                    .complete_agent_run(
                        run.id,
                        RunCompletion::succeeded(output, usage, started_at, finished_at),
                    )
                    .await?;
                state.run_settled = true;

                self.emit(SystemEvent::new(
                    EVENT_RUN_SUCCEEDED,
                    true,
                    json!({
                        "queue_item_id": item.id,
                        "run_id": run.id,
                        "workspace_id": item.workspace_id,
                        "agent_instance_id": item.agent_instance_id,
                        "job_type": item.job_type,
                        "runner_id": runner_id,
                        "duration_ms": completed.duration_ms,
                        "usage": usage,
                    }),
                    finished_at,
                ))
                .await;

                Ok(RunOutcome::Succeeded {
                    queue_item_id: item.id,
                    run_id: run.id,
                })
            }
            ExecutionResult::Failed { error, .. } => {
                let retriable = error.retriable;
                let detail = ErrorDetail::new(error.code, error.message);

                let updated = self
                    .store
                    .mark_queue_item_result(
                        item.id,
                        AttemptResult::Failed {
                            error: detail.clone(),
                            finished_at,
                        },
                    )
                    .await?;
                state.item_settled = true;

                self.store
                    .complete_agent_run(
                        run.id,
                        RunCompletion::failed(detail.clone(), started_at, finished_at),
                    )
                    .await?;
                state.run_settled = true;

                self.emit(SystemEvent::new(
                    EVENT_RUN_FAILED,
                    false,
                    failure_event_data(
                        item,
                        Some(run.id),
                        runner_id,
                        &detail,
                        Some(&updated),
                        Some(retriable),
                    ),
                    finished_at,
                ))
                .await;

                Ok(RunOutcome::Failed {
                    queue_item_id: item.id,
                    run_id: Some(run.id),
                    error: detail,
                })
            }
        }
    }

    async fn fail_gate(
        &self,
        item: &QueueItem,
        failure: GateFailure,
        state: &mut AttemptState,
    ) -> Result<RunOutcome, AttemptFault> {
        let now = self.clock.now();
        let error = ErrorDetail::new(failure.code(), failure.to_string());
        warn!(
            queue_item_id = %item.id,
            agent_instance_id = %item.agent_instance_id,
            error_code = failure.code(),
            "gating check failed"
        );

        let updated = self
            .store
            .mark_queue_item_result(
                item.id,
                AttemptResult::Failed {
                    error: error.clone(),
                    finished_at: now,
                },
            )
            .await?;
        state.item_settled = true;

        self.emit(SystemEvent::new(
            EVENT_RUN_FAILED,
            false,
            failure_event_data(
                item,
                None,
                &self.config.runner_id,
                &error,
                Some(&updated),
                None,
            ),
            now,
        ))
        .await;

        Ok(RunOutcome::Failed {
            queue_item_id: item.id,
            run_id: None,
            error,
        })
    }

    /// Push a faulted attempt through the failure path, best-effort.
    async fn recover(
        &self,
        item: &QueueItem,
        state: &AttemptState,
        fault: AttemptFault,
    ) -> RunOutcome {
        let now = self.clock.now();
        let error = ErrorDetail::new(fault.code(), fault.to_string());
        let run_id = state.run.map(|(id, _)| id);
        warn!(
            queue_item_id = %item.id,
            run_id = ?run_id,
            error_code = %error.code,
            error = %error.message,
            "attempt faulted"
        );

        let mut updated = None;
        if !state.item_settled {
            match self
                .store
                .mark_queue_item_result(
                    item.id,
                    AttemptResult::Failed {
                        error: error.clone(),
                        finished_at: now,
                    },
                )
                .await
            {
                Ok(item) => updated = Some(item),
                Err(err) => {
                    warn!(queue_item_id = %item.id, error = %err, "failed to record attempt failure");
                }
            }
        }

        if let (Some((run_id, started_at)), false) = (state.run, state.run_settled) {
            if let Err(err) = self
                .store
                .complete_agent_run(run_id, RunCompletion::failed(error.clone(), started_at, now))
                .await
            {
                warn!(run_id = %run_id, error = %err, "failed to mark run failed");
            }
        }

        self.report_error(
            ErrorReport::new(
                self.config.environment.clone(),
                REPORT_SOURCE,
                error.message.clone(),
                fault.severity(),
                now,
            )
            .with_stack(fault.stack())
            .with_context(json!({
                "queue_item_id": item.id,
                "run_id": run_id,
                "runner_id": self.config.runner_id,
                "job_type": item.job_type,
                "code": error.code,
            })),
        )
        .await;

        self.emit(SystemEvent::new(
            EVENT_RUN_FAILED,
            false,
            failure_event_data(
                item,
                run_id,
                &self.config.runner_id,
                &error,
                updated.as_ref(),
                None,
            ),
            now,
        ))
        .await;

        RunOutcome::Failed {
            queue_item_id: item.id,
            run_id,
            error,
        }
    }

    /// Run the executor on its own task so a panic becomes an error, renewing
    /// the lease meanwhile when a heartbeat is configured.
    async fn execute_guarded(
        &self,
        job: &AgentJob,
        agent: &AgentInstance,
    ) -> Result<ExecutionResult, ExecutorError> {
        let executor = Arc::clone(&self.executor);
        let task_job = job.clone();
        let task_agent = agent.clone();
        let mut handle =
            tokio::spawn(async move { executor.execute(&task_job, &task_agent).await });

        let joined = match self.config.heartbeat_interval {
            None => handle.await,
            Some(period) => {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        joined = &mut handle => break joined,
                        _ = ticker.tick() => self.heartbeat(job.queue_item_id).await,
                    }
                }
            }
        };

        match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                Err(ExecutorError::Panicked(panic_message(err.into_panic())))
            }
            Err(err) => Err(ExecutorError::Internal(err.to_string())),
        }
    }

    async fn heartbeat(&self, id: QueueItemId) {
        let now = self.clock.now();
        match self
            .store
            .renew_lease(id, &self.config.runner_id, now)
            .await
        {
            Ok(true) => debug!(queue_item_id = %id, "lease renewed"),
            Ok(false) => warn!(queue_item_id = %id, "lease no longer held; renewal skipped"),
            Err(err) => warn!(queue_item_id = %id, error = %err, "lease renewal failed"),
        }
    }
}

/// `agent_run_failed` payload.
fn failure_event_data(
    item: &QueueItem,
    run_id: Option<RunId>,
    runner_id: &RunnerId,
    error: &ErrorDetail,
    updated: Option<&QueueItem>,
    retriable: Option<bool>,
) -> serde_json::Value {
    let mut data = json!({
        "queue_item_id": item.id,
        "run_id": run_id,
        "workspace_id": item.workspace_id,
        "agent_instance_id": item.agent_instance_id,
        "job_type": item.job_type,
        "runner_id": runner_id,
        "error": error,
    });
    if let (Some(retriable), Some(map)) = (retriable, data.as_object_mut()) {
        map.insert("retriable".into(), json!(retriable));
    }
    if let (Some(updated), Some(map)) = (updated, data.as_object_mut()) {
        map.insert("attempts".into(), json!(updated.attempts));
        map.insert("max_attempts".into(), json!(updated.max_attempts));
        map.insert("status".into(), json!(updated.status));
        if updated.status == QueueStatus::Queued {
            map.insert("retry_at".into(), json!(updated.scheduled_at));
        }
    }
    data
}

fn log_steps(run_id: RunId, steps: &[ExecutionStep]) {
    if steps.is_empty() {
        return;
    }
    let kinds: Vec<&str> = steps.iter().map(|s| s.kind.as_str()).collect();
    debug!(run_id = %run_id, steps = steps.len(), kinds = ?kinds, "execution trace");
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
