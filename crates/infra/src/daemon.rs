//! Daemon harness: runs the orchestrator on a fixed interval until stopped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use agentops_agents::AgentExecutor;

use crate::orchestrator::{Orchestrator, RunOutcome, panic_message};
use crate::records::{ErrorReport, Severity, error_chain};
use crate::store::OrchestratorStore;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Wait between ticks that found nothing to do.
    pub poll_interval: Duration,
    /// Expired-lease sweep cadence; `None` disables the sweep.
    pub lease_sweep_interval: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            lease_sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl DaemonConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_sweep(mut self, interval: Option<Duration>) -> Self {
        self.lease_sweep_interval = interval;
        self
    }
}

/// Daemon runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    pub ticks: u64,
    pub idle: u64,
    pub contended: u64,
    pub skipped: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Ticks whose `run_once` returned an error or panicked.
    pub loop_errors: u64,
    pub swept_leases: u64,
}

impl DaemonStats {
    fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Idle => self.idle += 1,
            RunOutcome::Contended { .. } => self.contended += 1,
            RunOutcome::Skipped { .. } => self.skipped += 1,
            RunOutcome::Succeeded { .. } => self.succeeded += 1,
            RunOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Handle to control a running daemon.
#[derive(Debug)]
pub struct DaemonHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DaemonStats>>,
}

impl DaemonHandle {
    /// Stop scheduling ticks and wait for the cycle in flight to finish.
    pub async fn stop(self) -> DaemonStats {
        let _ = self.stop.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "daemon loop terminated abnormally");
        }
        snapshot(&self.stats)
    }

    pub fn stats(&self) -> DaemonStats {
        snapshot(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}

pub struct Daemon<S, E: ?Sized = dyn AgentExecutor> {
    orchestrator: Arc<Orchestrator<S, E>>,
    config: DaemonConfig,
}

impl<S, E> Daemon<S, E>
where
    S: OrchestratorStore + 'static,
    E: AgentExecutor + ?Sized + 'static,
{
    pub fn new(orchestrator: Arc<Orchestrator<S, E>>, config: DaemonConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn start(self) -> DaemonHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(DaemonStats::default()));
        let join = tokio::spawn(run_loop(
            self.orchestrator,
            self.config,
            stop_rx,
            Arc::clone(&stats),
        ));

        DaemonHandle {
            stop: stop_tx,
            join,
            stats,
        }
    }
}

async fn run_loop<S, E>(
    orchestrator: Arc<Orchestrator<S, E>>,
    config: DaemonConfig,
    mut stop_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<DaemonStats>>,
) where
    S: OrchestratorStore + 'static,
    E: AgentExecutor + ?Sized + 'static,
{
    info!(
        runner_id = %orchestrator.runner_id(),
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "daemon started"
    );

    let mut next_sweep = Instant::now();
    loop {
        if *stop_rx.borrow() {
            break;
        }

        if let Some(every) = config.lease_sweep_interval {
            if Instant::now() >= next_sweep {
                sweep(&orchestrator, &stats).await;
                next_sweep = Instant::now() + every;
            }
        }

        // Own task so a panic inside the cycle cannot take the loop down.
        let tick = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run_once().await }).await
        };

        let drain = match tick {
            Ok(Ok(outcome)) => {
                let mut guard = stats.lock().unwrap_or_else(|p| p.into_inner());
                guard.ticks += 1;
                guard.record(&outcome);
                outcome.processed_item()
            }
            Ok(Err(err)) => {
                let stack = error_chain(&err);
                loop_error(&orchestrator, &stats, err.to_string(), stack, Severity::Error).await;
                false
            }
            Err(err) if err.is_panic() => {
                let payload = panic_message(err.into_panic());
                let message = format!("run_once panicked: {payload}");
                let stack = format!("run_once task panicked: {payload}");
                loop_error(&orchestrator, &stats, message, stack, Severity::Critical).await;
                false
            }
            Err(err) => {
                let stack = error_chain(&err);
                loop_error(&orchestrator, &stats, err.to_string(), stack, Severity::Error).await;
                false
            }
        };

        if drain {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    let stats = snapshot(&stats);
    info!(
        runner_id = %orchestrator.runner_id(),
        ticks = stats.ticks,
        succeeded = stats.succeeded,
        failed = stats.failed,
        loop_errors = stats.loop_errors,
        "daemon stopped"
    );
}

async fn sweep<S, E>(orchestrator: &Orchestrator<S, E>, stats: &Mutex<DaemonStats>)
where
    S: OrchestratorStore + 'static,
    E: AgentExecutor + ?Sized + 'static,
{
    match orchestrator.sweep_expired_leases().await {
        Ok(swept) => {
            stats.lock().unwrap_or_else(|p| p.into_inner()).swept_leases += swept;
        }
        Err(err) => {
            warn!(error = %err, "expired-lease sweep failed");
            orchestrator
                .report_error(
                    ErrorReport::new(
                        orchestrator.config().environment.clone(),
                        "daemon.lease_sweep",
                        err.to_string(),
                        Severity::Warning,
                        orchestrator.now(),
                    )
                    .with_stack(error_chain(&err))
                    .with_context(json!({ "runner_id": orchestrator.runner_id() })),
                )
                .await;
        }
    }
}

async fn loop_error<S, E>(
    orchestrator: &Orchestrator<S, E>,
    stats: &Mutex<DaemonStats>,
    message: String,
    stack: String,
    severity: Severity,
) where
    S: OrchestratorStore + 'static,
    E: AgentExecutor + ?Sized + 'static,
{
    {
        let mut guard = stats.lock().unwrap_or_else(|p| p.into_inner());
        guard.ticks += 1;
        guard.loop_errors += 1;
    }
    error!(runner_id = %orchestrator.runner_id(), error = %message, "daemon tick failed");
    orchestrator
        .report_error(
            ErrorReport::new(
                orchestrator.config().environment.clone(),
                "daemon.tick",
                message,
                severity,
                orchestrator.now(),
            )
            .with_stack(stack)
            .with_context(json!({ "runner_id": orchestrator.runner_id() })),
        )
        .await;
}

fn snapshot(stats: &Mutex<DaemonStats>) -> DaemonStats {
    *stats.lock().unwrap_or_else(|p| p.into_inner())
}
