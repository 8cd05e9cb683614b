//! Infrastructure layer: queue model, persistence adapters, the orchestrator
//! core loop and its daemon wrapper.

pub mod config;
pub mod daemon;
pub mod orchestrator;
pub mod queue;
pub mod records;
pub mod store;

pub use config::{ConfigError, ModelSettings, RunnerConfig};
pub use daemon::{Daemon, DaemonConfig, DaemonHandle, DaemonStats};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome};
pub use queue::{
    AttemptResult, BackoffStrategy, ErrorDetail, LEASE_DURATION, NewQueueItem, QueueItem,
    QueueStatus, RetryDecision, RetryPolicy,
};
pub use records::{
    AgentRun, ErrorReport, NewAgentRun, RunCompletion, RunStatus, Severity, SystemEvent,
};
pub use store::{InMemoryStore, OrchestratorStore, PostgresStore, QueueStats, StoreError};
