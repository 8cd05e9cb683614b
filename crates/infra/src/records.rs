//! Run records and observability records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use agentops_agents::Usage;
use agentops_core::{
    AgentInstanceId, DomainError, EventId, QueueItemId, ReportId, RunId, RunnerId, WorkspaceId,
};

use crate::queue::ErrorDetail;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "canceled" => Some(RunStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

/// Durable audit of one execution attempt.
///
/// Created `running`; completed exactly once; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: RunId,
    pub queue_item_id: QueueItemId,
    pub workspace_id: WorkspaceId,
    pub agent_instance_id: AgentInstanceId,
    pub job_type: String,
    pub runner_id: RunnerId,
    /// Payload snapshot at execution start.
    pub input: JsonValue,
    pub output: Option<JsonValue>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub usage: Option<Usage>,
    pub error: Option<ErrorDetail>,
}

impl AgentRun {
    /// Merge terminal fields. Rejects a second completion.
    pub fn complete(&mut self, completion: RunCompletion) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "run {} already completed as {}",
                self.id,
                self.status.as_str()
            )));
        }
        if !completion.status.is_terminal() {
            return Err(DomainError::validation(
                "run completion must carry a terminal status",
            ));
        }
        self.status = completion.status;
        self.output = completion.output;
        self.usage = completion.usage;
        self.error = completion.error;
        self.ended_at = Some(completion.ended_at);
        self.duration_ms = Some(completion.duration_ms);
        Ok(())
    }
}

/// Fields known when a run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAgentRun {
    pub queue_item_id: QueueItemId,
    pub workspace_id: WorkspaceId,
    pub agent_instance_id: AgentInstanceId,
    pub job_type: String,
    pub runner_id: RunnerId,
    pub input: JsonValue,
    pub started_at: DateTime<Utc>,
}

impl NewAgentRun {
    pub fn into_run(self) -> AgentRun {
        AgentRun {
            id: RunId::new(),
            queue_item_id: self.queue_item_id,
            workspace_id: self.workspace_id,
            agent_instance_id: self.agent_instance_id,
            job_type: self.job_type,
            runner_id: self.runner_id,
            input: self.input,
            output: None,
            status: RunStatus::Running,
            started_at: self.started_at,
            ended_at: None,
            duration_ms: None,
            usage: None,
            error: None,
        }
    }
}

/// Terminal fields merged into a run by `complete_agent_run`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub output: Option<JsonValue>,
    pub usage: Option<Usage>,
    pub error: Option<ErrorDetail>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunCompletion {
    pub fn succeeded(
        output: Option<JsonValue>,
        usage: Usage,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: RunStatus::Succeeded,
            output,
            usage: Some(usage),
            error: None,
            ended_at,
            duration_ms: elapsed_ms(started_at, ended_at),
        }
    }

    pub fn failed(error: ErrorDetail, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Failed,
            output: None,
            usage: None,
            error: Some(error),
            ended_at,
            duration_ms: elapsed_ms(started_at, ended_at),
        }
    }
}

fn elapsed_ms(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> u64 {
    u64::try_from((ended_at - started_at).num_milliseconds()).unwrap_or(0)
}

/// Append-only event emitted by the core loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: EventId,
    /// e.g. "agent_run_succeeded".
    pub event_type: String,
    pub ok: bool,
    pub data: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(
        event_type: impl Into<String>,
        ok: bool,
        data: JsonValue,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            ok,
            data,
            occurred_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Append-only record of an infrastructure failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: ReportId,
    pub environment: String,
    /// Component that caught the failure (e.g. "orchestrator.run_once").
    pub source: String,
    pub message: String,
    pub stack: Option<String>,
    pub context: JsonValue,
    pub severity: Severity,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(
        environment: impl Into<String>,
        source: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReportId::new(),
            environment: environment.into(),
            source: source.into(),
            message: message.into(),
            stack: None,
            context: JsonValue::Null,
            severity,
            occurred_at,
        }
    }

    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = context;
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Debug form of `err` followed by one `caused by:` line per source.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = format!("{err:?}");
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str("\ncaused by: ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
