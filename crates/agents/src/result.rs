use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Outcome of one execution.
///
/// Not a queue transition: the orchestrator decides what the queue item and
/// run record become based on this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Succeeded {
        output: Option<JsonValue>,
        usage: Usage,
        steps: Vec<ExecutionStep>,
    },
    Failed {
        error: ExecutionFailure,
        /// Empty or partial trace up to the failure.
        steps: Vec<ExecutionStep>,
    },
}

impl ExecutionResult {
    pub fn succeeded(output: Option<JsonValue>, usage: Usage) -> Self {
        Self::Succeeded {
            output,
            usage,
            steps: Vec::new(),
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>, retriable: bool) -> Self {
        Self::Failed {
            error: ExecutionFailure {
                code: code.into(),
                message: message.into(),
                retriable,
            },
            steps: Vec::new(),
        }
    }

    pub fn with_steps(mut self, trace: StepTrace) -> Self {
        match &mut self {
            Self::Succeeded { steps, .. } | Self::Failed { steps, .. } => {
                *steps = trace.into_steps();
            }
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        match self {
            Self::Succeeded { steps, .. } | Self::Failed { steps, .. } => steps,
        }
    }
}

/// Domain failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub code: String,
    pub message: String,
    /// Informational; retry decisions are made from the attempt counter alone.
    pub retriable: bool,
}

/// Token and cost accounting for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, cost: f64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thought,
    ToolCall,
    ToolResult,
    Decision,
    Output,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Thought => "thought",
            StepKind::ToolCall => "tool_call",
            StepKind::ToolResult => "tool_result",
            StepKind::Decision => "decision",
            StepKind::Output => "output",
        }
    }
}

/// One entry of the ordered step trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub index: u32,
    pub kind: StepKind,
    pub name: String,
    pub data: JsonValue,
}

/// Builder that assigns consecutive indexes as steps are pushed.
#[derive(Debug, Clone, Default)]
pub struct StepTrace {
    steps: Vec<ExecutionStep>,
}

impl StepTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: StepKind, name: impl Into<String>, data: JsonValue) -> &mut Self {
        let index = self.steps.len() as u32;
        self.steps.push(ExecutionStep {
            index,
            kind,
            name: name.into(),
            data,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_steps(self) -> Vec<ExecutionStep> {
        self.steps
    }
}

/// Infrastructure fault raised by an executor.
///
/// The orchestrator converts these into failed attempts and files an error
/// report; they never escape the attempt cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("executor timed out after {0} ms")]
    Timeout(u64),

    #[error("executor panicked: {0}")]
    Panicked(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecutorError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::Panicked(_) => "executor_panicked",
            ExecutorError::Transport(_) | ExecutorError::Timeout(_) | ExecutorError::Internal(_) => {
                "executor_error"
            }
        }
    }
}
