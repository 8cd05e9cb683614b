use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use agentops_access::AgentInstance;

use crate::executor::AgentExecutor;
use crate::job::AgentJob;
use crate::result::{ExecutionResult, ExecutorError, StepKind, StepTrace, Usage};

/// One scripted reaction to an `execute` call.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Succeed with the given output.
    Succeed { output: Option<JsonValue>, usage: Usage },
    /// Succeed, echoing the job payload back as output.
    Echo,
    /// Report a domain failure.
    Fail {
        code: String,
        message: String,
        retriable: bool,
    },
    /// Raise an infrastructure fault.
    Fault(ExecutorError),
    /// Panic inside `execute`.
    Panic(String),
    /// Sleep, then play the inner outcome.
    Delayed {
        delay: Duration,
        then: Box<ScriptedOutcome>,
    },
}

impl ScriptedOutcome {
    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fail {
            code: code.into(),
            message: message.into(),
            retriable: true,
        }
    }

    pub fn delayed(delay: Duration, then: ScriptedOutcome) -> Self {
        Self::Delayed {
            delay,
            then: Box::new(then),
        }
    }
}

/// Deterministic executor for tests, benchmarks and local runs.
///
/// Plays queued outcomes in order; once the script runs dry every call gets
/// the fallback outcome. Every invocation is recorded.
#[derive(Debug)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    calls: Mutex<Vec<AgentJob>>,
}

impl ScriptedExecutor {
    pub fn new(fallback: ScriptedOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always echo the payload.
    pub fn echo() -> Self {
        Self::new(ScriptedOutcome::Echo)
    }

    /// Always fail with the given code.
    pub fn always_failing(code: impl Into<String>) -> Self {
        let code = code.into();
        let message = format!("scripted failure: {code}");
        Self::new(ScriptedOutcome::fail(code, message))
    }

    pub fn then(self, outcome: ScriptedOutcome) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(outcome);
        self
    }

    /// Jobs seen so far, in call order.
    pub fn calls(&self) -> Vec<AgentJob> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn next_outcome(&self) -> ScriptedOutcome {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::echo()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        job: &AgentJob,
        agent: &AgentInstance,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(job.clone());

        let mut outcome = self.next_outcome();
        while let ScriptedOutcome::Delayed { delay, then } = outcome {
            tokio::time::sleep(delay).await;
            outcome = *then;
        }

        let mut trace = StepTrace::new();
        trace.push(
            StepKind::Thought,
            "scripted",
            serde_json::json!({ "agent_type": agent.agent_type, "job_type": job.job_type }),
        );

        match outcome {
            ScriptedOutcome::Succeed { output, usage } => {
                trace.push(StepKind::Output, "result", output.clone().unwrap_or(JsonValue::Null));
                Ok(ExecutionResult::succeeded(output, usage).with_steps(trace))
            }
            ScriptedOutcome::Echo => {
                trace.push(StepKind::Output, "echo", job.payload.clone());
                Ok(ExecutionResult::succeeded(Some(job.payload.clone()), Usage::default())
                    .with_steps(trace))
            }
            ScriptedOutcome::Fail {
                code,
                message,
                retriable,
            } => Ok(ExecutionResult::failed(code, message, retriable).with_steps(trace)),
            ScriptedOutcome::Fault(err) => Err(err),
            ScriptedOutcome::Panic(msg) => panic!("{msg}"),
            ScriptedOutcome::Delayed { .. } => unreachable!("delays are unwrapped above"),
        }
    }
}
