//! `agentops-agents`
//!
//! **Responsibility:** the execution strategy boundary.
//!
//! The orchestrator hands an `AgentJob` and its owning `AgentInstance` to an
//! `AgentExecutor` and receives a structured `ExecutionResult` back:
//! - Domain failures are returned as `ExecutionResult::Failed`.
//! - Only infrastructure faults are `Err(ExecutorError)`.
//! - Whatever the executor does externally (model calls, messages) is opaque
//!   to the orchestrator.

pub mod executor;
pub mod http;
pub mod job;
pub mod registry;
pub mod result;
pub mod scripted;

pub use executor::AgentExecutor;
pub use http::{HttpModelConfig, HttpModelExecutor};
pub use job::AgentJob;
pub use registry::ExecutorRegistry;
pub use result::{
    ExecutionFailure, ExecutionResult, ExecutionStep, ExecutorError, StepKind, StepTrace, Usage,
};
pub use scripted::{ScriptedExecutor, ScriptedOutcome};
