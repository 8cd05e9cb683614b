use std::sync::Arc;

use async_trait::async_trait;

use agentops_access::AgentInstance;

use crate::job::AgentJob;
use crate::result::{ExecutionResult, ExecutorError};

/// Execution strategy contract.
///
/// Must not return `Err` for ordinary domain failures; report those as
/// `ExecutionResult::Failed`. Timeouts are the executor's own business.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        job: &AgentJob,
        agent: &AgentInstance,
    ) -> Result<ExecutionResult, ExecutorError>;
}

#[async_trait]
impl<E: AgentExecutor + ?Sized> AgentExecutor for Arc<E> {
    async fn execute(
        &self,
        job: &AgentJob,
        agent: &AgentInstance,
    ) -> Result<ExecutionResult, ExecutorError> {
        (**self).execute(job, agent).await
    }
}

#[async_trait]
impl<E: AgentExecutor + ?Sized> AgentExecutor for Box<E> {
    async fn execute(
        &self,
        job: &AgentJob,
        agent: &AgentInstance,
    ) -> Result<ExecutionResult, ExecutorError> {
        (**self).execute(job, agent).await
    }
}
