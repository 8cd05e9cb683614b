use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use agentops_access::AgentInstance;

use crate::executor::AgentExecutor;
use crate::job::AgentJob;
use crate::result::{ExecutionResult, ExecutorError};

/// Routes executions to an executor by agent type.
///
/// Lookup order: exact agent type, then the longest matching category
/// pattern (`"sales.*"` matches `"sales.follow_up"`), then the wildcard `"*"`.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn AgentExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for an agent type, a `prefix.*` pattern or `*`.
    pub fn register(
        &mut self,
        pattern: impl Into<String>,
        executor: Arc<dyn AgentExecutor>,
    ) -> &mut Self {
        self.executors.insert(pattern.into(), executor);
        self
    }

    pub fn with(mut self, pattern: impl Into<String>, executor: Arc<dyn AgentExecutor>) -> Self {
        self.register(pattern, executor);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    fn resolve(&self, agent_type: &str) -> Option<&Arc<dyn AgentExecutor>> {
        if let Some(executor) = self.executors.get(agent_type) {
            return Some(executor);
        }

        let category = self
            .executors
            .iter()
            .filter_map(|(pattern, executor)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = agent_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), executor))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, executor)| executor);
        if category.is_some() {
            return category;
        }

        self.executors.get("*")
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        patterns.sort_unstable();
        f.debug_struct("ExecutorRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

#[async_trait]
impl AgentExecutor for ExecutorRegistry {
    async fn execute(
        &self,
        job: &AgentJob,
        agent: &AgentInstance,
    ) -> Result<ExecutionResult, ExecutorError> {
        match self.resolve(&agent.agent_type) {
            Some(executor) => executor.execute(job, agent).await,
            None => {
                warn!(agent_type = %agent.agent_type, queue_item_id = %job.queue_item_id, "no executor registered");
                Ok(ExecutionResult::failed(
                    "no_executor",
                    format!("no executor registered for agent type '{}'", agent.agent_type),
                    false,
                ))
            }
        }
    }
}
