use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use agentops_core::{AgentInstanceId, QueueItemId, WorkspaceId};

/// The executor's view of one queue item.
///
/// A snapshot taken when the attempt starts; executors cannot mutate the
/// queue item through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentJob {
    pub queue_item_id: QueueItemId,
    pub workspace_id: WorkspaceId,
    pub agent_instance_id: AgentInstanceId,
    /// Job-type tag (e.g. "follow_up.draft").
    pub job_type: String,
    pub payload: JsonValue,
    /// 1-based number of the attempt being executed.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl AgentJob {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
