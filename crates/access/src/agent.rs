use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use agentops_core::{AgentInstanceId, WorkspaceId};

/// A configured agent a queue item executes against.
///
/// Read-only from the orchestrator's perspective: it is loaded during gating
/// and handed to the execution strategy unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: AgentInstanceId,
    pub workspace_id: WorkspaceId,
    /// Agent type tag (e.g. "sales.follow_up"); used for executor routing.
    pub agent_type: String,
    #[serde(default)]
    pub config: AgentConfig,
    #[serde(default)]
    pub guardrails: Guardrails,
}

impl AgentInstance {
    pub fn new(workspace_id: WorkspaceId, agent_type: impl Into<String>) -> Self {
        Self {
            id: AgentInstanceId::new(),
            workspace_id,
            agent_type: agent_type.into(),
            config: AgentConfig::default(),
            guardrails: Guardrails::default(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_guardrails(mut self, guardrails: Guardrails) -> Self {
        self.guardrails = guardrails;
        self
    }
}

/// Free-form agent configuration.
///
/// Well-known keys are typed; anything else is preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Token budget per execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    /// Data scopes the agent may read (e.g. "customers", "estimates").
    #[serde(default)]
    pub data_scopes: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Channel permissions and approval requirements for an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guardrails {
    #[serde(default)]
    pub can_send_sms: bool,
    #[serde(default)]
    pub can_send_email: bool,
    #[serde(default)]
    pub can_create_estimate: bool,
    #[serde(default)]
    pub can_edit_price: bool,
    /// Actions that must be confirmed by a human before taking effect.
    #[serde(default)]
    pub require_approval_for: Vec<String>,
}

impl Guardrails {
    /// Channel actions this agent is not allowed to take.
    pub fn denied_actions(&self) -> Vec<&'static str> {
        let mut denied = Vec::new();
        if !self.can_send_sms {
            denied.push("send_sms");
        }
        if !self.can_send_email {
            denied.push("send_email");
        }
        if !self.can_create_estimate {
            denied.push("create_estimate");
        }
        if !self.can_edit_price {
            denied.push("edit_price");
        }
        denied
    }

    pub fn requires_approval(&self, action: &str) -> bool {
        self.require_approval_for.iter().any(|a| a == action)
    }
}
