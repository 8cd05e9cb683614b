use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use agentops_core::{AgentInstanceId, WorkspaceId};

/// Data scope identifier.
///
/// Scopes are modeled as opaque strings (e.g. "customers.read").
/// The wildcard scope `"*"` grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(Cow<'static, str>);

impl Scope {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Scope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a field may be written by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteRestriction {
    ReadOnly,
    RequiresApproval,
}

/// Permission record for one agent instance.
///
/// Only the record's presence is a gating requirement; the contents are
/// exposed for executors and external policy layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub agent_instance_id: AgentInstanceId,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub scopes: Vec<Scope>,
    /// Per-field write restrictions, keyed by field path (e.g. "estimate.price").
    #[serde(default)]
    pub field_restrictions: BTreeMap<String, WriteRestriction>,
    #[serde(default)]
    pub require_approval_for: Vec<String>,
}

impl PermissionRecord {
    pub fn new(agent_instance_id: AgentInstanceId, workspace_id: WorkspaceId) -> Self {
        Self {
            agent_instance_id,
            workspace_id,
            scopes: Vec::new(),
            field_restrictions: BTreeMap::new(),
            require_approval_for: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<Cow<'static, str>>) -> Self {
        self.scopes.push(Scope::new(scope));
        self
    }

    pub fn with_field_restriction(
        mut self,
        field: impl Into<String>,
        restriction: WriteRestriction,
    ) -> Self {
        self.field_restrictions.insert(field.into(), restriction);
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes
            .iter()
            .any(|s| s.is_wildcard() || s.as_str() == scope)
    }

    pub fn restriction_for(&self, field: &str) -> Option<WriteRestriction> {
        self.field_restrictions.get(field).copied()
    }
}
