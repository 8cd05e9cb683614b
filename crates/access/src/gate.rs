use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use agentops_core::{AgentInstanceId, WorkspaceId};

use crate::{AgentInstance, Entitlement, PermissionRecord};

/// Read-only source of the records consulted before execution.
///
/// Implemented by persistence adapters. Each accessor returns `Ok(None)` on
/// absence; `Err` is reserved for transport/storage faults.
#[async_trait]
pub trait GateRecords: Send + Sync {
    type Error: Send;

    async fn get_agent_instance(
        &self,
        id: AgentInstanceId,
    ) -> Result<Option<AgentInstance>, Self::Error>;

    /// The workspace's current entitlement, only if its status is active.
    async fn get_active_entitlement(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Option<Entitlement>, Self::Error>;

    async fn get_permission_record(
        &self,
        agent_instance_id: AgentInstanceId,
    ) -> Result<Option<PermissionRecord>, Self::Error>;
}

#[async_trait]
impl<R: GateRecords + ?Sized> GateRecords for Arc<R> {
    type Error = R::Error;

    async fn get_agent_instance(
        &self,
        id: AgentInstanceId,
    ) -> Result<Option<AgentInstance>, Self::Error> {
        (**self).get_agent_instance(id).await
    }

    async fn get_active_entitlement(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Option<Entitlement>, Self::Error> {
        (**self).get_active_entitlement(workspace_id).await
    }

    async fn get_permission_record(
        &self,
        agent_instance_id: AgentInstanceId,
    ) -> Result<Option<PermissionRecord>, Self::Error> {
        (**self).get_permission_record(agent_instance_id).await
    }
}

/// A gating check that did not pass.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GateFailure {
    #[error("agent instance not found")]
    AgentNotFound,

    #[error("workspace has no active entitlement")]
    EntitlementsMissing,

    #[error("agent has no permission record")]
    PermissionsMissing,
}

impl GateFailure {
    /// Stable machine code recorded as the queue item's `last_error`.
    pub fn code(&self) -> &'static str {
        match self {
            GateFailure::AgentNotFound => "agent_not_found",
            GateFailure::EntitlementsMissing => "entitlements_missing",
            GateFailure::PermissionsMissing => "permissions_missing",
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError<E> {
    #[error(transparent)]
    Denied(GateFailure),

    #[error("gate record lookup failed")]
    Source(E),
}

/// Everything execution needs once the gates have passed.
#[derive(Debug, Clone, PartialEq)]
pub struct GatePass {
    pub agent: AgentInstance,
    pub entitlement: Entitlement,
    pub permissions: PermissionRecord,
}

/// Run the gating checks for a job owned by `workspace_id`, in order:
/// agent, entitlement, permissions.
///
/// Every record must belong to the job's workspace: an agent owned by another
/// workspace counts as not found, and the entitlement consulted is the job
/// workspace's own. The first missing record short-circuits the rest. Only
/// presence is checked; scopes and limits are not matched against the job.
pub async fn run_gates<R>(
    records: &R,
    workspace_id: WorkspaceId,
    agent_instance_id: AgentInstanceId,
) -> Result<GatePass, GateError<R::Error>>
where
    R: GateRecords + ?Sized,
{
    let agent = records
        .get_agent_instance(agent_instance_id)
        .await
        .map_err(GateError::Source)?
        .filter(|agent| agent.workspace_id == workspace_id)
        .ok_or(GateError::Denied(GateFailure::AgentNotFound))?;

    let entitlement = records
        .get_active_entitlement(workspace_id)
        .await
        .map_err(GateError::Source)?
        .filter(|e| e.is_active() && e.workspace_id == workspace_id)
        .ok_or(GateError::Denied(GateFailure::EntitlementsMissing))?;

    let permissions = records
        .get_permission_record(agent.id)
        .await
        .map_err(GateError::Source)?
        .filter(|p| p.workspace_id == workspace_id)
        .ok_or(GateError::Denied(GateFailure::PermissionsMissing))?;

    Ok(GatePass {
        agent,
        entitlement,
        permissions,
    })
}
