//! `agentops-access`: authorization records consulted before an agent runs.
//!
//! This crate is intentionally decoupled from storage: it models agent
//! instances, permission records and workspace entitlements, and defines the
//! sequential gating checks over any `GateRecords` source.

pub mod agent;
pub mod entitlement;
pub mod gate;
pub mod permissions;

pub use agent::{AgentConfig, AgentInstance, Guardrails};
pub use entitlement::{BillingPeriod, Entitlement, EntitlementStatus};
pub use gate::{GateError, GateFailure, GatePass, GateRecords, run_gates};
pub use permissions::{PermissionRecord, Scope, WriteRestriction};
