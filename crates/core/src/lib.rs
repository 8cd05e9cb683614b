//! `agentops-core`: shared primitives for the agent job orchestrator.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns):
//! strongly-typed identifiers, the domain error model and the clock seam used
//! to keep scheduling logic deterministic under test.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AgentInstanceId, EventId, QueueItemId, ReportId, RunId, RunnerId, WorkspaceId};
