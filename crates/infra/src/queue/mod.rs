//! Queue items, their lock/lease state machine and the retry policy.
//!
//! ## Lifecycle
//!
//! `queued → locked → running → succeeded | failed | queued (retry)`
//!
//! - `canceled` is reachable only from `queued`.
//! - A `locked`/`running` item whose lease has expired may be re-locked by a
//!   different runner, or returned to `queued` by the expired-lease sweep.

pub mod retry;
pub mod types;

pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use types::{
    AttemptResult, ErrorDetail, LEASE_DURATION, NewQueueItem, QueueItem, QueueStatus,
};
