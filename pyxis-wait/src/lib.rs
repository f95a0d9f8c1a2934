//! Pyxis Wait
//!
//! Convergence primitives for asynchronous cloud control planes: a status
//! poller that blocks until a remote resource reaches a target state, a
//! retry wrapper that absorbs classified-as-transient errors, and a
//! shrinking deadline budget threaded through multi-step operations.
//!
//! Acceptance of a cloud mutation does not imply completion. Every mutating
//! call is followed by an explicit wait; skipping it lets dependent
//! operations observe stale state.

pub mod deadline;
pub mod resource;
pub mod retry;
pub mod state;

pub use deadline::Deadline;
pub use retry::{ErrorClassifier, RetryDecision, RetryError, RetryPolicy, retry_when};
pub use state::{Refresh, WaitConf, WaitError};
