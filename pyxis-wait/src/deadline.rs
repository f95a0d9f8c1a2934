//! Deadline - A monotonically shrinking time budget
//!
//! A multi-step operation gets one total budget, not a fresh timeout per
//! step. Each step is given `remaining()` so the budget shrinks across the
//! whole logical operation.

use std::time::Duration;

use tokio::time::Instant;

/// Absolute point in time by which a logical operation must finish
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    /// Start a deadline `budget` from now
    pub fn new(budget: Duration) -> Self {
        Self {
            end: Instant::now() + budget,
        }
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}
