//! Status poller - blocks until a remote resource converges
//!
//! A [`WaitConf`] describes one polling operation: which reported statuses
//! mean "still in progress", which mean "done", and which are unrecoverable.
//! The status read itself is an injected closure, so the poller knows
//! nothing about any concrete cloud API.

use std::future::Future;
use std::time::Duration;

use pyxis_core::provider::ProviderError;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// One observation from the status-read collaborator
#[derive(Debug, Clone)]
pub enum Refresh<T> {
    /// The resource exists and reported a status
    Found {
        status: String,
        /// Remote-supplied human-readable detail, surfaced on failure states
        detail: Option<String>,
        /// Full status payload, returned to the caller on success
        payload: T,
    },
    /// The resource was not found by the read
    Missing,
}

impl<T> Refresh<T> {
    /// An observation with no detail text
    pub fn found(status: impl Into<String>, payload: T) -> Self {
        Refresh::Found {
            status: status.into(),
            detail: None,
            payload,
        }
    }
}

/// Errors surfaced by [`WaitConf::wait_for_state`]
#[derive(Debug, Error)]
pub enum WaitError {
    /// The descriptor itself is unusable; nothing was polled
    #[error("invalid wait descriptor for {resource_id}: {reason}")]
    InvalidConf { resource_id: String, reason: String },

    /// The status-read collaborator failed. Never silently retried here;
    /// callers may wrap the read in their own retry policy.
    #[error("reading status of {resource_id}: {source}")]
    StatusRead {
        resource_id: String,
        #[source]
        source: ProviderError,
    },

    /// The remote reported a status the descriptor does not know about.
    /// Surfaced rather than looped on: an unknown status means the
    /// descriptor is out of date.
    #[error("unexpected status {status:?} reported for {resource_id}")]
    UnexpectedStatus { resource_id: String, status: String },

    /// The resource entered a documented failure state. Never retried.
    #[error("{resource_id} entered failure state {status:?}: {detail}")]
    TerminalFailure {
        resource_id: String,
        status: String,
        detail: String,
    },

    /// The budget ran out before a target state was reached
    #[error("timed out after {elapsed:?} waiting for {resource_id} (last status: {last_status:?})")]
    Timeout {
        resource_id: String,
        elapsed: Duration,
        last_status: Option<String>,
    },

    /// The caller canceled the wait
    #[error("wait for {resource_id} canceled")]
    Canceled { resource_id: String },
}

/// Descriptor for one polling operation
///
/// Constructed fresh per operation and immutable once polling starts. The
/// timeout is always caller-supplied; there is no default infinite wait.
#[derive(Debug, Clone)]
pub struct WaitConf {
    resource_id: String,
    pending: Vec<String>,
    target: Vec<String>,
    failure: Vec<String>,
    timeout: Duration,
    initial_delay: Duration,
    poll_interval: Duration,
    continuous_target_occurrences: u32,
    missing_is_target: bool,
    cancellation: CancellationToken,
}

impl WaitConf {
    pub fn new(resource_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            resource_id: resource_id.into(),
            pending: Vec::new(),
            target: Vec::new(),
            failure: Vec::new(),
            timeout,
            initial_delay: Duration::ZERO,
            poll_interval: DEFAULT_POLL_INTERVAL,
            continuous_target_occurrences: 1,
            missing_is_target: false,
            cancellation: CancellationToken::new(),
        }
    }

    /// Statuses considered "still in progress"
    pub fn pending<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pending = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Statuses considered success
    pub fn target<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Statuses considered unrecoverable; observing one aborts the wait
    pub fn failure<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure = statuses.into_iter().map(Into::into).collect();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait this long before the first poll
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Require this many consecutive target observations before declaring
    /// success. Guards against flapping status reports.
    pub fn continuous_target(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrences = occurrences.max(1);
        self
    }

    /// Treat a not-found read as having reached the target (delete-waits).
    ///
    /// This is a per-descriptor choice, not a universal rule: for some
    /// resource types a disappearance mid-wait is an error.
    pub fn missing_is_target(mut self, missing_is_target: bool) -> Self {
        self.missing_is_target = missing_is_target;
        self
    }

    /// Abort in-flight polls promptly when `token` is canceled
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    fn validate(&self) -> Result<(), WaitError> {
        if self.timeout.is_zero() {
            return Err(self.invalid("timeout must be greater than zero"));
        }
        if let Some(overlap) = self.pending.iter().find(|s| self.target.contains(s)) {
            return Err(self.invalid(format!(
                "status {:?} is both pending and target",
                overlap
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> WaitError {
        WaitError::InvalidConf {
            resource_id: self.resource_id.clone(),
            reason: reason.into(),
        }
    }

    /// Poll `refresh` until the resource reaches a target state, a failure
    /// state, or the budget runs out.
    ///
    /// Returns the payload of the last observation on success, or `None`
    /// when a delete-wait finished with the resource gone. A not-found read
    /// outside a delete-wait is treated as a transient read and polled
    /// through; that is the only condition absorbed silently.
    pub async fn wait_for_state<T, F, Fut>(&self, mut refresh: F) -> Result<Option<T>, WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Refresh<T>, ProviderError>>,
    {
        self.validate()?;

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut last_status: Option<String> = None;
        let mut target_streak: u32 = 0;

        if !self.initial_delay.is_zero() {
            let delay = self.initial_delay.min(self.timeout);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancellation.cancelled() => return Err(self.canceled()),
            }
        }

        loop {
            if self.cancellation.is_cancelled() {
                return Err(self.canceled());
            }

            match refresh().await {
                Err(source) => {
                    return Err(WaitError::StatusRead {
                        resource_id: self.resource_id.clone(),
                        source,
                    });
                }
                Ok(Refresh::Missing) if self.missing_is_target => {
                    tracing::debug!(resource = %self.resource_id, "resource gone, target reached");
                    target_streak += 1;
                    if target_streak >= self.continuous_target_occurrences {
                        return Ok(None);
                    }
                }
                Ok(Refresh::Missing) => {
                    // Eventual consistency: the resource may not be visible
                    // to reads yet. Keep polling.
                    tracing::debug!(resource = %self.resource_id, "resource not found, still polling");
                    target_streak = 0;
                    last_status = None;
                }
                Ok(Refresh::Found {
                    status,
                    detail,
                    payload,
                }) => {
                    tracing::debug!(resource = %self.resource_id, status = %status, "observed status");
                    last_status = Some(status.clone());

                    if self.failure.contains(&status) {
                        return Err(WaitError::TerminalFailure {
                            resource_id: self.resource_id.clone(),
                            status,
                            detail: detail.unwrap_or_default(),
                        });
                    }
                    if self.target.contains(&status) {
                        target_streak += 1;
                        if target_streak >= self.continuous_target_occurrences {
                            return Ok(Some(payload));
                        }
                    } else if self.pending.contains(&status) {
                        target_streak = 0;
                    } else {
                        return Err(WaitError::UnexpectedStatus {
                            resource_id: self.resource_id.clone(),
                            status,
                        });
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout {
                    resource_id: self.resource_id.clone(),
                    elapsed: now - started,
                    last_status,
                });
            }

            let pause = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.cancellation.cancelled() => return Err(self.canceled()),
            }
        }
    }

    fn canceled(&self) -> WaitError {
        WaitError::Canceled {
            resource_id: self.resource_id.clone(),
        }
    }
}
