//! Retry wrapper for idempotent mutations
//!
//! Cloud control planes return transient errors shortly after a dependent
//! resource is created (permission propagation lag, concurrent-modification
//! conflicts). Those are not caller bugs; they are absorbed here by
//! re-invoking the mutation under a bounded backoff until a total wall-clock
//! budget runs out. The wrapped operation must be safe to call more than
//! once, e.g. keyed by a client-supplied idempotency token.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Verdict of an [`ErrorClassifier`] for one observed error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient; re-invoke the operation after a backoff
    Retry,
    /// Permanent; surface the error to the caller unmodified
    Fail,
}

/// Strategy deciding which errors justify re-invoking a mutation
pub trait ErrorClassifier<E> {
    fn classify(&self, error: &E) -> RetryDecision;
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> RetryDecision,
{
    fn classify(&self, error: &E) -> RetryDecision {
        self(error)
    }
}

/// Error returned by [`RetryPolicy::run`] and [`retry_when`]
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The classifier declared the error permanent; it is passed through
    /// unmodified.
    #[error(transparent)]
    Fail(E),

    /// The budget ran out while the operation was still failing with
    /// retryable errors. Carries the last error for diagnostics.
    #[error("retry budget exhausted after {attempts} attempts over {elapsed:?}")]
    RetryTimeout {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: E,
    },

    /// The caller canceled the operation
    #[error("retry canceled by caller")]
    Canceled,
}

/// Explicit retry configuration for one mutation call
///
/// Constructed fresh per call site; there is no ambient global retry state.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    timeout: Duration,
    min_backoff: Duration,
    max_backoff: Duration,
    cancellation: CancellationToken,
}

impl RetryPolicy {
    /// A policy with the given total wall-clock budget and default backoff
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            cancellation: CancellationToken::new(),
        }
    }

    /// Override the backoff bounds (doubling from `min` up to `max`)
    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }

    /// Cancel in-flight waits when `token` is canceled
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Invoke `operation`, re-invoking it while `classifier` keeps returning
    /// [`RetryDecision::Retry`] and the budget lasts.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        mut operation: F,
        classifier: C,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: ErrorClassifier<E>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut backoff = self.min_backoff;
        let mut attempts: u32 = 0;

        loop {
            if self.cancellation.is_cancelled() {
                return Err(RetryError::Canceled);
            }

            attempts += 1;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match classifier.classify(&error) {
                RetryDecision::Fail => return Err(RetryError::Fail(error)),
                RetryDecision::Retry => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RetryError::RetryTimeout {
                            attempts,
                            elapsed: now - started,
                            source: error,
                        });
                    }

                    tracing::debug!(attempt = attempts, error = %error, "transient error, retrying");

                    let pause = backoff.min(deadline - now);
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = self.cancellation.cancelled() => return Err(RetryError::Canceled),
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
    }
}

/// Invoke `operation` under a default-backoff [`RetryPolicy`] with the given
/// total budget.
///
/// Composes with the status poller: a typical resource operation issues its
/// mutation through `retry_when`, then polls with
/// [`WaitConf::wait_for_state`](crate::state::WaitConf::wait_for_state)
/// until the effect is visible.
pub async fn retry_when<T, E, F, Fut, C>(
    timeout: Duration,
    operation: F,
    classifier: C,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: ErrorClassifier<E>,
{
    RetryPolicy::new(timeout).run(operation, classifier).await
}
