//! Generic multi-step sequencer
//!
//! For orchestrations that do not fit the blue/green shape: an ordered list
//! of named steps sharing one control handle and one shrinking deadline.
//! Steps may register a cleanup action; cleanups run exactly once, in
//! registration order, on success and failure paths alike.

use std::future::Future;
use std::sync::Arc;

use pyxis_core::provider::{BoxFuture, ProviderError};
use pyxis_wait::deadline::Deadline;
use thiserror::Error;

use crate::cleanup::{CleanupError, CleanupStack};

type StepFn<C> =
    Box<dyn FnOnce(Arc<C>, Deadline) -> BoxFuture<'static, Result<(), ProviderError>> + Send>;
type UndoFn<C> = Box<dyn FnOnce(Arc<C>) -> BoxFuture<'static, Result<(), ProviderError>> + Send>;

struct Step<C> {
    name: String,
    run: StepFn<C>,
    undo: Option<UndoFn<C>>,
}

/// Outcome of a fully executed sequence
#[derive(Debug)]
pub struct SequenceReport {
    pub steps_run: usize,
    /// Failures from the cleanup pass; the sequence itself succeeded
    pub cleanup_errors: Vec<CleanupError>,
}

/// A sequence aborted before its last step
///
/// Cleanup has already run by the time this is returned; its failures ride
/// along rather than masking the step's own error.
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("step {step:?} failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: ProviderError,
        cleanup_errors: Vec<CleanupError>,
    },

    #[error("deadline exhausted before step {step:?}")]
    DeadlineExhausted {
        step: String,
        cleanup_errors: Vec<CleanupError>,
    },
}

impl SequenceError {
    pub fn cleanup_errors(&self) -> &[CleanupError] {
        match self {
            SequenceError::StepFailed { cleanup_errors, .. }
            | SequenceError::DeadlineExhausted { cleanup_errors, .. } => cleanup_errors,
        }
    }
}

/// Ordered steps over a shared control handle
pub struct StepSequence<C> {
    control: Arc<C>,
    steps: Vec<Step<C>>,
}

impl<C: Send + Sync + 'static> StepSequence<C> {
    pub fn new(control: C) -> Self {
        Self {
            control: Arc::new(control),
            steps: Vec::new(),
        }
    }

    /// Append a step with no cleanup obligation
    pub fn step<F, Fut>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(Arc<C>, Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ProviderError>> + Send + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            run: Box::new(move |control, deadline| Box::pin(run(control, deadline))),
            undo: None,
        });
        self
    }

    /// Append a step whose side effects need undoing once attempted
    ///
    /// The cleanup is registered when the step starts, not when it
    /// succeeds: a step failing midway may already have created remote
    /// state.
    pub fn step_with_cleanup<F, Fut, G, GFut>(
        mut self,
        name: impl Into<String>,
        run: F,
        undo: G,
    ) -> Self
    where
        F: FnOnce(Arc<C>, Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ProviderError>> + Send + 'static,
        G: FnOnce(Arc<C>) -> GFut + Send + 'static,
        GFut: Future<Output = Result<(), ProviderError>> + Send + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            run: Box::new(move |control, deadline| Box::pin(run(control, deadline))),
            undo: Some(Box::new(move |control| Box::pin(undo(control)))),
        });
        self
    }

    /// Run the steps in order under one shrinking deadline.
    ///
    /// Stops at the first failing step or once the deadline is exhausted.
    /// Either way the cleanup actions registered so far run exactly once
    /// before this returns.
    pub async fn run(mut self, deadline: Deadline) -> Result<SequenceReport, SequenceError> {
        let mut cleanup = CleanupStack::new();
        let mut steps_run = 0;

        for step in self.steps.drain(..) {
            if deadline.expired() {
                return Err(SequenceError::DeadlineExhausted {
                    step: step.name,
                    cleanup_errors: cleanup.run_all().await,
                });
            }
            if let Some(undo) = step.undo {
                let control = Arc::clone(&self.control);
                cleanup.push(format!("undo {}", step.name), move || undo(control));
            }
            tracing::debug!(step = %step.name, "running step");
            if let Err(source) = (step.run)(Arc::clone(&self.control), deadline).await {
                tracing::warn!(step = %step.name, error = %source, "step failed, cleaning up");
                return Err(SequenceError::StepFailed {
                    step: step.name,
                    source,
                    cleanup_errors: cleanup.run_all().await,
                });
            }
            steps_run += 1;
        }

        Ok(SequenceReport {
            steps_run,
            cleanup_errors: cleanup.run_all().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn far_deadline() -> Deadline {
        Deadline::new(Duration::from_secs(3600))
    }

    #[tokio::test(start_paused = true)]
    async fn runs_steps_then_cleanups_in_order() {
        let seq = StepSequence::new(Recorder::default())
            .step_with_cleanup(
                "create",
                |c: Arc<Recorder>, _| async move {
                    c.push("create");
                    Ok(())
                },
                |c| async move {
                    c.push("undo create");
                    Ok(())
                },
            )
            .step("verify", |c: Arc<Recorder>, _| async move {
                c.push("verify");
                Ok(())
            });

        let control = Arc::clone(&seq.control);
        let report = seq.run(far_deadline()).await.unwrap();
        assert_eq!(report.steps_run, 2);
        assert!(report.cleanup_errors.is_empty());
        assert_eq!(control.entries(), vec!["create", "verify", "undo create"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_midway_cleans_up_attempted_steps_only() {
        let seq = StepSequence::new(Recorder::default());
        let seq = seq
            .step_with_cleanup(
                "one",
                |c: Arc<Recorder>, _| async move {
                    c.push("one");
                    Ok(())
                },
                |c| async move {
                    c.push("undo one");
                    Ok(())
                },
            )
            .step_with_cleanup(
                "two",
                |c: Arc<Recorder>, _| async move {
                    c.push("two");
                    Err(ProviderError::new("resize rejected"))
                },
                |c| async move {
                    c.push("undo two");
                    Ok(())
                },
            )
            .step_with_cleanup(
                "three",
                |c: Arc<Recorder>, _| async move {
                    c.push("three");
                    Ok(())
                },
                |c| async move {
                    c.push("undo three");
                    Ok(())
                },
            )
            .step("four", |c: Arc<Recorder>, _| async move {
                c.push("four");
                Ok(())
            });

        let control = Arc::clone(&seq.control);
        let err = seq.run(far_deadline()).await.unwrap_err();
        match &err {
            SequenceError::StepFailed { step, source, .. } => {
                assert_eq!(step, "two");
                assert!(source.to_string().contains("resize rejected"));
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
        assert!(err.cleanup_errors().is_empty());
        // Step two was attempted, so its cleanup runs; three and four were
        // never reached.
        assert_eq!(
            control.entries(),
            vec!["one", "two", "undo one", "undo two"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exhaustion_skips_remaining_steps() {
        let seq = StepSequence::new(Recorder::default())
            .step_with_cleanup(
                "slow",
                |c: Arc<Recorder>, _| async move {
                    c.push("slow");
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                },
                |c| async move {
                    c.push("undo slow");
                    Ok(())
                },
            )
            .step("late", |c: Arc<Recorder>, _| async move {
                c.push("late");
                Ok(())
            });

        let control = Arc::clone(&seq.control);
        let err = seq.run(Deadline::new(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(
            &err,
            SequenceError::DeadlineExhausted { step, .. } if step == "late"
        ));
        assert_eq!(control.entries(), vec!["slow", "undo slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_failures_reported_on_success_path() {
        let seq = StepSequence::new(Recorder::default()).step_with_cleanup(
            "create",
            |_, _| async { Ok(()) },
            |_| async { Err(ProviderError::new("delete conflict")) },
        );

        let report = seq.run(far_deadline()).await.unwrap();
        assert_eq!(report.steps_run, 1);
        assert_eq!(report.cleanup_errors.len(), 1);
        assert_eq!(report.cleanup_errors[0].action, "undo create");
    }
}
