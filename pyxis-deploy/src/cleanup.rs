//! Append-only stack of cleanup obligations
//!
//! An orchestration accumulates cleanup actions as it provisions transient
//! resources. The stack is drained exactly once, in registration order;
//! failures are collected rather than allowed to mask the primary error.

use std::future::Future;

use pyxis_core::provider::{BoxFuture, ProviderError};
use thiserror::Error;

/// A registered cleanup action failed.
///
/// Reported alongside, never instead of, the primary operation's error.
#[derive(Debug, Error)]
#[error("cleanup action {action:?} failed: {source}")]
pub struct CleanupError {
    pub action: String,
    #[source]
    pub source: ProviderError,
}

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ProviderError>> + Send>;

/// Accumulates cleanup actions for one orchestration instance
///
/// Append-only and driven under single-threaded control; no action is ever
/// conditionally skipped.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, CleanupAction)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup action under a diagnostic name
    pub fn push<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ProviderError>> + Send + 'static,
    {
        self.actions
            .push((name.into(), Box::new(move || Box::pin(action()))));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every registered action exactly once, in registration order.
    ///
    /// Failures are collected and returned; later actions still run.
    pub async fn run_all(&mut self) -> Vec<CleanupError> {
        let mut errors = Vec::new();
        for (action, run) in self.actions.drain(..) {
            tracing::debug!(action = %action, "running cleanup action");
            if let Err(source) = run().await {
                tracing::warn!(action = %action, error = %source, "cleanup action failed");
                errors.push(CleanupError { action, source });
            }
        }
        errors
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            tracing::warn!(
                remaining = self.actions.len(),
                "cleanup stack dropped without running; transient remote resources may linger"
            );
        }
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.actions.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("CleanupStack").field("actions", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn runs_actions_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for name in ["delete deployment", "wait deployment deleted", "wait source deleted"] {
            let order = order.clone();
            stack.push(name, move || async move {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }

        let errors = stack.run_all().await;
        assert!(errors.is_empty());
        assert_eq!(
            *order.lock().unwrap(),
            vec![
                "delete deployment",
                "wait deployment deleted",
                "wait source deleted"
            ]
        );
    }

    #[tokio::test]
    async fn failures_are_collected_and_later_actions_still_run() {
        let ran = Arc::new(AtomicU32::new(0));
        let mut stack = CleanupStack::new();
        stack.push("failing", || async {
            Err(ProviderError::new("delete conflict"))
        });
        {
            let ran = ran.clone();
            stack.push("after-failure", move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let errors = stack.run_all().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].action, "failing");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_drain_is_a_no_op() {
        let ran = Arc::new(AtomicU32::new(0));
        let mut stack = CleanupStack::new();
        {
            let ran = ran.clone();
            stack.push("once", move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert!(stack.run_all().await.is_empty());
        assert!(stack.run_all().await.is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(stack.is_empty());
    }
}
