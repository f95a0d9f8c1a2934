//! Blue/green deployment orchestrator
//!
//! Drives one deployment through its lifecycle: stand up a parallel
//! environment, wait for it, modify the provisioned target, cut traffic
//! over, decommission the superseded source. Every mutation goes through
//! the retry wrapper and is followed by a convergence wait; the next step
//! never starts before the previous wait reached a terminal success state.
//!
//! One orchestrator instance drives one deployment. Concurrent operations
//! against the same resource identifier are unsafe and must be serialized
//! by the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pyxis_core::provider::{BoxFuture, ProviderError};
use pyxis_wait::deadline::Deadline;
use pyxis_wait::retry::{RetryDecision, RetryError, RetryPolicy};
use pyxis_wait::state::{Refresh, WaitConf, WaitError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cleanup::{CleanupError, CleanupStack};
use crate::control::{DeploymentControl, DeploymentSpec, DeploymentState, ResourceStatus, status};

// Refresh closures outlive `&self`, so their futures are boxed.
type RefreshFuture<T> = BoxFuture<'static, Result<Refresh<T>, ProviderError>>;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const WAIT_DELAY: Duration = Duration::from_secs(60);
const MUTATION_RETRY_TIMEOUT: Duration = Duration::from_secs(120);
// Permission propagation after a switchover settles well within this.
const SOURCE_DELETE_RETRY_TIMEOUT: Duration = Duration::from_secs(300);
// Cleanup waits keep at least this much budget even after the caller's
// deadline has expired; by then the delete has already been issued and
// abandoning the wait would only hide its outcome.
const CLEANUP_WAIT_FLOOR: Duration = Duration::from_secs(60);

/// Orchestration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Provisioning,
    Available,
    Transitioning,
    Completed,
    Failed,
    CleaningUp,
}

/// Errors surfaced by [`BlueGreenOrchestrator`]
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("creating deployment: {0}")]
    Create(#[source] RetryError<ProviderError>),

    #[error("waiting for deployment to become available: {0}")]
    WaitAvailable(#[source] WaitError),

    #[error("deployment {id} disappeared mid-operation")]
    DeploymentVanished { id: String },

    #[error("deployment {id} reported no target resource")]
    NoTarget { id: String },

    #[error("modifying target {target}: {source}")]
    ModifyTarget {
        target: String,
        #[source]
        source: RetryError<ProviderError>,
    },

    #[error("waiting for target {target} to stabilize: {source}")]
    TargetUnstable {
        target: String,
        #[source]
        source: WaitError,
    },

    #[error("requesting switchover of deployment {id}: {source}")]
    Switchover {
        id: String,
        #[source]
        source: RetryError<ProviderError>,
    },

    #[error("waiting for switchover of deployment {id}: {source}")]
    SwitchoverIncomplete {
        id: String,
        #[source]
        source: WaitError,
    },

    #[error("deleting superseded source {source_id}: {source}")]
    DecommissionSource {
        source_id: String,
        #[source]
        source: RetryError<ProviderError>,
    },

    #[error("operation not valid in phase {phase:?}")]
    InvalidPhase { phase: Phase },
}

/// Retry classifier for mutations racing other control-plane activity
pub fn conflict_classifier(error: &ProviderError) -> RetryDecision {
    if error.message_contains("concurrent modification")
        || error.message_contains("conflicting operation")
    {
        RetryDecision::Retry
    } else {
        RetryDecision::Fail
    }
}

/// Retry classifier for permission-propagation lag after a role or grant
/// change; deletes of a freshly switched-over source hit this.
pub fn permission_classifier(error: &ProviderError) -> RetryDecision {
    if error.message_contains("IAM role") || error.message_contains("required permissions") {
        RetryDecision::Retry
    } else {
        RetryDecision::Fail
    }
}

/// Orchestrates one blue/green deployment against a [`DeploymentControl`]
pub struct BlueGreenOrchestrator<C: DeploymentControl> {
    control: Arc<C>,
    spec: DeploymentSpec,
    phase: Phase,
    deployment: Option<DeploymentState>,
    switched_over: Arc<AtomicBool>,
    cleanup: CleanupStack,
    cancellation: CancellationToken,
}

impl<C: DeploymentControl> BlueGreenOrchestrator<C> {
    pub fn new(control: C, spec: DeploymentSpec) -> Self {
        Self {
            control: Arc::new(control),
            spec,
            phase: Phase::Idle,
            deployment: None,
            switched_over: Arc::new(AtomicBool::new(false)),
            cleanup: CleanupStack::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Abort in-flight waits promptly when `token` is canceled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deployment(&self) -> Option<&DeploymentState> {
        self.deployment.as_ref()
    }

    /// Stand up the parallel environment
    ///
    /// The create call is retried under the conflict classifier; the spec's
    /// idempotency token keeps retries from provisioning duplicates. A
    /// cleanup action deleting the deployment descriptor is registered
    /// before this returns, so the descriptor cannot leak on any later
    /// failure path. The descriptor's target resource is deleted with it
    /// unless switchover completed.
    pub async fn create_deployment(
        &mut self,
        deadline: &Deadline,
    ) -> Result<DeploymentState, OrchestrationError> {
        if self.phase != Phase::Idle {
            return Err(OrchestrationError::InvalidPhase { phase: self.phase });
        }
        self.spec.ensure_client_token();
        tracing::info!(
            deployment = %self.spec.name,
            source = %self.spec.source,
            "creating parallel deployment"
        );

        let control = Arc::clone(&self.control);
        let spec = self.spec.clone();
        let result = RetryPolicy::new(MUTATION_RETRY_TIMEOUT.min(deadline.remaining()))
            .cancellation(self.cancellation.clone())
            .run(
                move || {
                    let control = Arc::clone(&control);
                    let spec = spec.clone();
                    async move { control.create_deployment(&spec).await }
                },
                conflict_classifier,
            )
            .await;
        let dep = match result {
            Ok(dep) => dep,
            Err(source) => return self.fail(OrchestrationError::Create(source)),
        };

        let control = Arc::clone(&self.control);
        let dep_id = dep.id.clone();
        let switched = Arc::clone(&self.switched_over);
        let budget = *deadline;
        self.cleanup
            .push("delete deployment descriptor", move || async move {
                let delete_target = !switched.load(Ordering::SeqCst);
                control.delete_deployment(&dep_id, delete_target).await?;
                let timeout = budget.remaining().max(CLEANUP_WAIT_FLOOR);
                wait_deployment_deleted(&*control, &dep_id, timeout).await
            });

        self.phase = Phase::Provisioning;
        self.deployment = Some(dep.clone());
        Ok(dep)
    }

    /// Block until the deployment's own status feed reports it available
    pub async fn wait_available(
        &mut self,
        timeout: Duration,
    ) -> Result<DeploymentState, OrchestrationError> {
        if self.phase != Phase::Provisioning {
            return Err(OrchestrationError::InvalidPhase { phase: self.phase });
        }
        let id = self.deployment_id()?;

        let conf = WaitConf::new(id.clone(), timeout)
            .pending([status::PROVISIONING])
            .target([status::AVAILABLE])
            .failure([status::INVALID_CONFIGURATION, status::SWITCHOVER_FAILED])
            .poll_interval(POLL_INTERVAL)
            .initial_delay(WAIT_DELAY)
            .cancellation(self.cancellation.clone());

        let observed = match conf
            .wait_for_state(self.deployment_refresh(&id))
            .await
        {
            Ok(observed) => observed,
            Err(source) => return self.fail(OrchestrationError::WaitAvailable(source)),
        };
        let dep = match observed {
            Some(dep) => dep,
            None => return self.fail(OrchestrationError::DeploymentVanished { id }),
        };

        self.phase = Phase::Available;
        self.deployment = Some(dep.clone());
        Ok(dep)
    }

    /// Apply modifications to the provisioned target, then wait for it to
    /// stabilize under the spec's status vocabulary.
    ///
    /// Failures propagate without rolling anything back; the cleanup
    /// actions registered so far still run when the caller cleans up.
    pub async fn apply_target_changes(
        &mut self,
        changes: &serde_json::Value,
        timeout: Duration,
    ) -> Result<(), OrchestrationError> {
        if self.phase != Phase::Available {
            return Err(OrchestrationError::InvalidPhase { phase: self.phase });
        }
        let dep = self
            .deployment
            .clone()
            .ok_or(OrchestrationError::InvalidPhase { phase: self.phase })?;
        let target = match dep.target {
            Some(target) => target,
            None => return self.fail(OrchestrationError::NoTarget { id: dep.id }),
        };
        let deadline = Deadline::new(timeout);
        tracing::info!(
            deployment = %self.spec.name,
            target = %target,
            "applying changes to provisioned target"
        );

        let control = Arc::clone(&self.control);
        let target_id = target.clone();
        let changes = changes.clone();
        let result = RetryPolicy::new(MUTATION_RETRY_TIMEOUT.min(deadline.remaining()))
            .cancellation(self.cancellation.clone())
            .run(
                move || {
                    let control = Arc::clone(&control);
                    let target_id = target_id.clone();
                    let changes = changes.clone();
                    async move { control.modify_target(&target_id, &changes).await }
                },
                conflict_classifier,
            )
            .await;
        if let Err(source) = result {
            return self.fail(OrchestrationError::ModifyTarget { target, source });
        }

        let states = self.spec.target_states.clone();
        let conf = WaitConf::new(target.clone(), deadline.remaining())
            .pending(states.pending)
            .target(states.stable)
            .failure(states.failed)
            .poll_interval(POLL_INTERVAL)
            .cancellation(self.cancellation.clone());
        if let Err(source) = conf
            .wait_for_state(self.resource_refresh(&target))
            .await
        {
            return self.fail(OrchestrationError::TargetUnstable { target, source });
        }
        Ok(())
    }

    /// Cut traffic over and wait for the deployment to report completion
    ///
    /// A reported `SWITCHOVER_FAILED` surfaces as a terminal failure
    /// carrying the remote detail text; it is never retried.
    pub async fn switchover(
        &mut self,
        timeout: Duration,
    ) -> Result<DeploymentState, OrchestrationError> {
        if self.phase != Phase::Available {
            return Err(OrchestrationError::InvalidPhase { phase: self.phase });
        }
        let id = self.deployment_id()?;
        let deadline = Deadline::new(timeout);
        self.phase = Phase::Transitioning;
        tracing::info!(deployment = %self.spec.name, "switching traffic over");

        let control = Arc::clone(&self.control);
        let dep_id = id.clone();
        let result = RetryPolicy::new(MUTATION_RETRY_TIMEOUT.min(deadline.remaining()))
            .cancellation(self.cancellation.clone())
            .run(
                move || {
                    let control = Arc::clone(&control);
                    let dep_id = dep_id.clone();
                    async move { control.switchover_deployment(&dep_id).await }
                },
                conflict_classifier,
            )
            .await;
        if let Err(source) = result {
            return self.fail(OrchestrationError::Switchover { id, source });
        }

        let conf = WaitConf::new(id.clone(), deadline.remaining())
            .pending([status::AVAILABLE, status::SWITCHOVER_IN_PROGRESS])
            .target([status::SWITCHOVER_COMPLETED])
            .failure([status::SWITCHOVER_FAILED, status::INVALID_CONFIGURATION])
            .poll_interval(POLL_INTERVAL)
            .cancellation(self.cancellation.clone());
        match conf.wait_for_state(self.deployment_refresh(&id)).await {
            Err(source) => self.fail(OrchestrationError::SwitchoverIncomplete { id, source }),
            Ok(None) => self.fail(OrchestrationError::DeploymentVanished { id }),
            Ok(Some(dep)) => {
                self.switched_over.store(true, Ordering::SeqCst);
                self.phase = Phase::Completed;
                self.deployment = Some(dep.clone());
                Ok(dep)
            }
        }
    }

    /// Delete the superseded original resource after a completed switchover
    ///
    /// Distinct from descriptor cleanup: this is an explicit step with its
    /// own retry policy for permission-propagation errors. The deletion is
    /// itself asynchronous, so a wait-until-gone action is registered for
    /// the cleanup pass.
    pub async fn decommission_source(
        &mut self,
        deadline: &Deadline,
    ) -> Result<(), OrchestrationError> {
        if self.phase != Phase::Completed {
            return Err(OrchestrationError::InvalidPhase { phase: self.phase });
        }
        let source_id = self
            .deployment
            .as_ref()
            .map(|d| d.source.clone())
            .unwrap_or_else(|| self.spec.source.clone());
        tracing::info!(source = %source_id, "deleting superseded source resource");

        let control = Arc::clone(&self.control);
        let sid = source_id.clone();
        let result = RetryPolicy::new(SOURCE_DELETE_RETRY_TIMEOUT.min(deadline.remaining()))
            .cancellation(self.cancellation.clone())
            .run(
                move || {
                    let control = Arc::clone(&control);
                    let sid = sid.clone();
                    async move { control.delete_resource(&sid).await }
                },
                permission_classifier,
            )
            .await;
        if let Err(source) = result {
            return self.fail(OrchestrationError::DecommissionSource { source_id, source });
        }

        let control = Arc::clone(&self.control);
        let sid = source_id.clone();
        let states = self.spec.target_states.clone();
        let budget = *deadline;
        self.cleanup
            .push("wait for superseded source deletion", move || async move {
                let mut pending = states.pending;
                pending.extend(states.stable);
                pending.extend(states.deleting);
                let conf = WaitConf::new(sid.clone(), budget.remaining().max(CLEANUP_WAIT_FLOOR))
                    .pending(pending)
                    .missing_is_target(true)
                    .poll_interval(POLL_INTERVAL);
                let refresh = move || {
                    let control = Arc::clone(&control);
                    let sid = sid.clone();
                    async move {
                        match control.describe_resource(&sid).await? {
                            None => Ok(Refresh::Missing),
                            Some(rs) => Ok(Refresh::Found {
                                status: rs.status.clone(),
                                detail: rs.detail.clone(),
                                payload: rs,
                            }),
                        }
                    }
                };
                conf.wait_for_state(refresh)
                    .await
                    .map(|_| ())
                    .map_err(|err| {
                        ProviderError::new("waiting for source deletion to complete")
                            .with_cause(err)
                    })
            });
        Ok(())
    }

    /// Run every registered cleanup action exactly once
    ///
    /// Safe to call on every exit path; a second call is a no-op. Errors
    /// are returned for reporting but never mask the primary operation's
    /// error, which the caller already holds. Cleanup is not subject to
    /// the orchestration's cancellation token: a canceled orchestration
    /// still tears its transient resources down.
    pub async fn clean_up(&mut self) -> Vec<CleanupError> {
        if self.cleanup.is_empty() {
            return Vec::new();
        }
        self.phase = Phase::CleaningUp;
        tracing::info!(
            deployment = %self.spec.name,
            actions = self.cleanup.len(),
            "running deferred cleanup"
        );
        self.cleanup.run_all().await
    }

    fn deployment_id(&self) -> Result<String, OrchestrationError> {
        self.deployment
            .as_ref()
            .map(|d| d.id.clone())
            .ok_or(OrchestrationError::InvalidPhase { phase: self.phase })
    }

    // `use<C>`: the closure owns its captures, so it must not hold the
    // `&self` borrow across the wait.
    fn deployment_refresh(
        &self,
        id: &str,
    ) -> impl FnMut() -> RefreshFuture<DeploymentState> + use<C> {
        let control = Arc::clone(&self.control);
        let id = id.to_string();
        move || {
            let control = Arc::clone(&control);
            let id = id.clone();
            Box::pin(async move {
                match control.describe_deployment(&id).await? {
                    None => Ok(Refresh::Missing),
                    Some(state) => Ok(Refresh::Found {
                        status: state.status.clone(),
                        detail: state.detail.clone(),
                        payload: state,
                    }),
                }
            })
        }
    }

    fn resource_refresh(
        &self,
        id: &str,
    ) -> impl FnMut() -> RefreshFuture<ResourceStatus> + use<C> {
        let control = Arc::clone(&self.control);
        let id = id.to_string();
        move || {
            let control = Arc::clone(&control);
            let id = id.clone();
            Box::pin(async move {
                match control.describe_resource(&id).await? {
                    None => Ok(Refresh::Missing),
                    Some(rs) => Ok(Refresh::Found {
                        status: rs.status.clone(),
                        detail: rs.detail.clone(),
                        payload: rs,
                    }),
                }
            })
        }
    }

    fn fail<T>(&mut self, error: OrchestrationError) -> Result<T, OrchestrationError> {
        if self.phase != Phase::Completed {
            self.phase = Phase::Failed;
        }
        Err(error)
    }
}

/// Drive the deployment descriptor's own delete-wait during cleanup
async fn wait_deployment_deleted<C: DeploymentControl>(
    control: &C,
    id: &str,
    timeout: Duration,
) -> Result<(), ProviderError> {
    let conf = WaitConf::new(id, timeout)
        .pending([
            status::PROVISIONING,
            status::AVAILABLE,
            status::SWITCHOVER_IN_PROGRESS,
            status::SWITCHOVER_COMPLETED,
            status::SWITCHOVER_FAILED,
            status::INVALID_CONFIGURATION,
            status::DELETING,
        ])
        .missing_is_target(true)
        .poll_interval(POLL_INTERVAL);
    let refresh = move || async move {
        match control.describe_deployment(id).await? {
            None => Ok(Refresh::Missing),
            Some(state) => Ok(Refresh::Found {
                status: state.status.clone(),
                detail: state.detail.clone(),
                payload: state,
            }),
        }
    };
    conf.wait_for_state(refresh)
        .await
        .map(|_| ())
        .map_err(|err| {
            ProviderError::new("waiting for deployment descriptor deletion").with_cause(err)
        })
}
