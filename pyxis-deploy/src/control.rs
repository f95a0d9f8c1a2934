//! Deployment control seam
//!
//! The orchestrator drives a small set of mutations and status reads
//! supplied by resource glue. The trait carries no concrete cloud API
//! shapes; implementations translate to whatever their control plane
//! expects.

use async_trait::async_trait;
use pyxis_core::provider::ProviderResult;

/// Lifecycle statuses a deployment descriptor reports
pub mod status {
    pub const PROVISIONING: &str = "PROVISIONING";
    pub const AVAILABLE: &str = "AVAILABLE";
    pub const SWITCHOVER_IN_PROGRESS: &str = "SWITCHOVER_IN_PROGRESS";
    pub const SWITCHOVER_COMPLETED: &str = "SWITCHOVER_COMPLETED";
    pub const SWITCHOVER_FAILED: &str = "SWITCHOVER_FAILED";
    pub const INVALID_CONFIGURATION: &str = "INVALID_CONFIGURATION";
    pub const DELETING: &str = "DELETING";
}

/// Status vocabulary of the resource behind a deployment
///
/// Supplied by resource glue per resource type; the orchestrator has no
/// built-in knowledge of any resource's lifecycle strings.
#[derive(Debug, Clone, Default)]
pub struct TargetStates {
    /// Statuses meaning the resource is still converging
    pub pending: Vec<String>,
    /// Statuses meaning the resource is stable and usable
    pub stable: Vec<String>,
    /// Unrecoverable statuses
    pub failed: Vec<String>,
    /// Statuses reported while the resource is being deleted
    pub deleting: Vec<String>,
}

impl TargetStates {
    pub fn new<P, PS, T, TS>(pending: P, stable: T) -> Self
    where
        P: IntoIterator<Item = PS>,
        PS: Into<String>,
        T: IntoIterator<Item = TS>,
        TS: Into<String>,
    {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            stable: stable.into_iter().map(Into::into).collect(),
            failed: Vec::new(),
            deleting: Vec::new(),
        }
    }

    pub fn failed<I, S>(mut self, failed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failed = failed.into_iter().map(Into::into).collect();
        self
    }

    pub fn deleting<I, S>(mut self, deleting: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deleting = deleting.into_iter().map(Into::into).collect();
        self
    }
}

/// Specification for one orchestrated deployment
#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    /// Diagnostic name for the deployment
    pub name: String,
    /// Remote identifier of the original (source) resource
    pub source: String,
    /// Idempotency token for the create call; generated when absent so a
    /// retried create cannot provision a duplicate parallel environment
    pub client_token: Option<String>,
    /// Status vocabulary of the source/target resource type
    pub target_states: TargetStates,
}

impl DeploymentSpec {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            client_token: None,
            target_states: TargetStates::default(),
        }
    }

    pub fn client_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = Some(token.into());
        self
    }

    pub fn target_states(mut self, target_states: TargetStates) -> Self {
        self.target_states = target_states;
        self
    }

    /// The idempotency token, generating one on first use
    pub fn ensure_client_token(&mut self) -> &str {
        self.client_token
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
    }
}

/// Remote-reported state of a deployment descriptor
#[derive(Debug, Clone)]
pub struct DeploymentState {
    pub id: String,
    pub status: String,
    /// Remote-supplied detail accompanying the status
    pub detail: Option<String>,
    /// Identifier of the original resource
    pub source: String,
    /// Identifier of the provisioned parallel resource, once known
    pub target: Option<String>,
}

/// Status of an individual resource read through the control seam
#[derive(Debug, Clone)]
pub struct ResourceStatus {
    pub status: String,
    pub detail: Option<String>,
}

/// Mutations and status reads the orchestrator needs from resource glue
///
/// All calls are async and side-effecting. `create_deployment` must honor
/// the spec's client token so the orchestrator can retry it safely.
#[async_trait]
pub trait DeploymentControl: Send + Sync + 'static {
    /// Stand up the parallel deployment described by `spec`
    async fn create_deployment(&self, spec: &DeploymentSpec) -> ProviderResult<DeploymentState>;

    /// Read the deployment descriptor; `None` when it no longer exists
    async fn describe_deployment(&self, id: &str) -> ProviderResult<Option<DeploymentState>>;

    /// Cut traffic over from the source to the target
    async fn switchover_deployment(&self, id: &str) -> ProviderResult<()>;

    /// Delete the deployment descriptor. When `delete_target` is set the
    /// provisioned parallel resource is deleted with it (the descriptor was
    /// abandoned before switchover).
    async fn delete_deployment(&self, id: &str, delete_target: bool) -> ProviderResult<()>;

    /// Apply modifications to the provisioned target resource
    async fn modify_target(
        &self,
        target_id: &str,
        changes: &serde_json::Value,
    ) -> ProviderResult<()>;

    /// Read an individual resource's status; `None` when it does not exist
    async fn describe_resource(&self, id: &str) -> ProviderResult<Option<ResourceStatus>>;

    /// Delete an individual resource
    async fn delete_resource(&self, id: &str) -> ProviderResult<()>;
}
