//! Pyxis Deploy
//!
//! Multi-step orchestration over asynchronous cloud mutations: a blue/green
//! deployment orchestrator (stand up a parallel environment, wait for
//! availability, switch traffic, tear down the old environment) and a
//! generic step sequencer. Both guarantee that registered cleanup actions
//! run exactly once, on success and failure paths alike.

pub mod cleanup;
pub mod control;
pub mod orchestrator;
pub mod steps;

pub use cleanup::{CleanupError, CleanupStack};
pub use control::{DeploymentControl, DeploymentSpec, DeploymentState, ResourceStatus, TargetStates};
pub use orchestrator::{BlueGreenOrchestrator, OrchestrationError, Phase};
pub use steps::{SequenceError, SequenceReport, StepSequence};
