//! Pyxis Core
//!
//! Shared model for the Pyxis convergence engine: the resource/state types
//! exchanged with cloud providers and the async `Provider` seam that
//! resource-operation glue implements.

pub mod provider;
pub mod resource;
