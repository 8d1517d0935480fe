//! Execution backends for buildlane build jobs.
//!
//! The Docker backend runs each job's build script in a fresh container with
//! resource limits capped by the agent's configuration.

pub mod docker;

pub use docker::{ContainerLimits, DockerBuildExecutor};
