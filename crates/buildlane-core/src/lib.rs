//! Core domain types and traits for the buildlane build-job scheduler.
//!
//! This crate contains:
//! - Job identifiers and the build job record
//! - Agent records and their state transitions
//! - The cluster state store trait
//! - The build executor trait
//! - Agent events for the notification outbox

pub mod agent;
pub mod error;
pub mod event;
pub mod executor;
pub mod id;
pub mod job;
pub mod state;

pub use agent::{AgentStatus, BuildAgent, BuildAgentDetails, BuildAgentInformation, ResumeKind};
pub use error::{Error, Result};
pub use event::AgentEvent;
pub use executor::{ArtifactRef, BuildExecutor, BuildOutcome};
pub use id::JobId;
pub use job::{
    BuildConfig, BuildJob, BuildJobRequest, BuildStatus, DockerRunConfig, JobTimingInfo,
    PRIORITY_EXAM_CONDUCTION, PRIORITY_NORMAL, PRIORITY_OPTIONAL_EXERCISE, RepositoryInfo,
};
pub use state::StateStore;
