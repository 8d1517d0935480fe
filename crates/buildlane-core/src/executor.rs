//! Build executor trait and outcome types.
//!
//! Executors run a build job in an isolated environment (container, VM, ...)
//! and report a terminal status. Per-job timeouts are enforced here, not by
//! the scheduler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::{BuildJob, BuildStatus};
use crate::{JobId, Result};

/// Reference to an artifact produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub path: String,
    pub size: u64,
}

/// Result of running one build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    /// Terminal status reported by the executor.
    pub status: BuildStatus,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub artifacts: Vec<ArtifactRef>,
}

impl BuildOutcome {
    pub fn with_status(status: BuildStatus) -> Self {
        Self {
            status,
            exit_code: None,
            message: None,
            artifacts: Vec::new(),
        }
    }

    pub fn successful() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::with_status(BuildStatus::Successful)
        }
    }

    pub fn failed(exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: Some(message.into()),
            ..Self::with_status(BuildStatus::Failed)
        }
    }

    pub fn timed_out() -> Self {
        Self::with_status(BuildStatus::Timeout)
    }

    pub fn cancelled() -> Self {
        Self::with_status(BuildStatus::Cancelled)
    }
}

/// Trait for build executors.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run the job to completion.
    ///
    /// Infrastructure failures are returned as `Err` and recorded as ERROR.
    async fn run(&self, job: &BuildJob) -> Result<BuildOutcome>;

    /// Stop the execution of a running job. Unknown ids are ignored.
    async fn interrupt(&self, job_id: JobId) -> Result<()>;
}
