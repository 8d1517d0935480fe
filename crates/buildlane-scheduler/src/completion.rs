//! Completion protocol for finished builds.

use std::sync::Arc;

use buildlane_core::{BuildJob, BuildOutcome, Result, StateStore};
use buildlane_db::{BuildJobRepo, FinishedBuildJob};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::agent::AgentLifecycle;

/// Finalizes builds that ran on the local agent.
pub struct JobCompletion {
    store: Arc<dyn StateStore>,
    repo: Arc<dyn BuildJobRepo>,
    lifecycle: Arc<AgentLifecycle>,
}

impl JobCompletion {
    pub fn new(
        store: Arc<dyn StateStore>,
        repo: Arc<dyn BuildJobRepo>,
        lifecycle: Arc<AgentLifecycle>,
    ) -> Self {
        Self {
            store,
            repo,
            lifecycle,
        }
    }

    /// Record the outcome of `job`.
    ///
    /// Only the caller that removes the job from the processing map writes
    /// the historical record. A job the sweeper already reclaimed still frees
    /// its slot on the local agent. Failures are logged, never returned, so
    /// capacity is always released.
    pub async fn complete(
        &self,
        job: &BuildJob,
        outcome: BuildOutcome,
        now: DateTime<Utc>,
    ) -> BuildJob {
        let finished = job.finished(outcome.status, now);

        let owned = match self.store.remove_processing(job.id).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                info!(job_id = %job.id, "Job was reclaimed while running, skipping result");
                false
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to remove job from processing");
                false
            }
        };

        if owned {
            if let Err(e) = self.repo.save(FinishedBuildJob::from_job(&finished)).await {
                warn!(job_id = %job.id, error = %e, "Failed to persist finished build job");
            }
            if let Err(e) = self.lifecycle.record_completion(&finished, now).await {
                warn!(job_id = %job.id, error = %e, "Failed to record completion on agent");
            }
        } else if let Err(e) = self.lifecycle.release(job.id).await {
            warn!(job_id = %job.id, error = %e, "Failed to release job from agent");
        }

        if let Err(e) = self.store.clear_cancellation(job.id).await {
            warn!(job_id = %job.id, error = %e, "Failed to clear cancellation request");
        }

        info!(
            job_id = %job.id,
            status = %finished.status,
            exit_code = ?outcome.exit_code,
            duration_secs = ?finished.timing.build_duration().map(|d| d.num_seconds()),
            "Build finished"
        );
        finished
    }

    /// Undo a claim: the job goes back to the queue with its id and
    /// submission date, and its slot on the local agent is freed.
    ///
    /// Returns `false` if the processing entry changed under us, in which
    /// case whoever changed it owns the job now.
    pub async fn requeue(&self, job: &BuildJob) -> Result<bool> {
        let owned = self.store.remove_processing_if(job).await?;
        if owned {
            self.store.enqueue(job.requeued()).await?;
            info!(job_id = %job.id, "Returned build job to the queue");
        } else {
            error!(job_id = %job.id, "Claimed job changed before it could be returned to the queue");
        }
        self.lifecycle.release(job.id).await?;
        Ok(owned)
    }
}
