//! Stale-job sweeper.
//!
//! Detects jobs that sat in the queue or in the processing map for too long
//! and finalizes them as MISSING, re-enqueueing a retry while the retry
//! budget lasts. Every agent host runs one; conditional removal keeps
//! concurrent sweepers and completions from finalizing a job twice.

use std::sync::Arc;
use std::time::Duration;

use buildlane_config::SchedulerConfig;
use buildlane_core::{BuildJob, BuildStatus, Error, Result, StateStore};
use buildlane_db::{BuildJobRepo, FinishedBuildJob};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::update_agent;

/// Counts of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Queued jobs past the queue timeout.
    pub stale_queued: usize,
    /// Building jobs past the missing-job threshold.
    pub missing: usize,
    pub retried: usize,
    /// Jobs that used up their retries.
    pub exhausted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stale_queued == 0 && self.missing == 0
    }
}

pub struct Sweeper {
    store: Arc<dyn StateStore>,
    repo: Arc<dyn BuildJobRepo>,
    queue_timeout: chrono::Duration,
    missing_job_threshold: chrono::Duration,
    max_missing_job_retries: u32,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn StateStore>,
        repo: Arc<dyn BuildJobRepo>,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        let to_chrono = |d: Duration, field: &str| {
            chrono::Duration::from_std(d)
                .map_err(|e| Error::InvalidInput(format!("{} out of range: {}", field, e)))
        };
        Ok(Self {
            store,
            repo,
            queue_timeout: to_chrono(config.queue_timeout, "queue timeout")?,
            missing_job_threshold: to_chrono(config.missing_job_threshold, "missing job threshold")?,
            max_missing_job_retries: config.max_missing_job_retries,
            interval: config.sweep_interval,
        })
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.sweep_once(Utc::now()).await {
                Ok(report) if report.is_empty() => debug!("Sweep found no stale jobs"),
                Ok(report) => info!(
                    stale_queued = report.stale_queued,
                    missing = report.missing,
                    retried = report.retried,
                    exhausted = report.exhausted,
                    "Sweep reclaimed stale jobs"
                ),
                Err(e) => warn!(error = %e, "Sweep failed"),
            }
        }
        info!("Sweeper stopped");
    }

    /// One pass over the queue and the processing map.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let queue = self.store.peek_all().await?;
        if queue.iter().any(|job| job.is_stale_queued(self.queue_timeout, now))
            && !self.cluster_has_room().await?
        {
            debug!("Cluster is saturated, leaving old queued jobs in place");
        } else {
            for job in queue {
                if !job.is_stale_queued(self.queue_timeout, now) {
                    continue;
                }
                self.reclaim_queued(job, now, &mut report).await?;
            }
        }

        for job in self.store.processing_jobs().await? {
            if !job.is_stale_building(self.missing_job_threshold, now) {
                continue;
            }
            if !self.store.remove_processing_if(&job).await? {
                debug!(job_id = %job.id, "Stale job changed during sweep, skipping");
                continue;
            }
            warn!(
                job_id = %job.id,
                agent = job.agent_address().unwrap_or("-"),
                started = ?job.timing.build_start_date,
                "Job exceeded the missing job threshold"
            );
            report.missing += 1;
            self.release_from_agent(&job).await;
            self.finalize_missing(&job, now, &mut report).await?;
        }

        Ok(report)
    }

    /// Whether a queued job could have been claimed: some unpaused agent has
    /// a free slot, or no unpaused agent is registered at all.
    async fn cluster_has_room(&self) -> Result<bool> {
        let mut eligible = self
            .store
            .agents()
            .await?
            .into_iter()
            .filter(|agent| !agent.status.is_paused())
            .peekable();
        if eligible.peek().is_none() {
            return Ok(true);
        }
        Ok(eligible.any(|agent| agent.has_capacity()))
    }

    async fn reclaim_queued(
        &self,
        job: BuildJob,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        // Gone means it was dispatched or cancelled in the meantime.
        let Some(job) = self.store.remove_queued(job.id).await? else {
            return Ok(());
        };
        warn!(
            job_id = %job.id,
            submitted = %job.timing.submission_date,
            "Job exceeded the queue timeout"
        );
        report.stale_queued += 1;
        self.finalize_missing(&job, now, report).await
    }

    async fn release_from_agent(&self, job: &BuildJob) {
        let Some(address) = job.agent_address() else {
            return;
        };
        let result = update_agent(self.store.as_ref(), address, |info| {
            info.remove_running_job(job.id).is_some()
        })
        .await;
        if let Err(e) = result {
            warn!(job_id = %job.id, agent = %address, error = %e, "Failed to release missing job from agent");
        }
    }

    async fn finalize_missing(
        &self,
        job: &BuildJob,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let missing = job.finished(BuildStatus::Missing, now);
        if let Err(e) = self.repo.save(FinishedBuildJob::from_job(&missing)).await {
            warn!(job_id = %job.id, error = %e, "Failed to persist missing build job");
        }

        if job.retry_count < self.max_missing_job_retries {
            let retry = job.retried();
            info!(
                job_id = %job.id,
                retry_job_id = %retry.id,
                retry_count = retry.retry_count,
                "Re-enqueued missing job"
            );
            self.store.enqueue(retry).await?;
            report.retried += 1;
        } else {
            error!(
                job_id = %job.id,
                name = %job.name,
                participation_id = job.participation_id,
                retry_count = job.retry_count,
                "Missing job exhausted its retries and will not be re-enqueued"
            );
            report.exhausted += 1;
        }
        Ok(())
    }
}
