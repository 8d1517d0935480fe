//! Admin and control surface.
//!
//! Submission, queries, cancellation and agent pause/resume on top of the
//! shared cluster state. Safe to use from any process.

use std::sync::Arc;
use std::time::Duration;

use buildlane_core::{
    BuildAgentInformation, BuildJob, BuildJobRequest, BuildStatus, Error, JobId, ResumeKind,
    Result, StateStore,
};
use buildlane_db::{BuildJobRepo, BuildJobStatistics, FinishedBuildJob, FinishedJobFilter, Page};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::agent::AgentRegistry;
use crate::estimate::with_estimates;

pub struct SchedulerControl {
    store: Arc<dyn StateStore>,
    repo: Arc<dyn BuildJobRepo>,
    registry: AgentRegistry,
    default_estimated_duration: i64,
}

impl SchedulerControl {
    pub fn new(
        repo: Arc<dyn BuildJobRepo>,
        registry: AgentRegistry,
        default_estimated_duration: Duration,
    ) -> Self {
        Self {
            store: registry.store().clone(),
            repo,
            registry,
            default_estimated_duration: i64::try_from(default_estimated_duration.as_secs())
                .unwrap_or(i64::MAX),
        }
    }

    /// Validate and queue a build request.
    pub async fn enqueue(&self, request: BuildJobRequest) -> Result<JobId> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidInput("job name must not be empty".to_string()));
        }
        request.build_config.validate()?;

        let estimated_duration = match self.repo.average_build_duration(request.exercise_id).await
        {
            Ok(Some(average)) => average,
            Ok(None) => self.default_estimated_duration,
            Err(e) => {
                warn!(
                    exercise_id = request.exercise_id,
                    error = %e,
                    "Failed to load average build duration, using default"
                );
                self.default_estimated_duration
            }
        };

        let job = BuildJob::queued(request, estimated_duration, Utc::now());
        let id = job.id;
        info!(
            job_id = %id,
            name = %job.name,
            participation_id = job.participation_id,
            priority = job.priority,
            estimated_duration,
            "Enqueued build job"
        );
        self.store.enqueue(job).await?;
        Ok(id)
    }

    /// Queued jobs in dispatch order, with estimated completion dates.
    pub async fn list_queued(&self, course_id: Option<i64>) -> Result<Vec<BuildJob>> {
        let queued = self.store.peek_all().await?;
        let agents = self.store.agents().await?;
        let estimated = with_estimates(queued, &agents, Utc::now());
        Ok(estimated
            .into_iter()
            .filter(|job| matches_course(job, course_id))
            .collect())
    }

    pub async fn list_running(&self, course_id: Option<i64>) -> Result<Vec<BuildJob>> {
        let mut running: Vec<_> = self
            .store
            .processing_jobs()
            .await?
            .into_iter()
            .filter(|job| matches_course(job, course_id))
            .collect();
        running.sort_by_key(|job| job.timing.build_start_date);
        Ok(running)
    }

    pub async fn list_agents(&self) -> Result<Vec<BuildAgentInformation>> {
        let mut agents = self.store.agents().await?;
        agents.sort_by(|a, b| a.agent.short_name.cmp(&b.agent.short_name));
        Ok(agents)
    }

    pub async fn get_agent(&self, short_name: &str) -> Result<BuildAgentInformation> {
        self.store
            .agents()
            .await?
            .into_iter()
            .find(|info| info.agent.short_name == short_name)
            .ok_or_else(|| Error::NotFound(format!("build agent {}", short_name)))
    }

    /// Cancel one job wherever it is.
    ///
    /// Returns `false` when there was nothing to cancel: the id is unknown
    /// or the job already finished.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool> {
        if let Some(job) = self.store.remove_queued(job_id).await? {
            let cancelled = job.finished(BuildStatus::Cancelled, Utc::now());
            if let Err(e) = self.repo.save(FinishedBuildJob::from_job(&cancelled)).await {
                warn!(job_id = %job_id, error = %e, "Failed to persist cancelled build job");
            }
            info!(job_id = %job_id, "Cancelled queued build job");
            return Ok(true);
        }

        if self.store.get_processing(job_id).await?.is_some() {
            self.store.request_cancellation(job_id).await?;
            info!(job_id = %job_id, "Requested cancellation of running build job");
            return Ok(true);
        }

        debug!(job_id = %job_id, "Nothing to cancel");
        Ok(false)
    }

    /// Cancel every id, counting only those that were still there.
    async fn cancel_each(&self, ids: impl IntoIterator<Item = JobId>) -> Result<usize> {
        let mut cancelled = 0;
        for id in ids {
            if self.cancel(id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub async fn cancel_all_queued(&self, course_id: Option<i64>) -> Result<usize> {
        let queued = self.store.peek_all().await?;
        self.cancel_each(
            queued
                .into_iter()
                .filter(|job| matches_course(job, course_id))
                .map(|job| job.id),
        )
        .await
    }

    /// Request cancellation of running jobs, optionally only those of one
    /// course or one agent.
    pub async fn cancel_all_running(
        &self,
        course_id: Option<i64>,
        agent_name: Option<&str>,
    ) -> Result<usize> {
        let running = self.store.processing_jobs().await?;
        self.cancel_each(
            running
                .into_iter()
                .filter(|job| {
                    agent_name.is_none_or(|name| {
                        job.agent.as_ref().is_some_and(|agent| agent.short_name == name)
                    }) && matches_course(job, course_id)
                })
                .map(|job| job.id),
        )
        .await
    }

    /// Returns `false` if the agent was already paused.
    pub async fn pause_agent(&self, short_name: &str) -> Result<bool> {
        let info = self.get_agent(short_name).await?;
        self.registry.pause(&info.agent.member_address).await
    }

    /// Operator resume; clears the failure streak.
    pub async fn resume_agent(&self, short_name: &str) -> Result<bool> {
        let info = self.get_agent(short_name).await?;
        self.registry
            .resume(&info.agent.member_address, ResumeKind::Operator)
            .await
    }

    /// Number of agents that changed to PAUSED.
    pub async fn pause_all_agents(&self) -> Result<usize> {
        let mut paused = 0;
        for info in self.store.agents().await? {
            match self.registry.pause(&info.agent.member_address).await {
                Ok(true) => paused += 1,
                Ok(false) => {}
                // Deregistered in the meantime.
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(paused)
    }

    /// Number of agents that were resumed.
    pub async fn resume_all_agents(&self) -> Result<usize> {
        let mut resumed = 0;
        for info in self.store.agents().await? {
            match self
                .registry
                .resume(&info.agent.member_address, ResumeKind::Operator)
                .await
            {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(resumed)
    }

    pub async fn list_finished(
        &self,
        filter: &FinishedJobFilter,
        page: Page,
    ) -> Result<Vec<FinishedBuildJob>> {
        Ok(self.repo.list_finished(filter, page).await?)
    }

    pub async fn statistics(&self, course_id: Option<i64>) -> Result<BuildJobStatistics> {
        Ok(self.repo.statistics(course_id).await?)
    }
}

fn matches_course(job: &BuildJob, course_id: Option<i64>) -> bool {
    course_id.is_none_or(|id| job.course_id == id)
}
