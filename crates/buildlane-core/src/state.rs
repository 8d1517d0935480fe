//! Cluster state store trait.
//!
//! Every agent process shares one queue of QUEUED jobs, the
//! `processing_jobs` map (job id -> BUILDING job) and the
//! `build_agent_information` map (member address -> agent record). All
//! operations are atomic per key; nothing here spans two keys except
//! [`StateStore::claim_next`], which moves one job from the queue into the
//! processing map.
//!
//! Conditional operations (`*_if`) compare against a full snapshot and report
//! whether they applied. Callers use them to resolve races silently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::agent::{BuildAgent, BuildAgentInformation};
use crate::job::BuildJob;
use crate::{JobId, Result};

#[async_trait]
pub trait StateStore: Send + Sync {
    // Queue

    /// Append a QUEUED job.
    async fn enqueue(&self, job: BuildJob) -> Result<()>;

    /// All queued jobs in dispatch order.
    async fn peek_all(&self) -> Result<Vec<BuildJob>>;

    /// Remove a queued job by id.
    async fn remove_queued(&self, id: JobId) -> Result<Option<BuildJob>>;

    /// Atomically take the head of the queue and store it, claimed by
    /// `agent`, in the processing map. Returns the claimed job.
    async fn claim_next(&self, agent: &BuildAgent, now: DateTime<Utc>)
    -> Result<Option<BuildJob>>;

    /// Wait until the queue may have changed, at most `timeout`.
    async fn wait_for_queue(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    /// Claim the next job, waiting up to `timeout` for one to arrive.
    async fn dequeue_blocking(
        &self,
        agent: &BuildAgent,
        timeout: Duration,
    ) -> Result<Option<BuildJob>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.claim_next(agent, Utc::now()).await? {
                return Ok(Some(job));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.wait_for_queue(remaining).await;
        }
    }

    // Processing map

    async fn processing_jobs(&self) -> Result<Vec<BuildJob>>;

    async fn get_processing(&self, id: JobId) -> Result<Option<BuildJob>>;

    async fn put_processing(&self, job: BuildJob) -> Result<()>;

    /// Returns `false` if a job with the same id is already present.
    async fn put_processing_if_absent(&self, job: BuildJob) -> Result<bool>;

    async fn remove_processing(&self, id: JobId) -> Result<Option<BuildJob>>;

    /// Remove only if the stored job still equals `expected`.
    async fn remove_processing_if(&self, expected: &BuildJob) -> Result<bool>;

    /// Replace only if the stored job still equals `expected`.
    async fn replace_processing_if(&self, expected: &BuildJob, new: BuildJob) -> Result<bool>;

    // Agent map

    async fn agents(&self) -> Result<Vec<BuildAgentInformation>>;

    async fn get_agent(&self, member_address: &str) -> Result<Option<BuildAgentInformation>>;

    async fn put_agent(&self, info: BuildAgentInformation) -> Result<()>;

    /// Returns `false` if a record for the address already exists.
    async fn put_agent_if_absent(&self, info: BuildAgentInformation) -> Result<bool>;

    async fn remove_agent(&self, member_address: &str) -> Result<Option<BuildAgentInformation>>;

    /// Replace only if the stored record still equals `expected`.
    async fn replace_agent_if(
        &self,
        expected: &BuildAgentInformation,
        new: BuildAgentInformation,
    ) -> Result<bool>;

    // Cancellation requests

    /// Ask the owning agent to interrupt a running job.
    async fn request_cancellation(&self, id: JobId) -> Result<()>;

    async fn cancellation_requests(&self) -> Result<Vec<JobId>>;

    async fn clear_cancellation(&self, id: JobId) -> Result<()>;
}
