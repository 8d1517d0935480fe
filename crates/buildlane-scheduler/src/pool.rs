//! Bounded execution pool.
//!
//! A semaphore sized to the agent's capacity gates how many builds run at
//! once. The dispatch loop acquires a permit before claiming a job, so a job
//! is only ever taken from the queue when a slot is free. Each running build
//! has a cancellation token used to interrupt it. Builds interrupted by
//! [`ExecutionPool::shutdown`] go back to the queue instead of finishing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use buildlane_core::{BuildExecutor, BuildJob, BuildOutcome, BuildStatus, Error, JobId, Result};
use chrono::Utc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion::JobCompletion;

pub struct ExecutionPool {
    executor: Arc<dyn BuildExecutor>,
    permits: Arc<Semaphore>,
    capacity: usize,
    running: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    draining: CancellationToken,
}

impl ExecutionPool {
    pub fn new(executor: Arc<dyn BuildExecutor>, capacity: usize) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            running: Arc::new(Mutex::new(HashMap::new())),
            draining: CancellationToken::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("execution pool is closed".to_string()))
    }

    pub async fn running_jobs(&self) -> Vec<JobId> {
        self.running.lock().await.keys().copied().collect()
    }

    pub async fn is_running(&self, job_id: JobId) -> bool {
        self.running.lock().await.contains_key(&job_id)
    }

    /// Run `job` in the background, holding `permit` until its completion
    /// has been recorded.
    pub async fn spawn(
        &self,
        job: BuildJob,
        permit: OwnedSemaphorePermit,
        completion: Arc<JobCompletion>,
    ) {
        let token = CancellationToken::new();
        self.running.lock().await.insert(job.id, token.clone());

        let executor = self.executor.clone();
        let running = self.running.clone();
        let draining = self.draining.clone();
        tokio::spawn(async move {
            let _permit = permit;
            info!(job_id = %job.id, name = %job.name, "Starting build");
            let outcome = execute(executor.as_ref(), &job, &token, &draining).await;
            running.lock().await.remove(&job.id);
            match outcome {
                Some(outcome) => {
                    completion.complete(&job, outcome, Utc::now()).await;
                }
                None => {
                    if let Err(e) = completion.requeue(&job).await {
                        warn!(job_id = %job.id, error = %e, "Failed to return interrupted build to the queue");
                    }
                }
            }
        });
    }

    /// Interrupt a local build. Returns `false` if the job does not run here.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        match self.running.lock().await.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until every slot is free. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(_permits)) => true,
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }

    /// Let running builds finish within `grace`, then interrupt the rest and
    /// return them to the queue for another agent.
    pub async fn shutdown(&self, grace: Duration) {
        if self.wait_idle(grace).await {
            return;
        }
        let interrupted = self.running.lock().await.len();
        warn!(interrupted, "Shutdown grace period elapsed, interrupting builds");
        self.draining.cancel();
        if !self.wait_idle(grace.max(Duration::from_secs(1))).await {
            warn!("Builds still running after interruption");
        }
    }
}

/// Run one build, mapping every way it can end to a terminal outcome.
///
/// `None` means the pool is shutting down and the build was abandoned.
async fn execute(
    executor: &dyn BuildExecutor,
    job: &BuildJob,
    token: &CancellationToken,
    draining: &CancellationToken,
) -> Option<BuildOutcome> {
    let outcome = tokio::select! {
        result = executor.run(job) => match result {
            Ok(outcome) if outcome.status.is_terminal() => outcome,
            Ok(outcome) => {
                warn!(job_id = %job.id, status = %outcome.status, "Executor returned a non-terminal status");
                BuildOutcome {
                    message: Some(format!("executor returned non-terminal status {}", outcome.status)),
                    ..BuildOutcome::with_status(BuildStatus::Error)
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Build failed with an infrastructure error");
                BuildOutcome {
                    message: Some(e.to_string()),
                    ..BuildOutcome::with_status(BuildStatus::Error)
                }
            }
        },
        _ = token.cancelled() => {
            debug!(job_id = %job.id, "Interrupting build");
            interrupt(executor, job).await;
            BuildOutcome::cancelled()
        }
        _ = draining.cancelled() => {
            debug!(job_id = %job.id, "Interrupting build for shutdown");
            interrupt(executor, job).await;
            return None;
        }
    };
    Some(outcome)
}

async fn interrupt(executor: &dyn BuildExecutor, job: &BuildJob) {
    if let Err(e) = executor.interrupt(job.id).await {
        warn!(job_id = %job.id, error = %e, "Failed to interrupt build");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, MockBehavior};
    use buildlane_core::{PRIORITY_NORMAL, StateStore};

    #[tokio::test]
    async fn test_executor_error_maps_to_error_status() {
        let harness = Harness::new(1).await;
        harness
            .executor
            .set_behavior("broken", MockBehavior::Fail("daemon unreachable".to_string()));
        let job = harness.claim("broken", PRIORITY_NORMAL).await;

        let permit = harness.pool.acquire().await.unwrap();
        harness
            .pool
            .spawn(job.clone(), permit, harness.completion.clone())
            .await;
        assert!(harness.pool.wait_idle(Duration::from_secs(5)).await);

        let records = harness.repo.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "ERROR");
    }

    #[tokio::test]
    async fn test_non_terminal_outcome_maps_to_error_status() {
        let harness = Harness::new(1).await;
        harness
            .executor
            .set_behavior("weird", MockBehavior::Status(BuildStatus::Building));
        let job = harness.claim("weird", PRIORITY_NORMAL).await;

        let permit = harness.pool.acquire().await.unwrap();
        harness.pool.spawn(job, permit, harness.completion.clone()).await;
        assert!(harness.pool.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(harness.repo.all().await[0].status, "ERROR");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_and_reports_cancelled() {
        let harness = Harness::new(1).await;
        harness.executor.set_behavior("slow", MockBehavior::Hang);
        let job = harness.claim("slow", PRIORITY_NORMAL).await;

        let permit = harness.pool.acquire().await.unwrap();
        harness
            .pool
            .spawn(job.clone(), permit, harness.completion.clone())
            .await;
        assert!(harness.pool.is_running(job.id).await);
        assert_eq!(harness.pool.available(), 0);

        assert!(harness.pool.cancel(job.id).await);
        assert!(harness.pool.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(harness.executor.interrupted(), vec![job.id]);
        assert_eq!(harness.repo.all().await[0].status, "CANCELLED");
        assert!(!harness.pool.cancel(job.id).await);
        assert!(harness.store.get_processing(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_returns_interrupted_builds_to_queue() {
        let harness = Harness::new(2).await;
        harness.executor.set_behavior("slow", MockBehavior::Hang);
        let mut claimed = Vec::new();
        for _ in 0..2 {
            let job = harness.claim("slow", PRIORITY_NORMAL).await;
            claimed.push(job.id);
            let permit = harness.pool.acquire().await.unwrap();
            harness.pool.spawn(job, permit, harness.completion.clone()).await;
        }

        harness.pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(harness.pool.available(), 2);
        assert_eq!(harness.executor.interrupted().len(), 2);
        assert!(harness.repo.all().await.is_empty());
        assert!(harness.store.processing_jobs().await.unwrap().is_empty());

        let queue = harness.store.peek_all().await.unwrap();
        let mut requeued: Vec<_> = queue.iter().map(|j| j.id).collect();
        requeued.sort();
        claimed.sort();
        assert_eq!(requeued, claimed);
        assert!(queue.iter().all(|j| j.status == BuildStatus::Queued && j.agent.is_none()));
        assert!(queue.iter().all(|j| j.retry_count == 0));

        let info = harness.agent_info().await;
        assert_eq!(info.current_build_jobs, 0);
        assert_eq!(info.details.consecutive_failed_build_jobs, 0);
    }
}
