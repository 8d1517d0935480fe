//! Dispatch loop of one agent.
//!
//! Pulls the highest-priority queued job whenever the local agent has a free
//! slot and is not paused, hands it to the execution pool and watches the
//! cancellation requests for jobs running here.

use std::sync::Arc;
use std::time::Duration;

use buildlane_config::SchedulerConfig;
use buildlane_core::{Result, StateStore};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentLifecycle;
use crate::completion::JobCompletion;
use crate::pool::ExecutionPool;

/// Pause after a failed iteration before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound between two scans of the cancellation requests.
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct DispatchLoop {
    store: Arc<dyn StateStore>,
    lifecycle: Arc<AgentLifecycle>,
    pool: Arc<ExecutionPool>,
    completion: Arc<JobCompletion>,
    poll_interval: Duration,
    shutdown_grace_period: Duration,
}

impl DispatchLoop {
    pub fn new(
        store: Arc<dyn StateStore>,
        lifecycle: Arc<AgentLifecycle>,
        pool: Arc<ExecutionPool>,
        completion: Arc<JobCompletion>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            lifecycle,
            pool,
            completion,
            poll_interval: config.poll_interval,
            shutdown_grace_period: config.shutdown_grace_period,
        }
    }

    /// Register the agent, dispatch until `shutdown` fires, then drain the
    /// pool and deregister.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.lifecycle.register(Utc::now()).await?;
        info!(
            agent = %self.lifecycle.agent().short_name,
            capacity = self.pool.capacity(),
            "Dispatch loop started"
        );

        tokio::join!(
            self.dispatch_until(&shutdown),
            self.watch_cancellations(&shutdown)
        );

        info!(
            grace_secs = self.shutdown_grace_period.as_secs(),
            "Dispatch loop stopping, waiting for running builds"
        );
        self.pool.shutdown(self.shutdown_grace_period).await;
        self.lifecycle.deregister().await?;
        info!("Dispatch loop stopped");
        Ok(())
    }

    async fn dispatch_until(&self, shutdown: &CancellationToken) {
        while !shutdown.is_cancelled() {
            if let Err(e) = self.dispatch_once(shutdown).await {
                warn!(error = %e, "Dispatch iteration failed");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    /// One claim attempt. Returns whether a job was started.
    pub async fn dispatch_once(&self, shutdown: &CancellationToken) -> Result<bool> {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => return Ok(false),
            permit = tokio::time::timeout(self.poll_interval, self.pool.acquire()) => match permit {
                Ok(permit) => permit?,
                Err(_) => return Ok(false),
            },
        };

        if !self.lifecycle.is_accepting().await? {
            drop(permit);
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            return Ok(false);
        }

        let agent = self.lifecycle.agent();
        let claimed = tokio::select! {
            _ = shutdown.cancelled() => return Ok(false),
            claimed = self.store.dequeue_blocking(agent, self.poll_interval) => claimed?,
        };
        let Some(job) = claimed else {
            return Ok(false);
        };

        match self.lifecycle.record_claim(&job).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, "Agent paused during claim, returning job to queue");
                self.completion.requeue(&job).await?;
                return Ok(false);
            }
            Err(e) => {
                self.completion.requeue(&job).await?;
                return Err(e);
            }
        }

        info!(
            job_id = %job.id,
            name = %job.name,
            priority = job.priority,
            retry_count = job.retry_count,
            "Dispatched build job"
        );
        self.pool
            .spawn(job, permit, self.completion.clone())
            .await;
        Ok(true)
    }

    async fn watch_cancellations(&self, shutdown: &CancellationToken) {
        let period = self.poll_interval.min(CANCELLATION_POLL_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.process_cancellations().await {
                warn!(error = %e, "Failed to process cancellation requests");
            }
        }
    }

    /// Interrupt local builds with a pending cancellation request.
    ///
    /// Requests for jobs that are no longer processing anywhere are dropped.
    /// Requests for jobs of other agents are left for their owners.
    pub async fn process_cancellations(&self) -> Result<usize> {
        let mut interrupted = 0;
        for job_id in self.store.cancellation_requests().await? {
            if self.pool.cancel(job_id).await {
                info!(job_id = %job_id, "Cancelling running build");
                interrupted += 1;
                continue;
            }
            if self.store.get_processing(job_id).await?.is_none() {
                self.store.clear_cancellation(job_id).await?;
            }
        }
        Ok(interrupted)
    }
}
