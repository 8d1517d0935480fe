//! Agent lifecycle management.
//!
//! Every write to an agent record is a compare-and-swap loop over its single
//! key in the state store. [`AgentRegistry`] works on any agent by address;
//! [`AgentLifecycle`] owns the record of the local agent.

use std::sync::Arc;

use buildlane_config::AgentConfig;
use buildlane_core::{
    AgentEvent, AgentStatus, BuildAgent, BuildAgentInformation, BuildJob, Error, JobId,
    ResumeKind, Result, StateStore,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::notify::Outbox;

const MAX_CAS_ATTEMPTS: usize = 32;

/// Before and after images of an agent record update.
#[derive(Debug, Clone)]
pub struct AgentUpdate {
    pub before: BuildAgentInformation,
    pub after: BuildAgentInformation,
}

impl AgentUpdate {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Apply `apply` to the record stored under `address` until the conditional
/// write succeeds.
///
/// `apply` returns `false` to leave the record untouched. Returns `None` when
/// no record exists.
pub async fn update_agent<F>(
    store: &dyn StateStore,
    address: &str,
    mut apply: F,
) -> Result<Option<AgentUpdate>>
where
    F: FnMut(&mut BuildAgentInformation) -> bool + Send,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let Some(before) = store.get_agent(address).await? else {
            return Ok(None);
        };
        let mut after = before.clone();
        if !apply(&mut after) || after == before {
            return Ok(Some(AgentUpdate {
                after: before.clone(),
                before,
            }));
        }
        if store.replace_agent_if(&before, after.clone()).await? {
            return Ok(Some(AgentUpdate { before, after }));
        }
        debug!(agent = %address, "Agent record changed concurrently, retrying");
    }
    Err(Error::Conflict(format!(
        "agent record {} kept changing during update",
        address
    )))
}

/// Pause/resume operations on any agent in the cluster.
#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<dyn StateStore>,
    outbox: Outbox,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn StateStore>, outbox: Outbox) -> Self {
        Self { store, outbox }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Stop dispatching to an agent. Running jobs continue.
    ///
    /// Returns `false` if the agent was already paused.
    pub async fn pause(&self, address: &str) -> Result<bool> {
        let update = update_agent(self.store.as_ref(), address, |info| info.pause())
            .await?
            .ok_or_else(|| Error::NotFound(format!("build agent {}", address)))?;

        if update.changed() {
            info!(agent = %address, "Paused build agent");
        }
        Ok(update.changed())
    }

    /// Clear a pause. Operator resumes also clear the failure streak.
    ///
    /// Returns `false` if the agent was not paused.
    pub async fn resume(&self, address: &str, kind: ResumeKind) -> Result<bool> {
        let update = update_agent(self.store.as_ref(), address, |info| info.resume(kind))
            .await?
            .ok_or_else(|| Error::NotFound(format!("build agent {}", address)))?;

        let resumed = update.before.status.is_paused() && !update.after.status.is_paused();
        if resumed {
            info!(agent = %address, kind = ?kind, "Resumed build agent");
            if kind == ResumeKind::Operator {
                self.outbox.publish(AgentEvent::Resumed {
                    agent: update.after.agent.clone(),
                    at: Utc::now(),
                });
            }
        }
        Ok(resumed)
    }
}

/// Owner of the local agent's record.
pub struct AgentLifecycle {
    registry: AgentRegistry,
    agent: BuildAgent,
    max_concurrent_builds: usize,
    pause_after_consecutive_failures: u32,
    recent_build_jobs: usize,
}

impl AgentLifecycle {
    pub fn new(registry: AgentRegistry, config: &AgentConfig) -> Self {
        Self {
            registry,
            agent: BuildAgent::new(
                config.short_name.clone(),
                config.address.clone(),
                config.display_name.clone(),
            ),
            max_concurrent_builds: config.max_concurrent_builds,
            pause_after_consecutive_failures: config.pause_after_consecutive_failures,
            recent_build_jobs: config.recent_build_jobs,
        }
    }

    pub fn agent(&self) -> &BuildAgent {
        &self.agent
    }

    pub fn max_concurrent_builds(&self) -> usize {
        self.max_concurrent_builds
    }

    fn address(&self) -> &str {
        &self.agent.member_address
    }

    /// Create or refresh the local agent record.
    ///
    /// A record left behind by a previous run at the same address keeps its
    /// health history and operator pause. Its running jobs are dropped; the
    /// sweeper reclaims them. A self-pause whose threshold no longer applies
    /// is lifted without clearing the failure streak.
    pub async fn register(&self, now: DateTime<Utc>) -> Result<BuildAgentInformation> {
        let store = self.registry.store.as_ref();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let previous = store.get_agent(self.address()).await?;
            let info = self.fresh_record(previous.as_ref(), now);
            let written = match &previous {
                Some(previous) => store.replace_agent_if(previous, info.clone()).await?,
                None => store.put_agent_if_absent(info.clone()).await?,
            };
            if written {
                info!(
                    agent = %self.agent.short_name,
                    address = %self.address(),
                    max_concurrent_builds = self.max_concurrent_builds,
                    status = ?info.status,
                    "Registered build agent"
                );
                return Ok(info);
            }
            debug!(agent = %self.address(), "Agent record changed during registration, retrying");
        }
        Err(Error::Conflict(format!(
            "agent record {} kept changing during registration",
            self.address()
        )))
    }

    fn fresh_record(
        &self,
        previous: Option<&BuildAgentInformation>,
        now: DateTime<Utc>,
    ) -> BuildAgentInformation {
        let mut info = BuildAgentInformation::new(
            self.agent.clone(),
            self.max_concurrent_builds,
            self.pause_after_consecutive_failures,
            self.recent_build_jobs,
            now,
        );
        let Some(previous) = previous else {
            return info;
        };

        info.details = previous.details.clone();
        info.recent_build_jobs = previous.recent_build_jobs.clone();
        let excess = info.recent_build_jobs.len().saturating_sub(self.recent_build_jobs);
        info.recent_build_jobs.drain(..excess);
        if previous.status.is_paused() {
            info.status = previous.status;
        }
        let threshold = self.pause_after_consecutive_failures;
        if info.status == AgentStatus::SelfPaused
            && (threshold == 0 || info.details.consecutive_failed_build_jobs < threshold)
        {
            info.resume(ResumeKind::Internal);
        }
        info
    }

    /// Remove the local agent record.
    pub async fn deregister(&self) -> Result<()> {
        self.registry.store.remove_agent(self.address()).await?;
        info!(agent = %self.agent.short_name, "Deregistered build agent");
        Ok(())
    }

    /// Current record of the local agent.
    pub async fn snapshot(&self) -> Result<Option<BuildAgentInformation>> {
        self.registry.store.get_agent(self.address()).await
    }

    /// Whether the local agent may take another job.
    pub async fn is_accepting(&self) -> Result<bool> {
        Ok(self
            .snapshot()
            .await?
            .is_some_and(|info| info.is_accepting()))
    }

    /// Track a claimed job.
    ///
    /// Returns `false`, leaving the record unchanged, if the agent was paused
    /// in the meantime.
    pub async fn record_claim(&self, job: &BuildJob) -> Result<bool> {
        let mut paused = false;
        let update = update_agent(self.registry.store.as_ref(), self.address(), |info| {
            paused = info.status.is_paused();
            if paused {
                return false;
            }
            info.add_running_job(job.clone());
            true
        })
        .await?
        .ok_or_else(|| Error::NotFound(format!("build agent {}", self.address())))?;

        if !paused {
            debug!(
                job_id = %job.id,
                current_build_jobs = update.after.current_build_jobs,
                "Recorded claim"
            );
        }
        Ok(!paused)
    }

    /// Drop a job from the running list without touching health metrics.
    pub async fn release(&self, job_id: JobId) -> Result<()> {
        update_agent(self.registry.store.as_ref(), self.address(), |info| {
            info.remove_running_job(job_id).is_some()
        })
        .await?;
        Ok(())
    }

    /// Apply a finished job to the local record.
    ///
    /// Emits [`AgentEvent::SelfPaused`] when this completion crossed the
    /// failure threshold.
    pub async fn record_completion(&self, job: &BuildJob, now: DateTime<Utc>) -> Result<()> {
        let mut entered_self_pause = false;
        let update = update_agent(self.registry.store.as_ref(), self.address(), |info| {
            entered_self_pause = info.record_completion(job, now);
            true
        })
        .await?;

        let Some(update) = update else {
            warn!(job_id = %job.id, "Local agent record is missing, completion not recorded");
            return Ok(());
        };

        if entered_self_pause {
            let consecutive_failures = update.after.details.consecutive_failed_build_jobs;
            warn!(
                agent = %self.agent.short_name,
                consecutive_failures,
                "Pausing build agent after consecutive failed build jobs"
            );
            self.registry.outbox.publish(AgentEvent::SelfPaused {
                agent: self.agent.clone(),
                consecutive_failures,
                at: now,
            });
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<bool> {
        self.registry.pause(self.address()).await
    }

    pub async fn resume(&self, kind: ResumeKind) -> Result<bool> {
        self.registry.resume(self.address(), kind).await
    }
}
