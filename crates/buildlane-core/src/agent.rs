//! Build agent records.
//!
//! [`BuildAgentInformation`] is the cluster-visible view of one agent process.
//! The transition methods here keep `current_build_jobs` equal to the length
//! of `running_build_jobs` and derive IDLE/ACTIVE from it; PAUSED and
//! SELF_PAUSED are only left through [`BuildAgentInformation::resume`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;
use crate::job::{BuildJob, BuildStatus};

/// Stable identity of an agent. `member_address` is the cluster map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildAgent {
    pub short_name: String,
    pub member_address: String,
    pub display_name: String,
}

impl BuildAgent {
    pub fn new(
        short_name: impl Into<String>,
        member_address: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            short_name: short_name.into(),
            member_address: member_address.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Active,
    /// Paused by an operator.
    Paused,
    /// Paused by the agent itself after repeated failures.
    SelfPaused,
}

impl AgentStatus {
    pub fn is_paused(&self) -> bool {
        matches!(self, AgentStatus::Paused | AgentStatus::SelfPaused)
    }
}

/// Who asked for a resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    /// Explicit operator action; clears the failure streak.
    Operator,
    /// Scheduler-internal; keeps the failure streak.
    Internal,
}

/// Rolling health metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAgentDetails {
    pub consecutive_failed_build_jobs: u32,
    pub last_failed_build_date: Option<DateTime<Utc>>,
    pub last_successful_build_date: Option<DateTime<Utc>>,
    pub successful_build_jobs: u64,
    pub failed_build_jobs: u64,
    pub start_date: DateTime<Utc>,
}

impl BuildAgentDetails {
    pub fn started_at(now: DateTime<Utc>) -> Self {
        Self {
            consecutive_failed_build_jobs: 0,
            last_failed_build_date: None,
            last_successful_build_date: None,
            successful_build_jobs: 0,
            failed_build_jobs: 0,
            start_date: now,
        }
    }
}

/// Cluster-visible state of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAgentInformation {
    pub agent: BuildAgent,
    pub max_concurrent_build_jobs: usize,
    pub current_build_jobs: usize,
    pub running_build_jobs: Vec<BuildJob>,
    pub status: AgentStatus,
    pub details: BuildAgentDetails,
    /// 0 disables self-pause.
    pub pause_after_consecutive_failures: u32,
    pub recent_build_jobs: Vec<BuildJob>,
    pub recent_build_jobs_limit: usize,
}

impl BuildAgentInformation {
    pub fn new(
        agent: BuildAgent,
        max_concurrent_build_jobs: usize,
        pause_after_consecutive_failures: u32,
        recent_build_jobs_limit: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent,
            max_concurrent_build_jobs,
            current_build_jobs: 0,
            running_build_jobs: Vec::new(),
            status: AgentStatus::Idle,
            details: BuildAgentDetails::started_at(now),
            pause_after_consecutive_failures,
            recent_build_jobs: Vec::new(),
            recent_build_jobs_limit,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.current_build_jobs < self.max_concurrent_build_jobs
    }

    /// Whether a new job may be dispatched to this agent.
    pub fn is_accepting(&self) -> bool {
        !self.status.is_paused() && self.has_capacity()
    }

    /// `current == |running| <= max`.
    pub fn is_consistent(&self) -> bool {
        self.current_build_jobs == self.running_build_jobs.len()
            && self.current_build_jobs <= self.max_concurrent_build_jobs
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.running_build_jobs.iter().any(|j| j.id == job_id)
    }

    /// Track a newly claimed job. Replaces an entry with the same id.
    pub fn add_running_job(&mut self, job: BuildJob) {
        self.running_build_jobs.retain(|j| j.id != job.id);
        self.running_build_jobs.push(job);
        self.sync_job_count();
    }

    pub fn remove_running_job(&mut self, job_id: JobId) -> Option<BuildJob> {
        let idx = self.running_build_jobs.iter().position(|j| j.id == job_id)?;
        let job = self.running_build_jobs.remove(idx);
        self.sync_job_count();
        Some(job)
    }

    /// Apply a finished job to the health metrics.
    ///
    /// Returns `true` when this completion moved the agent into SELF_PAUSED.
    /// Every non-successful status, CANCELLED included, extends the streak.
    pub fn record_completion(&mut self, job: &BuildJob, now: DateTime<Utc>) -> bool {
        self.remove_running_job(job.id);
        self.push_recent(job.clone());

        match job.status {
            BuildStatus::Successful => {
                self.details.consecutive_failed_build_jobs = 0;
                self.details.successful_build_jobs += 1;
                self.details.last_successful_build_date = Some(now);
                false
            }
            _ => {
                self.details.consecutive_failed_build_jobs += 1;
                self.details.failed_build_jobs += 1;
                self.details.last_failed_build_date = Some(now);
                self.check_self_pause()
            }
        }
    }

    /// Operator pause. Returns `false` if already paused.
    pub fn pause(&mut self) -> bool {
        if self.status.is_paused() {
            return false;
        }
        self.status = AgentStatus::Paused;
        true
    }

    /// Clear PAUSED/SELF_PAUSED. Returns `false` if the agent was not paused.
    pub fn resume(&mut self, kind: ResumeKind) -> bool {
        if !self.status.is_paused() {
            return false;
        }
        if kind == ResumeKind::Operator {
            self.details.consecutive_failed_build_jobs = 0;
        }
        self.status = AgentStatus::Idle;
        self.sync_job_count();
        true
    }

    fn check_self_pause(&mut self) -> bool {
        let threshold = self.pause_after_consecutive_failures;
        if threshold == 0
            || self.details.consecutive_failed_build_jobs < threshold
            || self.status == AgentStatus::SelfPaused
        {
            return false;
        }
        self.status = AgentStatus::SelfPaused;
        true
    }

    fn push_recent(&mut self, job: BuildJob) {
        if self.recent_build_jobs_limit == 0 {
            return;
        }
        while self.recent_build_jobs.len() >= self.recent_build_jobs_limit {
            self.recent_build_jobs.remove(0);
        }
        self.recent_build_jobs.push(job);
    }

    fn sync_job_count(&mut self) {
        self.current_build_jobs = self.running_build_jobs.len();
        if !self.status.is_paused() {
            self.status = if self.current_build_jobs > 0 {
                AgentStatus::Active
            } else {
                AgentStatus::Idle
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::PRIORITY_NORMAL;
    use crate::job::tests::make_request;

    fn make_agent(threshold: u32) -> BuildAgentInformation {
        BuildAgentInformation::new(
            BuildAgent::new("agent-1", "10.0.0.1:5701", "Agent 1"),
            2,
            threshold,
            3,
            Utc::now(),
        )
    }

    fn running_job(info: &BuildAgentInformation) -> BuildJob {
        let now = Utc::now();
        BuildJob::queued(make_request(PRIORITY_NORMAL), 10, now).claimed_by(info.agent.clone(), now)
    }

    #[test]
    fn test_status_follows_job_count() {
        let mut info = make_agent(0);
        let job = running_job(&info);
        info.add_running_job(job.clone());
        assert_eq!(info.status, AgentStatus::Active);
        assert!(info.is_consistent());

        info.record_completion(&job.finished(BuildStatus::Successful, Utc::now()), Utc::now());
        assert_eq!(info.status, AgentStatus::Idle);
        assert_eq!(info.current_build_jobs, 0);
        assert!(info.is_consistent());
    }

    #[test]
    fn test_self_pause_fires_once_at_threshold() {
        let mut info = make_agent(3);
        let mut transitions = 0;
        for _ in 0..5 {
            let job = running_job(&info);
            info.add_running_job(job.clone());
            if info.record_completion(&job.finished(BuildStatus::Failed, Utc::now()), Utc::now()) {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
        assert_eq!(info.status, AgentStatus::SelfPaused);
        assert_eq!(info.details.consecutive_failed_build_jobs, 5);
    }

    #[test]
    fn test_success_resets_streak() {
        let mut info = make_agent(3);
        for status in [BuildStatus::Failed, BuildStatus::Error, BuildStatus::Successful] {
            let job = running_job(&info);
            info.add_running_job(job.clone());
            info.record_completion(&job.finished(status, Utc::now()), Utc::now());
        }
        assert_eq!(info.details.consecutive_failed_build_jobs, 0);
        assert_eq!(info.status, AgentStatus::Idle);
    }

    #[test]
    fn test_cancelled_build_extends_failure_streak() {
        let mut info = make_agent(2);
        let mut paused = false;
        for status in [BuildStatus::Failed, BuildStatus::Cancelled] {
            let job = running_job(&info);
            info.add_running_job(job.clone());
            paused = info.record_completion(&job.finished(status, Utc::now()), Utc::now());
        }
        assert!(paused);
        assert_eq!(info.details.consecutive_failed_build_jobs, 2);
        assert_eq!(info.status, AgentStatus::SelfPaused);
    }

    #[test]
    fn test_operator_resume_clears_streak_internal_does_not() {
        let mut info = make_agent(1);
        let job = running_job(&info);
        info.add_running_job(job.clone());
        assert!(info.record_completion(&job.finished(BuildStatus::Timeout, Utc::now()), Utc::now()));

        let mut internal = info.clone();
        assert!(internal.resume(ResumeKind::Internal));
        assert_eq!(internal.details.consecutive_failed_build_jobs, 1);

        assert!(info.resume(ResumeKind::Operator));
        assert_eq!(info.details.consecutive_failed_build_jobs, 0);
        assert_eq!(info.status, AgentStatus::Idle);
    }

    #[test]
    fn test_pause_keeps_running_jobs_and_resume_restores_active() {
        let mut info = make_agent(0);
        info.add_running_job(running_job(&info));
        assert!(info.pause());
        assert!(!info.pause());
        assert_eq!(info.status, AgentStatus::Paused);
        assert!(!info.is_accepting());
        assert_eq!(info.current_build_jobs, 1);

        assert!(info.resume(ResumeKind::Operator));
        assert_eq!(info.status, AgentStatus::Active);
    }

    #[test]
    fn test_recent_jobs_are_bounded() {
        let mut info = make_agent(0);
        for _ in 0..5 {
            let job = running_job(&info);
            info.add_running_job(job.clone());
            info.record_completion(&job.finished(BuildStatus::Successful, Utc::now()), Utc::now());
        }
        assert_eq!(info.recent_build_jobs.len(), 3);
    }
}
