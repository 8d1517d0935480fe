//! Build job records.
//!
//! A [`BuildJob`] is the unit of work moved between the shared queue and the
//! processing map. Its payload ([`RepositoryInfo`], [`BuildConfig`]) is fixed
//! once the job is enqueued; only status, agent and timing change while the
//! job is owned by the scheduler.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::agent::BuildAgent;
use crate::{Error, JobId, Result};

/// Builds of a running exam. Dispatched before everything else.
pub const PRIORITY_EXAM_CONDUCTION: i32 = 1;
/// Regular exercise builds.
pub const PRIORITY_NORMAL: i32 = 2;
/// Practice builds of exercises past their due date.
pub const PRIORITY_OPTIONAL_EXERCISE: i32 = 3;

/// Lifecycle status of a build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Queued,
    Building,
    Successful,
    Failed,
    Error,
    Timeout,
    Missing,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Queued | BuildStatus::Building)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildStatus::Successful)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "QUEUED",
            BuildStatus::Building => "BUILDING",
            BuildStatus::Successful => "SUCCESSFUL",
            BuildStatus::Failed => "FAILED",
            BuildStatus::Error => "ERROR",
            BuildStatus::Timeout => "TIMEOUT",
            BuildStatus::Missing => "MISSING",
            BuildStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(BuildStatus::Queued),
            "BUILDING" => Ok(BuildStatus::Building),
            "SUCCESSFUL" => Ok(BuildStatus::Successful),
            "FAILED" => Ok(BuildStatus::Failed),
            "ERROR" => Ok(BuildStatus::Error),
            "TIMEOUT" => Ok(BuildStatus::Timeout),
            "MISSING" => Ok(BuildStatus::Missing),
            "CANCELLED" => Ok(BuildStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown build status: {}", other))),
        }
    }
}

/// Where the sources of a build come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    /// Name of the repository that was pushed to.
    pub repository_name: String,
    /// Clone URI of the assignment/submission repository.
    pub repository_uri: String,
    /// Clone URI of the test repository, if the exercise has one.
    pub test_repository_uri: Option<String>,
    /// Commit to build.
    pub commit_hash: Option<String>,
    /// Branch to build.
    pub branch: String,
    /// Which repository the triggering push went to (e.g. "user", "tests").
    pub triggered_by_push_to: Option<String>,
}

/// Container settings of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerRunConfig {
    /// Run the build without network access.
    pub network_disabled: bool,
    /// Extra environment, each entry `KEY=VALUE`.
    pub env: Vec<String>,
    /// CPU limit, 0 means unlimited.
    pub cpu_count: u32,
    /// Memory limit in MB, 0 means unlimited.
    pub memory_mb: u64,
    /// Memory + swap limit in MB, 0 means unlimited.
    pub memory_swap_mb: u64,
}

/// How a job is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Container image to run the build script in.
    pub docker_image: String,
    /// Shell script executed inside the container.
    pub build_script: String,
    /// Wall-clock limit enforced by the executor.
    pub timeout_seconds: u64,
    #[serde(default)]
    pub docker_run_config: DockerRunConfig,
}

static IMAGE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?::[0-9]+)?(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*(?::[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?(?:@sha256:[a-f0-9]{64})?$",
    )
    .expect("image reference pattern is valid")
});

static ENV_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("env entry pattern is valid")
});

impl BuildConfig {
    /// Reject configurations that can never produce a runnable container.
    pub fn validate(&self) -> Result<()> {
        if self.docker_image.trim().is_empty() {
            return Err(Error::InvalidInput("docker image must not be empty".to_string()));
        }
        if !IMAGE_REFERENCE.is_match(&self.docker_image) {
            return Err(Error::InvalidInput(format!(
                "malformed docker image reference: {}",
                self.docker_image
            )));
        }
        if self.build_script.trim().is_empty() {
            return Err(Error::InvalidInput("build script must not be empty".to_string()));
        }
        if self.timeout_seconds == 0 {
            return Err(Error::InvalidInput(
                "build timeout must be greater than zero".to_string(),
            ));
        }

        let run = &self.docker_run_config;
        if let Some(entry) = run.env.iter().find(|e| !ENV_ENTRY.is_match(e)) {
            return Err(Error::InvalidInput(format!(
                "environment entry must have the form KEY=VALUE: {}",
                entry
            )));
        }
        if run.memory_mb > 0 && run.memory_swap_mb > 0 && run.memory_swap_mb < run.memory_mb {
            return Err(Error::InvalidInput(format!(
                "memory swap limit ({} MB) must not be lower than memory limit ({} MB)",
                run.memory_swap_mb, run.memory_mb
            )));
        }
        Ok(())
    }
}

/// Timestamps of a build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimingInfo {
    pub submission_date: DateTime<Utc>,
    pub build_start_date: Option<DateTime<Utc>>,
    pub build_completion_date: Option<DateTime<Utc>>,
    /// Advisory, recomputed on read.
    pub estimated_completion_date: Option<DateTime<Utc>>,
    /// Expected build duration in seconds.
    pub estimated_duration: i64,
}

impl JobTimingInfo {
    pub fn submitted_at(now: DateTime<Utc>, estimated_duration: i64) -> Self {
        Self {
            submission_date: now,
            build_start_date: None,
            build_completion_date: None,
            estimated_completion_date: None,
            estimated_duration: estimated_duration.max(0),
        }
    }

    /// Wall-clock build duration, once both ends are known.
    pub fn build_duration(&self) -> Option<Duration> {
        match (self.build_start_date, self.build_completion_date) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// A request to build, as produced by the push collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJobRequest {
    pub name: String,
    pub participation_id: i64,
    pub course_id: i64,
    pub exercise_id: i64,
    pub priority: i32,
    pub repository_info: RepositoryInfo,
    pub build_config: BuildConfig,
}

/// One unit of build work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: JobId,
    pub name: String,
    /// Owning agent, set on dispatch.
    pub agent: Option<BuildAgent>,
    pub participation_id: i64,
    pub course_id: i64,
    pub exercise_id: i64,
    pub priority: i32,
    pub status: BuildStatus,
    pub repository_info: RepositoryInfo,
    pub build_config: BuildConfig,
    pub timing: JobTimingInfo,
    pub retry_count: u32,
}

impl BuildJob {
    /// Create a fresh QUEUED job from a request.
    pub fn queued(request: BuildJobRequest, estimated_duration: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            name: request.name,
            agent: None,
            participation_id: request.participation_id,
            course_id: request.course_id,
            exercise_id: request.exercise_id,
            priority: request.priority,
            status: BuildStatus::Queued,
            repository_info: request.repository_info,
            build_config: request.build_config,
            timing: JobTimingInfo::submitted_at(now, estimated_duration),
            retry_count: 0,
        }
    }

    /// The job as owned by `agent`, building since `now`.
    pub fn claimed_by(&self, agent: BuildAgent, now: DateTime<Utc>) -> Self {
        let mut job = self.clone();
        job.agent = Some(agent);
        job.status = BuildStatus::Building;
        job.timing.build_start_date = Some(now);
        job.timing.estimated_completion_date =
            Some(now + Duration::seconds(job.timing.estimated_duration));
        job
    }

    /// The job finalized with a terminal `status`.
    pub fn finished(&self, status: BuildStatus, now: DateTime<Utc>) -> Self {
        debug_assert!(status.is_terminal());
        let mut job = self.clone();
        job.status = status;
        if job.timing.build_completion_date.is_none() {
            job.timing.build_completion_date = Some(now);
        }
        job
    }

    /// The job as it was before being claimed: same id, QUEUED, no agent.
    pub fn requeued(&self) -> Self {
        let mut job = self.clone();
        job.agent = None;
        job.status = BuildStatus::Queued;
        job.timing.build_start_date = None;
        job.timing.estimated_completion_date = None;
        job
    }

    /// A new QUEUED record carrying the same payload, for a retry.
    ///
    /// The submission date is kept so the retry does not lose its place in
    /// the queue to jobs submitted after the original.
    pub fn retried(&self) -> Self {
        Self {
            id: JobId::new(),
            name: self.name.clone(),
            agent: None,
            participation_id: self.participation_id,
            course_id: self.course_id,
            exercise_id: self.exercise_id,
            priority: self.priority,
            status: BuildStatus::Queued,
            repository_info: self.repository_info.clone(),
            build_config: self.build_config.clone(),
            timing: JobTimingInfo::submitted_at(
                self.timing.submission_date,
                self.timing.estimated_duration,
            ),
            retry_count: self.retry_count + 1,
        }
    }

    /// Address of the owning agent, if dispatched.
    pub fn agent_address(&self) -> Option<&str> {
        self.agent.as_ref().map(|a| a.member_address.as_str())
    }

    /// Dispatch order: priority, then submission date, then id.
    pub fn dispatch_order(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.timing.submission_date.cmp(&other.timing.submission_date))
            .then(self.id.cmp(&other.id))
    }

    /// QUEUED for longer than `threshold`.
    pub fn is_stale_queued(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.status == BuildStatus::Queued && now - self.timing.submission_date > threshold
    }

    /// BUILDING for longer than `threshold`.
    pub fn is_stale_building(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.status == BuildStatus::Building
            && self
                .timing
                .build_start_date
                .is_some_and(|start| now - start > threshold)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn make_request(priority: i32) -> BuildJobRequest {
        BuildJobRequest {
            name: "participation-42".to_string(),
            participation_id: 42,
            course_id: 7,
            exercise_id: 3,
            priority,
            repository_info: RepositoryInfo {
                repository_name: "exercise-42".to_string(),
                repository_uri: "https://git.example.org/exercise-42.git".to_string(),
                test_repository_uri: None,
                commit_hash: Some("abc123".to_string()),
                branch: "main".to_string(),
                triggered_by_push_to: Some("user".to_string()),
            },
            build_config: BuildConfig {
                docker_image: "ghcr.io/example/java-builder:21".to_string(),
                build_script: "./gradlew test".to_string(),
                timeout_seconds: 120,
                docker_run_config: DockerRunConfig::default(),
            },
        }
    }

    #[test]
    fn test_dispatch_order_prefers_priority_over_age() {
        let now = Utc::now();
        let normal = BuildJob::queued(make_request(PRIORITY_NORMAL), 30, now);
        let exam = BuildJob::queued(
            make_request(PRIORITY_EXAM_CONDUCTION),
            30,
            now + Duration::seconds(1),
        );
        assert_eq!(exam.dispatch_order(&normal), Ordering::Less);
    }

    #[test]
    fn test_dispatch_order_is_fifo_within_priority() {
        let now = Utc::now();
        let first = BuildJob::queued(make_request(PRIORITY_NORMAL), 30, now);
        let second = BuildJob::queued(
            make_request(PRIORITY_NORMAL),
            30,
            now + Duration::seconds(1),
        );
        assert_eq!(first.dispatch_order(&second), Ordering::Less);
    }

    #[test]
    fn test_retry_gets_fresh_id_and_incremented_count() {
        let now = Utc::now();
        let job = BuildJob::queued(make_request(PRIORITY_NORMAL), 30, now)
            .claimed_by(BuildAgent::new("agent-1", "10.0.0.1:5701", "Agent 1"), now);
        let retry = job.retried();
        assert_ne!(retry.id, job.id);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.agent, None);
        assert_eq!(retry.timing.submission_date, job.timing.submission_date);
        assert_eq!(retry.timing.build_start_date, None);
        assert_eq!(retry.status, BuildStatus::Queued);
        assert_eq!(retry.build_config, job.build_config);
    }

    #[test]
    fn test_requeued_restores_queued_job() {
        let now = Utc::now();
        let job = BuildJob::queued(make_request(PRIORITY_NORMAL), 30, now);
        let agent = BuildAgent::new("agent-1", "10.0.0.1:5701", "Agent 1");
        let claimed = job.claimed_by(agent, now + Duration::seconds(5));
        assert_eq!(claimed.requeued(), job);
    }

    #[test]
    fn test_finished_sets_completion_once() {
        let now = Utc::now();
        let job = BuildJob::queued(make_request(PRIORITY_NORMAL), 30, now);
        let done = job.finished(BuildStatus::Failed, now);
        let again = done.finished(BuildStatus::Failed, now + Duration::seconds(10));
        assert_eq!(again.timing.build_completion_date, Some(now));
    }

    #[test]
    fn test_stale_building_uses_start_date() {
        let now = Utc::now();
        let agent = BuildAgent::new("agent-1", "10.0.0.1:5701", "Agent 1");
        let job = BuildJob::queued(make_request(PRIORITY_NORMAL), 30, now)
            .claimed_by(agent, now - Duration::minutes(6));
        assert!(job.is_stale_building(Duration::minutes(5), now));
        assert!(!job.is_stale_queued(Duration::minutes(5), now));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [BuildStatus::Successful, BuildStatus::Missing, BuildStatus::Cancelled] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("nope".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_validate_accepts_registry_image_with_tag() {
        assert!(make_request(PRIORITY_NORMAL).build_config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut config = make_request(PRIORITY_NORMAL).build_config;
        config.docker_image = "Not An Image".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));

        let mut config = make_request(PRIORITY_NORMAL).build_config;
        config.docker_run_config.env = vec!["NO_EQUALS_SIGN".to_string()];
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));

        let mut config = make_request(PRIORITY_NORMAL).build_config;
        config.docker_run_config.memory_mb = 1024;
        config.docker_run_config.memory_swap_mb = 512;
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));

        let mut config = make_request(PRIORITY_NORMAL).build_config;
        config.timeout_seconds = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }
}
