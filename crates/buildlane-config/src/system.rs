//! Agent host configuration parsing.
//!
//! One KDL file configures one agent-hosting process:
//!
//! ```kdl
//! agent "builder-1" {
//!     display-name "Builder 1"
//!     address "10.0.0.5:7700"
//!     max-concurrent-builds 4
//!     pause-after-consecutive-failures 5
//!     recent-build-jobs 20
//! }
//!
//! scheduler {
//!     poll-interval-secs 10
//!     queue-timeout-secs 3600
//!     missing-job-threshold-secs 300
//!     max-missing-job-retries 3
//!     sweep-interval-secs 60
//! }
//!
//! executor "docker" {
//!     max-cpu-count 4
//!     max-memory-mb 4096
//! }
//!
//! database url="postgres://buildlane@localhost/buildlane" max-connections=10
//! logging level="info" json=#false
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static SHORT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("short name pattern is valid"));

/// Complete configuration of an agent-hosting process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub agent: AgentConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    /// Without a database the process uses in-memory state (single node).
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
}

/// Identity and capacity of the local agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Lowercase letters, digits and hyphens only.
    pub short_name: String,
    pub display_name: String,
    /// Cluster map key of this agent.
    pub address: String,
    pub max_concurrent_builds: usize,
    /// 0 disables self-pause.
    pub pause_after_consecutive_failures: u32,
    pub recent_build_jobs: usize,
}

/// Timings and policies of dispatch and sweeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound of a single wait for queue changes.
    pub poll_interval: Duration,
    /// QUEUED longer than this counts as stale.
    pub queue_timeout: Duration,
    /// BUILDING longer than this counts as missing.
    pub missing_job_threshold: Duration,
    pub max_missing_job_retries: u32,
    pub sweep_interval: Duration,
    /// Used when no build history exists for an exercise.
    pub default_estimated_duration: Duration,
    /// How long shutdown waits for running builds before interrupting them.
    pub shutdown_grace_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(60 * 60),
            missing_job_threshold: Duration::from_secs(5 * 60),
            max_missing_job_retries: 3,
            sweep_interval: Duration::from_secs(60),
            default_estimated_duration: Duration::from_secs(60),
            shutdown_grace_period: Duration::from_secs(60),
        }
    }
}

/// Execution backend and the container limits it enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub executor_type: String,
    /// 0 means no cap.
    pub max_cpu_count: u32,
    /// 0 means no cap.
    pub max_memory_mb: u64,
    /// 0 means no cap.
    pub max_memory_swap_mb: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            executor_type: "docker".to_string(),
            max_cpu_count: 0,
            max_memory_mb: 0,
            max_memory_swap_mb: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut agent = None;
    let mut scheduler = None;
    let mut executor = None;
    let mut database = None;
    let mut logging = None;

    for node in doc.nodes() {
        match node.name().value() {
            "agent" => set_once(&mut agent, "agent", parse_agent(node)?)?,
            "scheduler" => set_once(&mut scheduler, "scheduler", parse_scheduler(node)?)?,
            "executor" => set_once(&mut executor, "executor", parse_executor(node)?)?,
            "database" => set_once(&mut database, "database", parse_database(node)?)?,
            "logging" => set_once(&mut logging, "logging", parse_logging(node))?,
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(SystemConfig {
        agent: agent.ok_or_else(|| ConfigError::MissingField("agent".to_string()))?,
        scheduler: scheduler.unwrap_or_default(),
        executor: executor.unwrap_or_default(),
        database,
        logging: logging.unwrap_or_default(),
    })
}

fn set_once<T>(slot: &mut Option<T>, name: &str, value: T) -> ConfigResult<()> {
    if slot.is_some() {
        return Err(ConfigError::Duplicate(name.to_string()));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_agent(node: &KdlNode) -> ConfigResult<AgentConfig> {
    let short_name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("agent short name".to_string()))?;

    if !SHORT_NAME.is_match(&short_name) {
        return Err(ConfigError::InvalidValue {
            field: "agent short name".to_string(),
            message: format!(
                "'{}' must only contain lowercase letters, numbers and hyphens",
                short_name
            ),
        });
    }

    let mut config = AgentConfig {
        display_name: short_name.clone(),
        address: short_name.clone(),
        short_name,
        max_concurrent_builds: 1,
        pause_after_consecutive_failures: 0,
        recent_build_jobs: 20,
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "display-name" => {
                    if let Some(name) = get_first_string_arg(child).filter(|n| !n.is_empty()) {
                        config.display_name = name;
                    }
                }
                "address" => {
                    config.address = get_first_string_arg(child)
                        .filter(|a| !a.is_empty())
                        .ok_or_else(|| ConfigError::MissingField("agent address".to_string()))?;
                }
                "max-concurrent-builds" => {
                    config.max_concurrent_builds = get_positive_int(child)? as usize;
                }
                "pause-after-consecutive-failures" => {
                    config.pause_after_consecutive_failures = get_non_negative_int(child)? as u32;
                }
                "recent-build-jobs" => {
                    config.recent_build_jobs = get_non_negative_int(child)? as usize;
                }
                _ => {}
            }
        }
    }

    Ok(config)
}

fn parse_scheduler(node: &KdlNode) -> ConfigResult<SchedulerConfig> {
    let mut config = SchedulerConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "poll-interval-secs" => config.poll_interval = get_seconds(child)?,
                "queue-timeout-secs" => config.queue_timeout = get_seconds(child)?,
                "missing-job-threshold-secs" => config.missing_job_threshold = get_seconds(child)?,
                "max-missing-job-retries" => {
                    config.max_missing_job_retries = get_non_negative_int(child)? as u32;
                }
                "sweep-interval-secs" => config.sweep_interval = get_seconds(child)?,
                "default-estimated-duration-secs" => {
                    config.default_estimated_duration = get_seconds(child)?;
                }
                "shutdown-grace-period-secs" => {
                    config.shutdown_grace_period =
                        Duration::from_secs(get_non_negative_int(child)? as u64);
                }
                _ => {}
            }
        }
    }

    Ok(config)
}

fn parse_executor(node: &KdlNode) -> ConfigResult<ExecutorConfig> {
    let mut config = ExecutorConfig::default();
    if let Some(executor_type) = get_first_string_arg(node) {
        if executor_type != "docker" {
            return Err(ConfigError::InvalidValue {
                field: "executor type".to_string(),
                message: format!("unknown executor type: {}", executor_type),
            });
        }
        config.executor_type = executor_type;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "max-cpu-count" => config.max_cpu_count = get_non_negative_int(child)? as u32,
                "max-memory-mb" => config.max_memory_mb = get_non_negative_int(child)? as u64,
                "max-memory-swap-mb" => {
                    config.max_memory_swap_mb = get_non_negative_int(child)? as u64;
                }
                _ => {}
            }
        }
    }

    Ok(config)
}

fn parse_database(node: &KdlNode) -> ConfigResult<DatabaseConfig> {
    let url = get_string_prop(node, "url")
        .or_else(|| get_first_string_arg(node))
        .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?;

    let max_connections = match node.get("max-connections").and_then(|v| v.as_integer()) {
        Some(n) if n > 0 && n <= u32::MAX as i128 => n as u32,
        Some(n) => {
            return Err(ConfigError::InvalidValue {
                field: "database max-connections".to_string(),
                message: format!("must be a positive integer, got {}", n),
            });
        }
        None => 10,
    };

    Ok(DatabaseConfig {
        url,
        max_connections,
    })
}

fn parse_logging(node: &KdlNode) -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: get_string_prop(node, "level").unwrap_or(defaults.level),
        json: get_bool_prop(node, "json").unwrap_or(defaults.json),
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_non_negative_int(node: &KdlNode) -> ConfigResult<i128> {
    let field = node.name().value();
    match get_first_int_arg(node) {
        Some(n) if (0..=u32::MAX as i128).contains(&n) => Ok(n),
        Some(n) => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("must be a non-negative integer, got {}", n),
        }),
        None => Err(ConfigError::MissingField(field.to_string())),
    }
}

fn get_positive_int(node: &KdlNode) -> ConfigResult<i128> {
    let n = get_non_negative_int(node)?;
    if n == 0 {
        return Err(ConfigError::InvalidValue {
            field: node.name().value().to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(n)
}

fn get_seconds(node: &KdlNode) -> ConfigResult<Duration> {
    Ok(Duration::from_secs(get_positive_int(node)? as u64))
}
