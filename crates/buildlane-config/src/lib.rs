//! KDL configuration parsing for buildlane agent hosts.
//!
//! This crate handles parsing of:
//! - Agent identity and capacity
//! - Scheduler timings (dispatch polling, stale-job sweeping, retries)
//! - Executor limits, database and logging settings

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    AgentConfig, DatabaseConfig, ExecutorConfig, LoggingConfig, SchedulerConfig, SystemConfig,
    load_system_config, parse_system_config,
};
