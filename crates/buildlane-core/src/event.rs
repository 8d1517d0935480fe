//! Agent state-transition events.
//!
//! Written to an outbox by whoever performs the transition and consumed by a
//! separate notifier, so notification delivery never affects scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::BuildAgent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentEvent {
    /// The agent paused itself after `consecutive_failures` failed builds.
    SelfPaused {
        agent: BuildAgent,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    },
    /// An operator resumed the agent.
    Resumed { agent: BuildAgent, at: DateTime<Utc> },
}

impl AgentEvent {
    pub fn agent(&self) -> &BuildAgent {
        match self {
            AgentEvent::SelfPaused { agent, .. } | AgentEvent::Resumed { agent, .. } => agent,
        }
    }
}
