//! Build-job scheduling for buildlane.
//!
//! Every agent process runs a [`DispatchLoop`] feeding a bounded
//! [`ExecutionPool`], and a [`Sweeper`] reclaiming lost jobs. All of them
//! share state through a [`buildlane_core::StateStore`]; the
//! [`SchedulerControl`] surface works on that same state from anywhere.

#[cfg(test)]
#[macro_use]
mod testing;

pub mod agent;
pub mod completion;
pub mod control;
pub mod dispatch;
pub mod estimate;
pub mod notify;
pub mod pool;
pub mod store;
pub mod sweeper;

pub use agent::{AgentLifecycle, AgentRegistry, AgentUpdate, update_agent};
pub use completion::JobCompletion;
pub use control::SchedulerControl;
pub use dispatch::DispatchLoop;
pub use estimate::with_estimates;
pub use notify::{AgentNotifier, LogNotifier, Outbox, run_notifier};
pub use pool::ExecutionPool;
pub use store::MemoryStateStore;
pub use sweeper::{SweepReport, Sweeper};
