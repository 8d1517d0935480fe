//! Estimated completion times for queued jobs.
//!
//! Advisory only. Assumes queued jobs start in dispatch order on whichever
//! eligible agent frees a slot first, and that running jobs take their
//! estimated duration.

use buildlane_core::{BuildAgentInformation, BuildJob};
use chrono::{DateTime, Duration, Utc};

/// Fill in `estimated_completion_date` for every job in `queued`.
///
/// `queued` must be in dispatch order. With no unpaused agent, estimates are
/// cleared.
pub fn with_estimates(
    mut queued: Vec<BuildJob>,
    agents: &[BuildAgentInformation],
    now: DateTime<Utc>,
) -> Vec<BuildJob> {
    let eligible: Vec<_> = agents.iter().filter(|a| !a.status.is_paused()).collect();
    let slots: i64 = eligible
        .iter()
        .map(|a| a.max_concurrent_build_jobs as i64)
        .sum();

    if slots == 0 {
        for job in &mut queued {
            job.timing.estimated_completion_date = None;
        }
        return queued;
    }

    let free_slots: usize = eligible
        .iter()
        .map(|a| a.max_concurrent_build_jobs.saturating_sub(a.current_build_jobs))
        .sum();
    let running_backlog: i64 = eligible
        .iter()
        .flat_map(|a| a.running_build_jobs.iter())
        .map(|job| remaining_seconds(job, now))
        .sum();

    let mut queued_ahead: i64 = 0;
    for (ahead, job) in queued.iter_mut().enumerate() {
        let start = if ahead < free_slots {
            now
        } else {
            now + Duration::seconds((running_backlog + queued_ahead) / slots)
        };
        job.timing.estimated_completion_date =
            Some(start + Duration::seconds(job.timing.estimated_duration));
        queued_ahead += job.timing.estimated_duration;
    }
    queued
}

/// Seconds a running job is still expected to take.
fn remaining_seconds(job: &BuildJob, now: DateTime<Utc>) -> i64 {
    let expected_end = job.timing.estimated_completion_date.or_else(|| {
        job.timing
            .build_start_date
            .map(|start| start + Duration::seconds(job.timing.estimated_duration))
    });
    expected_end.map_or(0, |end| (end - now).num_seconds().max(0))
}
