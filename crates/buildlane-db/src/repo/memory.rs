//! In-memory finished job repository, for single-node runs and tests.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::build_job::{
    BuildJobRepo, BuildJobStatistics, FinishedBuildJob, FinishedJobFilter, Page,
};
use crate::{DbError, DbResult};

#[derive(Default)]
pub struct MemoryBuildJobRepo {
    records: RwLock<Vec<FinishedBuildJob>>,
}

impl MemoryBuildJobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, in insertion order.
    pub async fn all(&self) -> Vec<FinishedBuildJob> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl BuildJobRepo for MemoryBuildJobRepo {
    async fn save(&self, record: FinishedBuildJob) -> DbResult<()> {
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(DbError::Duplicate(format!("build job {}", record.id)));
        }
        records.push(record);
        Ok(())
    }

    async fn list_finished(
        &self,
        filter: &FinishedJobFilter,
        page: Page,
    ) -> DbResult<Vec<FinishedBuildJob>> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records.iter().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| {
            b.submission_date
                .cmp(&a.submission_date)
                .then(b.id.cmp(&a.id))
        });
        Ok(matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect())
    }

    async fn statistics(&self, course_id: Option<i64>) -> DbResult<BuildJobStatistics> {
        let records = self.records.read().await;
        let mut stats = BuildJobStatistics::default();
        for record in records
            .iter()
            .filter(|r| course_id.is_none_or(|c| c == r.course_id))
        {
            // Unknown status strings only come from foreign writers; skip them.
            if let Ok(status) = record.status() {
                stats.count(status);
            }
        }
        Ok(stats)
    }

    async fn average_build_duration(&self, exercise_id: i64) -> DbResult<Option<i64>> {
        let records = self.records.read().await;
        let durations: Vec<i64> = records
            .iter()
            .filter(|r| r.exercise_id == exercise_id && r.status == "SUCCESSFUL")
            .filter_map(|r| r.duration_seconds())
            .collect();
        if durations.is_empty() {
            return Ok(None);
        }
        Ok(Some(durations.iter().sum::<i64>() / durations.len() as i64))
    }
}
