//! Historical build job records.

use async_trait::async_trait;
use buildlane_core::{BuildJob, BuildStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{DbError, DbResult};

/// A job that reached a terminal status, as stored in `build_jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FinishedBuildJob {
    pub id: uuid::Uuid,
    pub name: String,
    pub status: String,
    pub participation_id: i64,
    pub course_id: i64,
    pub exercise_id: i64,
    pub repository_name: String,
    pub commit_hash: Option<String>,
    pub retry_count: i32,
    pub priority: i32,
    pub submission_date: DateTime<Utc>,
    pub build_start_date: Option<DateTime<Utc>>,
    pub build_completion_date: Option<DateTime<Utc>>,
    pub agent_address: Option<String>,
    pub agent_name: Option<String>,
}

impl FinishedBuildJob {
    pub fn from_job(job: &BuildJob) -> Self {
        Self {
            id: *job.id.as_uuid(),
            name: job.name.clone(),
            status: job.status.as_str().to_string(),
            participation_id: job.participation_id,
            course_id: job.course_id,
            exercise_id: job.exercise_id,
            repository_name: job.repository_info.repository_name.clone(),
            commit_hash: job.repository_info.commit_hash.clone(),
            retry_count: job.retry_count as i32,
            priority: job.priority,
            submission_date: job.timing.submission_date,
            build_start_date: job.timing.build_start_date,
            build_completion_date: job.timing.build_completion_date,
            agent_address: job.agent.as_ref().map(|a| a.member_address.clone()),
            agent_name: job.agent.as_ref().map(|a| a.short_name.clone()),
        }
    }

    pub fn status(&self) -> buildlane_core::Result<BuildStatus> {
        self.status.parse()
    }

    /// Build duration in whole seconds.
    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.build_start_date, self.build_completion_date) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

/// Filter for finished job listings. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinishedJobFilter {
    pub course_id: Option<i64>,
    pub status: Option<BuildStatus>,
    pub agent_address: Option<String>,
    /// Lower bound on submission date.
    pub start_date: Option<DateTime<Utc>>,
    /// Upper bound on submission date.
    pub end_date: Option<DateTime<Utc>>,
    pub min_duration_secs: Option<i64>,
    pub max_duration_secs: Option<i64>,
    /// Case-insensitive substring of name, repository, commit or agent.
    pub search_term: Option<String>,
}

impl FinishedJobFilter {
    pub fn matches(&self, job: &FinishedBuildJob) -> bool {
        if self.course_id.is_some_and(|c| c != job.course_id) {
            return false;
        }
        if self.status.is_some_and(|s| s.as_str() != job.status) {
            return false;
        }
        if let Some(address) = &self.agent_address {
            if job.agent_address.as_deref() != Some(address.as_str()) {
                return false;
            }
        }
        if self.start_date.is_some_and(|d| job.submission_date < d) {
            return false;
        }
        if self.end_date.is_some_and(|d| job.submission_date > d) {
            return false;
        }
        if self.min_duration_secs.is_some() || self.max_duration_secs.is_some() {
            let Some(duration) = job.duration_seconds() else {
                return false;
            };
            if self.min_duration_secs.is_some_and(|min| duration < min) {
                return false;
            }
            if self.max_duration_secs.is_some_and(|max| duration > max) {
                return false;
            }
        }
        if let Some(term) = self.search_term.as_deref().filter(|t| !t.is_empty()) {
            let term = term.to_lowercase();
            let hit = [
                Some(job.name.as_str()),
                Some(job.repository_name.as_str()),
                job.commit_hash.as_deref(),
                job.agent_name.as_deref(),
            ]
            .into_iter()
            .flatten()
            .any(|field| field.to_lowercase().contains(&term));
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Zero-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub size: u32,
}

impl Page {
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    pub fn offset(&self) -> i64 {
        self.page as i64 * self.size as i64
    }

    pub fn limit(&self) -> i64 {
        self.size as i64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 0, size: 50 }
    }
}

/// Aggregate counts over finished jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildJobStatistics {
    pub total: i64,
    pub successful: i64,
    /// FAILED, ERROR, TIMEOUT and MISSING.
    pub failed: i64,
    pub cancelled: i64,
}

impl BuildJobStatistics {
    pub fn count(&mut self, status: BuildStatus) {
        self.total += 1;
        match status {
            BuildStatus::Successful => self.successful += 1,
            BuildStatus::Failed
            | BuildStatus::Error
            | BuildStatus::Timeout
            | BuildStatus::Missing => self.failed += 1,
            BuildStatus::Cancelled => self.cancelled += 1,
            BuildStatus::Queued | BuildStatus::Building => {}
        }
    }
}

#[async_trait]
pub trait BuildJobRepo: Send + Sync {
    /// Store a finished job. Saving the same id twice is a `Duplicate` error.
    async fn save(&self, record: FinishedBuildJob) -> DbResult<()>;

    /// Finished jobs matching `filter`, newest submission first.
    async fn list_finished(
        &self,
        filter: &FinishedJobFilter,
        page: Page,
    ) -> DbResult<Vec<FinishedBuildJob>>;

    async fn statistics(&self, course_id: Option<i64>) -> DbResult<BuildJobStatistics>;

    /// Mean duration in seconds of successful builds of an exercise.
    async fn average_build_duration(&self, exercise_id: i64) -> DbResult<Option<i64>>;
}

/// PostgreSQL implementation of BuildJobRepo.
pub struct PgBuildJobRepo {
    pool: PgPool,
}

impl PgBuildJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildJobRepo for PgBuildJobRepo {
    async fn save(&self, record: FinishedBuildJob) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO build_jobs (
                id, name, status, participation_id, course_id, exercise_id,
                repository_name, commit_hash, retry_count, priority, submission_date,
                build_start_date, build_completion_date, agent_address, agent_name
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.status)
        .bind(record.participation_id)
        .bind(record.course_id)
        .bind(record.exercise_id)
        .bind(&record.repository_name)
        .bind(&record.commit_hash)
        .bind(record.retry_count)
        .bind(record.priority)
        .bind(record.submission_date)
        .bind(record.build_start_date)
        .bind(record.build_completion_date)
        .bind(&record.agent_address)
        .bind(&record.agent_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::Duplicate(format!("build job {}", record.id)));
        }
        Ok(())
    }

    async fn list_finished(
        &self,
        filter: &FinishedJobFilter,
        page: Page,
    ) -> DbResult<Vec<FinishedBuildJob>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM build_jobs WHERE TRUE");

        if let Some(course_id) = filter.course_id {
            query.push(" AND course_id = ").push_bind(course_id);
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(address) = &filter.agent_address {
            query.push(" AND agent_address = ").push_bind(address.clone());
        }
        if let Some(start) = filter.start_date {
            query.push(" AND submission_date >= ").push_bind(start);
        }
        if let Some(end) = filter.end_date {
            query.push(" AND submission_date <= ").push_bind(end);
        }
        if let Some(min) = filter.min_duration_secs {
            query
                .push(" AND EXTRACT(EPOCH FROM (build_completion_date - build_start_date)) >= ")
                .push_bind(min as f64);
        }
        if let Some(max) = filter.max_duration_secs {
            query
                .push(" AND EXTRACT(EPOCH FROM (build_completion_date - build_start_date)) <= ")
                .push_bind(max as f64);
        }
        if let Some(term) = filter.search_term.as_deref().filter(|t| !t.is_empty()) {
            let pattern = substring_pattern(term);
            query.push(" AND (");
            for (i, column) in ["name", "repository_name", "commit_hash", "agent_name"]
                .into_iter()
                .enumerate()
            {
                if i > 0 {
                    query.push(" OR ");
                }
                query
                    .push(column)
                    .push(" ILIKE ")
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\'");
            }
            query.push(")");
        }

        query
            .push(" ORDER BY submission_date DESC, id DESC OFFSET ")
            .push_bind(page.offset())
            .push(" LIMIT ")
            .push_bind(page.limit());

        let records = query
            .build_query_as::<FinishedBuildJob>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn statistics(&self, course_id: Option<i64>) -> DbResult<BuildJobStatistics> {
        let stats = sqlx::query_as::<_, BuildJobStatistics>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'SUCCESSFUL') AS successful,
                COUNT(*) FILTER (WHERE status IN ('FAILED', 'ERROR', 'TIMEOUT', 'MISSING')) AS failed,
                COUNT(*) FILTER (WHERE status = 'CANCELLED') AS cancelled
            FROM build_jobs
            WHERE $1::BIGINT IS NULL OR course_id = $1
            "#,
        )
        .bind(course_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn average_build_duration(&self, exercise_id: i64) -> DbResult<Option<i64>> {
        let average = sqlx::query_scalar::<_, Option<i64>>(
            r#"
            SELECT AVG(EXTRACT(EPOCH FROM (build_completion_date - build_start_date)))::BIGINT
            FROM build_jobs
            WHERE exercise_id = $1
              AND status = 'SUCCESSFUL'
              AND build_start_date IS NOT NULL
              AND build_completion_date IS NOT NULL
            "#,
        )
        .bind(exercise_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(average)
    }
}

/// `LIKE` pattern matching `term` anywhere, with its wildcards taken literally.
fn substring_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}
