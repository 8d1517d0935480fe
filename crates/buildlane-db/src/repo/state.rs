//! PostgreSQL-backed cluster state store.
//!
//! Records are stored as JSONB payloads. Conditional writes compare the
//! stored payload against the caller's snapshot, and claiming uses
//! `FOR UPDATE SKIP LOCKED` so concurrent agents never take the same job.

use async_trait::async_trait;
use buildlane_core::{BuildAgent, BuildAgentInformation, BuildJob, JobId, Result, StateStore};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use std::time::Duration;
use tracing::debug;

use crate::error::store_err;

/// Upper bound of a single sleep while waiting for queue changes.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn enqueue(&self, job: BuildJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_job_queue (id, priority, submission_date, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.priority)
        .bind(job.timing.submission_date)
        .bind(Json(&job))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn peek_all(&self) -> Result<Vec<BuildJob>> {
        let rows = sqlx::query_scalar::<_, Json<BuildJob>>(
            "SELECT payload FROM build_job_queue ORDER BY priority ASC, submission_date ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(|Json(job)| job).collect())
    }

    async fn remove_queued(&self, id: JobId) -> Result<Option<BuildJob>> {
        let row = sqlx::query_scalar::<_, Json<BuildJob>>(
            "DELETE FROM build_job_queue WHERE id = $1 RETURNING payload",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|Json(job)| job))
    }

    async fn claim_next(&self, agent: &BuildAgent, now: DateTime<Utc>) -> Result<Option<BuildJob>> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let row = sqlx::query_scalar::<_, Json<BuildJob>>(
            r#"
            DELETE FROM build_job_queue
            WHERE id = (
                SELECT id FROM build_job_queue
                ORDER BY priority ASC, submission_date ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING payload
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let Some(Json(queued)) = row else {
            tx.rollback().await.map_err(store_err)?;
            return Ok(None);
        };

        let claimed = queued.claimed_by(agent.clone(), now);
        sqlx::query("INSERT INTO processing_jobs (id, agent_address, payload) VALUES ($1, $2, $3)")
            .bind(claimed.id.as_uuid())
            .bind(&agent.member_address)
            .bind(Json(&claimed))
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        debug!(job_id = %claimed.id, agent = %agent.member_address, "Claimed job");
        Ok(Some(claimed))
    }

    async fn wait_for_queue(&self, timeout: Duration) {
        tokio::time::sleep(timeout.min(QUEUE_POLL_INTERVAL)).await;
    }

    async fn processing_jobs(&self) -> Result<Vec<BuildJob>> {
        let rows = sqlx::query_scalar::<_, Json<BuildJob>>("SELECT payload FROM processing_jobs")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(|Json(job)| job).collect())
    }

    async fn get_processing(&self, id: JobId) -> Result<Option<BuildJob>> {
        let row = sqlx::query_scalar::<_, Json<BuildJob>>(
            "SELECT payload FROM processing_jobs WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|Json(job)| job))
    }

    async fn put_processing(&self, job: BuildJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_jobs (id, agent_address, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET agent_address = EXCLUDED.agent_address, payload = EXCLUDED.payload
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.agent_address())
        .bind(Json(&job))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn put_processing_if_absent(&self, job: BuildJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processing_jobs (id, agent_address, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.agent_address())
        .bind(Json(&job))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_processing(&self, id: JobId) -> Result<Option<BuildJob>> {
        let row = sqlx::query_scalar::<_, Json<BuildJob>>(
            "DELETE FROM processing_jobs WHERE id = $1 RETURNING payload",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|Json(job)| job))
    }

    async fn remove_processing_if(&self, expected: &BuildJob) -> Result<bool> {
        let result = sqlx::query("DELETE FROM processing_jobs WHERE id = $1 AND payload = $2")
            .bind(expected.id.as_uuid())
            .bind(Json(expected))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_processing_if(&self, expected: &BuildJob, new: BuildJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET agent_address = $3, payload = $4
            WHERE id = $1 AND payload = $2
            "#,
        )
        .bind(expected.id.as_uuid())
        .bind(Json(expected))
        .bind(new.agent_address())
        .bind(Json(&new))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn agents(&self) -> Result<Vec<BuildAgentInformation>> {
        let rows = sqlx::query_scalar::<_, Json<BuildAgentInformation>>(
            "SELECT payload FROM build_agent_information ORDER BY member_address",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(|Json(info)| info).collect())
    }

    async fn get_agent(&self, member_address: &str) -> Result<Option<BuildAgentInformation>> {
        let row = sqlx::query_scalar::<_, Json<BuildAgentInformation>>(
            "SELECT payload FROM build_agent_information WHERE member_address = $1",
        )
        .bind(member_address)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|Json(info)| info))
    }

    async fn put_agent(&self, info: BuildAgentInformation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_agent_information (member_address, payload, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (member_address) DO UPDATE
            SET payload = EXCLUDED.payload, updated_at = NOW()
            "#,
        )
        .bind(&info.agent.member_address)
        .bind(Json(&info))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn put_agent_if_absent(&self, info: BuildAgentInformation) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO build_agent_information (member_address, payload, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (member_address) DO NOTHING
            "#,
        )
        .bind(&info.agent.member_address)
        .bind(Json(&info))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_agent(&self, member_address: &str) -> Result<Option<BuildAgentInformation>> {
        let row = sqlx::query_scalar::<_, Json<BuildAgentInformation>>(
            "DELETE FROM build_agent_information WHERE member_address = $1 RETURNING payload",
        )
        .bind(member_address)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|Json(info)| info))
    }

    async fn replace_agent_if(
        &self,
        expected: &BuildAgentInformation,
        new: BuildAgentInformation,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE build_agent_information
            SET payload = $3, updated_at = NOW()
            WHERE member_address = $1 AND payload = $2
            "#,
        )
        .bind(&expected.agent.member_address)
        .bind(Json(expected))
        .bind(Json(&new))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn request_cancellation(&self, id: JobId) -> Result<()> {
        sqlx::query(
            "INSERT INTO build_job_cancellations (job_id) VALUES ($1) ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn cancellation_requests(&self) -> Result<Vec<JobId>> {
        let ids = sqlx::query_scalar::<_, uuid::Uuid>(
            "SELECT job_id FROM build_job_cancellations ORDER BY requested_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }

    async fn clear_cancellation(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM build_job_cancellations WHERE job_id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildlane_core::{BuildConfig, BuildJobRequest, RepositoryInfo};

    async fn store() -> PgStateStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = crate::create_pool(&url, 5).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        for table in [
            "build_job_queue",
            "processing_jobs",
            "build_agent_information",
            "build_job_cancellations",
        ] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&pool)
                .await
                .unwrap();
        }
        PgStateStore::new(pool)
    }

    fn job(priority: i32) -> BuildJob {
        let request = BuildJobRequest {
            name: format!("job-p{}", priority),
            participation_id: 1,
            course_id: 1,
            exercise_id: 1,
            priority,
            repository_info: RepositoryInfo {
                repository_name: "repo".to_string(),
                repository_uri: "https://git.example.com/repo.git".to_string(),
                test_repository_uri: None,
                commit_hash: None,
                branch: "main".to_string(),
                triggered_by_push_to: None,
            },
            build_config: BuildConfig {
                docker_image: "alpine:3".to_string(),
                build_script: "true".to_string(),
                timeout_seconds: 10,
                docker_run_config: Default::default(),
            },
        };
        BuildJob::queued(request, 10, Utc::now())
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (DATABASE_URL)"]
    async fn test_claim_respects_priority() {
        let store = store().await;
        let agent = BuildAgent::new("builder-1", "10.0.0.1", "Builder 1");
        let normal = job(2);
        let exam = job(1);
        store.enqueue(normal.clone()).await.unwrap();
        store.enqueue(exam.clone()).await.unwrap();

        let claimed = store.claim_next(&agent, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, exam.id);
        assert!(store.get_processing(exam.id).await.unwrap().is_some());
        assert_eq!(store.peek_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (DATABASE_URL)"]
    async fn test_conditional_remove_compares_payload() {
        let store = store().await;
        let agent = BuildAgent::new("builder-1", "10.0.0.1", "Builder 1");
        store.enqueue(job(2)).await.unwrap();
        let claimed = store.claim_next(&agent, Utc::now()).await.unwrap().unwrap();

        let mut stale = claimed.clone();
        stale.retry_count += 1;
        assert!(!store.remove_processing_if(&stale).await.unwrap());
        assert!(store.remove_processing_if(&claimed).await.unwrap());
        assert!(!store.remove_processing_if(&claimed).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (DATABASE_URL)"]
    async fn test_agent_compare_and_swap() {
        let store = store().await;
        let agent = BuildAgent::new("builder-1", "10.0.0.1", "Builder 1");
        let info = BuildAgentInformation::new(agent, 2, 3, 20, Utc::now());
        assert!(store.put_agent_if_absent(info.clone()).await.unwrap());
        assert!(!store.put_agent_if_absent(info.clone()).await.unwrap());

        let mut paused = info.clone();
        paused.pause();
        assert!(store.replace_agent_if(&info, paused.clone()).await.unwrap());
        assert!(!store.replace_agent_if(&info, paused).await.unwrap());
    }
}
