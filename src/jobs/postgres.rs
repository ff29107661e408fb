use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, PgPool, types::Json};
use uuid::Uuid;

use super::model::{ImportPayload, Job, JobId, JobKind, JobResult, JobState, Lease};
use super::store::{Finish, JobBackend, JobStoreError};

const JOB_COLUMNS: &str = "id, kind, payload, state, attempts, max_attempts, result, last_error, \
     available_at, lease_id, lease_expires_at, created_at, started_at, finished_at";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: JobKind,
    payload: Json<ImportPayload>,
    state: JobState,
    attempts: i32,
    max_attempts: i32,
    result: Option<Json<JobResult>>,
    last_error: Option<String>,
    available_at: DateTime<Utc>,
    lease_id: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| JobStoreError::Corrupt(format!("job {} has negative attempts", row.id)))?;
        let max_attempts = u32::try_from(row.max_attempts).map_err(|_| {
            JobStoreError::Corrupt(format!("job {} has negative max_attempts", row.id))
        })?;

        Ok(Job {
            id: row.id,
            kind: row.kind,
            payload: row.payload.0,
            state: row.state,
            attempts,
            max_attempts,
            result: row.result.map(|json| json.0),
            last_error: row.last_error,
            available_at: row.available_at,
            lease_id: row.lease_id,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Postgres-backed job storage on the `import_jobs` table.
#[derive(Clone)]
pub struct PgJobBackend {
    pool: PgPool,
}

impl PgJobBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[rocket::async_trait]
impl JobBackend for PgJobBackend {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"INSERT INTO import_jobs
                   (id, kind, payload, state, attempts, max_attempts, available_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(job.id)
        .bind(job.kind)
        .bind(Json(&job.payload))
        .bind(job.state)
        .bind(to_i32(job.attempts))
        .bind(to_i32(job.max_attempts))
        .bind(job.available_at)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM import_jobs ORDER BY created_at DESC LIMIT $1");
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Claim atomically (SELECT FOR UPDATE SKIP LOCKED)
    async fn claim_next(
        &self,
        lease_id: Uuid,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self.pool.begin().await?;

        let candidate: Option<(Uuid,)> = sqlx::query_as(
            r#"SELECT id FROM import_jobs
               WHERE state = 'queued'
                 AND available_at <= $1
                 AND attempts < max_attempts
                 AND (lease_id IS NULL OR lease_expires_at <= $1)
               ORDER BY available_at ASC, created_at ASC
               LIMIT 1
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let sql = format!(
            "UPDATE import_jobs SET lease_id = $2, lease_expires_at = $3 \
             WHERE id = $1 RETURNING {JOB_COLUMNS}"
        );
        let row: JobRow = sqlx::query_as(&sql)
            .bind(id)
            .bind(lease_id)
            .bind(lease_expires_at)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Job::try_from(row).map(Some)
    }

    async fn activate(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            "UPDATE import_jobs
                SET state = 'active',
                    attempts = attempts + 1,
                    started_at = COALESCE(started_at, $3),
                    lease_expires_at = $4
              WHERE id = $1 AND lease_id = $2 AND state = 'queued' AND attempts < max_attempts
              RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(lease.job_id)
            .bind(lease.lease_id)
            .bind(now)
            .bind(lease.expires_at)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<bool, JobStoreError> {
        let updated = sqlx::query(
            r#"UPDATE import_jobs SET lease_expires_at = $3
               WHERE id = $1 AND lease_id = $2 AND state IN ('queued', 'active')"#,
        )
        .bind(lease.job_id)
        .bind(lease.lease_id)
        .bind(lease.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn release_lease(&self, lease: &Lease) -> Result<bool, JobStoreError> {
        let updated = sqlx::query(
            r#"UPDATE import_jobs SET lease_id = NULL, lease_expires_at = NULL
               WHERE id = $1 AND lease_id = $2 AND state = 'queued'"#,
        )
        .bind(lease.job_id)
        .bind(lease.lease_id)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn requeue(
        &self,
        lease: &Lease,
        retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, JobStoreError> {
        let updated = sqlx::query(
            r#"UPDATE import_jobs
                  SET state = 'queued',
                      available_at = $3,
                      last_error = $4,
                      lease_id = NULL,
                      lease_expires_at = NULL
                WHERE id = $1 AND lease_id = $2 AND state = 'active'"#,
        )
        .bind(lease.job_id)
        .bind(lease.lease_id)
        .bind(retry_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn finish(
        &self,
        lease: &Lease,
        outcome: Finish<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            "UPDATE import_jobs
                SET state = $3,
                    result = $4,
                    last_error = COALESCE($5, last_error),
                    finished_at = $6,
                    lease_id = NULL,
                    lease_expires_at = NULL
              WHERE id = $1 AND lease_id = $2 AND state = 'active'
              RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(lease.job_id)
            .bind(lease.lease_id)
            .bind(outcome.state)
            .bind(Json(outcome.result))
            .bind(outcome.last_error)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs
              WHERE lease_id IS NOT NULL
                AND lease_expires_at <= $1
                AND state IN ('queued', 'active')
              ORDER BY lease_expires_at ASC
              LIMIT $2"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }
}
