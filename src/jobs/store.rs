//! Durable job queue with visibility leases and bounded retries.
//!
//! [`JobQueue`] owns every state-transition decision (retry vs. terminal
//! failure, idempotent no-ops, lease checks). Backends only apply conditional
//! updates, so the Postgres store and the in-memory test store behave the same.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rocket_db_pools::sqlx;
use thiserror::Error;
use uuid::Uuid;

use super::config::QueueConfig;
use super::model::{
    ClaimedJob, Disposition, ImportPayload, Job, JobFailure, JobId, JobKind, JobResult, JobState,
    Lease,
};

/// Upper bound on expired leases handled in one recovery sweep.
const RECOVERY_BATCH: usize = 100;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job queue unavailable: {0}")]
    QueueUnavailable(String),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("lease on job {0} is no longer held")]
    LeaseLost(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: &'static str,
        to: &'static str,
    },
    #[error("stored job is corrupt: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl JobStoreError {
    /// True when the store itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, JobStoreError::QueueUnavailable(_))
    }
}

impl From<sqlx::Error> for JobStoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => JobStoreError::QueueUnavailable(err.to_string()),
            _ => JobStoreError::Database(err),
        }
    }
}

/// Terminal write applied by [`JobBackend::finish`].
#[derive(Debug, Clone, Copy)]
pub struct Finish<'a> {
    pub state: JobState,
    pub result: &'a JobResult,
    pub last_error: Option<&'a str>,
}

/// Storage primitives behind [`JobQueue`].
///
/// Every mutating call is conditional on the lease it is given and returns
/// `None`/`false` when that lease is no longer current.
#[rocket::async_trait]
pub trait JobBackend: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    async fn fetch(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Lease the oldest queued job that is due, unleased and under its attempt limit.
    async fn claim_next(
        &self,
        lease_id: Uuid,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `Queued -> Active` for the lease holder; bumps `attempts`.
    async fn activate(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    async fn renew_lease(&self, lease: &Lease) -> Result<bool, JobStoreError>;

    /// Drop a lease on a job that never became active.
    async fn release_lease(&self, lease: &Lease) -> Result<bool, JobStoreError>;

    /// `Active -> Queued` with a new `available_at`.
    async fn requeue(
        &self,
        lease: &Lease,
        retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, JobStoreError>;

    async fn finish(
        &self,
        lease: &Lease,
        outcome: Finish<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueueState {
    Open,
    Disabled(String),
    Closed,
}

/// The single source of truth for import jobs.
pub struct JobQueue {
    backend: Option<Arc<dyn JobBackend>>,
    state: RwLock<QueueState>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn open(backend: Arc<dyn JobBackend>, config: QueueConfig) -> Self {
        Self {
            backend: Some(backend),
            state: RwLock::new(QueueState::Open),
            config,
        }
    }

    /// A queue that refuses all work. Used when infrastructure is switched off.
    pub fn disabled(reason: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            backend: None,
            state: RwLock::new(QueueState::Disabled(reason.into())),
            config,
        }
    }

    /// Open the queue unless the configuration switches it off.
    pub fn from_config(backend: Arc<dyn JobBackend>, config: QueueConfig) -> Self {
        if config.enabled {
            Self::open(backend, config)
        } else {
            Self::disabled("import queue disabled by IMPORT_QUEUE_ENABLED", config)
        }
    }

    pub fn close(&self) {
        let mut state = self.state.write();
        if *state == QueueState::Open {
            log::info!("import queue closed");
            *state = QueueState::Closed;
        }
    }

    pub fn is_available(&self) -> bool {
        *self.state.read() == QueueState::Open && self.backend.is_some()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn backend(&self) -> Result<&Arc<dyn JobBackend>, JobStoreError> {
        match &*self.state.read() {
            QueueState::Open => {}
            QueueState::Disabled(reason) => {
                return Err(JobStoreError::QueueUnavailable(reason.clone()));
            }
            QueueState::Closed => {
                return Err(JobStoreError::QueueUnavailable("import queue is closed".into()));
            }
        }

        self.backend
            .as_ref()
            .ok_or_else(|| JobStoreError::QueueUnavailable("no queue backend configured".into()))
    }

    /// Record a new job and return its freshly issued id.
    pub async fn enqueue(&self, kind: JobKind, payload: ImportPayload) -> Result<JobId, JobStoreError> {
        let backend = self.backend()?;
        let job = Job::new(kind, payload, self.config.max_attempts, Utc::now());
        backend.insert(&job).await?;

        log::info!(
            "job {}: enqueued {} for '{}'",
            job.id,
            kind.as_str(),
            job.payload.file_name
        );
        Ok(job.id)
    }

    /// Lease the next due job, if any. Never blocks waiting for work.
    pub async fn dequeue(&self) -> Result<Option<ClaimedJob>, JobStoreError> {
        let backend = self.backend()?;
        let now = Utc::now();
        let lease_id = Uuid::new_v4();
        let expires_at = now + to_chrono(self.config.lease_timeout);

        let claimed = backend.claim_next(lease_id, now, expires_at).await?;
        Ok(claimed.map(|job| ClaimedJob {
            lease: Lease {
                job_id: job.id,
                lease_id,
                expires_at,
            },
            job,
        }))
    }

    pub async fn mark_active(&self, lease: &Lease) -> Result<Job, JobStoreError> {
        let backend = self.backend()?;
        let job = self.require(backend, lease.job_id).await?;

        match job.state {
            JobState::Active if job.holds_lease(lease) => Ok(job),
            JobState::Queued if job.holds_lease(lease) => backend
                .activate(lease, Utc::now())
                .await?
                .ok_or(JobStoreError::LeaseLost(lease.job_id)),
            JobState::Completed | JobState::Failed => Err(JobStoreError::InvalidTransition {
                id: job.id,
                from: job.state.as_str(),
                to: JobState::Active.as_str(),
            }),
            _ => Err(JobStoreError::LeaseLost(lease.job_id)),
        }
    }

    /// Push the lease deadline out for a worker that is still making progress.
    pub async fn heartbeat(&self, lease: &Lease) -> Result<Lease, JobStoreError> {
        let backend = self.backend()?;
        let renewed = Lease {
            expires_at: Utc::now() + to_chrono(self.config.lease_timeout),
            ..*lease
        };

        if backend.renew_lease(&renewed).await? {
            Ok(renewed)
        } else {
            Err(JobStoreError::LeaseLost(lease.job_id))
        }
    }

    /// Finish an active job. `Ok(None)` means the job was already completed and
    /// nothing changed, so the caller must not report the outcome again.
    pub async fn mark_completed(
        &self,
        lease: &Lease,
        result: JobResult,
    ) -> Result<Option<Job>, JobStoreError> {
        let backend = self.backend()?;
        let job = self.require(backend, lease.job_id).await?;

        match job.state {
            JobState::Completed => Ok(None),
            JobState::Failed => Err(JobStoreError::InvalidTransition {
                id: job.id,
                from: job.state.as_str(),
                to: JobState::Completed.as_str(),
            }),
            JobState::Active if job.holds_lease(lease) => {
                let outcome = Finish {
                    state: JobState::Completed,
                    result: &result,
                    last_error: None,
                };
                backend
                    .finish(lease, outcome, Utc::now())
                    .await?
                    .map(Some)
                    .ok_or(JobStoreError::LeaseLost(lease.job_id))
            }
            _ => Err(JobStoreError::LeaseLost(lease.job_id)),
        }
    }

    /// Report a failed attempt. Retryable failures are re-queued with backoff
    /// until the attempt limit; everything else becomes terminally `Failed`.
    pub async fn mark_failed(
        &self,
        lease: &Lease,
        failure: JobFailure,
    ) -> Result<Disposition, JobStoreError> {
        let backend = self.backend()?;
        let job = self.require(backend, lease.job_id).await?;

        match job.state {
            JobState::Failed => Ok(Disposition::AlreadyFailed(job.id)),
            JobState::Completed => Err(JobStoreError::InvalidTransition {
                id: job.id,
                from: job.state.as_str(),
                to: JobState::Failed.as_str(),
            }),
            JobState::Active if job.holds_lease(lease) => {
                self.settle_failure(backend, &job, lease, failure, Utc::now())
                    .await
            }
            _ => Err(JobStoreError::LeaseLost(lease.job_id)),
        }
    }

    /// Return abandoned work to the queue. An active job whose lease expired
    /// counts as a failed attempt; jobs that exhaust their attempts are
    /// returned so the caller can report them.
    pub async fn recover_expired_leases(&self) -> Result<Vec<Disposition>, JobStoreError> {
        let backend = self.backend()?;
        let now = Utc::now();
        let expired = backend.expired_leases(now, RECOVERY_BATCH).await?;
        let mut settled = Vec::new();

        for job in expired {
            let (Some(lease_id), Some(expires_at)) = (job.lease_id, job.lease_expires_at) else {
                continue;
            };
            let lease = Lease {
                job_id: job.id,
                lease_id,
                expires_at,
            };

            match job.state {
                JobState::Queued => {
                    if backend.release_lease(&lease).await? {
                        log::info!("job {}: released lease that was never activated", job.id);
                    }
                }
                JobState::Active => {
                    let failure = JobFailure::transient(
                        "import worker stopped responding",
                        format!("lease {} expired at {}", lease_id, expires_at),
                    );
                    match self.settle_failure(backend, &job, &lease, failure, now).await {
                        Ok(disposition) => settled.push(disposition),
                        Err(JobStoreError::LeaseLost(id)) => {
                            log::debug!("job {}: lease settled concurrently", id);
                        }
                        Err(err) => return Err(err),
                    }
                }
                JobState::Completed | JobState::Failed => {}
            }
        }

        Ok(settled)
    }

    pub async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let backend = self.backend()?;
        self.require(backend, id).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.backend()?.list_recent(limit).await
    }

    async fn require(&self, backend: &Arc<dyn JobBackend>, id: JobId) -> Result<Job, JobStoreError> {
        backend.fetch(id).await?.ok_or(JobStoreError::NotFound(id))
    }

    async fn settle_failure(
        &self,
        backend: &Arc<dyn JobBackend>,
        job: &Job,
        lease: &Lease,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Disposition, JobStoreError> {
        if failure.retryable && job.attempts < job.max_attempts {
            let retry_at = now + to_chrono(self.config.backoff_delay(job.attempts));
            if !backend.requeue(lease, retry_at, &failure.detail).await? {
                return Err(JobStoreError::LeaseLost(job.id));
            }

            log::warn!(
                "job {}: attempt {}/{} failed, retrying at {}: {}",
                job.id,
                job.attempts,
                job.max_attempts,
                retry_at,
                failure.detail
            );
            return Ok(Disposition::Retrying {
                job_id: job.id,
                attempt: job.attempts,
                retry_at,
            });
        }

        let detail = failure.detail.clone();
        let result = failure.into_result(job.attempts);
        let outcome = Finish {
            state: JobState::Failed,
            result: &result,
            last_error: Some(&detail),
        };

        let failed = backend
            .finish(lease, outcome, now)
            .await?
            .ok_or(JobStoreError::LeaseLost(job.id))?;

        log::error!(
            "job {}: failed permanently after {} attempt(s): {}",
            failed.id,
            failed.attempts,
            detail
        );
        Ok(Disposition::Failed(failed))
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::hours(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryJobBackend;

    fn payload() -> ImportPayload {
        ImportPayload {
            file_url: "https://uploads.example.com/prompts.csv".into(),
            file_name: "prompts.csv".into(),
            delimiter: ",".into(),
            skip_empty_lines: true,
            max_rows: 5000,
            submitted_by: "admin-1".into(),
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            backoff_base: Duration::ZERO,
            ..QueueConfig::default()
        }
    }

    fn queue() -> JobQueue {
        JobQueue::open(Arc::new(MemoryJobBackend::new()), config())
    }

    async fn claim_active(queue: &JobQueue) -> ClaimedJob {
        let claimed = queue.dequeue().await.expect("dequeue").expect("job available");
        queue.mark_active(&claimed.lease).await.expect("mark active");
        claimed
    }

    #[tokio::test]
    async fn enqueue_issues_distinct_ids() {
        let queue = queue();
        let first = queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");
        let second = queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");
        assert_ne!(first, second);
        assert_eq!(queue.list(10).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn disabled_queue_fails_fast() {
        let queue = JobQueue::disabled("maintenance", config());
        let err = queue
            .enqueue(JobKind::ProcessCsv, payload())
            .await
            .expect_err("disabled queue must reject");
        assert!(err.is_unavailable());
        assert!(!queue.is_available());
    }

    #[tokio::test]
    async fn closed_queue_rejects_work() {
        let queue = queue();
        queue.close();
        let err = queue.dequeue().await.expect_err("closed queue must reject");
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn leased_job_is_invisible_to_other_workers() {
        let queue = queue();
        queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");

        let first = queue.dequeue().await.expect("dequeue");
        let second = queue.dequeue().await.expect("dequeue");
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn mark_active_increments_attempts_once() {
        let queue = queue();
        queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");
        let claimed = queue.dequeue().await.expect("dequeue").expect("job");

        let active = queue.mark_active(&claimed.lease).await.expect("activate");
        let again = queue.mark_active(&claimed.lease).await.expect("idempotent");
        assert_eq!(active.state, JobState::Active);
        assert_eq!(active.attempts, 1);
        assert_eq!(again.attempts, 1);
        assert!(active.started_at.is_some());
    }

    #[tokio::test]
    async fn completion_sets_result_and_repeat_is_a_no_op() {
        let queue = queue();
        queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");
        let claimed = claim_active(&queue).await;

        let result = JobResult {
            files_processed: 1,
            posts_created: 4,
            status_messages: vec![],
            error: None,
        };
        let done = queue
            .mark_completed(&claimed.lease, result.clone())
            .await
            .expect("complete")
            .expect("transition applied");
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.result, Some(result.clone()));
        assert!(done.finished_at.is_some());
        assert!(done.lease_id.is_none());

        let again = queue
            .mark_completed(&claimed.lease, result)
            .await
            .expect("second completion is a no-op");
        assert!(again.is_none());
        assert_eq!(queue.get(done.id).await.expect("get").finished_at, done.finished_at);

        let err = queue
            .mark_failed(&claimed.lease, JobFailure::fatal("x", "y"))
            .await
            .expect_err("completed jobs cannot fail");
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_attempts_exhausted() {
        let queue = queue();
        let id = queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");

        for attempt in 1..=2 {
            let claimed = claim_active(&queue).await;
            let disposition = queue
                .mark_failed(&claimed.lease, JobFailure::transient("fetch failed", "timeout"))
                .await
                .expect("mark failed");
            match disposition {
                Disposition::Retrying { attempt: a, .. } => assert_eq!(a, attempt),
                other => panic!("expected retry, got {other:?}"),
            }
            let job = queue.get(id).await.expect("get");
            assert_eq!(job.state, JobState::Queued);
            assert!(job.result.is_none());
            assert_eq!(job.last_error.as_deref(), Some("timeout"));
        }

        let claimed = claim_active(&queue).await;
        let disposition = queue
            .mark_failed(&claimed.lease, JobFailure::transient("fetch failed", "timeout"))
            .await
            .expect("mark failed");
        let Disposition::Failed(job) = disposition else {
            panic!("expected terminal failure");
        };
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(
            job.result.and_then(|r| r.error).as_deref(),
            Some("fetch failed (gave up after 3 attempts)")
        );

        assert!(queue.dequeue().await.expect("dequeue").is_none());
    }

    #[tokio::test]
    async fn fatal_failure_skips_retries() {
        let queue = queue();
        queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");
        let claimed = claim_active(&queue).await;

        let disposition = queue
            .mark_failed(&claimed.lease, JobFailure::fatal("too many rows", "5001 > 5000"))
            .await
            .expect("mark failed");
        let Disposition::Failed(job) = disposition else {
            panic!("fatal failures are terminal");
        };
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result.and_then(|r| r.error).as_deref(), Some("too many rows"));
    }

    #[tokio::test]
    async fn backoff_delays_next_dequeue() {
        let queue = JobQueue::open(
            Arc::new(MemoryJobBackend::new()),
            QueueConfig {
                backoff_base: Duration::from_secs(60),
                ..QueueConfig::default()
            },
        );
        queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");
        let claimed = claim_active(&queue).await;

        let disposition = queue
            .mark_failed(&claimed.lease, JobFailure::transient("fetch failed", "503"))
            .await
            .expect("mark failed");
        let Disposition::Retrying { retry_at, .. } = disposition else {
            panic!("expected retry");
        };
        assert!(retry_at > Utc::now() + chrono::Duration::seconds(100));
        assert!(queue.dequeue().await.expect("dequeue").is_none());
    }

    #[tokio::test]
    async fn stale_lease_cannot_complete() {
        let queue = queue();
        queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");
        let claimed = claim_active(&queue).await;

        let forged = Lease {
            lease_id: Uuid::new_v4(),
            ..claimed.lease
        };
        let err = queue
            .mark_completed(&forged, JobResult::default())
            .await
            .expect_err("foreign lease must be rejected");
        assert!(matches!(err, JobStoreError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn expired_active_lease_counts_as_failed_attempt() {
        let queue = JobQueue::open(
            Arc::new(MemoryJobBackend::new()),
            QueueConfig {
                backoff_base: Duration::ZERO,
                lease_timeout: Duration::from_millis(1),
                max_attempts: 2,
                ..QueueConfig::default()
            },
        );
        let id = queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");

        claim_active(&queue).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let settled = queue.recover_expired_leases().await.expect("recover");
        assert!(matches!(settled.as_slice(), [Disposition::Retrying { .. }]));
        assert_eq!(queue.get(id).await.expect("get").state, JobState::Queued);

        claim_active(&queue).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let settled = queue.recover_expired_leases().await.expect("recover");
        let [Disposition::Failed(job)] = settled.as_slice() else {
            panic!("second expiry should exhaust attempts");
        };
        assert_eq!(job.attempts, 2);
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn reaped_job_ignores_late_failure_from_original_worker() {
        let queue = JobQueue::open(
            Arc::new(MemoryJobBackend::new()),
            QueueConfig {
                lease_timeout: Duration::from_millis(1),
                max_attempts: 1,
                ..QueueConfig::default()
            },
        );
        queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");
        let claimed = claim_active(&queue).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let settled = queue.recover_expired_leases().await.expect("recover");
        assert!(matches!(settled.as_slice(), [Disposition::Failed(_)]));

        let late = queue
            .mark_failed(&claimed.lease, JobFailure::transient("fetch failed", "late"))
            .await
            .expect("late failure is a no-op");
        assert!(matches!(late, Disposition::AlreadyFailed(_)));
        let job = queue.get(claimed.job.id).await.expect("get");
        assert_eq!(job.state, JobState::Failed);
        assert_ne!(job.last_error.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn expired_unactivated_lease_is_released_without_consuming_attempt() {
        let queue = JobQueue::open(
            Arc::new(MemoryJobBackend::new()),
            QueueConfig {
                lease_timeout: Duration::from_millis(1),
                ..QueueConfig::default()
            },
        );
        let id = queue.enqueue(JobKind::ProcessCsv, payload()).await.expect("enqueue");
        queue.dequeue().await.expect("dequeue").expect("job");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let settled = queue.recover_expired_leases().await.expect("recover");
        assert!(settled.is_empty());

        let job = queue.get(id).await.expect("get");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.lease_id.is_none());
    }
}
