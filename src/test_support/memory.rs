//! In-memory collaborators that mirror the Postgres stores closely enough
//! for queue, pipeline and gateway tests to run without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::audit::{AuditError, AuditLogEntry, AuditSink};
use crate::import::config::FetchLimits;
use crate::import::content::{ContentStore, ContentStoreError, CreateOutcome};
use crate::import::fetch::{FetchError, FileFetcher};
use crate::import::validate::NewContentPost;
use crate::jobs::store::{Finish, JobBackend, JobStoreError};
use crate::jobs::{Job, JobId, JobState, Lease};

/// [`JobBackend`] over a mutex-guarded map, applying the same conditional
/// updates as the SQL statements in `PgJobBackend`.
#[derive(Default)]
pub struct MemoryJobBackend {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryJobBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_lease<T>(&self, lease: &Lease, apply: impl FnOnce(&mut Job) -> Option<T>) -> Option<T> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&lease.job_id)?;
        if job.holds_lease(lease) {
            apply(job)
        } else {
            None
        }
    }
}

#[rocket::async_trait]
impl JobBackend for MemoryJobBackend {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn fetch(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn claim_next(
        &self,
        lease_id: Uuid,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.lock();
        let candidate = jobs
            .values_mut()
            .filter(|job| {
                job.state == JobState::Queued
                    && job.available_at <= now
                    && job.attempts < job.max_attempts
                    && (job.lease_id.is_none() || job.lease_expired(now))
            })
            .min_by(|a, b| {
                a.available_at
                    .cmp(&b.available_at)
                    .then(a.created_at.cmp(&b.created_at))
            });

        Ok(candidate.map(|job| {
            job.lease_id = Some(lease_id);
            job.lease_expires_at = Some(lease_expires_at);
            job.clone()
        }))
    }

    async fn activate(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        Ok(self.with_lease(lease, |job| {
            if job.state != JobState::Queued || job.attempts >= job.max_attempts {
                return None;
            }
            job.state = JobState::Active;
            job.attempts += 1;
            job.started_at.get_or_insert(now);
            job.lease_expires_at = Some(lease.expires_at);
            Some(job.clone())
        }))
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<bool, JobStoreError> {
        Ok(self
            .with_lease(lease, |job| {
                if job.state.is_terminal() {
                    return None;
                }
                job.lease_expires_at = Some(lease.expires_at);
                Some(())
            })
            .is_some())
    }

    async fn release_lease(&self, lease: &Lease) -> Result<bool, JobStoreError> {
        Ok(self
            .with_lease(lease, |job| {
                if job.state != JobState::Queued {
                    return None;
                }
                job.lease_id = None;
                job.lease_expires_at = None;
                Some(())
            })
            .is_some())
    }

    async fn requeue(
        &self,
        lease: &Lease,
        retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, JobStoreError> {
        Ok(self
            .with_lease(lease, |job| {
                if job.state != JobState::Active {
                    return None;
                }
                job.state = JobState::Queued;
                job.available_at = retry_at;
                job.last_error = Some(last_error.to_string());
                job.lease_id = None;
                job.lease_expires_at = None;
                Some(())
            })
            .is_some())
    }

    async fn finish(
        &self,
        lease: &Lease,
        outcome: Finish<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        Ok(self.with_lease(lease, |job| {
            if job.state != JobState::Active {
                return None;
            }
            job.state = outcome.state;
            job.result = Some(outcome.result.clone());
            if let Some(error) = outcome.last_error {
                job.last_error = Some(error.to_string());
            }
            job.finished_at = Some(now);
            job.lease_id = None;
            job.lease_expires_at = None;
            Some(job.clone())
        }))
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut expired: Vec<Job> = self
            .jobs
            .lock()
            .values()
            .filter(|job| !job.state.is_terminal() && job.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|job| job.lease_expires_at);
        expired.truncate(limit);
        Ok(expired)
    }
}

#[derive(Debug, Clone)]
pub struct StoredPost {
    pub id: Uuid,
    pub post: NewContentPost,
    pub source_job: JobId,
}

/// [`ContentStore`] keyed on the row key, like the unique index in Postgres.
#[derive(Default)]
pub struct MemoryContentStore {
    posts: Mutex<HashMap<String, StoredPost>>,
    unavailable: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.posts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn posts(&self) -> Vec<StoredPost> {
        self.posts.lock().values().cloned().collect()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[rocket::async_trait]
impl ContentStore for MemoryContentStore {
    async fn create(
        &self,
        post: &NewContentPost,
        row_key: &str,
        source_job: JobId,
    ) -> Result<CreateOutcome, ContentStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ContentStoreError::Unavailable("connection refused".into()));
        }

        let mut posts = self.posts.lock();
        if let Some(existing) = posts.get(row_key) {
            return Ok(CreateOutcome::AlreadyImported(existing.id));
        }

        let id = Uuid::new_v4();
        posts.insert(
            row_key.to_string(),
            StoredPost {
                id,
                post: post.clone(),
                source_job,
            },
        );
        Ok(CreateOutcome::Created(id))
    }
}

/// [`AuditSink`] that keeps entries in insertion order.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditLogEntry>>,
    unavailable: AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[rocket::async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("audit log offline".into()));
        }
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        Ok(self.entries.lock().iter().rev().take(limit).cloned().collect())
    }
}

/// [`FileFetcher`] serving a fixed body. It can fail, panic or stall on demand.
pub struct StaticFetcher {
    body: Vec<u8>,
    error: Option<FetchError>,
    fail_remaining: AtomicUsize,
    panic_remaining: AtomicUsize,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            error: None,
            fail_remaining: AtomicUsize::new(0),
            panic_remaining: AtomicUsize::new(0),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails every call with `error`.
    pub fn failing(error: FetchError) -> Self {
        Self::new(Vec::new()).fail_first(usize::MAX, error)
    }

    pub fn fail_first(mut self, times: usize, error: FetchError) -> Self {
        self.error = Some(error);
        self.fail_remaining = AtomicUsize::new(times);
        self
    }

    /// Panics on the first `times` calls, as a crashing import would.
    pub fn panic_first(mut self, times: usize) -> Self {
        self.panic_remaining = AtomicUsize::new(times);
        self
    }

    /// Sleeps before answering, to keep a job in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[rocket::async_trait]
impl FileFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str, limits: FetchLimits) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let panicking = self
            .panic_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if panicking {
            panic!("import file handler crashed");
        }

        if let Some(error) = &self.error {
            let failing = self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(error.clone());
            }
        }

        if self.body.len() as u64 > limits.max_bytes {
            return Err(FetchError::TooLarge {
                limit: limits.max_bytes,
            });
        }
        Ok(self.body.clone())
    }
}
