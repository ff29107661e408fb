use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::model::{ClaimedJob, Disposition, Job, JobFailure, JobId};
use super::store::{JobQueue, JobStoreError};
use crate::audit::{AuditSink, job_outcome, record_or_log};
use crate::import::ImportPipeline;

/// Pause after a queue error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// What one pass of a worker did with the job it claimed.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(Job),
    Retrying {
        job_id: JobId,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    Failed(Job),
    /// The lease was lost or the job was settled by someone else; this
    /// attempt's result was discarded.
    Abandoned(JobId),
}

impl From<Disposition> for JobOutcome {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Retrying {
                job_id,
                attempt,
                retry_at,
            } => JobOutcome::Retrying {
                job_id,
                attempt,
                retry_at,
            },
            Disposition::Failed(job) => JobOutcome::Failed(job),
            Disposition::AlreadyFailed(job_id) => JobOutcome::Abandoned(job_id),
        }
    }
}

/// Pulls jobs from the queue and drives them through the import pipeline.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    pipeline: ImportPipeline,
    audit: Arc<dyn AuditSink>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, pipeline: ImportPipeline, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            queue,
            pipeline,
            audit,
        }
    }

    /// Start the configured number of workers plus the lease reaper.
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let worker_count = self.queue.config().worker_count;
        log::info!("starting {} import workers", worker_count);

        let mut handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|worker| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(worker, shutdown).await })
            })
            .collect();

        let reaper = self.clone();
        handles.push(tokio::spawn(async move { reaper.reaper_loop(shutdown).await }));
        handles
    }

    async fn worker_loop(self, worker: usize, shutdown: CancellationToken) {
        log::info!("import worker {} started", worker);
        let poll_interval = self.queue.config().idle_poll_interval();

        while !shutdown.is_cancelled() {
            let pause = match self.run_once(worker).await {
                Ok(Some(_)) => continue,
                Ok(None) => poll_interval,
                Err(err) if err.is_unavailable() => {
                    log::warn!("worker {}: queue unavailable: {}", worker, err);
                    ERROR_BACKOFF
                }
                Err(err) => {
                    log::error!("worker {}: {}", worker, err);
                    poll_interval
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        log::info!("import worker {} stopped", worker);
    }

    async fn reaper_loop(self, shutdown: CancellationToken) {
        let interval = self.queue.config().reap_interval();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(err) = self.reap_once().await {
                log::warn!("lease reaper: {}", err);
            }
        }
    }

    /// Claim and process at most one job. `Ok(None)` means the queue was empty.
    pub async fn run_once(&self, worker: usize) -> Result<Option<JobOutcome>, JobStoreError> {
        let Some(claimed) = self.queue.dequeue().await? else {
            return Ok(None);
        };

        log::debug!("worker {}: claimed job {}", worker, claimed.job.id);
        self.execute(worker, claimed).await.map(Some)
    }

    /// Recover expired leases once, auditing jobs that ended up terminal.
    pub async fn reap_once(&self) -> Result<usize, JobStoreError> {
        let settled = self.queue.recover_expired_leases().await?;
        let recovered = settled.len();

        for disposition in settled {
            if let Disposition::Failed(job) = disposition {
                self.report(&job).await;
            }
        }

        if recovered > 0 {
            log::info!("lease reaper: recovered {} abandoned job(s)", recovered);
        }
        Ok(recovered)
    }

    async fn execute(&self, worker: usize, claimed: ClaimedJob) -> Result<JobOutcome, JobStoreError> {
        let mut lease = claimed.lease;
        let job = self.queue.mark_active(&lease).await?;
        log::info!(
            "job {}: attempt {}/{} started on worker {}",
            job.id,
            job.attempts,
            job.max_attempts,
            worker
        );

        let pipeline = self.pipeline.clone();
        let task_job = job.clone();
        let mut task = tokio::spawn(async move { pipeline.run(&task_job).await });

        let mut heartbeat = tokio::time::interval(self.queue.config().heartbeat_interval());
        heartbeat.tick().await;

        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = heartbeat.tick() => match self.queue.heartbeat(&lease).await {
                    Ok(renewed) => lease = renewed,
                    Err(JobStoreError::LeaseLost(_)) => {
                        log::warn!("job {}: lease lost mid-run, abandoning attempt", job.id);
                        task.abort();
                        return Ok(JobOutcome::Abandoned(job.id));
                    }
                    Err(err) => log::warn!("job {}: heartbeat failed: {}", job.id, err),
                },
            }
        };

        let settled = match joined {
            Ok(Ok(report)) => self
                .queue
                .mark_completed(&lease, report.into_result())
                .await
                .map(|completed| match completed {
                    Some(job) => JobOutcome::Completed(job),
                    None => JobOutcome::Abandoned(job.id),
                }),
            Ok(Err(failure)) => {
                log::warn!("job {}: attempt {} failed: {}", job.id, job.attempts, failure.error);
                self.queue
                    .mark_failed(&lease, failure.into_job_failure())
                    .await
                    .map(JobOutcome::from)
            }
            Err(join_err) => {
                log::error!("job {}: pipeline task crashed: {}", job.id, join_err);
                let failure = JobFailure::transient(
                    "import worker crashed",
                    format!("pipeline task failed: {join_err}"),
                );
                self.queue.mark_failed(&lease, failure).await.map(JobOutcome::from)
            }
        };

        // Only the holder that applied a terminal transition reports it.
        let outcome = match settled {
            Ok(outcome) => outcome,
            Err(JobStoreError::LeaseLost(_) | JobStoreError::InvalidTransition { .. }) => {
                JobOutcome::Abandoned(job.id)
            }
            Err(err) => return Err(err),
        };

        match &outcome {
            JobOutcome::Completed(job) => {
                log::info!(
                    "job {}: completed in {}ms",
                    job.id,
                    job.duration_ms().unwrap_or_default()
                );
                self.report(job).await;
            }
            JobOutcome::Failed(job) => self.report(job).await,
            JobOutcome::Abandoned(job_id) => {
                log::warn!("job {}: attempt settled elsewhere, result discarded", job_id);
            }
            JobOutcome::Retrying { .. } => {}
        }

        Ok(outcome)
    }

    async fn report(&self, job: &Job) {
        let limit = self.pipeline.config().audit_message_limit;
        if let Some(entry) = job_outcome(job, limit) {
            record_or_log(self.audit.as_ref(), entry).await;
        }
    }
}
