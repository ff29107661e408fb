use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "import_job_kind")]
pub enum JobKind {
    #[serde(rename = "process-csv")]
    #[sqlx(rename = "process-csv")]
    ProcessCsv,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProcessCsv => "process-csv",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "import_job_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Parsing options and provenance for a single bulk import.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportPayload {
    pub file_url: String,
    pub file_name: String,
    pub delimiter: String,
    pub skip_empty_lines: bool,
    pub max_rows: u32,
    pub submitted_by: String,
}

/// Outcome recorded on a job once it reaches a terminal state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub files_processed: u32,
    pub posts_created: u32,
    pub status_messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: ImportPayload,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<JobResult>,
    /// Internal detail of the most recent failure; never shown to submitters.
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub lease_id: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(kind: JobKind, payload: ImportPayload, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            result: None,
            last_error: None,
            available_at: now,
            lease_id: None,
            lease_expires_at: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn holds_lease(&self, lease: &Lease) -> bool {
        self.id == lease.job_id && self.lease_id == Some(lease.lease_id)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.lease_id, self.lease_expires_at) {
            (Some(_), Some(expires_at)) => expires_at <= now,
            _ => false,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        }
    }
}

/// Visibility lease granted to the worker that dequeued a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub lease_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub lease: Lease,
}

/// Failure report handed to the store when an attempt does not complete.
#[derive(Debug, Clone, Default)]
pub struct JobFailure {
    /// Opaque message safe to show to the submitter.
    pub summary: String,
    /// Full detail kept for logs and the audit trail.
    pub detail: String,
    pub retryable: bool,
    pub files_processed: u32,
    pub posts_created: u32,
    pub status_messages: Vec<String>,
}

impl JobFailure {
    pub fn transient(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            detail: detail.into(),
            retryable: true,
            ..Self::default()
        }
    }

    pub fn fatal(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            detail: detail.into(),
            retryable: false,
            ..Self::default()
        }
    }

    pub(crate) fn into_result(self, attempts: u32) -> JobResult {
        let error = if self.retryable {
            format!("{} (gave up after {} attempts)", self.summary, attempts)
        } else {
            self.summary
        };

        JobResult {
            files_processed: self.files_processed,
            posts_created: self.posts_created,
            status_messages: self.status_messages,
            error: Some(error),
        }
    }
}

/// What happened to a job after a failed attempt was reported.
#[derive(Debug, Clone)]
pub enum Disposition {
    Retrying {
        job_id: JobId,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    Failed(Job),
    /// The job was already `Failed`; nothing was written.
    AlreadyFailed(JobId),
}

/// Public status view of a job, keyed by id and polled by submitters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: String,
    pub kind: JobKind,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub file_name: String,
    pub submitted_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        let next_attempt_at = (job.state == JobState::Queued && job.attempts > 0)
            .then_some(job.available_at);

        Self {
            id: job.id.to_string(),
            kind: job.kind,
            state: job.state,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            file_name: job.payload.file_name.clone(),
            submitted_by: job.payload.submitted_by.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            next_attempt_at,
            result: job.result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn kind_serializes_as_process_csv() {
        let json = serde_json::to_string(&JobKind::ProcessCsv).expect("serialize kind");
        assert_eq!(json, "\"process-csv\"");
    }

    #[test]
    fn new_jobs_start_queued_without_result() {
        let job = Job::new(JobKind::ProcessCsv, payload(), 3, Utc::now());
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.result.is_none());
        assert_eq!(job.available_at, job.created_at);
    }

    #[test]
    fn exhausted_transient_failure_reports_attempt_count() {
        let failure = JobFailure::transient("could not fetch the import file", "connection refused");
        let result = failure.into_result(3);
        assert_eq!(
            result.error.as_deref(),
            Some("could not fetch the import file (gave up after 3 attempts)")
        );
    }

    #[test]
    fn status_view_hides_internal_error_detail() {
        let mut job = Job::new(JobKind::ProcessCsv, payload(), 3, Utc::now());
        job.state = JobState::Failed;
        job.last_error = Some("tcp connect error: 10.0.0.7:443".into());
        job.result = Some(JobFailure::fatal("file could not be parsed", "bad utf-8").into_result(1));

        let view = JobStatusView::from(&job);
        let json = serde_json::to_string(&view).expect("serialize view");
        assert!(!json.contains("10.0.0.7"));
        assert!(json.contains("file could not be parsed"));
    }
}
