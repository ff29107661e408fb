use serde_json::json;

use super::models::{AuditAction, AuditLogEntry, EntityType, Severity};
use crate::jobs::{Job, JobState};

/// The single audit entry written when a job reaches a terminal state.
///
/// Returns `None` for jobs that are still queued or running.
pub fn job_outcome(job: &Job, message_limit: usize) -> Option<AuditLogEntry> {
    let (action, severity) = match job.state {
        JobState::Completed => (AuditAction::JobCompleted, Severity::Low),
        JobState::Failed => (AuditAction::JobFailed, Severity::Medium),
        JobState::Queued | JobState::Active => return None,
    };

    let result = job.result.clone().unwrap_or_default();
    let messages: Vec<&String> = result.status_messages.iter().take(message_limit).collect();

    let mut builder = AuditLogEntry::builder(action, EntityType::ImportJob, severity)
        .user(job.payload.submitted_by.clone())
        .entity(job.id)
        .meta("kind", job.kind.as_str())
        .meta("fileName", job.payload.file_name.clone())
        .meta("attempts", job.attempts)
        .meta("filesProcessed", result.files_processed)
        .meta("postsCreated", result.posts_created)
        .meta("statusMessages", json!(messages))
        .meta("statusMessageCount", result.status_messages.len());

    if let Some(duration_ms) = job.duration_ms() {
        builder = builder.meta("durationMs", duration_ms);
    }
    if let Some(error) = result.error {
        builder = builder.meta("error", error);
    }
    if job.state == JobState::Failed {
        if let Some(detail) = &job.last_error {
            builder = builder.meta("errorDetail", detail.clone());
        }
    }

    Some(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ImportPayload, JobFailure, JobKind, JobResult};
    use chrono::{Duration, Utc};

    fn job(state: JobState) -> Job {
        let mut job = Job::new(
            JobKind::ProcessCsv,
            ImportPayload {
                file_url: "https://uploads.example.com/a.csv".into(),
                file_name: "a.csv".into(),
                delimiter: ",".into(),
                skip_empty_lines: true,
                max_rows: 100,
                submitted_by: "admin-1".into(),
            },
            3,
            Utc::now(),
        );
        job.state = state;
        job.attempts = 1;
        job.started_at = Some(job.created_at);
        job.finished_at = Some(job.created_at + Duration::milliseconds(1500));
        job
    }

    #[test]
    fn unfinished_jobs_have_no_outcome() {
        assert!(job_outcome(&job(JobState::Queued), 20).is_none());
        assert!(job_outcome(&job(JobState::Active), 20).is_none());
    }

    #[test]
    fn completed_job_entry_truncates_messages() {
        let mut completed = job(JobState::Completed);
        completed.result = Some(JobResult {
            files_processed: 1,
            posts_created: 70,
            status_messages: (1..=30).map(|n| format!("Row {n}: bad")).collect(),
            error: None,
        });

        let entry = job_outcome(&completed, 20).expect("entry");
        assert_eq!(entry.action, "import.job_completed");
        assert_eq!(entry.severity, Severity::Low);
        assert_eq!(entry.entity_id, Some(completed.id.to_string()));
        assert_eq!(entry.metadata["statusMessages"].as_array().map(Vec::len), Some(20));
        assert_eq!(entry.metadata["statusMessageCount"], 30);
        assert_eq!(entry.metadata["durationMs"], 1500);
        assert_eq!(entry.metadata["postsCreated"], 70);
    }

    #[test]
    fn failed_job_entry_carries_error_detail() {
        let mut failed = job(JobState::Failed);
        failed.last_error = Some("connection refused".into());
        failed.result = Some(JobFailure::fatal("could not fetch", "connection refused").into_result(1));

        let entry = job_outcome(&failed, 20).expect("entry");
        assert_eq!(entry.action, "import.job_failed");
        assert_eq!(entry.severity, Severity::Medium);
        assert_eq!(entry.metadata_str("error"), Some("could not fetch"));
        assert_eq!(entry.metadata_str("errorDetail"), Some("connection refused"));
    }
}
