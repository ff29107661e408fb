use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::config::PipelineConfig;
use super::content::{ContentStore, ContentStoreError, CreateOutcome};
use super::fetch::{FetchError, FileFetcher};
use super::parser::{ParseError, ParseOptions, parse_file};
use super::validate::{RowFailure, validate_record};
use crate::jobs::{Job, JobFailure, JobId, JobResult};

/// Stable identity of one data record within one job.
///
/// Retries of the same job produce the same key, so the content store can
/// recognise rows an earlier attempt already wrote.
pub fn row_key(job_id: JobId, file_url: &str, record_index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{job_id}|{file_url}|{record_index}").as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("{detail}")]
    Transient { summary: String, detail: String },
    #[error("{detail}")]
    Fatal { summary: String, detail: String },
}

impl PipelineError {
    pub fn transient(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        PipelineError::Transient {
            summary: summary.into(),
            detail: detail.into(),
        }
    }

    pub fn fatal(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        PipelineError::Fatal {
            summary: summary.into(),
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient { .. })
    }

    /// Message safe to show the submitter.
    pub fn public_summary(&self) -> &str {
        match self {
            PipelineError::Transient { summary, .. } | PipelineError::Fatal { summary, .. } => {
                summary
            }
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        let summary = match &err {
            FetchError::InvalidUrl(_) => "import file URL is invalid".to_string(),
            FetchError::TooLarge { limit } => format!("import file exceeds the {limit} byte limit"),
            FetchError::Status { status } if !err.is_transient() => {
                format!("import file could not be downloaded (HTTP {status})")
            }
            _ => "could not fetch the import file".to_string(),
        };

        if err.is_transient() {
            PipelineError::transient(summary, err.to_string())
        } else {
            PipelineError::fatal(summary, err.to_string())
        }
    }
}

impl From<ParseError> for PipelineError {
    fn from(err: ParseError) -> Self {
        PipelineError::fatal(format!("import file failed validation: {err}"), err.to_string())
    }
}

/// Counters and row failures gathered while importing one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub files_processed: u32,
    pub created: u32,
    pub already_imported: u32,
    pub failures: Vec<RowFailure>,
}

impl ImportReport {
    /// Rows this job has in the content store, whichever attempt wrote them.
    pub fn posts_created(&self) -> u32 {
        self.created + self.already_imported
    }

    pub fn status_messages(&self) -> Vec<String> {
        self.failures.iter().map(ToString::to_string).collect()
    }

    pub fn into_result(self) -> JobResult {
        JobResult {
            files_processed: self.files_processed,
            posts_created: self.posts_created(),
            status_messages: self.status_messages(),
            error: None,
        }
    }
}

/// A failed attempt along with whatever progress it made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFailure {
    pub error: PipelineError,
    pub report: ImportReport,
}

impl PipelineFailure {
    fn new(error: impl Into<PipelineError>, report: ImportReport) -> Self {
        Self {
            error: error.into(),
            report,
        }
    }

    pub fn into_job_failure(self) -> JobFailure {
        let retryable = self.error.is_transient();
        let (summary, detail) = match self.error {
            PipelineError::Transient { summary, detail } | PipelineError::Fatal { summary, detail } => {
                (summary, detail)
            }
        };

        JobFailure {
            summary,
            detail,
            retryable,
            files_processed: self.report.files_processed,
            posts_created: self.report.posts_created(),
            status_messages: self.report.status_messages(),
        }
    }
}

/// Fetch, split, validate and persist one import file.
#[derive(Clone)]
pub struct ImportPipeline {
    fetcher: Arc<dyn FileFetcher>,
    content: Arc<dyn ContentStore>,
    config: PipelineConfig,
}

impl ImportPipeline {
    pub fn new(
        fetcher: Arc<dyn FileFetcher>,
        content: Arc<dyn ContentStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            content,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, job: &Job) -> Result<ImportReport, PipelineFailure> {
        let payload = &job.payload;
        let mut report = ImportReport::default();

        let bytes = match self
            .fetcher
            .fetch(&payload.file_url, self.config.fetch_limits())
            .await
        {
            Ok(bytes) => bytes,
            Err(err) => return Err(PipelineFailure::new(err, report)),
        };
        report.files_processed = 1;
        log::debug!("job {}: fetched {} bytes", job.id, bytes.len());

        let options = ParseOptions {
            delimiter: payload.delimiter.clone(),
            skip_empty_lines: payload.skip_empty_lines,
            max_rows: payload.max_rows,
        };
        let records = match parse_file(&bytes, &payload.file_name, &options) {
            Ok(records) => records,
            Err(err) => return Err(PipelineFailure::new(err, report)),
        };

        for record in records {
            let row = record.row_number();
            let fields = match record.fields {
                Ok(fields) => fields,
                Err(message) => {
                    report.failures.push(RowFailure::new(row, message));
                    continue;
                }
            };

            let key = row_key(job.id, &payload.file_url, record.index);
            let post = match validate_record(&fields, &key) {
                Ok(post) => post,
                Err(message) => {
                    report.failures.push(RowFailure::new(row, message));
                    continue;
                }
            };

            match self.content.create(&post, &key, job.id).await {
                Ok(CreateOutcome::Created(_)) => report.created += 1,
                Ok(CreateOutcome::AlreadyImported(_)) => report.already_imported += 1,
                Err(ContentStoreError::Rejected(message)) => {
                    report.failures.push(RowFailure::new(row, message));
                }
                Err(err @ ContentStoreError::Unavailable(_)) => {
                    let error = PipelineError::transient("content store unavailable", err.to_string());
                    return Err(PipelineFailure::new(error, report));
                }
            }
        }

        log::info!(
            "job {}: imported '{}' ({} created, {} already present, {} row failures)",
            job.id,
            payload.file_name,
            report.created,
            report.already_imported,
            report.failures.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ImportPayload, JobKind};
    use crate::test_support::{MemoryContentStore, StaticFetcher};
    use chrono::Utc;

    const HEADER: &str = "title,content,category,tags\n";

    fn job(file_name: &str, max_rows: u32) -> Job {
        Job::new(
            JobKind::ProcessCsv,
            ImportPayload {
                file_url: format!("https://uploads.example.com/{file_name}"),
                file_name: file_name.into(),
                delimiter: ",".into(),
                skip_empty_lines: true,
                max_rows,
                submitted_by: "admin-1".into(),
            },
            3,
            Utc::now(),
        )
    }

    fn ten_rows_two_bad() -> String {
        let mut csv = String::from(HEADER);
        for i in 1..=10 {
            match i {
                4 => csv.push_str(",missing title,coding,\n"),
                7 => csv.push_str("Bad category,body,poetry,\n"),
                _ => csv.push_str(&format!("Prompt {i},Body {i},coding,a|b\n")),
            }
        }
        csv
    }

    fn pipeline(fetcher: StaticFetcher, store: Arc<MemoryContentStore>) -> ImportPipeline {
        ImportPipeline::new(Arc::new(fetcher), store, PipelineConfig::default())
    }

    #[test]
    fn row_keys_are_stable_per_job_and_distinct_across_jobs() {
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        let url = "https://uploads.example.com/a.csv";

        assert_eq!(row_key(a, url, 3), row_key(a, url, 3));
        assert_ne!(row_key(a, url, 3), row_key(a, url, 4));
        assert_ne!(row_key(a, url, 3), row_key(b, url, 3));
        assert_eq!(row_key(a, url, 3).len(), 64);
    }

    #[tokio::test]
    async fn malformed_rows_are_reported_not_fatal() {
        let store = Arc::new(MemoryContentStore::new());
        let pipeline = pipeline(StaticFetcher::new(ten_rows_two_bad()), store.clone());

        let report = pipeline.run(&job("a.csv", 5000)).await.expect("import");
        let result = report.into_result();

        assert_eq!(result.files_processed, 1);
        assert_eq!(result.posts_created, 8);
        assert_eq!(result.status_messages.len(), 2);
        assert_eq!(result.status_messages[0], "Row 4: title is required");
        assert!(result.status_messages[1].starts_with("Row 7: category 'poetry'"));
        assert_eq!(store.len(), 8);
    }

    #[tokio::test]
    async fn separate_jobs_import_the_same_file_independently() {
        let store = Arc::new(MemoryContentStore::new());
        let pipeline = pipeline(StaticFetcher::new(ten_rows_two_bad()), store.clone());

        let first = pipeline.run(&job("a.csv", 5000)).await.expect("first");
        let second = pipeline.run(&job("a.csv", 5000)).await.expect("second");

        assert_eq!(first.posts_created(), 8);
        assert_eq!(second.posts_created(), 8);
        assert_eq!(store.len(), 16);
    }

    #[tokio::test]
    async fn rerunning_a_job_does_not_duplicate_rows() {
        let store = Arc::new(MemoryContentStore::new());
        let pipeline = pipeline(StaticFetcher::new(ten_rows_two_bad()), store.clone());
        let job = job("a.csv", 5000);

        pipeline.run(&job).await.expect("first attempt");
        let rerun = pipeline.run(&job).await.expect("second attempt");

        assert_eq!(rerun.created, 0);
        assert_eq!(rerun.already_imported, 8);
        assert_eq!(rerun.posts_created(), 8);
        assert_eq!(store.len(), 8);
    }

    #[tokio::test]
    async fn too_many_rows_is_fatal_and_persists_nothing() {
        let mut csv = String::from(HEADER);
        for i in 0..5001 {
            csv.push_str(&format!("Prompt {i},Body,coding,\n"));
        }
        let store = Arc::new(MemoryContentStore::new());
        let pipeline = pipeline(StaticFetcher::new(csv), store.clone());

        let failure = pipeline
            .run(&job("big.csv", 5000))
            .await
            .expect_err("over the row limit");
        assert!(!failure.error.is_transient());

        let job_failure = failure.into_job_failure();
        assert!(!job_failure.retryable);
        assert_eq!(job_failure.files_processed, 1);
        assert_eq!(job_failure.posts_created, 0);
        assert_eq!(
            job_failure.summary,
            "import file failed validation: file has more than 5000 data rows"
        );
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn fetch_errors_are_classified() {
        let store = Arc::new(MemoryContentStore::new());

        let transient = pipeline(StaticFetcher::failing(FetchError::Status { status: 503 }), store.clone())
            .run(&job("a.csv", 10))
            .await
            .expect_err("503");
        assert!(transient.error.is_transient());
        assert_eq!(transient.report.files_processed, 0);

        let fatal = pipeline(StaticFetcher::failing(FetchError::Status { status: 404 }), store)
            .run(&job("a.csv", 10))
            .await
            .expect_err("404");
        assert!(!fatal.error.is_transient());
        assert_eq!(
            fatal.error.public_summary(),
            "import file could not be downloaded (HTTP 404)"
        );
    }

    #[tokio::test]
    async fn unavailable_store_aborts_as_transient() {
        let store = Arc::new(MemoryContentStore::new());
        store.set_unavailable(true);
        let pipeline = pipeline(StaticFetcher::new(ten_rows_two_bad()), store);

        let failure = pipeline.run(&job("a.csv", 5000)).await.expect_err("store down");
        assert!(failure.error.is_transient());
        assert_eq!(failure.error.public_summary(), "content store unavailable");
    }
}
