//! Submission gateway: authorizes and validates import requests, then
//! enqueues exactly one job per accepted request.

use std::sync::Arc;

use rocket::http::Status;
use rocket_okapi::request::OpenApiFromRequest;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::audit::models::AuditEntryBuilder;
use crate::audit::{AuditAction, AuditLogEntry, AuditSink, EntityType, Severity, record_or_log};
use crate::auth::csrf::CsrfService;
use crate::auth::{AuthError, AuthResult, AuthUser};
use crate::jobs::{ImportPayload, JobId, JobKind, JobQueue, JobState, JobStoreError};

pub const DEFAULT_DELIMITER: &str = ",";
pub const DEFAULT_MAX_ROWS: i64 = 5000;
pub const MAX_ROWS_LIMIT: i64 = 10_000;
pub const FILE_NAME_MAX_CHARS: usize = 255;
pub const DELIMITER_MAX_CHARS: usize = 5;

/// Everything the gateway needs to know about the caller.
///
/// Identity failures are carried rather than rejected by the guard so the
/// gateway can audit them.
#[derive(Debug, OpenApiFromRequest)]
pub struct SubmissionContext {
    pub identity: AuthResult<AuthUser>,
    pub csrf_header: Option<String>,
    pub csrf_cookie: Option<String>,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Body of an import submission. Everything is optional at the wire level so
/// missing fields are reported as field errors rather than parse failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub delimiter: Option<String>,
    pub skip_empty_lines: Option<bool>,
    pub max_rows: Option<i64>,
}

impl ImportRequest {
    pub fn validate(&self, submitted_by: &str) -> Result<ImportPayload, Vec<FieldError>> {
        let mut errors = Vec::new();

        let file_url = match self.file_url.as_deref().map(str::trim) {
            None | Some("") => {
                errors.push(FieldError::new("fileUrl", "fileUrl is required"));
                None
            }
            Some(raw) => match Url::parse(raw) {
                Ok(url) if !matches!(url.scheme(), "http" | "https") => {
                    errors.push(FieldError::new("fileUrl", "fileUrl must use http or https"));
                    None
                }
                Ok(url) if url.host_str().is_none_or(str::is_empty) => {
                    errors.push(FieldError::new("fileUrl", "fileUrl must include a host"));
                    None
                }
                Ok(url) => Some(url.to_string()),
                Err(err) => {
                    errors.push(FieldError::new("fileUrl", format!("fileUrl is not a valid URL: {err}")));
                    None
                }
            },
        };

        let file_name = match self.file_name.as_deref().map(str::trim) {
            None | Some("") => {
                errors.push(FieldError::new("fileName", "fileName is required"));
                None
            }
            Some(name) if name.chars().count() > FILE_NAME_MAX_CHARS => {
                errors.push(FieldError::new(
                    "fileName",
                    format!("fileName must be at most {FILE_NAME_MAX_CHARS} characters"),
                ));
                None
            }
            Some(name) => Some(name.to_string()),
        };

        let delimiter = self.delimiter.clone().unwrap_or_else(|| DEFAULT_DELIMITER.to_string());
        let delimiter_len = delimiter.chars().count();
        if delimiter_len == 0 || delimiter_len > DELIMITER_MAX_CHARS {
            errors.push(FieldError::new(
                "delimiter",
                format!("delimiter must be 1 to {DELIMITER_MAX_CHARS} characters"),
            ));
        } else if delimiter.contains(['\n', '\r', '"']) {
            errors.push(FieldError::new(
                "delimiter",
                "delimiter must not contain quotes or line breaks",
            ));
        }

        let max_rows = self.max_rows.unwrap_or(DEFAULT_MAX_ROWS);
        if !(1..=MAX_ROWS_LIMIT).contains(&max_rows) {
            errors.push(FieldError::new(
                "maxRows",
                format!("maxRows must be between 1 and {MAX_ROWS_LIMIT}"),
            ));
        }

        match (file_url, file_name) {
            (Some(file_url), Some(file_name)) if errors.is_empty() => Ok(ImportPayload {
                file_url,
                file_name,
                delimiter,
                skip_empty_lines: self.skip_empty_lines.unwrap_or(true),
                max_rows: u32::try_from(max_rows).unwrap_or(u32::MAX),
                submitted_by: submitted_by.to_string(),
            }),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid anti-forgery token")]
    InvalidToken,
    #[error("invalid import request")]
    InvalidPayload(Vec<FieldError>),
    #[error("import queue unavailable")]
    QueueUnavailable,
    #[error("import job {0} not found")]
    NotFound(JobId),
    #[error("import job {0} has not failed and cannot be resubmitted")]
    NotResubmittable(JobId),
}

impl SubmissionError {
    pub fn status(&self) -> Status {
        match self {
            SubmissionError::Unauthorized(_) | SubmissionError::InvalidToken => Status::Forbidden,
            SubmissionError::InvalidPayload(_) => Status::BadRequest,
            SubmissionError::QueueUnavailable => Status::InternalServerError,
            SubmissionError::NotFound(_) => Status::NotFound,
            SubmissionError::NotResubmittable(_) => Status::Conflict,
        }
    }

    /// Message returned to the caller. Never includes internal detail.
    pub fn public_message(&self) -> String {
        match self {
            SubmissionError::Unauthorized(_) => "Unauthorized".to_string(),
            SubmissionError::InvalidToken => "Invalid or missing anti-forgery token".to_string(),
            SubmissionError::InvalidPayload(_) => "Invalid import request".to_string(),
            SubmissionError::QueueUnavailable => "Import queue is unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

/// Authorizes, validates and enqueues import submissions.
pub struct SubmissionGateway {
    queue: Arc<JobQueue>,
    audit: Arc<dyn AuditSink>,
    csrf: Arc<CsrfService>,
}

impl SubmissionGateway {
    pub fn new(queue: Arc<JobQueue>, audit: Arc<dyn AuditSink>, csrf: Arc<CsrfService>) -> Self {
        Self { queue, audit, csrf }
    }

    /// Checks run in order: identity, admin role, anti-forgery token,
    /// payload, then enqueue. Every rejection is audited.
    pub async fn submit(
        &self,
        ctx: &SubmissionContext,
        body: Result<ImportRequest, String>,
    ) -> Result<JobId, SubmissionError> {
        let user = self.authorize(ctx, "submit").await?;

        let validated = body
            .map_err(|err| vec![FieldError::new("body", format!("request body is not valid JSON: {err}"))])
            .and_then(|request| request.validate(&user.id));
        let payload = match validated {
            Ok(payload) => payload,
            Err(field_errors) => {
                let fields: Vec<&str> = field_errors.iter().map(|e| e.field.as_str()).collect();
                self.record_entry(
                    AuditLogEntry::builder(AuditAction::SubmissionRejected, EntityType::ImportSubmission, Severity::Low)
                        .user(user.id.clone())
                        .meta("reason", "invalid payload")
                        .meta("fields", serde_json::json!(fields)),
                    ctx,
                )
                .await;
                return Err(SubmissionError::InvalidPayload(field_errors));
            }
        };

        let job_id = self.enqueue(&user, payload, ctx, "submit").await?;
        Ok(job_id)
    }

    /// Enqueue a fresh job from the payload of a terminally failed one.
    pub async fn resubmit(
        &self,
        ctx: &SubmissionContext,
        previous: JobId,
    ) -> Result<JobId, SubmissionError> {
        let user = self.authorize(ctx, "resubmit").await?;

        let job = match self.queue.get(previous).await {
            Ok(job) => job,
            Err(JobStoreError::NotFound(id)) => return Err(SubmissionError::NotFound(id)),
            Err(err) => return Err(self.queue_failure(&user, err, ctx, "resubmit").await),
        };
        if job.state != JobState::Failed {
            return Err(SubmissionError::NotResubmittable(previous));
        }

        let payload = ImportPayload {
            submitted_by: user.id.clone(),
            ..job.payload
        };
        let job_id = self.enqueue(&user, payload, ctx, "resubmit").await?;

        self.record_entry(
            AuditLogEntry::builder(AuditAction::JobResubmitted, EntityType::ImportJob, Severity::Low)
                .user(user.id.clone())
                .entity(job_id)
                .meta("previousJobId", previous.to_string()),
            ctx,
        )
        .await;
        Ok(job_id)
    }

    async fn authorize(&self, ctx: &SubmissionContext, operation: &str) -> Result<AuthUser, SubmissionError> {
        let user = match &ctx.identity {
            Ok(user) => user.clone(),
            Err(err) => {
                self.record_entry(
                    AuditLogEntry::builder(AuditAction::SubmissionRejected, EntityType::ImportSubmission, Severity::High)
                        .meta("reason", err.to_string())
                        .meta("operation", operation),
                    ctx,
                )
                .await;
                return Err(SubmissionError::Unauthorized(err.to_string()));
            }
        };

        if !user.is_admin() {
            self.record_entry(
                AuditLogEntry::builder(AuditAction::SubmissionRejected, EntityType::ImportSubmission, Severity::High)
                    .user(user.id.clone())
                    .meta("reason", AuthError::Forbidden.to_string())
                    .meta("operation", operation),
                ctx,
            )
            .await;
            return Err(SubmissionError::Unauthorized(AuthError::Forbidden.to_string()));
        }

        if let Err(err) = self.csrf.verify(
            &user.id,
            ctx.csrf_header.as_deref(),
            ctx.csrf_cookie.as_deref(),
        ) {
            self.record_entry(
                AuditLogEntry::builder(AuditAction::CsrfViolation, EntityType::ImportSubmission, Severity::High)
                    .user(user.id.clone())
                    .meta("reason", err.to_string())
                    .meta("operation", operation),
                ctx,
            )
            .await;
            return Err(SubmissionError::InvalidToken);
        }

        Ok(user)
    }

    async fn enqueue(
        &self,
        user: &AuthUser,
        payload: ImportPayload,
        ctx: &SubmissionContext,
        operation: &str,
    ) -> Result<JobId, SubmissionError> {
        let file_name = payload.file_name.clone();
        let file_host = Url::parse(&payload.file_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string));
        let max_rows = payload.max_rows;

        match self.queue.enqueue(JobKind::ProcessCsv, payload).await {
            Ok(job_id) => {
                let mut entry = AuditLogEntry::builder(AuditAction::JobCreated, EntityType::ImportJob, Severity::Low)
                    .user(user.id.clone())
                    .entity(job_id)
                    .meta("fileName", file_name)
                    .meta("maxRows", max_rows)
                    .meta("operation", operation);
                if let Some(host) = file_host {
                    entry = entry.meta("fileHost", host);
                }
                self.record_entry(entry, ctx).await;
                Ok(job_id)
            }
            Err(err) => Err(self.queue_failure(user, err, ctx, operation).await),
        }
    }

    async fn queue_failure(
        &self,
        user: &AuthUser,
        err: JobStoreError,
        ctx: &SubmissionContext,
        operation: &str,
    ) -> SubmissionError {
        log::error!("import {} by {} failed: {}", operation, user.id, err);
        self.record_entry(
            AuditLogEntry::builder(AuditAction::SubmissionFailed, EntityType::ImportSubmission, Severity::Medium)
                .user(user.id.clone())
                .meta("reason", err.to_string())
                .meta("operation", operation),
            ctx,
        )
        .await;
        SubmissionError::QueueUnavailable
    }

    async fn record_entry(&self, entry: AuditEntryBuilder, ctx: &SubmissionContext) {
        let entry = match &ctx.client_ip {
            Some(ip) => entry.meta("clientIp", ip.clone()),
            None => entry,
        };
        record_or_log(self.audit.as_ref(), entry.build()).await;
    }
}
