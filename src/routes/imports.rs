//! Import submission, status polling and manual resubmission.

use std::sync::Arc;

use rocket::State;
use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::{self, Json};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::RequireAdmin;
use crate::error::{ApiError, ApiResult};
use crate::gateway::{FieldError, ImportRequest, SubmissionContext, SubmissionError, SubmissionGateway};
use crate::jobs::{JobId, JobQueue, JobStatusView};

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

type SubmitRouteResult = Result<Json<SubmitResponse>, status::Custom<Json<SubmitResponse>>>;

/// Outcome of a submission. `jobId` is set on success, `error` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<Vec<FieldError>>,
}

impl SubmitResponse {
    fn accepted(job_id: JobId) -> Json<Self> {
        Json(Self {
            success: true,
            job_id: Some(job_id.to_string()),
            error: None,
            field_errors: None,
        })
    }

    fn rejected(status: Status, error: String, field_errors: Option<Vec<FieldError>>) -> status::Custom<Json<Self>> {
        status::Custom(
            status,
            Json(Self {
                success: false,
                job_id: None,
                error: Some(error),
                field_errors,
            }),
        )
    }
}

impl From<SubmissionError> for status::Custom<Json<SubmitResponse>> {
    fn from(err: SubmissionError) -> Self {
        let status = err.status();
        let message = err.public_message();
        let field_errors = match err {
            SubmissionError::InvalidPayload(errors) => Some(errors),
            _ => None,
        };
        SubmitResponse::rejected(status, message, field_errors)
    }
}

/// Queue a bulk import. Admin only; requires the anti-forgery token.
#[openapi(tag = "Imports")]
#[post("/admin/imports", data = "<body>")]
pub async fn submit_import(
    ctx: SubmissionContext,
    gateway: &State<SubmissionGateway>,
    body: Result<Json<ImportRequest>, json::Error<'_>>,
) -> SubmitRouteResult {
    let body = body.map(Json::into_inner).map_err(|err| err.to_string());
    let job_id = gateway.submit(&ctx, body).await?;
    Ok(SubmitResponse::accepted(job_id))
}

/// Queue a new job from the payload of a failed one.
#[openapi(tag = "Imports")]
#[post("/admin/imports/<id>/resubmit")]
pub async fn resubmit_import(
    ctx: SubmissionContext,
    gateway: &State<SubmissionGateway>,
    id: &str,
) -> SubmitRouteResult {
    let previous = parse_job_id(id).map_err(|err| {
        SubmitResponse::rejected(
            Status::BadRequest,
            err.to_string(),
            Some(vec![FieldError {
                field: "id".to_string(),
                message: "id must be a UUID".to_string(),
            }]),
        )
    })?;

    let job_id = gateway.resubmit(&ctx, previous).await?;
    Ok(SubmitResponse::accepted(job_id))
}

/// Status of one job. Failed jobs expose only the opaque error summary.
#[openapi(tag = "Imports")]
#[get("/admin/imports/<id>")]
pub async fn get_import(
    _admin: RequireAdmin,
    queue: &State<Arc<JobQueue>>,
    id: &str,
) -> ApiResult<JobStatusView> {
    let id = parse_job_id(id)?;
    let job = queue.get(id).await.map_err(ApiError::from)?;
    Ok(Json(JobStatusView::from(&job)))
}

/// Most recently submitted jobs, newest first.
#[openapi(tag = "Imports")]
#[get("/admin/imports?<limit>")]
pub async fn list_imports(
    _admin: RequireAdmin,
    queue: &State<Arc<JobQueue>>,
    limit: Option<usize>,
) -> ApiResult<Vec<JobStatusView>> {
    let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let jobs = queue.list(limit).await.map_err(ApiError::from)?;
    Ok(Json(jobs.iter().map(JobStatusView::from).collect()))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("'{raw}' is not a valid job id")))
}
