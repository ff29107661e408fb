//! HTTP-facing error type shared by the admin routes.

use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::{Request, catch};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditError;
use crate::auth::AuthError;
use crate::jobs::JobStoreError;

pub type ApiResult<T> = Result<Json<T>, status::Custom<Json<ErrorResponse>>>;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::NotFound(_) => Status::NotFound,
            ApiError::BadRequest(_) => Status::BadRequest,
            ApiError::Unavailable(_) => Status::ServiceUnavailable,
            ApiError::Internal(_) => Status::InternalServerError,
            ApiError::Auth(err) => err.status(),
        }
    }

    fn public_message(&self) -> String {
        match self {
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<JobStoreError> for ApiError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => ApiError::NotFound(format!("import job {id} not found")),
            JobStoreError::QueueUnavailable(_) => {
                ApiError::Unavailable("Import queue is unavailable".to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::Unavailable(_) => ApiError::Unavailable("Audit log is unavailable".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ApiError> for status::Custom<Json<ErrorResponse>> {
    fn from(err: ApiError) -> Self {
        let status = err.status();
        if status.code >= 500 {
            log::error!("request failed: {}", err);
        } else {
            log::debug!("request rejected: {}", err);
        }

        status::Custom(
            status,
            Json(ErrorResponse {
                status: status.code,
                message: err.public_message(),
            }),
        )
    }
}

/// JSON body for failures raised before a handler runs (guards, routing).
#[catch(default)]
pub fn default_catcher(status: Status, _request: &Request<'_>) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        status: status.code,
        message: status.reason_lossy().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_detail_is_not_exposed() {
        let response: status::Custom<Json<ErrorResponse>> =
            ApiError::Internal("connection reset by peer".into()).into();
        assert_eq!(response.0, Status::InternalServerError);
        assert_eq!(response.1.message, "Internal server error");
    }

    #[test]
    fn store_errors_map_to_statuses() {
        let missing = ApiError::from(JobStoreError::NotFound(uuid::Uuid::nil()));
        assert_eq!(missing.status(), Status::NotFound);

        let down = ApiError::from(JobStoreError::QueueUnavailable("pool timed out".into()));
        assert_eq!(down.status(), Status::ServiceUnavailable);
        assert_eq!(down.to_string(), "Import queue is unavailable");
    }

    #[test]
    fn auth_errors_keep_their_status() {
        assert_eq!(ApiError::from(AuthError::Forbidden).status(), Status::Forbidden);
        assert_eq!(ApiError::from(AuthError::TokenExpired).status(), Status::Unauthorized);
    }
}
