//! Liveness endpoint used for readiness checks and tests.

use std::sync::Arc;

use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

use crate::jobs::JobQueue;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `ok` while the process serves requests.
    pub status: String,
    /// Whether the import queue is accepting submissions.
    pub queue_available: bool,
}

#[openapi(tag = "Health")]
#[get("/health")]
pub fn health_check(queue: &State<Arc<JobQueue>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        queue_available: queue.is_available(),
    })
}
