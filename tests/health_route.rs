use import_server::jobs::{JobQueue, QueueConfig};
use import_server::routes::health::{HealthResponse, health_check};
use import_server::test_support::{StaticFetcher, TestRocketBuilder, TestServices};
use rocket::http::Status;
use rocket::routes;

#[test]
fn health_endpoint_reports_queue_availability() {
    let services = TestServices::memory(StaticFetcher::new(""));
    let client = TestRocketBuilder::new()
        .manage_services(&services)
        .mount_api_routes(routes![health_check])
        .blocking_client();

    let response = client.get("/api/v1/health").dispatch();
    assert_eq!(response.status(), Status::Ok);

    let payload: HealthResponse = response.into_json().expect("valid JSON payload");
    assert_eq!(payload.status, "ok");
    assert!(payload.queue_available);
}

#[test]
fn disabled_queue_is_still_live() {
    let services = TestServices::with_queue(
        JobQueue::disabled("maintenance", QueueConfig::default()),
        StaticFetcher::new(""),
    );
    let client = TestRocketBuilder::new()
        .manage_services(&services)
        .mount_api_routes(routes![health_check])
        .blocking_client();

    let payload: HealthResponse = client
        .get("/api/v1/health")
        .dispatch()
        .into_json()
        .expect("valid JSON payload");
    assert_eq!(payload.status, "ok");
    assert!(!payload.queue_available);
}

#[test]
fn unknown_routes_get_json_errors() {
    let client = TestRocketBuilder::new().blocking_client();

    let response = client.get("/api/v1/nope").dispatch();
    assert_eq!(response.status(), Status::NotFound);
    let body = response.into_string().expect("body");
    assert!(body.contains("\"status\":404"));
}
