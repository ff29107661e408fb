use import_server::api_routes;
use import_server::audit::{AuditLogEntry, Severity};
use import_server::auth::responses::CsrfTokenResponse;
use import_server::jobs::{JobFailure, JobState, JobStatusView, WorkerPool};
use import_server::routes::imports::SubmitResponse;
use import_server::test_support::{StaticFetcher, TestRocketBuilder, TestServices};
use rocket::http::{ContentType, Header, Status};
use rocket::local::asynchronous::Client;
use rocket::serde::json::json;

const CSV: &str = "title,content,category,tags\nFirst,Body,coding,rust|async\nSecond,Body,writing,\n,Missing title,coding,\n";

async fn client(services: &TestServices) -> Client {
    TestRocketBuilder::new()
        .manage_services(services)
        .mount_api_routes(api_routes())
        .async_client()
        .await
}

fn bearer(token: &str) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {token}"))
}

/// Fetch an anti-forgery token; the tracked client keeps the cookie.
async fn csrf_token(client: &Client, token: &str) -> String {
    let response = client
        .get("/api/v1/admin/csrf")
        .header(bearer(token))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    assert!(response.cookies().get("import_csrf").is_some());

    let body: CsrfTokenResponse = response.into_json().await.expect("csrf body");
    assert_eq!(body.header_name, "X-CSRF-Token");
    body.csrf_token
}

fn import_body() -> String {
    json!({
        "fileUrl": "https://uploads.example.com/prompts.csv?X-Amz-Signature=abc",
        "fileName": "prompts.csv",
        "delimiter": ",",
        "skipEmptyLines": true,
        "maxRows": 5000
    })
    .to_string()
}

async fn submit(client: &Client, token: &str, csrf: Option<&str>, body: String) -> (Status, SubmitResponse) {
    let mut request = client
        .post("/api/v1/admin/imports")
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(body);
    if let Some(csrf) = csrf {
        request = request.header(Header::new("X-CSRF-Token", csrf.to_string()));
    }

    let response = request.dispatch().await;
    let status = response.status();
    (status, response.into_json().await.expect("submit body"))
}

#[tokio::test]
async fn valid_submission_creates_one_job() {
    let services = TestServices::memory(StaticFetcher::new(CSV));
    let client = client(&services).await;
    let admin = services.admin_token();
    let csrf = csrf_token(&client, &admin).await;

    let (status, body) = submit(&client, &admin, Some(&csrf), import_body()).await;
    assert_eq!(status, Status::Ok);
    assert!(body.success);
    let job_id = body.job_id.expect("job id");

    let jobs = services.queue.list(10).await.expect("list jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id.to_string(), job_id);
    assert_eq!(jobs[0].payload.submitted_by, "admin-1");

    let entries = services.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, "import.job_created");
    assert_eq!(entries[0].metadata_str("fileHost"), Some("uploads.example.com"));
    assert!(!entries[0].metadata.to_string().contains("X-Amz-Signature"));
}

#[tokio::test]
async fn missing_csrf_token_is_rejected_and_audited() {
    let services = TestServices::memory(StaticFetcher::new(CSV));
    let client = client(&services).await;
    let admin = services.admin_token();

    let (status, body) = submit(&client, &admin, None, import_body()).await;
    assert_eq!(status, Status::Forbidden);
    assert!(!body.success);
    assert!(body.job_id.is_none());

    assert!(services.queue.list(10).await.expect("list").is_empty());
    let entries = services.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, "security.csrf_violation");
    assert_eq!(entries[0].severity, Severity::High);
}

#[tokio::test]
async fn forged_csrf_token_is_rejected() {
    let services = TestServices::memory(StaticFetcher::new(CSV));
    let client = client(&services).await;
    let admin = services.admin_token();
    csrf_token(&client, &admin).await;

    let (status, _) = submit(&client, &admin, Some("nonce.deadbeef"), import_body()).await;
    assert_eq!(status, Status::Forbidden);
    assert!(services.queue.list(10).await.expect("list").is_empty());
}

#[tokio::test]
async fn non_admin_and_anonymous_callers_are_forbidden() {
    let services = TestServices::memory(StaticFetcher::new(CSV));
    let client = client(&services).await;

    let user = services.user_token("user-7");
    let csrf = csrf_token(&client, &user).await;
    let (status, body) = submit(&client, &user, Some(&csrf), import_body()).await;
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body.error.as_deref(), Some("Unauthorized"));

    let response = client
        .post("/api/v1/admin/imports")
        .header(ContentType::JSON)
        .body(import_body())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Forbidden);

    assert!(services.queue.list(10).await.expect("list").is_empty());
    assert!(
        services
            .audit
            .entries()
            .iter()
            .all(|entry| entry.severity == Severity::High)
    );
}

#[tokio::test]
async fn invalid_payload_returns_field_errors() {
    let services = TestServices::memory(StaticFetcher::new(CSV));
    let client = client(&services).await;
    let admin = services.admin_token();
    let csrf = csrf_token(&client, &admin).await;

    let body = json!({ "fileUrl": "ftp://uploads.example.com/a.csv", "maxRows": 0 }).to_string();
    let (status, body) = submit(&client, &admin, Some(&csrf), body).await;
    assert_eq!(status, Status::BadRequest);

    let fields: Vec<String> = body
        .field_errors
        .expect("field errors")
        .into_iter()
        .map(|error| error.field)
        .collect();
    assert!(fields.contains(&"fileUrl".to_string()));
    assert!(fields.contains(&"fileName".to_string()));
    assert!(fields.contains(&"maxRows".to_string()));

    let (status, body) = submit(&client, &admin, Some(&csrf), "{not json".to_string()).await;
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body.field_errors.expect("field errors")[0].field, "body");

    assert!(services.queue.list(10).await.expect("list").is_empty());
}

#[tokio::test]
async fn status_view_tracks_job_through_processing() {
    let services = TestServices::memory(StaticFetcher::new(CSV));
    let client = client(&services).await;
    let admin = services.admin_token();
    let csrf = csrf_token(&client, &admin).await;

    let (_, body) = submit(&client, &admin, Some(&csrf), import_body()).await;
    let job_id = body.job_id.expect("job id");

    let response = client
        .get(format!("/api/v1/admin/imports/{job_id}"))
        .header(bearer(&admin))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let view: JobStatusView = response.into_json().await.expect("status view");
    assert_eq!(view.state, JobState::Queued);
    assert_eq!(view.attempts, 0);

    let workers = WorkerPool::new(services.queue.clone(), services.pipeline(), services.audit.clone());
    workers.run_once(0).await.expect("run worker").expect("job processed");

    let response = client
        .get(format!("/api/v1/admin/imports/{job_id}"))
        .header(bearer(&admin))
        .dispatch()
        .await;
    let view: JobStatusView = response.into_json().await.expect("status view");
    assert_eq!(view.state, JobState::Completed);
    let result = view.result.expect("result");
    assert_eq!(result.files_processed, 1);
    assert_eq!(result.posts_created, 2);
    assert_eq!(result.status_messages.len(), 1);
    assert!(result.status_messages[0].starts_with("Row 3:"));
    assert_eq!(services.content.len(), 2);

    let response = client
        .get("/api/v1/admin/imports?limit=5")
        .header(bearer(&admin))
        .dispatch()
        .await;
    let views: Vec<JobStatusView> = response.into_json().await.expect("job list");
    assert_eq!(views.len(), 1);
}

#[tokio::test]
async fn failed_job_exposes_only_the_summary() {
    let services = TestServices::memory(StaticFetcher::new(CSV));
    let client = client(&services).await;
    let admin = services.admin_token();
    let csrf = csrf_token(&client, &admin).await;

    let (_, body) = submit(&client, &admin, Some(&csrf), import_body()).await;
    let job_id = body.job_id.expect("job id");

    let claimed = services.queue.dequeue().await.expect("dequeue").expect("job");
    services.queue.mark_active(&claimed.lease).await.expect("activate");
    services
        .queue
        .mark_failed(
            &claimed.lease,
            JobFailure::fatal("import file failed validation", "parser panicked at 10.0.0.7:5432"),
        )
        .await
        .expect("fail job");

    let response = client
        .get(format!("/api/v1/admin/imports/{job_id}"))
        .header(bearer(&admin))
        .dispatch()
        .await;
    let raw = response.into_string().await.expect("body");
    assert!(raw.contains("import file failed validation"));
    assert!(!raw.contains("10.0.0.7"));

    let response = client
        .post(format!("/api/v1/admin/imports/{job_id}/resubmit"))
        .header(bearer(&admin))
        .header(Header::new("X-CSRF-Token", csrf.clone()))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let body: SubmitResponse = response.into_json().await.expect("resubmit body");
    assert_ne!(body.job_id.as_deref(), Some(job_id.as_str()));
    assert_eq!(services.queue.list(10).await.expect("list").len(), 2);
}

#[tokio::test]
async fn status_requires_admin_and_a_valid_id() {
    let services = TestServices::memory(StaticFetcher::new(CSV));
    let client = client(&services).await;

    let response = client
        .get(format!("/api/v1/admin/imports/{}", uuid::Uuid::new_v4()))
        .header(bearer(&services.user_token("user-7")))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Forbidden);

    let admin = services.admin_token();
    let response = client
        .get(format!("/api/v1/admin/imports/{}", uuid::Uuid::new_v4()))
        .header(bearer(&admin))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::NotFound);

    let response = client
        .get("/api/v1/admin/imports/not-a-uuid")
        .header(bearer(&admin))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);
}

#[tokio::test]
async fn audit_view_lists_newest_first() {
    let services = TestServices::memory(StaticFetcher::new(CSV));
    let client = client(&services).await;
    let admin = services.admin_token();

    submit(&client, &admin, None, import_body()).await;
    let csrf = csrf_token(&client, &admin).await;
    submit(&client, &admin, Some(&csrf), import_body()).await;

    let response = client
        .get("/api/v1/admin/audit?limit=10")
        .header(bearer(&admin))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let entries: Vec<AuditLogEntry> = response.into_json().await.expect("audit entries");
    let actions: Vec<&str> = entries.iter().map(|entry| entry.action.as_str()).collect();
    assert_eq!(actions, vec!["import.job_created", "security.csrf_violation"]);
}
