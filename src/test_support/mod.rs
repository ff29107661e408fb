//! Shared fixtures for unit and integration tests.

use std::sync::Arc;

use rocket::config::LogLevel;
use rocket::figment::Figment;
use rocket::local::asynchronous::Client as AsyncClient;
use rocket::local::blocking::Client;
use rocket::{Build, Rocket, Route};

use crate::auth::responses::Role;
use crate::auth::{AuthConfig, AuthState};
use crate::import::{ImportPipeline, PipelineConfig};
use crate::jobs::{ImportPayload, JobQueue, QueueConfig};
use crate::{ImportServices, error};

mod database;
mod memory;

pub use database::{TestDatabase, TestDatabaseError};
pub use memory::{MemoryAuditLog, MemoryContentStore, MemoryJobBackend, StaticFetcher, StoredPost};

pub const TEST_ADMIN_ID: &str = "admin-1";

/// Canned configuration and payloads.
pub struct TestFixtures;

impl TestFixtures {
    pub fn auth_config() -> AuthConfig {
        AuthConfig {
            issuer: "https://import.test".into(),
            audience: "import-api".into(),
            access_token_ttl_secs: 900,
            jwt_secret: "test-jwt-secret".into(),
            jwt_kid: Some("test-kid".into()),
            csrf_secret: "test-csrf-secret".into(),
            csrf_cookie_name: "import_csrf".into(),
            csrf_header_name: "X-CSRF-Token".into(),
            csrf_token_ttl_secs: 3600,
            cookie_domain: None,
            cookie_secure: false,
        }
    }

    pub fn auth_state() -> AuthState {
        AuthState::from_config(Self::auth_config()).expect("test auth state")
    }

    pub fn access_token(auth: &AuthState, user_id: &str, role: Role) -> String {
        auth.jwt_service
            .issue_access_token(user_id, role)
            .expect("issue access token")
            .token
    }

    pub fn payload(file_url: &str, file_name: &str) -> ImportPayload {
        ImportPayload {
            file_url: file_url.to_string(),
            file_name: file_name.to_string(),
            delimiter: ",".into(),
            skip_empty_lines: true,
            max_rows: 5000,
            submitted_by: TEST_ADMIN_ID.into(),
        }
    }
}

/// In-memory service graph with handles kept for assertions.
pub struct TestServices {
    pub queue: Arc<JobQueue>,
    pub audit: Arc<MemoryAuditLog>,
    pub content: Arc<MemoryContentStore>,
    pub auth: AuthState,
    fetcher: Arc<StaticFetcher>,
}

impl TestServices {
    pub fn memory(fetcher: StaticFetcher) -> Self {
        Self::with_queue(
            JobQueue::open(Arc::new(MemoryJobBackend::new()), QueueConfig::default()),
            fetcher,
        )
    }

    pub fn with_queue(queue: JobQueue, fetcher: StaticFetcher) -> Self {
        Self {
            queue: Arc::new(queue),
            audit: Arc::new(MemoryAuditLog::new()),
            content: Arc::new(MemoryContentStore::new()),
            auth: TestFixtures::auth_state(),
            fetcher: Arc::new(fetcher),
        }
    }

    pub fn pipeline(&self) -> ImportPipeline {
        ImportPipeline::new(
            self.fetcher.clone(),
            self.content.clone(),
            PipelineConfig::default(),
        )
    }

    pub fn admin_token(&self) -> String {
        TestFixtures::access_token(&self.auth, TEST_ADMIN_ID, Role::Admin)
    }

    pub fn user_token(&self, user_id: &str) -> String {
        TestFixtures::access_token(&self.auth, user_id, Role::User)
    }

    fn services(&self) -> ImportServices {
        ImportServices {
            queue: self.queue.clone(),
            pipeline: self.pipeline(),
            audit: self.audit.clone(),
            auth: self.auth.clone(),
        }
    }
}

/// Builder for Rocket instances tailored to route tests.
#[derive(Default)]
pub struct TestRocketBuilder {
    figment: Figment,
    mounts: Vec<(String, Vec<Route>)>,
    services: Option<ImportServices>,
}

impl TestRocketBuilder {
    /// Random port, logging disabled.
    pub fn new() -> Self {
        let figment = rocket::Config::figment()
            .merge(("port", 0))
            .merge(("log_level", LogLevel::Off))
            .merge(("cli_colors", false));

        Self {
            figment,
            mounts: Vec::new(),
            services: None,
        }
    }

    /// Mount routes under `/api/v1`.
    pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
        self.mounts.push(("/api/v1".to_string(), routes));
        self
    }

    pub fn manage_services(mut self, services: &TestServices) -> Self {
        self.services = Some(services.services());
        self
    }

    pub fn build(self) -> Rocket<Build> {
        let mut rocket = rocket::custom(self.figment)
            .register("/", catchers![error::default_catcher]);

        for (base, routes) in self.mounts {
            rocket = rocket.mount(base, routes);
        }

        match self.services {
            Some(services) => services.manage(rocket),
            None => rocket,
        }
    }

    pub fn blocking_client(self) -> Client {
        Client::tracked(self.build()).expect("valid Rocket instance")
    }

    pub async fn async_client(self) -> AsyncClient {
        AsyncClient::tracked(self.build())
            .await
            .expect("valid Rocket instance")
    }
}
