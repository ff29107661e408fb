#[macro_use]
extern crate rocket;

pub mod audit;
pub mod auth;
pub(crate) mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod import;
pub mod jobs;
pub mod request_logger;
pub mod routes;

use std::sync::{Arc, Once};
use std::time::Duration;

use crate::audit::{AuditSink, PgAuditLog};
use crate::auth::{AuthConfig, AuthState};
use crate::db::ImportDb;
use crate::gateway::SubmissionGateway;
use crate::import::{HttpFetcher, ImportPipeline, PgContentStore, PipelineConfig};
use crate::jobs::{JobQueue, PgJobBackend, QueueConfig, WorkerPool};
use crate::request_logger::RequestLogger;
use env_logger::Env;
use parking_lot::Mutex;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket, Route};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for in-flight jobs before abandoning them to lease recovery.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

/// Services shared between the HTTP routes and the background workers.
pub struct ImportServices {
    pub queue: Arc<JobQueue>,
    pub pipeline: ImportPipeline,
    pub audit: Arc<dyn AuditSink>,
    pub auth: AuthState,
}

impl ImportServices {
    /// Put every service into Rocket's managed state.
    pub fn manage(self, rocket: Rocket<Build>) -> Rocket<Build> {
        let gateway = SubmissionGateway::new(
            self.queue.clone(),
            self.audit.clone(),
            self.auth.csrf.clone(),
        );
        let workers = WorkerRuntime::new(WorkerPool::new(
            self.queue.clone(),
            self.pipeline,
            self.audit.clone(),
        ));

        rocket
            .manage(self.queue)
            .manage(self.audit)
            .manage(self.auth)
            .manage(gateway)
            .manage(workers)
    }
}

/// Running worker tasks and the token that stops them.
pub struct WorkerRuntime {
    pool: WorkerPool,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerRuntime {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let handles = self.pool.spawn(self.shutdown.clone());
        self.handles.lock().extend(handles);
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                log::warn!("import worker did not stop within {:?}", SHUTDOWN_GRACE);
            }
        }
    }
}

/// Fairings that start the worker pool on liftoff and drain it on shutdown.
pub fn worker_fairings() -> [AdHoc; 2] {
    [
        AdHoc::on_liftoff("Spawn Import Workers", |rocket| {
            Box::pin(async move {
                match rocket.state::<WorkerRuntime>() {
                    Some(runtime) => runtime.start(),
                    None => log::error!("failed to spawn import workers: services not managed"),
                }
            })
        }),
        AdHoc::on_shutdown("Stop Import Workers", |rocket| {
            Box::pin(async move {
                if let Some(queue) = rocket.state::<Arc<JobQueue>>() {
                    queue.close();
                }
                if let Some(runtime) = rocket.state::<WorkerRuntime>() {
                    runtime.stop().await;
                    log::info!("import workers stopped");
                }
            })
        }),
    ]
}

/// Routes served under `/api/v1`, including the generated `openapi.json`.
pub fn api_routes() -> Vec<Route> {
    openapi_get_routes![
        routes::health::health_check,
        routes::imports::submit_import,
        routes::imports::resubmit_import,
        routes::imports::get_import,
        routes::imports::list_imports,
        routes::admin::issue_csrf_token,
        routes::admin::list_audit_entries,
    ]
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    let [spawn_workers, stop_workers] = worker_fairings();

    rocket::build()
        .attach(RequestLogger)
        .attach(ImportDb::init())
        .attach(cors)
        .attach(AdHoc::try_on_ignite("Run Migrations", |rocket| async move {
            match ImportDb::fetch(&rocket) {
                Some(db) => match jobs::migration::run_migrations(db).await {
                    Ok(()) => Ok(rocket),
                    Err(e) => {
                        log::error!("database migrations failed: {}", e);
                        Err(rocket)
                    }
                },
                None => {
                    log::error!("database pool not available for migrations");
                    Err(rocket)
                }
            }
        }))
        .attach(AdHoc::try_on_ignite("Import Services", |rocket| async move {
            let pool = match ImportDb::fetch(&rocket) {
                Some(db) => (**db).clone(),
                None => {
                    log::error!("database pool not available for import services");
                    return Err(rocket);
                }
            };

            let auth = match AuthConfig::from_env().and_then(AuthState::from_config) {
                Ok(auth) => auth,
                Err(e) => {
                    log::error!("invalid auth configuration: {}", e);
                    return Err(rocket);
                }
            };

            let fetcher = match HttpFetcher::new() {
                Ok(fetcher) => fetcher,
                Err(e) => {
                    log::error!("failed to build import file fetcher: {}", e);
                    return Err(rocket);
                }
            };

            let queue_config = QueueConfig::from_env();
            let pipeline_config = PipelineConfig::from_env();
            log::info!(
                "import queue: enabled={} workers={} max_attempts={} lease={:?}",
                queue_config.enabled,
                queue_config.worker_count,
                queue_config.max_attempts,
                queue_config.lease_timeout
            );

            let services = ImportServices {
                queue: Arc::new(JobQueue::from_config(
                    Arc::new(PgJobBackend::new(pool.clone())),
                    queue_config,
                )),
                pipeline: ImportPipeline::new(
                    Arc::new(fetcher),
                    Arc::new(PgContentStore::new(pool.clone())),
                    pipeline_config,
                ),
                audit: Arc::new(PgAuditLog::new(pool)),
                auth,
            };

            Ok(services.manage(rocket))
        }))
        .attach(spawn_workers)
        .attach(stop_workers)
        .register("/", catchers![error::default_catcher])
        .mount("/api/v1", api_routes())
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Import API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support;
