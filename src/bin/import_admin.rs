use std::io::{self, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use import_server::audit::{AuditAction, AuditLogEntry, AuditSink, EntityType, PgAuditLog, Severity};
use import_server::auth::responses::Role;
use import_server::auth::{AuthConfig, JwtService};
use import_server::import::{HttpFetcher, ImportPipeline, PgContentStore, PipelineConfig};
use import_server::jobs::{
    ImportPayload, JobKind, JobQueue, JobState, JobStatusView, PgJobBackend, QueueConfig,
    WorkerPool,
};

#[derive(Parser, Debug)]
#[command(name = "import-admin", about = "Inspect and repair content import jobs")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the status of one job.
    Status {
        id: Uuid,
        /// Also print the internal detail of the last failure.
        #[arg(long)]
        detail: bool,
    },
    /// List the most recent jobs.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Queue a new job from the payload of a failed one.
    Resubmit {
        id: Uuid,
        /// Operator recorded as the submitter of the new job.
        #[arg(long)]
        user: String,
    },
    /// Return jobs with expired leases to the queue, or fail them when out of attempts.
    RecoverLeases,
    /// Mint an access token (needs IMPORT_JWT_SECRET).
    IssueToken {
        #[arg(long)]
        user: String,
        /// `admin` or `user`.
        #[arg(long, default_value = "admin")]
        role: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Status { id, detail } => {
            let (queue, _) = connect().await?;
            let job = queue.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&JobStatusView::from(&job))?);
            if detail {
                println!("last error: {}", job.last_error.as_deref().unwrap_or("-"));
            }
        }
        Command::List { limit } => {
            let (queue, _) = connect().await?;
            for job in queue.list(limit.max(1)).await? {
                println!(
                    "{}  {:<9}  {}/{}  {}  {}",
                    job.id,
                    job.state.as_str(),
                    job.attempts,
                    job.max_attempts,
                    job.created_at.to_rfc3339(),
                    job.payload.file_name
                );
            }
        }
        Command::Resubmit { id, user } => {
            let (queue, pool) = connect().await?;
            let job = queue.get(id).await?;
            if job.state != JobState::Failed {
                writeln!(
                    io::stderr(),
                    "error: job {id} is {} and cannot be resubmitted",
                    job.state.as_str()
                )?;
                std::process::exit(1);
            }

            let payload = ImportPayload {
                submitted_by: user.clone(),
                ..job.payload
            };
            let new_id = queue.enqueue(JobKind::ProcessCsv, payload).await?;

            let entry = AuditLogEntry::builder(AuditAction::JobResubmitted, EntityType::ImportJob, Severity::Low)
                .user(user)
                .entity(new_id)
                .meta("previousJobId", id.to_string())
                .meta("operation", "cli")
                .build();
            PgAuditLog::new(pool).record(&entry).await?;

            println!("Queued job {new_id} from failed job {id}");
        }
        Command::RecoverLeases => {
            let (queue, pool) = connect().await?;
            let pipeline = ImportPipeline::new(
                Arc::new(HttpFetcher::new()?),
                Arc::new(PgContentStore::new(pool.clone())),
                PipelineConfig::from_env(),
            );
            let workers = WorkerPool::new(queue, pipeline, Arc::new(PgAuditLog::new(pool)));
            let recovered = workers.reap_once().await?;
            println!("Recovered {recovered} expired leases");
        }
        Command::IssueToken { user, role } => {
            let role = match role.trim().to_lowercase().as_str() {
                "admin" => Role::Admin,
                "user" => Role::User,
                other => {
                    writeln!(io::stderr(), "error: unsupported role '{other}'. Use 'user' or 'admin'.")?;
                    std::process::exit(1);
                }
            };
            let config = AuthConfig::from_env()?;
            let token = JwtService::from_config(&config)?.issue_access_token(&user, role)?;
            println!("{}", token.token);
            eprintln!("expires at {}", token.expires_at.to_rfc3339());
        }
    }

    Ok(())
}

async fn connect() -> Result<(Arc<JobQueue>, PgPool), Box<dyn std::error::Error>> {
    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await?;

    let queue = JobQueue::open(Arc::new(PgJobBackend::new(pool.clone())), QueueConfig::from_env());
    Ok((Arc::new(queue), pool))
}
