//! Durable import job queue and the worker pool that drains it.

pub mod config;
pub mod migration;
pub mod model;
pub mod postgres;
pub mod store;
pub mod worker;

pub use config::QueueConfig;
pub use model::{
    ClaimedJob, Disposition, ImportPayload, Job, JobFailure, JobId, JobKind, JobResult, JobState,
    JobStatusView, Lease,
};
pub use postgres::PgJobBackend;
pub use store::{JobBackend, JobQueue, JobStoreError};
pub use worker::{JobOutcome, WorkerPool};
