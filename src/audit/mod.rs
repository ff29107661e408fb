//! Append-only audit trail for submissions and job outcomes.

pub mod events;
pub mod models;
pub mod sink;

pub use events::job_outcome;
pub use models::{AuditAction, AuditLogEntry, EntityType, Severity};
pub use sink::{AuditError, AuditSink, PgAuditLog, record_or_log};
