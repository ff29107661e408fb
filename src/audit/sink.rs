use rocket_db_pools::sqlx::{self, PgPool};
use thiserror::Error;

use super::models::{AuditLogEntry, MAX_AUDIT_QUERY_LIMIT};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Append-only destination for audit entries.
#[rocket::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditLogEntry) -> Result<(), AuditError>;

    /// Most recent entries first.
    async fn recent(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError>;
}

/// Record an entry, logging instead of failing when the sink is down.
pub async fn record_or_log(sink: &dyn AuditSink, entry: AuditLogEntry) {
    if let Err(err) = sink.record(&entry).await {
        log::error!(
            "failed to record audit entry {} ({}, entity {:?}): {}",
            entry.action,
            entry.severity.as_str(),
            entry.entity_id,
            err
        );
    }
}

#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[rocket::async_trait]
impl AuditSink for PgAuditLog {
    async fn record(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        sqlx::query(
            r#"INSERT INTO audit_log
                   (id, action, user_id, entity_type, entity_id, metadata, severity, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(entry.id)
        .bind(&entry.action)
        .bind(&entry.user_id)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.metadata)
        .bind(entry.severity)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        let limit = limit.clamp(1, MAX_AUDIT_QUERY_LIMIT) as i64;
        let entries = sqlx::query_as::<_, AuditLogEntry>(
            r#"SELECT id, action, user_id, entity_type, entity_id, metadata, severity, created_at
               FROM audit_log
               ORDER BY created_at DESC
               LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}
