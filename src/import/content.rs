use rocket_db_pools::sqlx::{self, PgPool};
use thiserror::Error;
use uuid::Uuid;

use super::validate::NewContentPost;
use crate::jobs::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Uuid),
    /// The row key was already imported by an earlier attempt.
    AlreadyImported(Uuid),
}

#[derive(Debug, Error)]
pub enum ContentStoreError {
    /// The store refused this particular row.
    #[error("content store rejected the row: {0}")]
    Rejected(String),
    #[error("content store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for ContentStoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => ContentStoreError::Rejected(db.message().to_string()),
            other => ContentStoreError::Unavailable(other.to_string()),
        }
    }
}

/// Destination for imported posts. Creation is keyed on the row key.
#[rocket::async_trait]
pub trait ContentStore: Send + Sync {
    async fn create(
        &self,
        post: &NewContentPost,
        row_key: &str,
        source_job: JobId,
    ) -> Result<CreateOutcome, ContentStoreError>;
}

#[derive(Clone)]
pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[rocket::async_trait]
impl ContentStore for PgContentStore {
    async fn create(
        &self,
        post: &NewContentPost,
        row_key: &str,
        source_job: JobId,
    ) -> Result<CreateOutcome, ContentStoreError> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"INSERT INTO content_posts
                   (id, title, slug, content, description, category, tags, status,
                    source_job_id, import_row_key)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (import_row_key) DO NOTHING
               RETURNING id"#,
        )
        .bind(Uuid::new_v4())
        .bind(&post.title)
        .bind(&post.slug)
        .bind(&post.content)
        .bind(&post.description)
        .bind(post.category.as_str())
        .bind(&post.tags)
        .bind(post.status)
        .bind(source_job)
        .bind(row_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            return Ok(CreateOutcome::Created(id));
        }

        let (existing,): (Uuid,) =
            sqlx::query_as("SELECT id FROM content_posts WHERE import_row_key = $1")
                .bind(row_key)
                .fetch_one(&self.pool)
                .await?;

        Ok(CreateOutcome::AlreadyImported(existing))
    }
}
