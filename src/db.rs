use rocket_db_pools::{Database, sqlx};

/// Postgres pool holding import jobs, content posts and the audit log.
#[derive(Database)]
#[database("import_db")]
pub struct ImportDb(sqlx::PgPool);
