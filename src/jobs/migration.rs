//! Database migration management.
//!
//! Migrations are embedded at compile time and applied before the server
//! starts accepting submissions.

use rocket_db_pools::sqlx::{self, PgPool, migrate::Migrator};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply any pending migrations. Already-applied migrations are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    log::info!("checking database migration state");
    MIGRATOR.run(pool).await?;
    log::info!("database migrations up to date");
    Ok(())
}

/// Roll back every applied migration. Used by tests that need a clean schema.
pub async fn undo_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    log::info!("reverting all database migrations");
    MIGRATOR.undo(pool, 0).await
}
