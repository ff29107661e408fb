use log::LevelFilter;
use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
use testcontainers::ImageExt;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::{
    ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
};
use thiserror::Error;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::jobs::migration::run_migrations;

const POSTGRES_TAG: &str = "16-alpine";

#[derive(Debug, Error)]
pub enum TestDatabaseError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("container error: {0}")]
    Container(#[from] TestcontainersError),
}

impl TestDatabaseError {
    /// True when no Postgres could be reached at all, so the test should skip.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            TestDatabaseError::Container(_) | TestDatabaseError::Sqlx(sqlx::Error::Io(_))
        )
    }
}

/// Ephemeral, migrated database for integration tests.
///
/// Uses `TEST_DATABASE_URL` when set, otherwise starts a disposable Postgres
/// container.
pub struct TestDatabase {
    pool: Option<PgPool>,
    admin_options: PgConnectOptions,
    database_name: String,
    container: Option<ContainerAsync<Postgres>>,
}

impl TestDatabase {
    pub async fn new() -> Result<Self, TestDatabaseError> {
        Self::provision(true).await
    }

    /// Like [`TestDatabase::new`] but leaves the schema empty.
    pub async fn unmigrated() -> Result<Self, TestDatabaseError> {
        Self::provision(false).await
    }

    async fn provision(migrate: bool) -> Result<Self, TestDatabaseError> {
        let (admin_url, container) = match std::env::var("TEST_DATABASE_URL") {
            Ok(url) if !url.is_empty() => (url, None),
            _ => {
                let container = Postgres::default().with_tag(POSTGRES_TAG).start().await?;
                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
                (url, Some(container))
            }
        };

        let base_options: PgConnectOptions = admin_url.parse()?;
        let base_options = base_options.log_statements(LevelFilter::Off);
        let base_name = base_options
            .get_database()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "postgres".to_string());

        let admin_options = base_options.clone().database("postgres");
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(admin_options.clone())
            .await?;

        let database_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE \"{database_name}\" TEMPLATE template0"))
            .execute(&admin_pool)
            .await?;
        admin_pool.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(base_options.database(&database_name))
            .await?;

        if migrate {
            run_migrations(&pool).await?;
        }

        Ok(Self {
            pool: Some(pool),
            admin_options,
            database_name,
            container,
        })
    }

    pub fn pool(&self) -> &PgPool {
        self.pool.as_ref().expect("test database pool is available")
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool().clone()
    }

    /// Close pool connections and drop the ephemeral database.
    pub async fn close(mut self) -> Result<(), TestDatabaseError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }

        drop_database(self.admin_options.clone(), &self.database_name).await?;
        self.container.take();
        Ok(())
    }
}

async fn drop_database(admin_options: PgConnectOptions, database_name: &str) -> Result<(), sqlx::Error> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(admin_options)
        .await?;

    sqlx::query(&format!("DROP DATABASE IF EXISTS \"{database_name}\" WITH (FORCE)"))
        .execute(&admin_pool)
        .await?;
    Ok(())
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };

        // Only external databases need dropping; a container takes its data with it.
        if self.container.is_none() {
            let admin_options = self.admin_options.clone();
            let db_name = self.database_name.clone();
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(async move {
                    pool.close().await;
                    let _ = drop_database(admin_options, &db_name).await;
                });
            }
        }
    }
}
