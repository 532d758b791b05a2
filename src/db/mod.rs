//! Database connection pool, migrations, and health check.
//!
//! One `Db` is constructed at process start and shared by every log handle
//! opened from it. Call [`Db::close`] at shutdown to drain the pool.

use crate::error::{Error, Result};
use crate::log::PgLog;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// How many connections the pool should hold.
///
/// Each worker holds at most one connection at a time for queue operations,
/// each API instance likewise for producer and gateway reads; every opened
/// log adds one dedicated `LISTEN` connection on top.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizing {
    pub workers: u32,
    pub api_instances: u32,
    pub logs: u32,
}

impl PoolSizing {
    pub fn max_connections(&self) -> u32 {
        (self.workers + self.api_instances + self.logs).max(2)
    }
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            workers: 4,
            api_instances: 1,
            logs: 3,
        }
    }
}

/// Database handle. Owns the connection pool shared across all logs.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, sizing: PoolSizing) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(sizing.max_connections())
            .connect(url)
            .await?;
        info!(
            max_connections = sizing.max_connections(),
            "database pool connected"
        );
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Open a named log backed by this pool.
    pub async fn open_log(&self, name: &str) -> Result<PgLog> {
        PgLog::open(self.pool.clone(), name).await
    }

    /// Close every connection. Outstanding log handles fail afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("database pool closed");
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
