use algo_pipeline_core::DatabaseConfig;
use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Owns the Postgres pool shared by one stage's repositories.
#[derive(Debug, Clone)]
pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    /// Connects to the configured database and applies pending migrations.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established or a
    /// migration fails.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .context("Failed to connect to database")?;

        let client = Self { pool };
        client.migrate().await?;
        Ok(client)
    }

    /// Runs the embedded migrations, then turns `market_ohlc` into a
    /// hypertable when TimescaleDB is installed.
    ///
    /// # Errors
    /// Returns an error if a migration or the hypertable call fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;

        self.ensure_hypertable().await
    }

    async fn ensure_hypertable(&self) -> Result<()> {
        let (installed,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb')",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to check for TimescaleDB")?;

        if !installed {
            tracing::info!("TimescaleDB not installed, market_ohlc stays a plain table");
            return Ok(());
        }

        sqlx::query(
            r"
            SELECT create_hypertable('market_ohlc', 'timestamp',
                                     if_not_exists => TRUE, migrate_data => TRUE)
            ",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create market_ohlc hypertable")?;

        tracing::info!("market_ohlc is a TimescaleDB hypertable");
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
