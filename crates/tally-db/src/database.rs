//! Connection pool and schema for the PostgreSQL item store.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tally_core::AppError;

use crate::config::DatabaseConfig;
use crate::item_repository::PgItemStore;

/// A migrated pool. Every [`PgItemStore`] handed out shares it.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect and bring the `items` schema up to date.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect to item store: {e}")))?;

        let database = Self::from_pool(pool);
        database.migrate().await?;
        tracing::info!(max_connections = config.max_connections, "Item store ready");
        Ok(database)
    }

    /// Wrap a pool opened elsewhere. The schema is left as found.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations. Already-applied ones are skipped.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Item store migration failed: {e}")))
    }

    pub fn item_store(&self) -> PgItemStore {
        PgItemStore::new(self.pool.clone())
    }
}
