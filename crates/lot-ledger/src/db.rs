use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;

/// Connection pool plus the per-(owner, asset) lock registry.
///
/// The locks live here rather than on [`crate::LotLedger`] so every handle
/// built over the same storage serializes through the same registry, no
/// matter how many ledger or executor values get constructed around it.
#[derive(Clone)]
pub struct LedgerDb {
    pool: SqlitePool,
    pair_locks: Arc<DashMap<(String, String), Arc<Mutex<()>>>>,
}

impl LedgerDb {
    /// Create a new database connection
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            pair_locks: Arc::new(DashMap::new()),
        };
        db.init_schema().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        let schema = include_str!("../../../schema.sql");

        // Execute schema (split by statement since sqlx doesn't support multiple statements)
        for statement in schema.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&self.pool).await?;
            }
        }

        Ok(())
    }

    /// Get the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Lock guarding disposals on one (owner, asset) pair. Hold it across the
    /// read-check-write of any operation that consumes open quantity.
    pub fn pair_lock(&self, owner_id: &str, asset_id: &str) -> Arc<Mutex<()>> {
        self.pair_locks
            .entry((owner_id.to_string(), asset_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
