//! SQLite destination store
//!
//! One pooled connection per concurrent dataset load. SQLite serializes the
//! writers itself; WAL mode plus a busy timeout makes a second writer wait for
//! the lock instead of failing.

use crate::dataset::DatasetSpec;
use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// How long a writer waits for another writer's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the destination database
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database file at `path`
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(path = %path.display(), max_connections, "Opened store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the dataset's table unless it already exists
    pub async fn ensure_table(&self, spec: &DatasetSpec) -> Result<()> {
        sqlx::query(&spec.create_table_sql())
            .execute(&self.pool)
            .await?;
        debug!(table = %spec.table, "Table ready");
        Ok(())
    }

    pub async fn count_rows(&self, spec: &DatasetSpec) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) AS count FROM {}",
            crate::dataset::quote_ident(&spec.table)
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get("count")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Every row of the dataset's table in insertion order, values in schema order
    pub async fn fetch_rows(&self, spec: &DatasetSpec) -> Result<Vec<Vec<Option<String>>>> {
        let rows = sqlx::query(&spec.select_all_sql())
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = (0..spec.arity())
                .map(|i| row.try_get::<Option<String>, _>(i))
                .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;
            out.push(values);
        }
        Ok(out)
    }

    /// Wait for every connection to be returned and close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
