use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::debug;

pub static RAWLOGS_MIGRATOR: Migrator = sqlx::migrate!("./migrations/rawlogs");
pub static DELIVERYDB_MIGRATOR: Migrator = sqlx::migrate!("./migrations/deliverydb");
pub static MASTER_MIGRATOR: Migrator = sqlx::migrate!("./migrations/master");

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const READER_CONNECTIONS: u32 = 4;

/// One SQLite file: a single connection for writes, a pool for reads.
#[derive(Debug, Clone)]
pub struct Database {
    pub writer: SqlitePool,
    pub reader: SqlitePool,
}

impl Database {
    /// Creates the file if needed and applies `migrator` before the read
    /// pool is opened.
    pub async fn open(
        path: &Path,
        migrator: &Migrator,
    ) -> Result<Self> {
        let filename = path.to_string_lossy();

        let base = SqliteConnectOptions::new()
            .filename(path)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                base.clone()
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal),
            )
            .await
            .with_context(|| format!("failed to open database for writing: path={filename}"))?;

        migrator
            .run(&writer)
            .await
            .with_context(|| format!("failed to migrate database: path={filename}"))?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(base.read_only(true))
            .await
            .with_context(|| format!("failed to open database for reading: path={filename}"))?;

        debug!("database opened: path={filename}");
        Ok(Self { writer, reader })
    }

    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}
