//! Raw log archive: every ingested line, kept for a limited time and
//! addressable by `(time, checksum)`.

mod accessor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use controlcenter_postfix::Record;
use futures_util::future::BoxFuture;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

pub use accessor::{Content, ContentRow, RawLogsAccessor, RawLogsError, SumPair};

use crate::dbrunner::{Action, ActionSender, Cleanup, DbRunnerSettings, action, spawn_db_runner};
use crate::publisher::Publisher;
use crate::runner::Running;

#[derive(Debug, Clone, Copy)]
pub struct RawLogsSettings {
    /// Lines older than the most recent line minus this are deleted.
    pub max_age: Duration,
    pub cleaning_batch_size: i64,
    pub cleaning_frequency: Duration,
    pub runner: DbRunnerSettings,
}

impl Default for RawLogsSettings {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(90 * 24 * 3600),
            cleaning_batch_size: 10_000,
            cleaning_frequency: Duration::from_secs(30),
            runner: DbRunnerSettings { commit_interval: Duration::from_millis(500), queue_capacity: 1024 * 1000 },
        }
    }
}

/// Write side of the archive.
#[derive(Clone)]
pub struct RawLogs {
    actions: ActionSender,
}

/// Starts the writer on `pool`, with periodic retention cleanup.
pub fn spawn_rawlogs(
    pool: SqlitePool,
    settings: RawLogsSettings,
) -> (RawLogs, Running) {
    let RawLogsSettings { max_age, cleaning_batch_size, .. } = settings;
    let cleanup = Cleanup {
        every: settings.cleaning_frequency,
        build: Arc::new(move || clean_action(max_age, cleaning_batch_size)),
    };

    let (actions, running) = spawn_db_runner("rawlogs", pool, settings.runner, Some(cleanup));
    (RawLogs { actions }, running)
}

impl RawLogs {
    pub fn publisher(&self) -> RawLogsPublisher {
        RawLogsPublisher { actions: self.actions.clone() }
    }

    /// Queues one retention pass.
    pub async fn clean(
        &self,
        max_age: Duration,
        batch_size: i64,
    ) -> Result<()> {
        self.actions.send(clean_action(max_age, batch_size)).await
    }
}

#[derive(Clone)]
pub struct RawLogsPublisher {
    actions: ActionSender,
}

impl Publisher for RawLogsPublisher {
    fn publish(
        &self,
        record: Record,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let time = record.time.unix_timestamp();
            let sum = record.sum;
            let line = record.line;

            let insert = action(move |conn| Box::pin(insert_line(conn, time, sum, line)));
            if let Err(err) = self.actions.send(insert).await {
                warn!("raw log line dropped: time={time}, error={err:#}");
            }
        })
    }
}

async fn insert_line(
    conn: &mut SqliteConnection,
    time: i64,
    sum: i64,
    line: String,
) -> Result<()> {
    sqlx::query("insert into logs(time, checksum, content) values(?, ?, ?)")
        .bind(time)
        .bind(sum)
        .bind(line)
        .execute(&mut *conn)
        .await
        .context("failed to insert raw log line")?;
    Ok(())
}

fn clean_action(
    max_age: Duration,
    batch_size: i64,
) -> Action {
    action(move |conn| Box::pin(clean_old_lines(conn, max_age, batch_size)))
}

/// Deletes at most `batch_size` of the oldest lines that are older than
/// the most recent line minus `max_age`.
async fn clean_old_lines(
    conn: &mut SqliteConnection,
    max_age: Duration,
    batch_size: i64,
) -> Result<()> {
    let most_recent = sqlx::query_scalar::<_, i64>("select time from logs order by time desc limit 1")
        .fetch_optional(&mut *conn)
        .await
        .context("failed to query most recent raw log time")?;

    let Some(most_recent) = most_recent else {
        return Ok(());
    };

    let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    let oldest_to_keep = most_recent.saturating_sub(max_age);

    let result = sqlx::query(
        "delete from logs where id in (select id from logs where time < ? order by time, id asc limit ?)",
    )
    .bind(oldest_to_keep)
    .bind(batch_size)
    .execute(&mut *conn)
    .await
    .context("failed to delete old raw log lines")?;

    if result.rows_affected() > 0 {
        debug!("raw logs cleanup: deleted={}, oldest_kept={oldest_to_keep}", result.rows_affected());
    }

    Ok(())
}
