//! Serialized writer: every write to a database is an [`Action`] queued to
//! one task that owns the only writable connection.
//!
//! Actions run inside a transaction that is committed on a timer, so a
//! burst of inserts costs one commit. A failing action is rolled back on
//! its own, the actions before it are committed and the runner stops with
//! the error.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures_util::future::BoxFuture;
use sqlx::{Connection, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::debug;

use crate::runner::Running;

pub type Action =
    Box<dyn for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> + Send>;

/// Boxes a closure as an [`Action`], typically
/// `action(move |conn| Box::pin(insert_row(conn, row)))`.
pub fn action<F>(f: F) -> Action
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> + Send + 'static,
{
    Box::new(f)
}

/// Produces the periodic cleanup action.
pub type CleanupBuilder = Arc<dyn Fn() -> Action + Send + Sync>;

#[derive(Clone)]
pub struct Cleanup {
    pub every: Duration,
    pub build: CleanupBuilder,
}

#[derive(Debug, Clone, Copy)]
pub struct DbRunnerSettings {
    pub commit_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for DbRunnerSettings {
    fn default() -> Self {
        Self { commit_interval: Duration::from_millis(500), queue_capacity: 1024 }
    }
}

/// Write side handed to producers.
#[derive(Clone)]
pub struct ActionSender {
    name: &'static str,
    tx: mpsc::Sender<Action>,
}

impl ActionSender {
    /// Waits for room in the queue.
    pub async fn send(
        &self,
        action: Action,
    ) -> Result<()> {
        self.tx
            .send(action)
            .await
            .map_err(|_| anyhow!("database runner stopped: name={}", self.name))
    }
}

struct State {
    name: &'static str,
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    executed: u64,
}

impl State {
    async fn execute(
        &mut self,
        action: Action,
    ) -> Result<()> {
        let mut tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await.context("failed to begin transaction")?,
        };

        let mut savepoint = Connection::begin(&mut *tx).await.context("failed to open savepoint")?;

        if let Err(err) = action(&mut *savepoint).await {
            savepoint.rollback().await.context("failed to roll back failed action")?;
            self.tx = Some(tx);
            self.commit().await?;
            return Err(err.context(format!("database action failed: runner={}", self.name)));
        }

        savepoint.commit().await.context("failed to release savepoint")?;
        self.tx = Some(tx);
        self.executed += 1;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };

        tx.commit()
            .await
            .with_context(|| format!("failed to commit: runner={}", self.name))?;

        debug!("database commit: runner={}, actions={}", self.name, self.executed);
        self.executed = 0;
        Ok(())
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}

/// Starts the writer task for `pool`, which should allow a single
/// connection. On cancel, queued actions still run and are committed
/// before the task ends.
pub fn spawn_db_runner(
    name: &'static str,
    pool: SqlitePool,
    settings: DbRunnerSettings,
    cleanup: Option<Cleanup>,
) -> (ActionSender, Running) {
    let (tx, mut rx) = mpsc::channel::<Action>(settings.queue_capacity.max(1));
    let sender = ActionSender { name, tx };

    let running = Running::spawn(name, move |cancel| async move {
        let mut state = State { name, pool, tx: None, executed: 0 };

        let mut commit_tick = interval(settings.commit_interval);
        commit_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cleanup_tick = cleanup.as_ref().map(|cleanup| {
            let mut tick = interval(cleanup.every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(action) => state.execute(action).await?,
                    None => break,
                },
                _ = commit_tick.tick() => state.commit().await?,
                _ = tick(&mut cleanup_tick) => {
                    if let Some(cleanup) = cleanup.as_ref() {
                        state.execute((cleanup.build)()).await?;
                    }
                }
            }
        }

        rx.close();
        let mut drained = 0usize;
        while let Some(action) = rx.recv().await {
            state.execute(action).await?;
            drained += 1;
        }

        state.commit().await?;
        debug!("database runner stopped: name={name}, drained={drained}");
        Ok(())
    });

    (sender, running)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use tokio::time::timeout;

    use super::*;
    use crate::db::Database;

    pub(crate) fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("controlcenter-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    async fn open_counter_db() -> SqlitePool {
        let path = temp_dir().join("counter.db");
        let options = sqlx::sqlite::SqliteConnectOptions::new().filename(&path).create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("open");

        sqlx::query("create table counter(value integer not null)")
            .execute(&pool)
            .await
            .expect("create");
        pool
    }

    async fn insert_value(
        conn: &mut SqliteConnection,
        value: i64,
    ) -> Result<()> {
        sqlx::query("insert into counter(value) values(?)")
            .bind(value)
            .execute(&mut *conn)
            .await
            .context("failed to insert value")?;
        Ok(())
    }

    async fn insert_into_missing_table(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("insert into missing_table values(1)")
            .execute(&mut *conn)
            .await
            .context("failed to insert into missing table")?;
        Ok(())
    }

    fn insert(value: i64) -> Action {
        action(move |conn| Box::pin(insert_value(conn, value)))
    }

    async fn values(pool: &SqlitePool) -> Vec<i64> {
        sqlx::query_scalar("select value from counter order by rowid")
            .fetch_all(pool)
            .await
            .expect("select")
    }

    #[tokio::test]
    async fn queued_actions_are_committed_on_stop() {
        let pool = open_counter_db().await;
        let settings = DbRunnerSettings { commit_interval: Duration::from_secs(3600), queue_capacity: 8 };
        let (sender, running) = spawn_db_runner("counter", pool.clone(), settings, None);

        for value in 1..=5 {
            sender.send(insert(value)).await.expect("send");
        }

        timeout(Duration::from_secs(5), running.stop())
            .await
            .expect("runner should stop")
            .expect("runner should succeed");

        assert_eq!(values(&pool).await, vec![1, 2, 3, 4, 5]);
        assert!(sender.send(insert(6)).await.is_err());
    }

    async fn insert_then_fail(
        conn: &mut SqliteConnection,
        value: i64,
    ) -> Result<()> {
        insert_value(conn, value).await?;
        insert_into_missing_table(conn).await
    }

    #[tokio::test]
    async fn failing_action_stops_the_runner_without_its_writes() {
        let pool = open_counter_db().await;
        let settings = DbRunnerSettings { commit_interval: Duration::from_secs(3600), queue_capacity: 8 };
        let (sender, running) = spawn_db_runner("counter", pool.clone(), settings, None);

        sender.send(insert(1)).await.expect("send");
        sender
            .send(action(|conn| Box::pin(insert_then_fail(conn, 99))))
            .await
            .expect("send");
        sender.send(insert(2)).await.expect("send");

        let err = timeout(Duration::from_secs(5), running.done())
            .await
            .expect("runner should end on its own")
            .expect_err("runner should fail");

        assert!(format!("{err:#}").contains("database action failed: runner=counter"));
        assert_eq!(values(&pool).await, vec![1]);
        assert!(sender.send(insert(3)).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_runs_periodically() {
        let pool = open_counter_db().await;
        let cleanup = Cleanup { every: Duration::from_millis(20), build: Arc::new(|| insert(0)) };
        let settings = DbRunnerSettings { commit_interval: Duration::from_millis(10), queue_capacity: 8 };
        let (_sender, running) = spawn_db_runner("counter", pool.clone(), settings, Some(cleanup));

        tokio::time::sleep(Duration::from_millis(200)).await;
        running.stop().await.expect("runner should succeed");

        assert!(values(&pool).await.len() >= 2);
    }

    #[tokio::test]
    async fn migrations_apply_on_open() {
        let dir = temp_dir();
        let db = Database::open(&dir.join("rawlogs.db"), &crate::db::RAWLOGS_MIGRATOR).await.expect("open");

        let count: i64 = sqlx::query_scalar("select count(*) from logs")
            .fetch_one(&db.reader)
            .await
            .expect("logs table");
        assert_eq!(count, 0);
        db.close().await;
    }
}
