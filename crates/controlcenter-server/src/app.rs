use std::sync::Arc;

use anyhow::{Context, Result};
use controlcenter_pipeline::announcer::{LogImportAnnouncer, TimeProbe, spawn_synchronizing_announcer};
use controlcenter_pipeline::db::{DELIVERYDB_MIGRATOR, Database, MASTER_MIGRATOR, RAWLOGS_MIGRATOR};
use controlcenter_pipeline::deliverydb::{DeliveryAccessor, DeliveryDbSettings, spawn_deliverydb};
use controlcenter_pipeline::metadata::Metadata;
use controlcenter_pipeline::postfixversion::VersionPublisher;
use controlcenter_pipeline::rawlogs::spawn_rawlogs;
use controlcenter_pipeline::sources::{DirSettings, DirSource, SocketAddress, SocketSource, open_file, stdin_source};
use controlcenter_pipeline::tracker::spawn_tracker;
use controlcenter_pipeline::transform::{TransformerArgs, TransformerRegistry};
use controlcenter_pipeline::{Clock, MultiPublisher, Publisher, ReadContext, RealClock, Running, read_lines};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, SourceKind};

/// Databases of the workspace.
struct Databases {
    logs: Database,
    rawlogs: Database,
    master: Database,
}

impl Databases {
    async fn open(config: &Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.workspace)
            .await
            .with_context(|| format!("failed to create workspace {}", config.workspace.display()))?;

        Ok(Self {
            logs: Database::open(&config.logs_db_path(), &DELIVERYDB_MIGRATOR).await?,
            rawlogs: Database::open(&config.rawlogs_db_path(), &RAWLOGS_MIGRATOR).await?,
            master: Database::open(&config.master_db_path(), &MASTER_MIGRATOR).await?,
        })
    }

    async fn close(&self) {
        self.logs.close().await;
        self.rawlogs.close().await;
        self.master.close().await;
    }
}

/// Runs the pipeline until `shutdown` fires, the source ends or a store
/// fails, then stops every component from the source down.
pub async fn run(
    config: Config,
    shutdown: CancellationToken,
) -> Result<()> {
    let dbs = Databases::open(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(RealClock);

    let (deliverydb, deliverydb_running) = spawn_deliverydb(
        dbs.logs.writer.clone(),
        DeliveryDbSettings { runner: config.runner_settings(), ..DeliveryDbSettings::default() },
    );
    let (rawlogs, rawlogs_running) = spawn_rawlogs(dbs.rawlogs.writer.clone(), config.rawlogs_settings());
    let (tracker, tracker_running) = spawn_tracker(Arc::new(deliverydb), config.tracker_settings());
    let metadata = Metadata::new(dbs.master.writer.clone(), dbs.master.reader.clone());

    let consumers: Vec<Arc<dyn Publisher>> = vec![
        Arc::new(tracker.publisher()),
        Arc::new(rawlogs.publisher()),
        Arc::new(VersionPublisher::new(metadata)),
    ];
    let publisher: Arc<dyn Publisher> = Arc::new(MultiPublisher::new(consumers));

    let primary: Arc<dyn TimeProbe> = Arc::new(DeliveryAccessor::new(dbs.logs.reader.clone()));
    let secondary: Arc<dyn TimeProbe> = tracker.probe();
    let (announcer, announcer_running) = spawn_synchronizing_announcer(
        Arc::new(LogImportAnnouncer),
        clock.clone(),
        primary,
        secondary,
        config.sync_settings(),
    );

    let transformer = TransformerRegistry::builtin()
        .builder(&config.log_format, TransformerArgs { clock: clock.clone(), year: config.year() })
        .context("invalid log format")?;

    let ctx = ReadContext { publisher, transformer, announcer, clock, idle_timeout: config.reader_idle_timeout };

    let source_running = match spawn_source(&config, ctx).await {
        Ok(running) => running,
        Err(err) => {
            let stopped = stop_all(vec![tracker_running, deliverydb_running, rawlogs_running, announcer_running]).await;
            if let Err(stop_err) = stopped {
                warn!("pipeline stopped with error: error={stop_err:#}");
            }
            dbs.close().await;
            return Err(err);
        }
    };

    info!(
        "pipeline running: source={:?}, workspace={}, format={}",
        config.source,
        config.workspace.display(),
        config.log_format,
    );

    tokio::select! {
        _ = shutdown.cancelled() => info!("shutdown requested"),
        _ = source_running.exited() => info!("log source finished"),
        _ = tracker_running.exited() => warn!("tracker stopped unexpectedly"),
        _ = deliverydb_running.exited() => warn!("delivery store stopped unexpectedly"),
        _ = rawlogs_running.exited() => warn!("raw log store stopped unexpectedly"),
    }

    let result = stop_all(vec![
        source_running,
        tracker_running,
        deliverydb_running,
        rawlogs_running,
        announcer_running,
    ])
    .await;

    dbs.close().await;
    info!("pipeline stopped: ok={}", result.is_ok());
    result
}

/// Stops in order, so every component drains into the next one.
async fn stop_all(runnings: Vec<Running>) -> Result<()> {
    for running in &runnings {
        running.cancel();
        running.exited().await;
    }

    Running::join_all(runnings).await
}

async fn spawn_source(
    config: &Config,
    ctx: ReadContext,
) -> Result<Running> {
    let log_path = config.log_path.clone().unwrap_or_default();

    let running = match config.source {
        SourceKind::File => {
            let source = open_file(&log_path).await?;
            Running::spawn("source", move |cancel| async move { read_lines(source, &ctx, cancel).await })
        }
        SourceKind::Stdin => {
            let source = stdin_source();
            Running::spawn("source", move |cancel| async move { read_lines(source, &ctx, cancel).await })
        }
        SourceKind::Directory => {
            let settings = DirSettings { bases: config.log_patterns.clone(), follow: config.follow, ..DirSettings::default() };
            let source = DirSource::open(&log_path, settings).await?;
            Running::spawn("source", move |cancel| async move { read_lines(source, &ctx, cancel).await })
        }
        SourceKind::Socket => {
            let description = config.socket.clone().unwrap_or_default();
            let address: SocketAddress = description.parse()?;
            let source = SocketSource::bind(&address).await?;
            let timeout = config.socket_connection_timeout;
            Running::spawn("source", move |cancel| source.serve(ctx, timeout, cancel))
        }
    };

    Ok(running)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::bail;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn components_stop_in_order_and_report_the_first_error() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let component = |name: &'static str, fail: bool| {
            let order = order.clone();
            Running::spawn(name, move |cancel| async move {
                cancel.cancelled().await;
                order.lock().expect("order lock").push(name);
                if fail {
                    bail!("{name} broken");
                }
                Ok(())
            })
        };

        let runnings = vec![component("source", false), component("tracker", true), component("store", true)];
        let err = timeout(Duration::from_secs(2), stop_all(runnings))
            .await
            .expect("components should stop")
            .expect_err("a component failed");

        assert_eq!(*order.lock().expect("order lock"), vec!["source", "tracker", "store"]);
        assert!(format!("{err:#}").contains("tracker broken"));
    }
}
