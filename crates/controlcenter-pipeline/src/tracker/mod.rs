//! Delivery tracker: correlates parsed records into per-recipient
//! deliveries and hands them to the delivery store.

mod state;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use controlcenter_postfix::Record;
use futures_util::future::BoxFuture;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use state::{TrackerOutput, TrackerState};

use crate::announcer::TimeProbe;
use crate::delivery::{Delivery, RelayedBounceUpdate};
use crate::deliverydb::DeliveryDb;
use crate::publisher::Publisher;
use crate::runner::Running;

#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    /// Log time after which a silent queue entry is closed.
    pub queue_idle_timeout: Duration,
    pub prune_interval: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            queue_idle_timeout: Duration::from_secs(24 * 3600),
            prune_interval: Duration::from_secs(3600),
        }
    }
}

/// Where finished deliveries go.
pub trait DeliverySink: Send + Sync {
    fn deliver(
        &self,
        delivery: Delivery,
    ) -> BoxFuture<'_, Result<()>>;

    /// Stores `delivery` in place of the earlier final result for the same
    /// message and recipient.
    fn replace(
        &self,
        delivery: Delivery,
    ) -> BoxFuture<'_, Result<()>>;

    fn relayed_bounce(
        &self,
        bounce: RelayedBounceUpdate,
    ) -> BoxFuture<'_, Result<()>>;
}

impl DeliverySink for DeliveryDb {
    fn deliver(
        &self,
        delivery: Delivery,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.store(delivery))
    }

    fn replace(
        &self,
        delivery: Delivery,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(DeliveryDb::replace(self, delivery))
    }

    fn relayed_bounce(
        &self,
        bounce: RelayedBounceUpdate,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(DeliveryDb::relayed_bounce(self, bounce))
    }
}

/// Time of the last record the tracker went through.
#[derive(Debug, Default)]
pub struct TrackerProbe {
    last: Mutex<Option<OffsetDateTime>>,
}

impl TrackerProbe {
    fn set(
        &self,
        time: OffsetDateTime,
    ) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Some(last.map_or(time, |t| t.max(time)));
    }

    pub fn last(&self) -> Option<OffsetDateTime> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TimeProbe for TrackerProbe {
    fn most_recent_log_time(&self) -> BoxFuture<'_, Result<Option<OffsetDateTime>>> {
        Box::pin(async move { Ok(self.last()) })
    }
}

#[derive(Clone)]
pub struct Tracker {
    tx: mpsc::UnboundedSender<Record>,
    probe: Arc<TrackerProbe>,
}

impl Tracker {
    pub fn publisher(&self) -> TrackerPublisher {
        TrackerPublisher { tx: self.tx.clone() }
    }

    pub fn probe(&self) -> Arc<TrackerProbe> {
        self.probe.clone()
    }
}

#[derive(Clone)]
pub struct TrackerPublisher {
    tx: mpsc::UnboundedSender<Record>,
}

impl Publisher for TrackerPublisher {
    fn publish(
        &self,
        record: Record,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.tx.send(record).is_err() {
                debug!("record dropped, tracker stopped");
            }
        })
    }
}

pub fn spawn_tracker(
    sink: Arc<dyn DeliverySink>,
    settings: TrackerSettings,
) -> (Tracker, Running) {
    let (tx, rx) = mpsc::unbounded_channel();
    let probe = Arc::new(TrackerProbe::default());
    let state = TrackerState::new(settings.queue_idle_timeout, settings.prune_interval);

    let task_probe = probe.clone();
    let running = Running::spawn("tracker", move |cancel| run(rx, state, sink, task_probe, cancel));

    (Tracker { tx, probe }, running)
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Record>,
    mut state: TrackerState,
    sink: Arc<dyn DeliverySink>,
    probe: Arc<TrackerProbe>,
    cancel: CancellationToken,
) -> Result<()> {
    info!("tracker started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            record = rx.recv() => {
                let Some(record) = record else {
                    break;
                };
                process(&mut state, &record, sink.as_ref()).await?;
                probe.set(record.time);
            }
        }
    }

    rx.close();
    while let Ok(record) = rx.try_recv() {
        process(&mut state, &record, sink.as_ref()).await?;
        probe.set(record.time);
    }

    let open = state.open_entries();
    emit(state.close_all(), sink.as_ref()).await?;
    info!("tracker stopped: closed_entries={}", open);

    Ok(())
}

async fn process(
    state: &mut TrackerState,
    record: &Record,
    sink: &dyn DeliverySink,
) -> Result<()> {
    emit(state.handle(record), sink).await
}

async fn emit(
    outputs: Vec<TrackerOutput>,
    sink: &dyn DeliverySink,
) -> Result<()> {
    for output in outputs {
        match output {
            TrackerOutput::Delivery(delivery) => {
                debug!(
                    "delivery: queue={}, recipient={}, status={}",
                    delivery.queue, delivery.recipient, delivery.status,
                );
                sink.deliver(*delivery).await.context("failed to store delivery")?;
            }
            TrackerOutput::Replacement(delivery) => {
                debug!(
                    "delivery replaced: queue={}, recipient={}, status={}",
                    delivery.queue, delivery.recipient, delivery.status,
                );
                sink.replace(*delivery).await.context("failed to replace delivery")?;
            }
            TrackerOutput::RelayedBounce(bounce) => {
                sink.relayed_bounce(bounce).await.context("failed to apply relayed bounce")?;
            }
        }
    }

    Ok(())
}
