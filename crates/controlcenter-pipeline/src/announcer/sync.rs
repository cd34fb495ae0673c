use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ImportAnnouncer, Progress};
use crate::clock::Clock;
use crate::runner::Running;

/// Most recent log time a downstream consumer has processed.
pub trait TimeProbe: Send + Sync {
    fn most_recent_log_time(&self) -> BoxFuture<'_, Result<Option<OffsetDateTime>>>;
}

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub sleep: Duration,
    pub primary_timeout: Duration,
    pub secondary_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sleep: Duration::from_millis(500),
            primary_timeout: Duration::from_secs(40),
            secondary_timeout: Duration::from_secs(80),
        }
    }
}

/// Front of the synchronizing announcer, handed to readers.
struct SyncFront {
    inner: Arc<dyn ImportAnnouncer>,
    tx: mpsc::UnboundedSender<Progress>,
}

impl ImportAnnouncer for SyncFront {
    fn announce_start(
        &self,
        time: Option<OffsetDateTime>,
    ) {
        self.inner.announce_start(time);
    }

    fn announce_progress(
        &self,
        progress: Progress,
    ) {
        if self.tx.send(progress).is_err() {
            debug!("progress dropped after import end: progress={}", progress.progress);
        }
    }
}

struct Waiter {
    clock: Arc<dyn Clock>,
    primary: Arc<dyn TimeProbe>,
    secondary: Arc<dyn TimeProbe>,
    settings: SyncSettings,
}

/// Wraps `inner` so that each progress step is only forwarded once the
/// primary probe has moved past the step time, or stopped moving for the
/// primary timeout. The finished step, if the primary stalled, also waits
/// for the secondary probe in the same way. Steps without a time go
/// through untouched.
pub fn spawn_synchronizing_announcer(
    inner: Arc<dyn ImportAnnouncer>,
    clock: Arc<dyn Clock>,
    primary: Arc<dyn TimeProbe>,
    secondary: Arc<dyn TimeProbe>,
    settings: SyncSettings,
) -> (Arc<dyn ImportAnnouncer>, Running) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();
    let front: Arc<dyn ImportAnnouncer> = Arc::new(SyncFront { inner: inner.clone(), tx });
    let waiter = Waiter { clock, primary, secondary, settings };

    let running = Running::spawn("synchronizing announcer", move |cancel| async move {
        loop {
            let progress = tokio::select! {
                _ = cancel.cancelled() => {
                    rx.close();
                    debug!("synchronizing announcer cancelled");
                    return Ok(());
                }
                maybe = rx.recv() => match maybe {
                    Some(progress) => progress,
                    None => return Ok(()),
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    rx.close();
                    debug!("synchronizing announcer cancelled while waiting: progress={}", progress.progress);
                    return Ok(());
                }
                waited = waiter.wait_for(progress) => waited?,
            }

            inner.announce_progress(progress);

            if progress.finished {
                return Ok(());
            }
        }
    });

    (front, running)
}

impl Waiter {
    async fn wait_for(
        &self,
        progress: Progress,
    ) -> Result<()> {
        let Some(time) = progress.time else {
            return Ok(());
        };

        let primary_passed = self
            .wait_until_past(self.primary.as_ref(), time, self.settings.primary_timeout)
            .await
            .context("primary log time probe failed")?;

        if progress.finished && !primary_passed {
            self.wait_until_past(self.secondary.as_ref(), time, self.settings.secondary_timeout)
                .await
                .context("secondary log time probe failed")?;
        }

        Ok(())
    }

    /// Polls `probe` until it reports a time after `target`. Gives up, and
    /// returns `false`, once the probe value has not changed for `timeout`.
    async fn wait_until_past(
        &self,
        probe: &dyn TimeProbe,
        target: OffsetDateTime,
        timeout: Duration,
    ) -> Result<bool> {
        let mut last_seen: Option<Option<OffsetDateTime>> = None;
        let mut last_change_at = self.clock.now();

        loop {
            let value = probe.most_recent_log_time().await?;

            if value.is_some_and(|value| value > target) {
                return Ok(true);
            }

            let now = self.clock.now();

            if last_seen != Some(value) {
                last_seen = Some(value);
                last_change_at = now;
            } else if now - last_change_at >= timeout {
                debug!("log time probe stalled: target={target}, last_seen={value:?}");
                return Ok(false);
            }

            self.clock.sleep(self.settings.sleep).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use time::macros::datetime;
    use tokio::time::timeout;

    use super::*;
    use crate::announcer::{DummyImportAnnouncer, Notifier, skip};
    use crate::clock::{FakeClock, RealClock};

    struct SequenceProbe {
        values: Mutex<VecDeque<OffsetDateTime>>,
        calls: AtomicUsize,
    }

    impl SequenceProbe {
        fn new(values: Vec<OffsetDateTime>) -> Arc<Self> {
            Arc::new(Self { values: Mutex::new(values.into()), calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TimeProbe for SequenceProbe {
        fn most_recent_log_time(&self) -> BoxFuture<'_, Result<Option<OffsetDateTime>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut values = self.values.lock().expect("probe lock");
            // the last value repeats forever
            let value = if values.len() > 1 { values.pop_front() } else { values.front().copied() };
            Box::pin(async move { Ok(value) })
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            sleep: Duration::from_secs(1),
            primary_timeout: Duration::from_secs(3),
            secondary_timeout: Duration::from_secs(6),
        }
    }

    #[tokio::test]
    async fn finished_step_waits_for_secondary_when_primary_stalls() {
        let clock = Arc::new(FakeClock::new(datetime!(2020-10-10 00:00:00 UTC)));
        let base = datetime!(2000-01-01 00:00:00 UTC);
        let at = |secs: i64| base + time::Duration::seconds(secs);

        let primary = SequenceProbe::new(vec![at(12), at(22), at(23), at(23), at(34), at(45), at(55)]);
        let secondary = SequenceProbe::new(vec![at(45), at(46), at(46), at(46), at(61)]);
        let dummy = Arc::new(DummyImportAnnouncer::new());

        let (announcer, running) = spawn_synchronizing_announcer(
            dummy.clone(),
            clock.clone(),
            primary.clone(),
            secondary.clone(),
            settings(),
        );

        {
            let mut notifier = Notifier::new(announcer.as_ref(), 20);
            notifier.start(base);
            for secs in [10, 20, 30, 35, 50] {
                notifier.step(at(secs));
            }
            notifier.end(at(60));
        }

        timeout(Duration::from_secs(5), running.done())
            .await
            .expect("announcer should finish")
            .expect("announcer should succeed");

        let expected = vec![
            Progress { finished: false, time: Some(at(10)), progress: 5 },
            Progress { finished: false, time: Some(at(20)), progress: 10 },
            Progress { finished: false, time: Some(at(30)), progress: 15 },
            Progress { finished: false, time: Some(at(35)), progress: 20 },
            Progress { finished: false, time: Some(at(50)), progress: 25 },
            Progress { finished: true, time: Some(at(60)), progress: 100 },
        ];

        assert_eq!(dummy.start(), Some(Some(base)));
        assert_eq!(dummy.progress(), expected);
        assert_eq!(primary.calls(), 11);
        assert_eq!(secondary.calls(), 5);
        assert_eq!(clock.now(), datetime!(2020-10-10 00:00:09 UTC));
    }

    #[tokio::test]
    async fn skipped_import_is_forwarded_without_probing() {
        let clock = Arc::new(FakeClock::new(datetime!(2020-10-10 00:00:00 UTC)));
        let primary = SequenceProbe::new(vec![datetime!(2000-01-01 00:00:00 UTC)]);
        let secondary = SequenceProbe::new(vec![datetime!(2000-01-01 00:00:00 UTC)]);
        let dummy = Arc::new(DummyImportAnnouncer::new());

        let (announcer, running) = spawn_synchronizing_announcer(
            dummy.clone(),
            clock.clone(),
            primary.clone(),
            secondary.clone(),
            settings(),
        );

        skip(announcer.as_ref());

        timeout(Duration::from_secs(5), running.done())
            .await
            .expect("announcer should finish")
            .expect("announcer should succeed");

        assert_eq!(dummy.start(), Some(None));
        assert_eq!(dummy.progress(), vec![Progress { finished: true, time: None, progress: 100 }]);
        assert_eq!(primary.calls(), 0);
        assert_eq!(secondary.calls(), 0);
        assert_eq!(clock.now(), datetime!(2020-10-10 00:00:00 UTC));
    }

    #[tokio::test]
    async fn cancel_interrupts_a_pending_wait() {
        let stuck = datetime!(2000-01-01 00:00:00 UTC);
        let primary = SequenceProbe::new(vec![stuck]);
        let secondary = SequenceProbe::new(vec![stuck]);
        let dummy = Arc::new(DummyImportAnnouncer::new());
        let settings = SyncSettings {
            sleep: Duration::from_millis(20),
            primary_timeout: Duration::from_secs(20),
            secondary_timeout: Duration::from_secs(20),
        };

        let (announcer, running) =
            spawn_synchronizing_announcer(dummy.clone(), Arc::new(RealClock), primary.clone(), secondary, settings);

        {
            let mut notifier = Notifier::new(announcer.as_ref(), 1);
            notifier.start(stuck);
            notifier.end(stuck + time::Duration::minutes(1));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(primary.calls() > 0);

        timeout(Duration::from_secs(2), running.stop())
            .await
            .expect("announcer should stop promptly")
            .expect("announcer should succeed");

        assert_eq!(dummy.start(), Some(Some(stuck)));
        assert!(dummy.progress().is_empty());
    }
}
