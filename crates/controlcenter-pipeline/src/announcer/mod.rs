//! Import progress reporting.
//!
//! A reader announces the start of an import, then monotonic progress steps
//! and exactly one finished step. Consumers such as the synchronizing
//! announcer wrap another announcer and decide when to forward.

mod sync;

use std::sync::Mutex;

use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::info;

pub use sync::{SyncSettings, TimeProbe, spawn_synchronizing_announcer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub finished: bool,
    /// Time of the last log line behind this step. `None` when the import
    /// was skipped.
    pub time: Option<OffsetDateTime>,
    pub progress: i64,
}

pub trait ImportAnnouncer: Send + Sync {
    fn announce_start(
        &self,
        time: Option<OffsetDateTime>,
    );

    fn announce_progress(
        &self,
        progress: Progress,
    );
}

/// Announces a finished import without any log time.
pub fn skip(announcer: &dyn ImportAnnouncer) {
    announcer.announce_start(None);
    announcer.announce_progress(Progress { finished: true, time: None, progress: 100 });
}

/// Splits an import into a fixed number of steps.
#[cfg(test)]
pub(crate) struct Notifier<'a> {
    announcer: &'a dyn ImportAnnouncer,
    steps: i64,
    current: i64,
}

#[cfg(test)]
impl<'a> Notifier<'a> {
    pub(crate) fn new(
        announcer: &'a dyn ImportAnnouncer,
        steps: i64,
    ) -> Self {
        Self { announcer, steps: steps.max(1), current: 0 }
    }

    pub(crate) fn start(
        &mut self,
        time: OffsetDateTime,
    ) {
        self.announcer.announce_start(Some(time));
    }

    pub(crate) fn step(
        &mut self,
        time: OffsetDateTime,
    ) {
        self.current += 1;
        let progress = (self.current * 100 / self.steps).min(100);
        self.announcer.announce_progress(Progress { finished: false, time: Some(time), progress });
    }

    pub(crate) fn end(
        &mut self,
        time: OffsetDateTime,
    ) {
        self.announcer.announce_progress(Progress { finished: true, time: Some(time), progress: 100 });
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyImportAnnouncer;

impl ImportAnnouncer for EmptyImportAnnouncer {
    fn announce_start(
        &self,
        _time: Option<OffsetDateTime>,
    ) {
    }

    fn announce_progress(
        &self,
        _progress: Progress,
    ) {
    }
}

/// Reports progress to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogImportAnnouncer;

impl ImportAnnouncer for LogImportAnnouncer {
    fn announce_start(
        &self,
        time: Option<OffsetDateTime>,
    ) {
        match time {
            Some(time) => info!("log import started: time={time}"),
            None => info!("log import skipped"),
        }
    }

    fn announce_progress(
        &self,
        progress: Progress,
    ) {
        let time = progress.time.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());

        if progress.finished {
            info!("log import finished: time={time}");
        } else {
            info!("log import progress: progress={}, time={time}", progress.progress);
        }
    }
}

/// Records everything it is told, for inspection.
#[derive(Debug, Default)]
pub struct DummyImportAnnouncer {
    start: Mutex<Option<Option<OffsetDateTime>>>,
    progress: Mutex<Vec<Progress>>,
    finished: Notify,
}

impl DummyImportAnnouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when start was never announced.
    pub fn start(&self) -> Option<Option<OffsetDateTime>> {
        *self.start.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn progress(&self) -> Vec<Progress> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.progress().iter().any(|p| p.finished)
    }

    pub async fn wait_finished(&self) {
        while !self.is_finished() {
            self.finished.notified().await;
        }
    }
}

impl ImportAnnouncer for DummyImportAnnouncer {
    fn announce_start(
        &self,
        time: Option<OffsetDateTime>,
    ) {
        *self.start.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(time);
    }

    fn announce_progress(
        &self,
        progress: Progress,
    ) {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(progress);

        if progress.finished {
            self.finished.notify_one();
        }
    }
}
