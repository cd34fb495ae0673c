//! Reader driver: pulls lines from a source, transforms and publishes them
//! and reports how far the import of past logs has come.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use controlcenter_postfix::{Record, RecordLocation, UNKNOWN_FILENAME};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::announcer::{ImportAnnouncer, Progress};
use crate::clock::Clock;
use crate::publisher::Publisher;
use crate::transform::{Transformer, TransformerBuilder};

const PROGRESS_STEPS: usize = 100;

/// One raw line and, when the source knows it, where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub text: String,
    pub location: Option<RecordLocation>,
}

impl SourceLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), location: None }
    }

    pub fn with_location(
        text: impl Into<String>,
        location: RecordLocation,
    ) -> Self {
        Self { text: text.into(), location: Some(location) }
    }
}

/// Yields lines in order. `None` is the end of the input.
pub trait LineSource: Send {
    fn next_line(&mut self) -> impl Future<Output = Result<Option<SourceLine>>> + Send;
}

#[derive(Clone)]
pub struct ReadContext {
    pub publisher: Arc<dyn Publisher>,
    pub transformer: TransformerBuilder,
    pub announcer: Arc<dyn ImportAnnouncer>,
    pub clock: Arc<dyn Clock>,
    /// Silence, after the first line, after which the import of past logs
    /// counts as done.
    pub idle_timeout: Duration,
}

impl ReadContext {
    /// Same context reporting to another announcer.
    pub fn with_announcer(
        &self,
        announcer: Arc<dyn ImportAnnouncer>,
    ) -> Self {
        Self { announcer, ..self.clone() }
    }
}

/// Progress bookkeeping for one run.
struct ImportProgress<'a> {
    announcer: &'a dyn ImportAnnouncer,
    expected_end: OffsetDateTime,
    initial: Option<OffsetDateTime>,
    last_time: Option<OffsetDateTime>,
    reported: [bool; PROGRESS_STEPS],
    end_announced: bool,
}

impl<'a> ImportProgress<'a> {
    fn new(
        announcer: &'a dyn ImportAnnouncer,
        expected_end: OffsetDateTime,
    ) -> Self {
        Self {
            announcer,
            expected_end,
            initial: None,
            last_time: None,
            reported: [false; PROGRESS_STEPS],
            end_announced: false,
        }
    }

    fn has_lines(&self) -> bool {
        self.initial.is_some()
    }

    fn percent(
        &self,
        initial: OffsetDateTime,
        time: OffsetDateTime,
    ) -> i64 {
        let span = self.expected_end.unix_timestamp() - initial.unix_timestamp();
        if span == 0 {
            return 100;
        }

        ((time.unix_timestamp() - initial.unix_timestamp()) * 100 / span).max(0)
    }

    fn record(
        &mut self,
        time: OffsetDateTime,
    ) {
        let initial = match self.initial {
            Some(initial) => initial,
            None => {
                self.announcer.announce_start(Some(time));
                self.initial = Some(time);
                time
            }
        };

        self.last_time = Some(time);

        if self.end_announced {
            return;
        }

        if time > self.expected_end {
            self.announce_end(time);
            return;
        }

        let percent = self.percent(initial, time).min(PROGRESS_STEPS as i64 - 1);
        let bucket = &mut self.reported[percent as usize];
        if *bucket {
            return;
        }

        *bucket = true;
        self.announcer.announce_progress(Progress { finished: false, time: Some(time), progress: percent });
    }

    fn announce_end(
        &mut self,
        time: OffsetDateTime,
    ) {
        self.announcer.announce_progress(Progress { finished: true, time: Some(time), progress: 100 });
        self.end_announced = true;
    }

    fn end_time(&self) -> OffsetDateTime {
        self.last_time.unwrap_or(self.expected_end)
    }

    /// Called once the input is exhausted.
    fn finish(&mut self) {
        if !self.has_lines() {
            self.announcer.announce_start(Some(self.expected_end));
        }

        if !self.end_announced {
            self.announce_end(self.end_time());
        }
    }
}

async fn scan<S: LineSource>(
    mut source: S,
    lines: mpsc::Sender<SourceLine>,
    mut next: mpsc::Receiver<()>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = source.next_line() => line?,
        };

        let Some(line) = line else {
            return Ok(());
        };

        if lines.send(line).await.is_err() {
            return Ok(());
        }

        // wait until the line has been published
        if next.recv().await.is_none() {
            return Ok(());
        }
    }
}

/// Reads `source` to its end, or until cancelled.
///
/// Progress is measured between the time of the first line and the clock's
/// time at entry. The import is announced finished on the first line past
/// that time, after `idle_timeout` without lines, or at the end of the
/// input, whichever comes first. Lines keep being published afterwards.
pub async fn read_lines<S>(
    source: S,
    ctx: &ReadContext,
    cancel: CancellationToken,
) -> Result<()>
where
    S: LineSource + 'static,
{
    let mut transformer = (ctx.transformer)().context("failed to build transformer")?;
    let mut progress = ImportProgress::new(ctx.announcer.as_ref(), ctx.clock.now());

    let (line_tx, mut line_rx) = mpsc::channel::<SourceLine>(1);
    let (next_tx, next_rx) = mpsc::channel::<()>(1);
    let scan_cancel = cancel.child_token();
    let scanner = tokio::spawn(scan(source, line_tx, next_rx, scan_cancel.clone()));

    let idle = tokio::time::sleep(ctx.idle_timeout);
    tokio::pin!(idle);

    loop {
        let idle_armed = progress.has_lines() && !progress.end_announced;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("reader cancelled: lines_seen={}", progress.has_lines());
                break;
            }
            maybe = line_rx.recv() => {
                let Some(line) = maybe else {
                    break;
                };

                if let Some(record) = transform_line(transformer.as_mut(), line) {
                    let time = record.time;
                    ctx.publisher.publish(record).await;
                    progress.record(time);
                    idle.as_mut().reset(Instant::now() + ctx.idle_timeout);
                }

                if next_tx.send(()).await.is_err() {
                    break;
                }
            }
            _ = &mut idle, if idle_armed => {
                debug!("reader idle, past logs imported: time={}", progress.end_time());
                progress.announce_end(progress.end_time());
            }
        }
    }

    scan_cancel.cancel();
    drop(next_tx);
    drop(line_rx);

    let scanned = scanner.await.context("line scanner panicked")?;

    if cancel.is_cancelled() {
        return Ok(());
    }

    if let Err(err) = scanned {
        if !progress.has_lines() {
            return Err(err.context("failed to read any line"));
        }

        warn!("line source failed, ending import: error={err:#}");
    }

    progress.finish();
    Ok(())
}

fn transform_line(
    transformer: &mut dyn Transformer,
    line: SourceLine,
) -> Option<Record> {
    let mut record = match transformer.transform(&line.text) {
        Ok(record) => record,
        Err(err) => {
            warn!("failed to parse log line: error={err}, line={}", line.text);
            return None;
        }
    };

    if let Some(location) = line.location {
        if record.location.filename == UNKNOWN_FILENAME {
            record.location = location;
        }
    }

    Some(record)
}
