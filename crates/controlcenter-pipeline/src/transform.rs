//! Line transformers: turn one raw line into a [`Record`].
//!
//! Transformers are looked up by name in a [`TransformerRegistry`]. The
//! built-in names are `default` (classic syslog, year inferred),
//! `rfc3339`, `prepend-rfc3339` and `logstash`.

use std::collections::BTreeMap;
use std::sync::Arc;

use controlcenter_postfix::{
    Header, ParseError, Payload, PayloadResult, Record, RecordLocation, TimeConverter,
    UNKNOWN_FILENAME, parse, parse_rfc3339, parse_with_rfc3339_time,
};
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unknown log format: {0}")]
    UnknownTransformer(String),
    #[error("line has no timestamp prefix")]
    MissingTimestamp,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("invalid json envelope: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub trait Transformer: Send {
    fn transform(
        &mut self,
        line: &str,
    ) -> Result<Record, TransformError>;
}

/// Arguments shared by every factory. Only `default` reads them.
#[derive(Clone)]
pub struct TransformerArgs {
    pub clock: Arc<dyn Clock>,
    /// Year of the first syslog line. `None` or `0` means the clock's year.
    pub year: Option<i32>,
}

pub type TransformerFactory =
    Arc<dyn Fn(&TransformerArgs) -> Result<Box<dyn Transformer>, TransformError> + Send + Sync>;

/// Creates fresh transformers of one format, e.g. one per socket
/// connection.
pub type TransformerBuilder =
    Arc<dyn Fn() -> Result<Box<dyn Transformer>, TransformError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct TransformerRegistry {
    factories: BTreeMap<String, TransformerFactory>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in formats.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register("default", |args| {
            let year = match args.year {
                Some(year) if year != 0 => year,
                _ => args.clock.now().year(),
            };

            Ok(Box::new(DefaultTransformer::new(year, args.clock.now().year() + 1)))
        });
        registry.register("rfc3339", |_| Ok(Box::new(Rfc3339Transformer::default())));
        registry.register("prepend-rfc3339", |_| Ok(Box::new(PrependRfc3339Transformer::default())));
        registry.register("logstash", |_| Ok(Box::new(LogstashTransformer::default())));

        registry
    }

    /// Adds or replaces a format.
    pub fn register<F>(
        &mut self,
        name: &str,
        factory: F,
    ) where
        F: Fn(&TransformerArgs) -> Result<Box<dyn Transformer>, TransformError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.factories.contains_key(name)
    }

    pub fn builder(
        &self,
        name: &str,
        args: TransformerArgs,
    ) -> Result<TransformerBuilder, TransformError> {
        let factory = self
            .factories
            .get(name)
            .cloned()
            .ok_or_else(|| TransformError::UnknownTransformer(name.to_string()))?;

        Ok(Arc::new(move || factory(&args)))
    }
}

/// Line numbering shared by every format; the first line is 1.
#[derive(Debug, Default)]
struct LineCounter {
    last: u64,
}

impl LineCounter {
    fn next(
        &mut self,
        filename: &str,
    ) -> RecordLocation {
        self.last += 1;
        RecordLocation::new(filename, self.last)
    }
}

/// Keeps the line when only the payload failed to parse.
fn into_record(
    time: OffsetDateTime,
    header: Header,
    payload: PayloadResult,
    line: &str,
    location: RecordLocation,
) -> Result<Record, TransformError> {
    let payload = match payload {
        Ok(payload) => payload,
        Err(err) if err.is_recoverable() => {
            debug!(
                "payload not tracked: file={}, line={}, process={}, daemon={}, error={err}",
                location.filename, location.line, header.process, header.daemon,
            );
            Payload::Unsupported
        }
        Err(err) => return Err(err.into()),
    };

    Ok(Record::new(time, header, payload, line.to_string(), location))
}

/// `Mon DD HH:MM:SS host process[pid]: ...`
pub struct DefaultTransformer {
    converter: TimeConverter,
    lines: LineCounter,
}

impl DefaultTransformer {
    pub fn new(
        year: i32,
        max_year: i32,
    ) -> Self {
        Self { converter: TimeConverter::new(year, max_year), lines: LineCounter::default() }
    }
}

impl Transformer for DefaultTransformer {
    fn transform(
        &mut self,
        line: &str,
    ) -> Result<Record, TransformError> {
        let location = self.lines.next(UNKNOWN_FILENAME);
        let (syslog_time, header, payload) = parse(line)?;

        let year = self.converter.year();
        let time = self.converter.convert(&syslog_time)?;
        if self.converter.year() != year {
            info!("log year changed: year={}, line={}", self.converter.year(), location.line);
        }

        into_record(time, header, payload, line, location)
    }
}

/// `2021-05-16T00:01:44.278515+02:00 host process[pid]: ...`, with the
/// wall clock fields read as UTC.
#[derive(Default)]
pub struct Rfc3339Transformer {
    lines: LineCounter,
}

impl Transformer for Rfc3339Transformer {
    fn transform(
        &mut self,
        line: &str,
    ) -> Result<Record, TransformError> {
        let location = self.lines.next(UNKNOWN_FILENAME);
        let (time, header, payload) = parse_with_rfc3339_time(line)?;
        into_record(time, header, payload, line, location)
    }
}

/// `2021-03-06T06:09:00.798Z Mar  6 07:08:59 host process[pid]: ...`, as
/// written by docker. The prefix is the record time and the syslog line
/// after it is what gets stored.
#[derive(Default)]
pub struct PrependRfc3339Transformer {
    lines: LineCounter,
}

impl Transformer for PrependRfc3339Transformer {
    fn transform(
        &mut self,
        line: &str,
    ) -> Result<Record, TransformError> {
        let location = self.lines.next(UNKNOWN_FILENAME);
        let (prefix, rest) = line.split_once(' ').ok_or(TransformError::MissingTimestamp)?;
        let time = parse_rfc3339(prefix)?;
        let (_, header, payload) = parse(rest)?;
        into_record(time, header, payload, rest, location)
    }
}

#[derive(Deserialize)]
struct LogstashEnvelope {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    #[serde(default)]
    log: Option<LogstashLog>,
    message: String,
}

#[derive(Deserialize)]
struct LogstashLog {
    #[serde(default)]
    file: Option<LogstashFile>,
}

#[derive(Deserialize)]
struct LogstashFile {
    path: String,
}

/// One JSON object per line, as shipped by filebeat through logstash.
#[derive(Default)]
pub struct LogstashTransformer {
    lines: LineCounter,
}

impl Transformer for LogstashTransformer {
    fn transform(
        &mut self,
        line: &str,
    ) -> Result<Record, TransformError> {
        let envelope: LogstashEnvelope = serde_json::from_str(line)?;

        let filename = envelope
            .log
            .and_then(|log| log.file)
            .map(|file| file.path)
            .unwrap_or_else(|| UNKNOWN_FILENAME.to_string());

        let location = self.lines.next(&filename);
        let time = parse_rfc3339(&envelope.timestamp)?;
        let (_, header, payload) = parse(&envelope.message)?;
        into_record(time, header, payload, &envelope.message, location)
    }
}
