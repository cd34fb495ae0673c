use time::OffsetDateTime;

use crate::hasher::{Sum, checksum};
use crate::header::Header;
use crate::payload::Payload;

pub const UNKNOWN_FILENAME: &str = "unknown";

/// Where a line was read from. Line numbers start at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLocation {
    pub filename: String,
    pub line: u64,
}

impl Default for RecordLocation {
    fn default() -> Self {
        Self { filename: UNKNOWN_FILENAME.to_string(), line: 0 }
    }
}

impl RecordLocation {
    pub fn new(
        filename: impl Into<String>,
        line: u64,
    ) -> Self {
        Self { filename: filename.into(), line }
    }
}

/// One ingested log line.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub time: OffsetDateTime,
    pub header: Header,
    pub payload: Payload,
    /// The line as stored in the raw logs. For wrapped formats (logstash,
    /// prepended timestamps) this is the embedded syslog line.
    pub line: String,
    pub location: RecordLocation,
    pub sum: Sum,
}

impl Record {
    pub fn new(
        time: OffsetDateTime,
        header: Header,
        payload: Payload,
        line: String,
        location: RecordLocation,
    ) -> Self {
        let sum = checksum(&line);
        Self { time, header, payload, line, location, sum }
    }
}
