//! Postfix syslog parsing.
//!
//! A log line is split into a timestamp, a [`Header`] (`host process[pid]:`)
//! and a typed [`Payload`]. A malformed timestamp or header is fatal for the
//! line; an unknown or malformed body is a recoverable error, and the line is
//! kept with [`Payload::Unsupported`].

mod error;
mod hasher;
mod header;
mod parse;
mod payload;
mod record;
mod text;
mod timestamp;

pub use error::ParseError;
pub use hasher::{Hasher, Sum, checksum};
pub use header::{Header, parse_header};
pub use parse::{PayloadResult, parse, parse_payload, parse_with_rfc3339_time, parse_without_time};
pub use payload::{
    Address, BounceCreated, CleanupMessageAccepted, CleanupMilterReject, Delays, DisconnectStat,
    MailAccepted, MailQueued, MessageExpired, Payload, Pickup, QueueRemoved, RelayedBounce, Relay,
    SentQueued, SmtpSentStatus, SmtpStatus, SmtpdConnect, SmtpdDisconnect, SmtpdLostConnection,
    SmtpdReject, Version,
};
pub use record::{Record, RecordLocation, UNKNOWN_FILENAME};
pub use timestamp::{
    SYSLOG_HEADER_LEN, SyslogTime, TimeConverter, parse_rfc3339, split_rfc3339_time,
    split_syslog_time,
};
