use std::net::IpAddr;

use controlcenter_postfix::{Address, Relay, SmtpStatus, Sum};
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound = 0,
    Incoming = 1,
}

impl Direction {
    /// Local transports deliver into this server; everything else leaves
    /// it.
    pub fn from_daemon(daemon: &str) -> Self {
        match daemon {
            "lmtp" | "pipe" | "virtual" | "local" => Self::Incoming,
            _ => Self::Outbound,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Self {
        if code == Self::Incoming.code() { Self::Incoming } else { Self::Outbound }
    }
}

/// Reference to a raw log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogRef {
    pub time: OffsetDateTime,
    pub sum: Sum,
}

/// One delivery attempt of one message to one recipient, as reconstructed
/// from the logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub host: String,
    pub queue: String,
    /// Queue of the message this one was created from (a bounce or a
    /// content filter re-injection).
    pub origin_queue: Option<String>,
    pub message_id: Option<String>,
    pub status: SmtpStatus,
    pub direction: Direction,
    pub queued_time: OffsetDateTime,
    pub first_attempt_time: OffsetDateTime,
    pub delivery_time: OffsetDateTime,
    pub sender: Address,
    pub recipient: Address,
    pub orig_recipient: Option<Address>,
    pub relay: Relay,
    pub dsn: String,
    pub delay: f32,
    pub extra_message: String,
    pub client_host: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub size: Option<u64>,
    pub nrcpt: Option<u32>,
    /// Contributing lines, oldest first.
    pub log_lines: Vec<LogRef>,
}

/// A downstream bounce to apply to an already stored `sent` delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedBounceUpdate {
    pub time: OffsetDateTime,
    pub sender: Address,
    pub recipient: Address,
    pub dsn: String,
    pub reporting_mta: String,
    pub message: String,
    pub line: LogRef,
}
