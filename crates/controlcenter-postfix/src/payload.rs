use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// An e-mail address split at the last `@`. The local part has its quotes
/// removed; a bare local part (`<root>`) has an empty domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Address {
    pub local: String,
    pub domain: String,
}

impl Address {
    pub fn new(
        local: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self { local: local.into(), domain: domain.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.domain.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.domain.is_empty() {
            f.write_str(&self.local)
        } else {
            write!(f, "{}@{}", self.local, self.domain)
        }
    }
}

/// Delivery status, as stored. The numeric values are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpStatus {
    Sent = 0,
    Bounced = 1,
    Deferred = 2,
    Expired = 3,
    Returned = 4,
    Received = 5,
}

impl SmtpStatus {
    pub fn parse(text: &str) -> Option<Self> {
        let status = match text {
            "sent" => Self::Sent,
            "bounced" => Self::Bounced,
            "deferred" => Self::Deferred,
            "expired" => Self::Expired,
            "returned" => Self::Returned,
            _ => return None,
        };

        Some(status)
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let status = match code {
            0 => Self::Sent,
            1 => Self::Bounced,
            2 => Self::Deferred,
            3 => Self::Expired,
            4 => Self::Returned,
            5 => Self::Received,
            _ => return None,
        };

        Some(status)
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Bounced => "bounced",
            Self::Deferred => "deferred",
            Self::Expired => "expired",
            Self::Returned => "returned",
            Self::Received => "received",
        }
    }

    /// Whether the status ends the life of a recipient in a queue.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Deferred)
    }
}

impl fmt::Display for SmtpStatus {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `delays=a/b/c/d`: time spent before the queue manager, in the queue
/// manager, setting up the connection and transmitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Delays {
    pub smtpd: f32,
    pub cleanup: f32,
    pub qmgr: f32,
    pub smtp: f32,
}

/// `relay=` value: `name[ip]:port`, `name[path]`, `none` or a bare name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Relay {
    pub name: String,
    pub ip: Option<IpAddr>,
    pub path: Option<String>,
    pub port: u16,
}

/// Extra message of a delivery handed to a local content filter that
/// re-queued it: `(250 2.0.0 from MTA(smtp:[127.0.0.1]:10025): 250 2.0.0 Ok:
/// queued as 2F01D1855DB2)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentQueued {
    pub smtp_code: u16,
    pub dsn: String,
    pub ip: IpAddr,
    pub port: u16,
    pub queue: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmtpSentStatus {
    pub queue: String,
    pub recipient: Address,
    pub orig_recipient: Option<Address>,
    pub relay: Relay,
    pub delay: f32,
    pub delays: Delays,
    pub dsn: String,
    pub status: SmtpStatus,
    pub extra_message: String,
    pub sent_queued: Option<SentQueued>,
}

/// qmgr `from=<s>, size=N, nrcpt=N (queue active)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailQueued {
    pub queue: String,
    pub sender: Address,
    pub size: u64,
    pub nrcpt: u32,
}

/// qmgr `removed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueRemoved {
    pub queue: String,
}

/// qmgr `from=<s>, status=expired, returned to sender`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageExpired {
    pub queue: String,
    pub sender: Address,
    pub forced: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmtpdConnect {
    pub host: String,
    pub ip: Option<IpAddr>,
}

/// One `name=ok/total` counter of a disconnect line; `ehlo=1` means `1/1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisconnectStat {
    pub command: String,
    pub success: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmtpdDisconnect {
    pub host: String,
    pub ip: Option<IpAddr>,
    pub stats: Vec<DisconnectStat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmtpdLostConnection {
    pub after: String,
    pub host: String,
    pub ip: Option<IpAddr>,
}

/// smtpd `Q: client=host[ip]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailAccepted {
    pub queue: String,
    pub host: String,
    pub ip: Option<IpAddr>,
}

/// smtpd `Q: reject: ...`, or `NOQUEUE: reject: ...` with no queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmtpdReject {
    pub queue: Option<String>,
    pub extra_message: String,
}

/// cleanup `Q: message-id=<...>`. `corrupted` is set when the value is
/// empty or has trailing garbage after the closing bracket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupMessageAccepted {
    pub queue: String,
    pub message_id: String,
    pub corrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupMilterReject {
    pub queue: String,
    pub extra_message: String,
}

/// pickup `Q: uid=N from=<s>`, a locally submitted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pickup {
    pub queue: String,
    pub uid: u32,
    pub sender: Address,
}

/// bounce `Q: sender non-delivery notification: CHILD`. The child queue
/// carries the bounce message back to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BounceCreated {
    pub queue: String,
    pub child: String,
}

/// master `daemon started -- version X, configuration D`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Version {
    pub version: String,
    pub configuration: String,
}

/// A bounce reported by a downstream MTA after this server handed the
/// message off as `sent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayedBounce {
    pub queue: Option<String>,
    pub dsn: String,
    pub sender: Address,
    pub recipient: Address,
    pub reporting_mta: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    SmtpSentStatus(SmtpSentStatus),
    MailQueued(MailQueued),
    QueueRemoved(QueueRemoved),
    MessageExpired(MessageExpired),
    SmtpdConnect(SmtpdConnect),
    SmtpdDisconnect(SmtpdDisconnect),
    SmtpdLostConnection(SmtpdLostConnection),
    MailAccepted(MailAccepted),
    SmtpdReject(SmtpdReject),
    CleanupMessageAccepted(CleanupMessageAccepted),
    CleanupMilterReject(CleanupMilterReject),
    Pickup(Pickup),
    BounceCreated(BounceCreated),
    Version(Version),
    RelayedBounce(RelayedBounce),
    Unsupported,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SmtpSentStatus(_) => "smtp_sent_status",
            Self::MailQueued(_) => "mail_queued",
            Self::QueueRemoved(_) => "queue_removed",
            Self::MessageExpired(_) => "message_expired",
            Self::SmtpdConnect(_) => "smtpd_connect",
            Self::SmtpdDisconnect(_) => "smtpd_disconnect",
            Self::SmtpdLostConnection(_) => "smtpd_lost_connection",
            Self::MailAccepted(_) => "mail_accepted",
            Self::SmtpdReject(_) => "smtpd_reject",
            Self::CleanupMessageAccepted(_) => "cleanup_message_accepted",
            Self::CleanupMilterReject(_) => "cleanup_milter_reject",
            Self::Pickup(_) => "pickup",
            Self::BounceCreated(_) => "bounce_created",
            Self::Version(_) => "version",
            Self::RelayedBounce(_) => "relayed_bounce",
            Self::Unsupported => "unsupported",
        }
    }

    /// Queue id the payload refers to, if any.
    pub fn queue(&self) -> Option<&str> {
        match self {
            Self::SmtpSentStatus(p) => Some(&p.queue),
            Self::MailQueued(p) => Some(&p.queue),
            Self::QueueRemoved(p) => Some(&p.queue),
            Self::MessageExpired(p) => Some(&p.queue),
            Self::MailAccepted(p) => Some(&p.queue),
            Self::SmtpdReject(p) => p.queue.as_deref(),
            Self::CleanupMessageAccepted(p) => Some(&p.queue),
            Self::CleanupMilterReject(p) => Some(&p.queue),
            Self::Pickup(p) => Some(&p.queue),
            Self::BounceCreated(p) => Some(&p.queue),
            Self::RelayedBounce(p) => p.queue.as_deref(),
            Self::SmtpdConnect(_)
            | Self::SmtpdDisconnect(_)
            | Self::SmtpdLostConnection(_)
            | Self::Version(_)
            | Self::Unsupported => None,
        }
    }
}
