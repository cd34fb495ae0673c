use std::net::IpAddr;

use crate::error::ParseError;
use crate::payload::{Address, Delays, Payload, Relay, SentQueued, SmtpSentStatus, SmtpStatus};
use crate::text::{split_address, split_queue, take_angle_address, take_field};

const KIND: &str = "smtp";

/// `Q: to=<r>, [orig_to=<o>, ]relay=..., delay=F, delays=a/b/c/d, dsn=X,
/// status=S (extra)`, shared by smtp, lmtp, pipe, local and virtual.
pub(super) fn parse(payload: &str) -> Result<Payload, ParseError> {
    let (queue, rest) = split_queue(payload).ok_or(ParseError::UnsupportedLine)?;
    let rest = rest.strip_prefix("to=").ok_or(ParseError::UnsupportedLine)?;

    let (recipient, rest) = take_address(rest, "to")?;

    let (orig_recipient, rest) = match rest.strip_prefix("orig_to=") {
        Some(rest) => {
            let (address, rest) = take_address(rest, "orig_to")?;
            (Some(address), rest)
        }
        None => (None, rest),
    };

    let (relay, rest) = take_field(rest, "relay=").ok_or_else(|| missing("relay"))?;
    let (delay, rest) = take_field(rest, "delay=").ok_or_else(|| missing("delay"))?;
    let (delays, rest) = take_field(rest, "delays=").ok_or_else(|| missing("delays"))?;
    let (dsn, rest) = take_field(rest, "dsn=").ok_or_else(|| missing("dsn"))?;
    let rest = rest.strip_prefix("status=").ok_or_else(|| missing("status"))?;

    let (status, extra_message) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = SmtpStatus::parse(status)
        .ok_or_else(|| ParseError::payload(KIND, format!("unknown status {status}")))?;

    let extra_message = extra_message.trim();

    Ok(Payload::SmtpSentStatus(SmtpSentStatus {
        queue: queue.to_string(),
        recipient,
        orig_recipient,
        relay: parse_relay(relay)?,
        delay: parse_float(delay)?,
        delays: parse_delays(delays)?,
        dsn: dsn.to_string(),
        status,
        extra_message: extra_message.to_string(),
        sent_queued: parse_sent_queued(extra_message),
    }))
}

fn missing(field: &str) -> ParseError {
    ParseError::payload(KIND, format!("missing {field}"))
}

fn take_address<'a>(
    text: &'a str,
    field: &str,
) -> Result<(Address, &'a str), ParseError> {
    let (address, rest) = take_angle_address(text).ok_or_else(|| missing(field))?;
    let (local, domain) = split_address(address);
    let rest = rest.strip_prefix(", ").unwrap_or(rest);
    Ok((Address { local, domain }, rest))
}

fn parse_relay(text: &str) -> Result<Relay, ParseError> {
    if text == "none" {
        return Ok(Relay::default());
    }

    let Some(open) = text.find('[') else {
        return Ok(Relay { name: text.to_string(), ..Relay::default() });
    };

    let close = text.rfind(']').filter(|close| *close > open)
        .ok_or_else(|| ParseError::payload(KIND, format!("invalid relay {text}")))?;

    let name = &text[..open];
    let inner = &text[open + 1..close];

    let port = match text[close + 1..].strip_prefix(':') {
        Some(port) => port
            .parse()
            .map_err(|_| ParseError::payload(KIND, format!("invalid relay port {port}")))?,
        None => 0,
    };

    let (ip, path) = match inner.parse::<IpAddr>() {
        Ok(ip) => (Some(ip), None),
        Err(_) if inner.is_empty() => (None, None),
        Err(_) => (None, Some(inner.to_string())),
    };

    Ok(Relay { name: name.to_string(), ip, path, port })
}

fn parse_float(text: &str) -> Result<f32, ParseError> {
    text.parse()
        .map_err(|_| ParseError::payload(KIND, format!("invalid number {text}")))
}

fn parse_delays(text: &str) -> Result<Delays, ParseError> {
    let parts = text.split('/').map(parse_float).collect::<Result<Vec<_>, _>>()?;

    let &[smtpd, cleanup, qmgr, smtp] = parts.as_slice() else {
        return Err(ParseError::payload(KIND, format!("invalid delays {text}")));
    };

    Ok(Delays { smtpd, cleanup, qmgr, smtp })
}

/// Recognizes the answer of a content filter listening on a local port:
/// `(250 2.0.0 from MTA(smtp:[127.0.0.1]:10025): 250 2.0.0 Ok: queued as X)`.
/// The plain `(250 2.0.0 Ok: queued as X)` of a remote server is not a
/// re-queue on this host.
fn parse_sent_queued(extra: &str) -> Option<SentQueued> {
    let inner = extra.strip_prefix('(')?.strip_suffix(')')?;

    let mut words = inner.splitn(3, ' ');
    let smtp_code = words.next()?.parse().ok()?;
    let dsn = words.next()?;
    let rest = words.next()?.strip_prefix("from MTA(smtp:[")?;

    let (ip, rest) = rest.split_once("]:")?;
    let (port, rest) = rest.split_once("): ")?;
    let (_, queue) = rest.split_once("queued as ")?;

    if queue.is_empty() {
        return None;
    }

    Some(SentQueued {
        smtp_code,
        dsn: dsn.to_string(),
        ip: ip.parse().ok()?,
        port: port.parse().ok()?,
        queue: queue.to_string(),
    })
}
