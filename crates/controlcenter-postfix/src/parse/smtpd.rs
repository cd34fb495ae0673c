use crate::error::ParseError;
use crate::payload::{
    DisconnectStat, MailAccepted, Payload, SmtpdConnect, SmtpdDisconnect, SmtpdLostConnection,
    SmtpdReject,
};
use crate::text::{split_host_ip, split_queue};

const KIND: &str = "smtpd";

pub(super) fn parse(payload: &str) -> Result<Payload, ParseError> {
    if let Some(rest) = payload.strip_prefix("connect from ") {
        let (host, ip) = client(rest)?;
        return Ok(Payload::SmtpdConnect(SmtpdConnect { host, ip }));
    }

    if let Some(rest) = payload.strip_prefix("disconnect from ") {
        let (client_part, stats) = rest.split_once(' ').unwrap_or((rest, ""));
        let (host, ip) = client(client_part)?;
        return Ok(Payload::SmtpdDisconnect(SmtpdDisconnect {
            host,
            ip,
            stats: parse_stats(stats)?,
        }));
    }

    if let Some(rest) = payload.strip_prefix("lost connection after ") {
        let (after, from) = rest.split_once(" from ").ok_or(ParseError::UnsupportedLine)?;
        let (host, ip) = client(from)?;
        return Ok(Payload::SmtpdLostConnection(SmtpdLostConnection {
            after: after.to_string(),
            host,
            ip,
        }));
    }

    if let Some(rest) = payload.strip_prefix("NOQUEUE: reject: ") {
        return Ok(Payload::SmtpdReject(SmtpdReject { queue: None, extra_message: rest.to_string() }));
    }

    let (queue, rest) = split_queue(payload).ok_or(ParseError::UnsupportedLine)?;

    if let Some(rest) = rest.strip_prefix("reject: ") {
        return Ok(Payload::SmtpdReject(SmtpdReject {
            queue: Some(queue.to_string()),
            extra_message: rest.to_string(),
        }));
    }

    if let Some(rest) = rest.strip_prefix("client=") {
        let client_part = rest.split_once(", ").map_or(rest, |(client, _)| client);
        let (host, ip) = client(client_part)?;
        return Ok(Payload::MailAccepted(MailAccepted { queue: queue.to_string(), host, ip }));
    }

    Err(ParseError::UnsupportedLine)
}

fn client(text: &str) -> Result<(String, Option<std::net::IpAddr>), ParseError> {
    let (host, ip) = split_host_ip(text)
        .ok_or_else(|| ParseError::payload(KIND, format!("invalid client {text}")))?;
    Ok((host.to_string(), ip))
}

fn parse_stats(text: &str) -> Result<Vec<DisconnectStat>, ParseError> {
    text.split_whitespace()
        .map(|item| {
            let invalid = || ParseError::payload(KIND, format!("invalid counter {item}"));
            let (command, value) = item.split_once('=').ok_or_else(invalid)?;
            let (success, total) = value.split_once('/').unwrap_or((value, value));
            Ok(DisconnectStat {
                command: command.to_string(),
                success: success.parse().map_err(|_| invalid())?,
                total: total.parse().map_err(|_| invalid())?,
            })
        })
        .collect()
}
