use std::net::IpAddr;

use serde::Serialize;

use crate::error::ParseError;

/// The `host process[/daemon][pid]:` part of a syslog line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Header {
    pub host: String,
    pub process: String,
    pub daemon: String,
    pub pid: Option<u32>,
    pub process_ip: Option<IpAddr>,
}

impl Header {
    /// Last component of the daemon, so `submission/smtpd` and
    /// `smtps/smtpd` both route as `smtpd`.
    pub fn daemon_name(&self) -> &str {
        self.daemon.rsplit('/').next().unwrap_or_default()
    }
}

/// Parses the header that follows the timestamp and returns the payload
/// text after `: `.
pub fn parse_header(text: &str) -> Result<(Header, &str), ParseError> {
    let (host, rest) = text.split_once(' ').ok_or(ParseError::InvalidHeader)?;
    if host.is_empty() {
        return Err(ParseError::InvalidHeader);
    }

    let colon = rest.find(':').ok_or(ParseError::InvalidHeader)?;
    let (tag, after) = rest.split_at(colon);
    let payload = match &after[1..] {
        "" => "",
        more => more.strip_prefix(' ').ok_or(ParseError::InvalidHeader)?,
    };

    if tag.is_empty() || tag.contains(char::is_whitespace) {
        return Err(ParseError::InvalidHeader);
    }

    let (name, pid) = split_pid(tag)?;
    let name = name.strip_prefix('/').unwrap_or(name);
    let (process, daemon) = name.split_once('/').unwrap_or((name, ""));
    let (process, process_ip) = split_process_ip(process);

    if process.is_empty() {
        return Err(ParseError::InvalidHeader);
    }

    let header = Header {
        host: host.to_string(),
        process: process.to_string(),
        daemon: daemon.to_string(),
        pid,
        process_ip,
    };

    Ok((header, payload))
}

fn split_pid(tag: &str) -> Result<(&str, Option<u32>), ParseError> {
    let Some(inner) = tag.strip_suffix(']') else {
        return Ok((tag, None));
    };

    let (name, pid) = inner.rsplit_once('[').ok_or(ParseError::InvalidHeader)?;
    let pid = pid.parse().map_err(|_| ParseError::InvalidHeader)?;
    Ok((name, Some(pid)))
}

/// `postfix-10.20.30.40` is the `postfix` process bound to an address.
fn split_process_ip(process: &str) -> (&str, Option<IpAddr>) {
    match process.rsplit_once('-') {
        Some((name, ip)) => match ip.parse::<IpAddr>() {
            Ok(ip) => (name, Some(ip)),
            Err(_) => (process, None),
        },
        None => (process, None),
    }
}
