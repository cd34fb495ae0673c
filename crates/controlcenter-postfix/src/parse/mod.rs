//! Payload parsers, one module per Postfix daemon family.

mod cleanup;
mod lightmeter;
mod local;
mod qmgr;
mod smtp;
mod smtpd;

use time::OffsetDateTime;

use crate::error::ParseError;
use crate::header::{Header, parse_header};
use crate::payload::Payload;
use crate::timestamp::{SyslogTime, split_rfc3339_time, split_syslog_time};

/// Outcome of the payload step. A failure here is recoverable: the header
/// and time are still valid.
pub type PayloadResult = Result<Payload, ParseError>;

/// Parses a classic syslog line (`Feb  4 09:29:33 host proc[pid]: ...`).
pub fn parse(line: &str) -> Result<(SyslogTime, Header, PayloadResult), ParseError> {
    let (time, rest) = split_syslog_time(line)?;
    let (header, payload) = parse_without_time(rest)?;
    Ok((time, header, payload))
}

/// Parses a line whose timestamp is an ISO-8601 prefix.
pub fn parse_with_rfc3339_time(
    line: &str,
) -> Result<(OffsetDateTime, Header, PayloadResult), ParseError> {
    let (time, rest) = split_rfc3339_time(line)?;
    let (header, payload) = parse_without_time(rest)?;
    Ok((time, header, payload))
}

/// Parses everything after the timestamp.
pub fn parse_without_time(text: &str) -> Result<(Header, PayloadResult), ParseError> {
    let (header, payload) = parse_header(text)?;
    let payload = parse_payload(&header, payload);
    Ok((header, payload))
}

/// Dispatches on process and daemon. Unknown pairs, and known daemons with
/// messages we do not track, are [`ParseError::UnsupportedLine`].
pub fn parse_payload(
    header: &Header,
    payload: &str,
) -> PayloadResult {
    if header.process == "lightmeter" && header.daemon == "relayed-bounce" {
        return lightmeter::parse_relayed_bounce(payload);
    }

    if !is_postfix_process(&header.process) {
        return Err(ParseError::UnsupportedLine);
    }

    match header.daemon_name() {
        "smtp" | "lmtp" | "pipe" | "local" | "virtual" => smtp::parse(payload),
        "qmgr" => qmgr::parse(payload),
        "smtpd" => smtpd::parse(payload),
        "cleanup" => cleanup::parse(payload),
        "pickup" => local::parse_pickup(payload),
        "bounce" => local::parse_bounce(payload),
        "master" => local::parse_master(payload),
        _ => Err(ParseError::UnsupportedLine),
    }
}

/// `postfix`, multi-instance names such as `postfix-slow`, and amavis'
/// re-injection instance.
fn is_postfix_process(process: &str) -> bool {
    process == "postfix" || process.starts_with("postfix-") || process == "amavis-inject"
}

#[cfg(test)]
mod tests {
    use time::Month;

    use super::*;

    #[test]
    fn invalid_line_is_fatal() {
        assert!(parse("Invalid Line").is_err());
        assert!(!parse("Invalid Line").err().map(|e| e.is_recoverable()).unwrap_or(true));
    }

    #[test]
    fn unsupported_line_keeps_header() {
        let (time, header, payload) = parse(
            "Sep 16 00:07:41 smtp-node07.com postfix-10.20.30.40/smtp[31868]: 0D59F4165A: \
             host mx-aol.mail.gm0.yahoodns.net[44.55.66.77] said: 421 4.7.0 [TSS04]",
        )
        .expect("valid header");

        assert_eq!(payload, Err(ParseError::UnsupportedLine));
        assert_eq!(header.process, "postfix");
        assert_eq!(header.daemon, "smtp");
        assert_eq!(header.host, "smtp-node07.com");
        assert_eq!(time.month, Month::September);
        assert_eq!(time.day, 16);
    }

    #[test]
    fn unknown_processes_are_unsupported() {
        for line in [
            "Apr  5 19:00:02 mail opendkim[195]: 407032C4FF6A: DKIM-Signature field added",
            "Jun 16 03:39:15 email dk_check[72882]: Starting the dk_check filter...",
            "Feb 16 00:07:34 smtpnode07 postfix-10.20.30.40/something[2342]: unsupported message",
            "Dec 17 06:25:48 sm02 /postfix-script[112854]: the Postfix mail system is running: PID: 95072",
        ] {
            let (_, _, payload) = parse(line).expect("valid header");
            assert_eq!(payload, Err(ParseError::UnsupportedLine), "{line}");
        }
    }

    #[test]
    fn leading_nul_bytes_are_ignored() {
        let line = format!("{}Jun  6 23:34:18 ucs fetchmail[2174]: Nachricht gelesen", "\0".repeat(64));
        let (_, header, payload) = parse(&line).expect("valid header");
        assert_eq!(header.process, "fetchmail");
        assert_eq!(header.host, "ucs");
        assert!(payload.is_err());
    }

    #[test]
    fn rfc3339_prefixed_line() {
        let (time, header, payload) = parse_with_rfc3339_time(
            "2021-05-16T00:01:42.278515+02:00 hq5 postfix/qmgr[21496]: 0262E27A61D7: \
             from=<h-1b6694c3@h-6f3118263bf.com>, size=19314, nrcpt=1 (queue active)",
        )
        .expect("valid line");

        assert_eq!(time, time::macros::datetime!(2021-05-16 00:01:42 UTC));
        assert_eq!(header.host, "hq5");
        assert_eq!(payload.expect("queued").queue(), Some("0262E27A61D7"));
    }
}
