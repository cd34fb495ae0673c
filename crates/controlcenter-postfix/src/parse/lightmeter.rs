use crate::error::ParseError;
use crate::payload::{Address, Payload, RelayedBounce};
use crate::text::{split_address, split_queue, take_angle_address, take_quoted};

const KIND: &str = "relayed-bounce";

/// `[Q: |Bounce: ]code="D", sender=<s>, recipient=<r>, mta="m", message="t"`,
/// written by the lightmeter milter. Fields may come in any order and
/// unknown ones are skipped.
pub(super) fn parse_relayed_bounce(payload: &str) -> Result<Payload, ParseError> {
    let (queue, mut rest) = match payload.strip_prefix("Bounce: ") {
        Some(rest) => (None, rest),
        None => {
            let (queue, rest) = split_queue(payload).ok_or(ParseError::UnsupportedLine)?;
            (Some(queue.to_string()), rest)
        }
    };

    let mut bounce = RelayedBounce {
        queue,
        dsn: String::new(),
        sender: Address::default(),
        recipient: Address::default(),
        reporting_mta: String::new(),
        message: String::new(),
    };

    while !rest.is_empty() {
        let (key, value) = rest
            .split_once('=')
            .ok_or_else(|| ParseError::payload(KIND, format!("expected key=value at {rest}")))?;

        let (value, after) = take_value(value)?;

        match key {
            "code" => bounce.dsn = value,
            "sender" => bounce.sender = address(&value),
            "recipient" => bounce.recipient = address(&value),
            "mta" => bounce.reporting_mta = value,
            "message" => bounce.message = value,
            _ => {}
        }

        rest = after.strip_prefix(',').map(str::trim_start).unwrap_or(after);
        if !after.is_empty() && rest.len() == after.len() {
            return Err(ParseError::payload(KIND, format!("trailing text {after}")));
        }
    }

    if bounce.dsn.is_empty() || bounce.recipient.is_empty() {
        return Err(ParseError::payload(KIND, "missing code or recipient"));
    }

    Ok(Payload::RelayedBounce(bounce))
}

fn take_value(text: &str) -> Result<(String, &str), ParseError> {
    if text.starts_with('"') {
        return take_quoted(text).ok_or_else(|| ParseError::payload(KIND, "unterminated quote"));
    }

    if text.starts_with('<') {
        let (value, rest) =
            take_angle_address(text).ok_or_else(|| ParseError::payload(KIND, "unterminated address"))?;
        return Ok((value.to_string(), rest));
    }

    let end = text.find(',').unwrap_or(text.len());
    Ok((text[..end].to_string(), &text[end..]))
}

fn address(value: &str) -> Address {
    let (local, domain) = split_address(value);
    Address { local, domain }
}
