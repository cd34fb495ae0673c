use crate::error::ParseError;
use crate::payload::{Address, MailQueued, MessageExpired, Payload, QueueRemoved};
use crate::text::{split_address, split_queue, take_angle_address, take_field};

const KIND: &str = "qmgr";

pub(super) fn parse(payload: &str) -> Result<Payload, ParseError> {
    let (queue, rest) = split_queue(payload).ok_or(ParseError::UnsupportedLine)?;

    if rest == "removed" {
        return Ok(Payload::QueueRemoved(QueueRemoved { queue: queue.to_string() }));
    }

    let rest = rest.strip_prefix("from=").ok_or(ParseError::UnsupportedLine)?;
    let (sender, rest) =
        take_angle_address(rest).ok_or_else(|| ParseError::payload(KIND, "invalid sender"))?;
    let (local, domain) = split_address(sender);
    let sender = Address { local, domain };
    let rest = rest.strip_prefix(", ").unwrap_or(rest);

    if let Some((size, rest)) = take_field(rest, "size=") {
        let nrcpt = rest
            .strip_prefix("nrcpt=")
            .and_then(|n| n.strip_suffix(" (queue active)"))
            .ok_or(ParseError::UnsupportedLine)?;

        return Ok(Payload::MailQueued(MailQueued {
            queue: queue.to_string(),
            sender,
            size: size.parse().map_err(|_| ParseError::payload(KIND, format!("invalid size {size}")))?,
            nrcpt: nrcpt
                .parse()
                .map_err(|_| ParseError::payload(KIND, format!("invalid nrcpt {nrcpt}")))?,
        }));
    }

    if let Some(message) = rest.strip_prefix("status=") {
        let forced = if message.starts_with("force-expired, ") {
            true
        } else if message.starts_with("expired, ") {
            false
        } else {
            return Err(ParseError::UnsupportedLine);
        };

        return Ok(Payload::MessageExpired(MessageExpired {
            queue: queue.to_string(),
            sender,
            forced,
            message: message.to_string(),
        }));
    }

    Err(ParseError::UnsupportedLine)
}
