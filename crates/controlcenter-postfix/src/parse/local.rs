//! Daemons that only announce a single kind of event: pickup, bounce and
//! master.

use crate::error::ParseError;
use crate::payload::{Address, BounceCreated, Payload, Pickup, Version};
use crate::text::{is_queue_id, split_address, split_queue, take_angle_address};

/// `Q: uid=N from=<s>`
pub(super) fn parse_pickup(payload: &str) -> Result<Payload, ParseError> {
    let (queue, rest) = split_queue(payload).ok_or(ParseError::UnsupportedLine)?;
    let rest = rest.strip_prefix("uid=").ok_or(ParseError::UnsupportedLine)?;
    let (uid, rest) = rest.split_once(' ').ok_or(ParseError::UnsupportedLine)?;

    let sender = rest
        .strip_prefix("from=")
        .and_then(take_angle_address)
        .map(|(sender, _)| sender)
        .ok_or_else(|| ParseError::payload("pickup", "invalid sender"))?;
    let (local, domain) = split_address(sender);

    Ok(Payload::Pickup(Pickup {
        queue: queue.to_string(),
        uid: uid
            .parse()
            .map_err(|_| ParseError::payload("pickup", format!("invalid uid {uid}")))?,
        sender: Address { local, domain },
    }))
}

/// `Q: sender non-delivery notification: CHILD`
pub(super) fn parse_bounce(payload: &str) -> Result<Payload, ParseError> {
    let (queue, rest) = split_queue(payload).ok_or(ParseError::UnsupportedLine)?;
    let child = rest
        .strip_prefix("sender non-delivery notification: ")
        .ok_or(ParseError::UnsupportedLine)?;

    if !is_queue_id(child) {
        return Err(ParseError::payload("bounce", format!("invalid queue {child}")));
    }

    Ok(Payload::BounceCreated(BounceCreated {
        queue: queue.to_string(),
        child: child.to_string(),
    }))
}

/// `daemon started -- version 3.4.14, configuration /etc/postfix`
pub(super) fn parse_master(payload: &str) -> Result<Payload, ParseError> {
    let rest = payload
        .strip_prefix("daemon started -- version ")
        .ok_or(ParseError::UnsupportedLine)?;

    let (version, configuration) = match rest.split_once(", configuration ") {
        Some((version, configuration)) => (version, configuration),
        None => (rest, ""),
    };

    if version.is_empty() {
        return Err(ParseError::payload("master", "empty version"));
    }

    Ok(Payload::Version(Version {
        version: version.to_string(),
        configuration: configuration.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pickup_with_bare_local_sender() {
        assert_eq!(
            parse_pickup("08ACF1541B01: uid=42 from=<someone>"),
            Ok(Payload::Pickup(Pickup {
                queue: "08ACF1541B01".to_string(),
                uid: 42,
                sender: Address::new("someone", ""),
            })),
        );
    }

    #[test]
    fn bounce_names_the_child_queue() {
        assert_eq!(
            parse_bounce("3A1973E542: sender non-delivery notification: 6EAA43E543"),
            Ok(Payload::BounceCreated(BounceCreated {
                queue: "3A1973E542".to_string(),
                child: "6EAA43E543".to_string(),
            })),
        );
        assert_eq!(
            parse_bounce("3A1973E542: sender delivery status notification: 6EAA43E543"),
            Err(ParseError::UnsupportedLine),
        );
    }

    #[test]
    fn master_announces_version() {
        assert_eq!(
            parse_master("daemon started -- version 3.4.14, configuration /etc/postfix"),
            Ok(Payload::Version(Version {
                version: "3.4.14".to_string(),
                configuration: "/etc/postfix".to_string(),
            })),
        );
        assert_eq!(parse_master("reload -- version 3.4.14"), Err(ParseError::UnsupportedLine));
    }
}
