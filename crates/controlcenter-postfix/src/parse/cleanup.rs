use crate::error::ParseError;
use crate::payload::{CleanupMessageAccepted, CleanupMilterReject, Payload};
use crate::text::split_queue;

pub(super) fn parse(payload: &str) -> Result<Payload, ParseError> {
    let (queue, rest) = split_queue(payload).ok_or(ParseError::UnsupportedLine)?;

    if let Some(value) = rest.strip_prefix("message-id=") {
        let (message_id, corrupted) = message_id(value);
        return Ok(Payload::CleanupMessageAccepted(CleanupMessageAccepted {
            queue: queue.to_string(),
            message_id: message_id.to_string(),
            corrupted,
        }));
    }

    if let Some(rest) = rest.strip_prefix("milter-reject: ") {
        return Ok(Payload::CleanupMilterReject(CleanupMilterReject {
            queue: queue.to_string(),
            extra_message: rest.to_string(),
        }));
    }

    Err(ParseError::UnsupportedLine)
}

/// Message ids are set by the sender, so anything goes. Bracketed values
/// lose the brackets; empty values, unterminated brackets and text after
/// the closing bracket mark the id as corrupted.
fn message_id(value: &str) -> (&str, bool) {
    if value.is_empty() {
        return ("", true);
    }

    match value.strip_prefix('<') {
        Some(inner) => match inner.find('>') {
            Some(end) => (&inner[..end], end + 1 != inner.len()),
            None => (inner, true),
        },
        None => (value, false),
    }
}
