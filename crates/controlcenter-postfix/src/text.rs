//! Small slicing helpers shared by the payload parsers.

use std::net::IpAddr;

/// Returns the trimmed text between the first `start` marker and the next
/// `end` marker after it.
pub(crate) fn extract_between<'a>(
    text: &'a str,
    start: &str,
    end: &str,
) -> Option<&'a str> {
    let start_idx = text.find(start)? + start.len();
    let rem = &text[start_idx..];
    let end_idx = rem.find(end)?;
    Some(rem[..end_idx].trim())
}

/// Reads an `<address>` value at the start of `text` and returns it plus the
/// remainder after the closing `>`. Quoted local parts may contain `>`.
pub(crate) fn take_angle_address(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix('<')?;
    let mut in_quotes = false;

    for (idx, c) in rest.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '>' if !in_quotes => return Some((&rest[..idx], &rest[idx + 1..])),
            _ => {}
        }
    }

    None
}

/// Reads a `"quoted"` value at the start of `text`. A doubled quote or a
/// backslash-escaped quote is kept as part of the value.
pub(crate) fn take_quoted(text: &str) -> Option<(String, &str)> {
    let rest = text.strip_prefix('"')?;
    let mut value = String::with_capacity(rest.len());
    let mut chars = rest.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    value.push(escaped);
                }
            }
            '"' => {
                let after = &rest[idx + 1..];
                let ends_value = after.is_empty()
                    || after.starts_with(", ")
                    || after.starts_with(',');
                if ends_value {
                    return Some((value, after));
                }
                value.push(c);
            }
            _ => value.push(c),
        }
    }

    None
}

/// Splits `local@domain`; a bare `local` yields an empty domain.
pub(crate) fn split_address(address: &str) -> (String, String) {
    match address.rsplit_once('@') {
        Some((local, domain)) => (unquote(local).to_string(), domain.to_string()),
        None => (unquote(address).to_string(), String::new()),
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Postfix queue ids are upper-case hex (short ids) or base-52 alnum (long
/// ids); both are plain ASCII alphanumerics.
pub(crate) fn is_queue_id(queue_id: &str) -> bool {
    !queue_id.is_empty()
        && queue_id.len() <= 32
        && queue_id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Splits `QUEUEID: rest`, validating the queue id.
pub(crate) fn split_queue(payload: &str) -> Option<(&str, &str)> {
    let (queue, rest) = payload.split_once(": ")?;
    if is_queue_id(queue) { Some((queue, rest)) } else { None }
}

/// Takes `key` and the value after it, up to the next `, ` separator.
pub(crate) fn take_field<'a>(
    text: &'a str,
    key: &str,
) -> Option<(&'a str, &'a str)> {
    let rest = text.strip_prefix(key)?;
    Some(rest.split_once(", ").unwrap_or((rest, "")))
}

/// Splits `host[ip]`. The address is `None` when it does not parse, as
/// with `unknown[unknown]`.
pub(crate) fn split_host_ip(text: &str) -> Option<(&str, Option<IpAddr>)> {
    let host = &text[..text.find('[')?];
    let ip = extract_between(text, "[", "]")?;
    Some((host, ip.parse().ok()))
}
