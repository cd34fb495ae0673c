use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::error::ParseError;

/// `Mon DD HH:MM:SS ` including the trailing space; the day may be
/// space padded.
pub const SYSLOG_HEADER_LEN: usize = 16;

/// Shortest accepted ISO header: `YYYY-MM-DDTHH:MM:SS`.
const ISO_SECONDS_LEN: usize = 19;

/// A syslog timestamp, which carries no year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyslogTime {
    pub month: Month,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl SyslogTime {
    /// Parses the 15 byte `Mon DD HH:MM:SS` form.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidTime(text.to_string());

        if text.len() != SYSLOG_HEADER_LEN - 1 || !text.is_ascii() {
            return Err(invalid());
        }

        let month = parse_month(&text[0..3]).ok_or_else(invalid)?;
        if &text[3..4] != " " || &text[6..7] != " " {
            return Err(invalid());
        }

        let day = parse_number(text[4..6].trim_start()).ok_or_else(invalid)?;

        let clock = &text[7..];
        let mut parts = clock.split(':');
        let (Some(hour), Some(minute), Some(second), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let check_len = |part: &str| part.len() == 2;
        if !(check_len(hour) && check_len(minute) && check_len(second)) {
            return Err(invalid());
        }

        Ok(Self {
            month,
            day,
            hour: parse_number(hour).ok_or_else(invalid)?,
            minute: parse_number(minute).ok_or_else(invalid)?,
            second: parse_number(second).ok_or_else(invalid)?,
        })
    }

    /// Builds the absolute UTC instant for `year`. Fails on impossible
    /// dates such as `Feb 29` on a non leap year.
    pub fn in_year(
        &self,
        year: i32,
    ) -> Result<OffsetDateTime, ParseError> {
        let invalid = |err: time::error::ComponentRange| {
            ParseError::InvalidTime(format!("{self:?} in {year}: {err}"))
        };

        let date = Date::from_calendar_date(year, self.month, self.day).map_err(invalid)?;
        let time = Time::from_hms(self.hour, self.minute, self.second).map_err(invalid)?;

        Ok(PrimitiveDateTime::new(date, time).assume_utc())
    }
}

fn parse_month(text: &str) -> Option<Month> {
    let month = match text {
        "Jan" => Month::January,
        "Feb" => Month::February,
        "Mar" => Month::March,
        "Apr" => Month::April,
        "May" => Month::May,
        "Jun" => Month::June,
        "Jul" => Month::July,
        "Aug" => Month::August,
        "Sep" => Month::September,
        "Oct" => Month::October,
        "Nov" => Month::November,
        "Dec" => Month::December,
        _ => return None,
    };

    Some(month)
}

fn parse_number(text: &str) -> Option<u8> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    text.parse().ok()
}

/// Splits the syslog timestamp off a line, returning it and the rest of the
/// line (`host process[pid]: ...`). Leading NUL bytes, left behind by
/// truncated log files, are ignored.
pub fn split_syslog_time(line: &str) -> Result<(SyslogTime, &str), ParseError> {
    let line = line.trim_start_matches('\0');

    if line.len() < SYSLOG_HEADER_LEN || !line.is_char_boundary(SYSLOG_HEADER_LEN) {
        return Err(ParseError::InvalidHeader);
    }

    let (head, rest) = line.split_at(SYSLOG_HEADER_LEN);
    let Some(head) = head.strip_suffix(' ') else {
        return Err(ParseError::InvalidHeader);
    };

    Ok((SyslogTime::parse(head)?, rest))
}

/// Splits an ISO-8601 timestamp prefix (`2021-05-16T00:01:42.278515+02:00 `).
///
/// Only the calendar and wall clock fields are used and they are read as
/// UTC: fractional seconds and the offset are ignored.
pub fn split_rfc3339_time(line: &str) -> Result<(OffsetDateTime, &str), ParseError> {
    let (token, rest) = line.split_once(' ').ok_or(ParseError::InvalidHeader)?;

    if token.len() < ISO_SECONDS_LEN || !token.is_char_boundary(ISO_SECONDS_LEN) {
        return Err(ParseError::InvalidTime(token.to_string()));
    }

    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let parsed = PrimitiveDateTime::parse(&token[..ISO_SECONDS_LEN], format)
        .map_err(|err| ParseError::InvalidTime(format!("{token}: {err}")))?;

    Ok((parsed.assume_utc(), rest))
}

/// Parses a complete RFC 3339 timestamp, keeping sub-second precision, and
/// normalises it to UTC.
pub fn parse_rfc3339(token: &str) -> Result<OffsetDateTime, ParseError> {
    OffsetDateTime::parse(token, &Rfc3339)
        .map(|t| t.to_offset(UtcOffset::UTC))
        .map_err(|err| ParseError::InvalidTime(format!("{token}: {err}")))
}

/// Resolves year-less syslog timestamps into absolute instants.
///
/// The year starts at the configured value and moves forward by one every
/// time the month goes backwards (`Dec` followed by `Jan`). It never moves
/// past `max_year`, usually the current year of the clock.
#[derive(Debug, Clone)]
pub struct TimeConverter {
    year: i32,
    max_year: i32,
    last_month: Option<Month>,
}

impl TimeConverter {
    pub fn new(
        initial_year: i32,
        max_year: i32,
    ) -> Self {
        Self { year: initial_year, max_year: max_year.max(initial_year), last_month: None }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn convert(
        &mut self,
        time: &SyslogTime,
    ) -> Result<OffsetDateTime, ParseError> {
        if let Some(last) = self.last_month {
            if (time.month as u8) < (last as u8) && self.year < self.max_year {
                self.year += 1;
            }
        }

        let converted = time.in_year(self.year)?;
        self.last_month = Some(time.month);
        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn parses_space_padded_and_zero_padded_days() {
        let (time, rest) =
            split_syslog_time("Feb  4 09:29:33 mail postfix/qmgr[964]: 027BD2C77B20: removed")
                .expect("valid header");
        assert_eq!(time.month, Month::February);
        assert_eq!(time.day, 4);
        assert_eq!((time.hour, time.minute, time.second), (9, 29, 33));
        assert_eq!(rest, "mail postfix/qmgr[964]: 027BD2C77B20: removed");

        let (time, _) = split_syslog_time("Sep 04 00:07:41 host x: y").expect("valid header");
        assert_eq!(time.day, 4);
    }

    #[test]
    fn strips_leading_nul_bytes() {
        let (time, rest) =
            split_syslog_time("\0\0\0Mar  3 02:55:42 mail dovecot: hi").expect("valid header");
        assert_eq!(time.month, Month::March);
        assert_eq!(rest, "mail dovecot: hi");
    }

    #[test]
    fn rejects_malformed_timestamps() {
        assert!(split_syslog_time("Foo  4 09:29:33 host x: y").is_err());
        assert!(split_syslog_time("Feb  4 09:29 host x: y").is_err());
        assert!(split_syslog_time("Feb").is_err());
        assert!(split_syslog_time("lalala Mar  6 07:08:59 host").is_err());
    }

    #[test]
    fn converts_unix_timestamp_in_utc() {
        let time = SyslogTime { month: Month::May, day: 25, hour: 5, minute: 12, second: 22 };
        assert_eq!(time.in_year(2008).expect("valid").unix_timestamp(), 1_211_692_342);

        let leap = SyslogTime { month: Month::February, day: 29, hour: 0, minute: 0, second: 0 };
        assert!(leap.in_year(2021).is_err());
        assert!(leap.in_year(2020).is_ok());
    }

    #[test]
    fn converter_moves_to_next_year_once_on_month_wraparound() {
        let mut converter = TimeConverter::new(2020, 2021);
        let dec = SyslogTime { month: Month::December, day: 31, hour: 23, minute: 59, second: 59 };
        let jan = SyslogTime { month: Month::January, day: 1, hour: 0, minute: 0, second: 1 };

        assert_eq!(converter.convert(&dec).expect("valid"), datetime!(2020-12-31 23:59:59 UTC));
        assert_eq!(converter.convert(&jan).expect("valid"), datetime!(2021-01-01 00:00:01 UTC));
        assert_eq!(converter.convert(&jan).expect("valid"), datetime!(2021-01-01 00:00:01 UTC));
        assert_eq!(converter.year(), 2021);

        // capped: no further increment beyond max_year
        assert_eq!(converter.convert(&dec).expect("valid"), datetime!(2021-12-31 23:59:59 UTC));
        assert_eq!(converter.convert(&jan).expect("valid"), datetime!(2021-01-01 00:00:01 UTC));
    }

    #[test]
    fn iso_prefix_is_read_as_utc_wall_clock() {
        let (time, rest) =
            split_rfc3339_time("2021-05-16T00:01:44.278515+02:00 mail postfix/postscreen[1]: x")
                .expect("valid");
        assert_eq!(time, datetime!(2021-05-16 00:01:44 UTC));
        assert_eq!(rest, "mail postfix/postscreen[1]: x");

        assert!(split_rfc3339_time("9898789").is_err());
        assert!(split_rfc3339_time("2021-05-16 x").is_err());
    }

    #[test]
    fn full_rfc3339_keeps_nanoseconds() {
        assert_eq!(
            parse_rfc3339("2021-03-08T07:21:23.496826493Z").expect("valid"),
            datetime!(2021-03-08 07:21:23.496826493 UTC),
        );
        assert_eq!(
            parse_rfc3339("2021-03-06T08:09:00+02:00").expect("valid"),
            datetime!(2021-03-06 06:09:00 UTC),
        );
    }
}
