use serde::Serialize;
use time::OffsetDateTime;

/// Closed time range, compared at second precision in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeInterval {
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
}

impl TimeInterval {
    pub fn new(
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Self {
        Self { from, to }
    }

    pub fn from_unix(&self) -> i64 {
        self.from.unix_timestamp()
    }

    pub fn to_unix(&self) -> i64 {
        self.to.unix_timestamp()
    }

    pub fn contains(
        &self,
        time: OffsetDateTime,
    ) -> bool {
        self.from <= time && time <= self.to
    }
}
