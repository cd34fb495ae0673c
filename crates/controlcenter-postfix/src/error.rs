use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid header line")]
    InvalidHeader,
    #[error("invalid time: {0}")]
    InvalidTime(String),
    #[error("unsupported log line")]
    UnsupportedLine,
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

impl ParseError {
    /// Recoverable errors keep the record (with an unsupported payload);
    /// the others drop the line.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnsupportedLine | Self::InvalidPayload { .. })
    }

    pub(crate) fn payload(
        kind: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidPayload { kind, reason: reason.into() }
    }
}
