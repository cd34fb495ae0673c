use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Accepts either integer seconds or a humantime string (`"500ms"`,
/// `"90days"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration<E: serde::de::Error>(self) -> Result<Option<Duration>, E> {
        match self {
            Self::Seconds(secs) => Ok(Some(Duration::from_secs(secs))),
            Self::Text(value) => {
                let value = value.trim();
                if value.is_empty() {
                    return Ok(None);
                }

                humantime::parse_duration(value).map(Some).map_err(E::custom)
            }
        }
    }
}

pub fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => raw.into_duration(),
    }
}

/// Like `deserialize_optional_duration`, but an explicit empty value is an
/// error. Pair it with `#[serde(default = "...")]` for missing keys.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()?
        .ok_or_else(|| D::Error::custom("empty duration"))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default, deserialize_with = "deserialize_optional_duration")]
        optional: Option<Duration>,
        #[serde(default = "default_required", deserialize_with = "deserialize_duration")]
        required: Duration,
    }

    fn default_required() -> Duration {
        Duration::from_secs(30)
    }

    #[test]
    fn parses_seconds_and_humantime_values() {
        let sample: Sample =
            serde_yaml::from_str("optional: 500ms\nrequired: 90days\n").expect("valid yaml");

        assert_eq!(sample.optional, Some(Duration::from_millis(500)));
        assert_eq!(sample.required, Duration::from_secs(90 * 24 * 3600));

        let sample: Sample = serde_yaml::from_str("required: 12\n").expect("valid yaml");
        assert_eq!(sample.optional, None);
        assert_eq!(sample.required, Duration::from_secs(12));
    }

    #[test]
    fn missing_and_blank_values() {
        let sample: Sample = serde_yaml::from_str("optional: ' '\n").expect("valid yaml");
        assert_eq!(sample.optional, None);
        assert_eq!(sample.required, Duration::from_secs(30));

        let err = serde_yaml::from_str::<Sample>("required: ''\n");
        assert!(err.is_err());

        let err = serde_yaml::from_str::<Sample>("required: soon\n");
        assert!(err.is_err());
    }
}
