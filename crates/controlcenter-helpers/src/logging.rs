#[cfg(target_os = "linux")]
use std::env;

use tracing_subscriber::EnvFilter;
#[cfg(target_os = "linux")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(target_os = "linux")]
use tracing_subscriber::util::SubscriberInitExt;

/// Where log events end up after `init_logging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink {
    Journald,
    Stderr,
}

impl LogSink {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Journald => "journald",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogSettings<'a> {
    /// Filter used when neither `env_key` nor `RUST_LOG` is set.
    pub default_filter: &'a str,
    pub env_key: &'a str,
    pub service_name: &'a str,
}

/// Installs the global subscriber. Under systemd the journald layer is
/// preferred; everything else logs to stderr through the fmt formatter.
pub fn init_logging(settings: &LogSettings<'_>) -> LogSink {
    #[cfg(not(target_os = "linux"))]
    let _ = settings.service_name;

    let env_filter = build_env_filter(settings.default_filter, settings.env_key);

    #[cfg(target_os = "linux")]
    {
        if is_running_under_systemd() {
            match tracing_journald::layer() {
                Ok(layer) => {
                    let layer =
                        layer.with_syslog_identifier(settings.service_name.to_string());
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(layer)
                        .init();
                    return LogSink::Journald;
                }
                Err(err) => {
                    eprintln!(
                        "{}: journald init failed, falling back to stderr formatter: {err}",
                        settings.service_name,
                    );
                }
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    LogSink::Stderr
}

fn build_env_filter(
    default_filter: &str,
    env_key: &str,
) -> EnvFilter {
    EnvFilter::try_from_env(env_key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter))
}

#[cfg(target_os = "linux")]
#[inline]
fn is_running_under_systemd() -> bool {
    env::var_os("JOURNAL_STREAM").is_some()
        || env::var_os("INVOCATION_ID").is_some()
}
