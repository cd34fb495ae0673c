use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use controlcenter_helpers::de::deserialize_duration;
use controlcenter_pipeline::announcer::SyncSettings;
use controlcenter_pipeline::dbrunner::DbRunnerSettings;
use controlcenter_pipeline::rawlogs::RawLogsSettings;
use controlcenter_pipeline::sources::{DEFAULT_BASES, SocketAddress};
use controlcenter_pipeline::tracker::TrackerSettings;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Directory,
    Socket,
    Stdin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default = "default_source")]
    pub source: SourceKind,
    /// File or directory to read, for the `file` and `directory` sources.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// `unix=/path` or `tcp=host:port`, for the `socket` source.
    #[serde(default)]
    pub socket: Option<String>,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Year of the first syslog line; `0` is the current year.
    #[serde(default)]
    pub log_year: i32,
    #[serde(default)]
    pub follow: bool,
    #[serde(default = "default_log_patterns")]
    pub log_patterns: Vec<String>,
    #[serde(default = "default_reader_idle_timeout", deserialize_with = "deserialize_duration")]
    pub reader_idle_timeout: Duration,
    #[serde(default = "default_socket_connection_timeout", deserialize_with = "deserialize_duration")]
    pub socket_connection_timeout: Duration,
    #[serde(default)]
    pub rawlogs: RawLogsConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub announcer: AnnouncerConfig,
    #[serde(default)]
    pub db: DbConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_config_path)
            .context("config path not found (CONTROLCENTER_CONFIG_PATH or controlcenter.yaml/controlcenter.yml)")?;

        let mut config = load_config_yaml(&config_path)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.log_format = self.log_format.trim().to_string();
        if self.log_format.is_empty() {
            self.log_format = default_log_format();
        }

        self.socket = self.socket.take().and_then(|socket| {
            let trimmed = socket.trim();
            if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
        });

        self.log_patterns = self
            .log_patterns
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if self.log_patterns.is_empty() {
            self.log_patterns = default_log_patterns();
        }

        self.rawlogs.cleaning_batch_size = self.rawlogs.cleaning_batch_size.max(1);
        self.db.action_queue_capacity = self.db.action_queue_capacity.max(1);
    }

    fn validate(&self) -> Result<()> {
        if self.workspace.as_os_str().is_empty() {
            bail!("config `workspace` is empty");
        }

        match self.source {
            SourceKind::File | SourceKind::Directory if self.log_path.is_none() => {
                bail!("config source `{:?}` needs `log_path`", self.source);
            }
            SourceKind::Socket => {
                let Some(socket) = &self.socket else {
                    bail!("config source `socket` needs `socket`");
                };
                socket.parse::<SocketAddress>().context("invalid config `socket`")?;
            }
            _ => {}
        }

        if self.log_year < 0 {
            bail!("config `log_year` must not be negative: {}", self.log_year);
        }

        Ok(())
    }

    pub fn year(&self) -> Option<i32> {
        (self.log_year != 0).then_some(self.log_year)
    }

    pub fn logs_db_path(&self) -> PathBuf {
        self.workspace.join("logs.db")
    }

    pub fn rawlogs_db_path(&self) -> PathBuf {
        self.workspace.join("rawlogs.db")
    }

    pub fn master_db_path(&self) -> PathBuf {
        self.workspace.join("master.db")
    }

    pub fn runner_settings(&self) -> DbRunnerSettings {
        DbRunnerSettings { commit_interval: self.db.commit_interval, queue_capacity: self.db.action_queue_capacity }
    }

    pub fn rawlogs_settings(&self) -> RawLogsSettings {
        RawLogsSettings {
            max_age: self.rawlogs.max_age,
            cleaning_batch_size: self.rawlogs.cleaning_batch_size,
            cleaning_frequency: self.rawlogs.cleaning_frequency,
            runner: DbRunnerSettings {
                queue_capacity: self.db.action_queue_capacity.saturating_mul(RAWLOGS_QUEUE_FACTOR),
                ..self.runner_settings()
            },
        }
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            queue_idle_timeout: self.tracker.queue_idle_timeout,
            prune_interval: self.tracker.prune_interval,
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            sleep: self.announcer.sleep,
            primary_timeout: self.announcer.primary_timeout,
            secondary_timeout: self.announcer.secondary_timeout,
        }
    }
}

/// The raw log writer receives every line, so its queue is deeper.
const RAWLOGS_QUEUE_FACTOR: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawLogsConfig {
    #[serde(default = "default_rawlogs_max_age", deserialize_with = "deserialize_duration")]
    pub max_age: Duration,
    #[serde(default = "default_cleaning_batch_size")]
    pub cleaning_batch_size: i64,
    #[serde(default = "default_cleaning_frequency", deserialize_with = "deserialize_duration")]
    pub cleaning_frequency: Duration,
}

impl Default for RawLogsConfig {
    fn default() -> Self {
        Self {
            max_age: default_rawlogs_max_age(),
            cleaning_batch_size: default_cleaning_batch_size(),
            cleaning_frequency: default_cleaning_frequency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    #[serde(default = "default_queue_idle_timeout", deserialize_with = "deserialize_duration")]
    pub queue_idle_timeout: Duration,
    #[serde(default = "default_prune_interval", deserialize_with = "deserialize_duration")]
    pub prune_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { queue_idle_timeout: default_queue_idle_timeout(), prune_interval: default_prune_interval() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnnouncerConfig {
    #[serde(default = "default_announcer_sleep", deserialize_with = "deserialize_duration")]
    pub sleep: Duration,
    #[serde(default = "default_primary_timeout", deserialize_with = "deserialize_duration")]
    pub primary_timeout: Duration,
    #[serde(default = "default_secondary_timeout", deserialize_with = "deserialize_duration")]
    pub secondary_timeout: Duration,
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            sleep: default_announcer_sleep(),
            primary_timeout: default_primary_timeout(),
            secondary_timeout: default_secondary_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    #[serde(default = "default_commit_interval", deserialize_with = "deserialize_duration")]
    pub commit_interval: Duration,
    #[serde(default = "default_action_queue_capacity")]
    pub action_queue_capacity: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { commit_interval: default_commit_interval(), action_queue_capacity: default_action_queue_capacity() }
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!("too many arguments: {arg} (usage: controlcenter-server [config-path])");
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: controlcenter-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path).with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse YAML config {}", path.display()))
}

fn parse_config(raw: &[u8]) -> Result<Config> {
    Ok(serde_yaml::from_slice(raw)?)
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("CONTROLCENTER_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let mut dirs = Vec::new();
    if let Some(home) = non_empty_env("HOME") {
        dirs.push(PathBuf::from(home));
    }
    dirs.push(env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    dirs.into_iter()
        .flat_map(|dir| [dir.join("controlcenter.yaml"), dir.join("controlcenter.yml")])
        .find(|path| path.exists())
}

fn default_workspace() -> PathBuf {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    cwd.join("lightmeter_workspace")
}

fn default_source() -> SourceKind {
    SourceKind::Directory
}

fn default_log_format() -> String {
    "default".to_string()
}

fn default_log_patterns() -> Vec<String> {
    DEFAULT_BASES.iter().map(|b| b.to_string()).collect()
}

fn default_reader_idle_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_socket_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_rawlogs_max_age() -> Duration {
    Duration::from_secs(90 * 24 * 3600)
}

fn default_cleaning_batch_size() -> i64 {
    10_000
}

fn default_cleaning_frequency() -> Duration {
    Duration::from_secs(30)
}

fn default_queue_idle_timeout() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_announcer_sleep() -> Duration {
    Duration::from_millis(500)
}

fn default_primary_timeout() -> Duration {
    Duration::from_secs(40)
}

fn default_secondary_timeout() -> Duration {
    Duration::from_secs(80)
}

fn default_commit_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_action_queue_capacity() -> usize {
    1024
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}
