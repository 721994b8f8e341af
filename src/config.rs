use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AppError, Result};

/// Settings snapshot for one bot account. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub account_id: u64,
    #[serde(default)]
    pub name: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub advanced: AdvancedSettings,
    #[serde(default)]
    pub auto_restart: AutoRestartSchedule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub http: Endpoint,
    #[serde(default)]
    pub websocket: Endpoint,
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedSettings {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub file_log: bool,
    #[serde(default = "default_true")]
    pub console_log: bool,
    #[serde(default = "default_file_log_level")]
    pub file_log_level: LogLevel,
    #[serde(default)]
    pub console_log_level: LogLevel,
}

/// Periodic reboot of a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRestartSchedule {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_restart_interval")]
    pub interval: Interval,
    /// Upper bound of the random delay added to each interval, 0..=3600.
    #[serde(default)]
    pub jitter_secs: u32,
}

/// Durations written as `45s`, `30m`, `6h` or `1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval(Duration);

impl Interval {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| AppError::config(format!("Interval '{text}' is missing a unit")))?;
        let (amount, unit) = text.split_at(split);
        let amount: u64 = amount
            .parse()
            .map_err(|_| AppError::config(format!("Invalid interval '{text}'")))?;
        let unit_secs = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => return Err(AppError::config(format!("Unknown interval unit in '{text}'"))),
        };
        if amount == 0 {
            return Err(AppError::config("Interval must be greater than zero"));
        }
        Ok(Self(Duration::from_secs(amount.saturating_mul(unit_secs))))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs % 86400 == 0 {
            write!(f, "{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_file_log_level() -> LogLevel {
    LogLevel::Debug
}

fn default_restart_interval() -> Interval {
    Interval(Duration::from_secs(6 * 3600))
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            http: Endpoint::default(),
            websocket: Endpoint::default(),
            secret: String::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            debug: false,
            file_log: false,
            console_log: true,
            file_log_level: LogLevel::Debug,
            console_log_level: LogLevel::Info,
        }
    }
}

impl Default for AutoRestartSchedule {
    fn default() -> Self {
        Self {
            enable: false,
            interval: default_restart_interval(),
            jitter_secs: 0,
        }
    }
}

impl AutoRestartSchedule {
    /// Delay until the next scheduled reboot, `None` when disabled.
    pub fn next_delay(&self) -> Option<Duration> {
        if !self.enable {
            return None;
        }
        let jitter = if self.jitter_secs == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=u64::from(self.jitter_secs))
        };
        self.interval
            .as_duration()
            .checked_add(Duration::from_secs(jitter))
    }
}

impl InstanceConfig {
    pub fn new(
        account_id: u64,
        executable: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            account_id,
            name: String::new(),
            executable: executable.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            connection: ConnectionSettings::default(),
            advanced: AdvancedSettings::default(),
            auto_restart: AutoRestartSchedule::default(),
        }
    }

    /// Fill in a random display name when none was given.
    pub fn with_default_name(mut self) -> Self {
        if self.name.trim().is_empty() {
            self.name = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .map(char::from)
                .filter(char::is_ascii_alphabetic)
                .take(8)
                .collect();
        }
        self
    }

    /// Arguments passed after the executable: user args, then `-q <account>`.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("-q".to_string());
        args.push(self.account_id.to_string());
        args
    }

    /// Variables added on top of the inherited environment.
    /// Explicit `env` entries override the derived ones.
    pub fn launch_env(&self) -> BTreeMap<String, String> {
        let flag = |on: bool| if on { "1" } else { "0" }.to_string();
        let adv = &self.advanced;
        let conn = &self.connection;

        let mut env = BTreeMap::from([
            ("BOT_ACCOUNT_ID".to_string(), self.account_id.to_string()),
            ("BOT_DEBUG".to_string(), flag(adv.debug)),
            ("BOT_FILE_LOG".to_string(), flag(adv.file_log)),
            (
                "BOT_FILE_LOG_LEVEL".to_string(),
                adv.file_log_level.as_str().to_string(),
            ),
            ("BOT_CONSOLE_LOG".to_string(), flag(adv.console_log)),
            (
                "BOT_CONSOLE_LOG_LEVEL".to_string(),
                adv.console_log_level.as_str().to_string(),
            ),
            (
                "BOT_HEARTBEAT_INTERVAL_MS".to_string(),
                conn.heartbeat_interval_ms.to_string(),
            ),
        ]);
        if !conn.secret.is_empty() {
            env.insert("BOT_SECRET".to_string(), conn.secret.clone());
        }
        if conn.http.enable {
            env.insert("BOT_HTTP_HOST".to_string(), conn.http.host.clone());
            env.insert("BOT_HTTP_PORT".to_string(), conn.http.port.to_string());
        }
        if conn.websocket.enable {
            env.insert("BOT_WS_HOST".to_string(), conn.websocket.host.clone());
            env.insert("BOT_WS_PORT".to_string(), conn.websocket.port.to_string());
        }
        for (key, value) in &self.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

/// Tunables of the supervisor itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_graceful_timeout_secs")]
    pub graceful_shutdown_timeout_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_output_history_lines")]
    pub output_history_lines: usize,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

/// Cap on quick-login auto-restarts inside a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_graceful_timeout_secs() -> u64 {
    10
}

fn default_event_capacity() -> usize {
    256
}

fn default_output_history_lines() -> usize {
    500
}

fn default_max_restarts() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    300
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            window_secs: default_window_secs(),
        }
    }
}

impl RestartPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            graceful_shutdown_timeout_secs: default_graceful_timeout_secs(),
            event_capacity: default_event_capacity(),
            output_history_lines: default_output_history_lines(),
            restart_policy: RestartPolicy::default(),
        }
    }
}

impl SupervisorSettings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content)?;
        if settings.event_capacity == 0 {
            return Err(AppError::config("event_capacity must be greater than zero"));
        }
        Ok(settings)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

/// Read supervisor settings from a TOML file; a missing file yields defaults.
pub fn load_settings(path: &Path) -> Result<SupervisorSettings> {
    if !path.exists() {
        log::info!("Settings file {:?} not found, using defaults", path);
        return Ok(SupervisorSettings::default());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::config(format!("Failed to read {:?}: {}", path, e)))?;
    SupervisorSettings::from_toml_str(content.trim_start_matches('\u{feff}'))
}
