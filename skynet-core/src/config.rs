//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/skynet/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/skynet/` (~/.config/skynet/)
//! - Data: `$XDG_DATA_HOME/skynet/` (~/.local/share/skynet/)
//! - State/Logs: `$XDG_STATE_HOME/skynet/` (~/.local/state/skynet/)

use crate::error::{Error, Result};
use crate::types::Priority;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Channel name of the live UI feed subscriber
pub const UI_CHANNEL: &str = "ui";

/// Channel name of the Telegram bot subscriber
pub const TELEGRAM_CHANNEL: &str = "telegram";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Expands a leading `~` against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Directory discovery and tailing
    #[serde(default)]
    pub watch: WatchConfig,

    /// Session status thresholds
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Notification policy and delivery
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Telegram bot channel (optional)
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Persisted store location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Continue-session launcher
    #[serde(default)]
    pub commands: CommandConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Directory monitor and tailer settings
#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Root directory holding one JSONL transcript per session
    #[serde(default = "default_sessions_root")]
    pub sessions_root: PathBuf,

    /// Bursts of filesystem events for one file inside this window trigger one re-read
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Fallback re-read interval when no filesystem events arrive
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Glob patterns (matched against the full path) excluded from ingestion
    #[serde(default = "default_ignore_patterns")]
    pub ignore: Vec<String>,

    /// Consecutive read failures before a file is treated as permanently unreadable
    #[serde(default = "default_max_read_failures")]
    pub max_read_failures: u32,

    /// Depth of the intake queue between tailers and the store
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            sessions_root: default_sessions_root(),
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            ignore: default_ignore_patterns(),
            max_read_failures: default_max_read_failures(),
            intake_capacity: default_intake_capacity(),
        }
    }
}

impl WatchConfig {
    /// The sessions root with `~` expanded
    pub fn root(&self) -> PathBuf {
        expand_home(&self.sessions_root)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_sessions_root() -> PathBuf {
    PathBuf::from("~/.claude/projects")
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        "**/subagents/**".to_string(),
        "**/agent-*.jsonl".to_string(),
    ]
}

fn default_max_read_failures() -> u32 {
    5
}

fn default_intake_capacity() -> usize {
    1024
}

/// Thresholds driving the time-based status sweep
#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Quiet period after which an active session becomes idle
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,

    /// Quiet period after which a session is considered finished
    #[serde(default = "default_completion_threshold_secs")]
    pub completion_threshold_secs: u64,

    /// How often the sweep runs
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: default_idle_threshold_secs(),
            completion_threshold_secs: default_completion_threshold_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl LifecycleConfig {
    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_threshold_secs as i64)
    }

    pub fn completion_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.completion_threshold_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_idle_threshold_secs() -> u64 {
    300
}

fn default_completion_threshold_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    15
}

/// Notification policy, rate limits and delivery retry settings
#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    /// Repeats of one classification for one session inside this window are dropped
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Tool invocations that ask the human something and always notify
    #[serde(default = "default_attention_tools")]
    pub attention_tools: Vec<String>,

    /// Notifications below this priority are suppressed
    #[serde(default)]
    pub min_priority: Priority,

    /// How often held-back rollups are re-checked against the rate limit
    #[serde(default = "default_rollup_check_secs")]
    pub rollup_check_secs: u64,

    /// Delivery attempts per channel before a notification is given up on
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry delay cap
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Per-subscriber queue depth
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-channel settings keyed by channel name
    #[serde(default = "default_channels")]
    pub channels: BTreeMap<String, ChannelConfig>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            attention_tools: default_attention_tools(),
            min_priority: Priority::default(),
            rollup_check_secs: default_rollup_check_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            queue_capacity: default_queue_capacity(),
            channels: default_channels(),
        }
    }
}

impl NotificationConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn rollup_check_interval(&self) -> Duration {
        Duration::from_secs(self.rollup_check_secs.max(1))
    }

    /// Settings for a channel, falling back to defaults for unlisted channels
    pub fn channel(&self, name: &str) -> ChannelConfig {
        self.channels.get(name).cloned().unwrap_or_default()
    }
}

/// Settings for one delivery channel
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    /// Notifications allowed per rolling hour
    #[serde(default = "default_rate_per_hour")]
    pub rate_per_hour: u32,

    /// Start with this channel muted
    #[serde(default)]
    pub muted: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            rate_per_hour: default_rate_per_hour(),
            muted: false,
        }
    }
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_attention_tools() -> Vec<String> {
    vec!["AskUserQuestion".to_string(), "ExitPlanMode".to_string()]
}

fn default_rollup_check_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    64
}

fn default_rate_per_hour() -> u32 {
    60
}

fn default_channels() -> BTreeMap<String, ChannelConfig> {
    let mut channels = BTreeMap::new();
    channels.insert(
        UI_CHANNEL.to_string(),
        ChannelConfig {
            rate_per_hour: 600,
            muted: false,
        },
    );
    channels.insert(
        TELEGRAM_CHANNEL.to_string(),
        ChannelConfig {
            rate_per_hour: 20,
            muted: false,
        },
    );
    channels
}

/// Telegram bot configuration
///
/// When enabled, approved notifications are also sent to one chat.
#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    /// Enable/disable the bot channel
    #[serde(default)]
    pub enabled: bool,

    /// Bot token from @BotFather
    pub bot_token: Option<String>,

    /// Chat that receives notifications
    pub chat_id: Option<String>,

    /// Bot API base URL
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_telegram_timeout")]
    pub timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: None,
            chat_id: None,
            api_base: default_telegram_api_base(),
            timeout_secs: default_telegram_timeout(),
        }
    }
}

impl TelegramConfig {
    /// Check if the bot is properly configured and enabled
    pub fn is_ready(&self) -> bool {
        self.enabled && self.bot_token.is_some() && self.chat_id.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.bot_token.is_none() {
            return Err(Error::Config(
                "telegram.bot_token is required when telegram is enabled".to_string(),
            ));
        }
        if self.chat_id.is_none() {
            return Err(Error::Config(
                "telegram.chat_id is required when telegram is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_timeout() -> u64 {
    15
}

/// Persisted store location
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StorageConfig {
    /// Override for the cursor/session/ledger database
    pub database_path: Option<PathBuf>,
}

/// External program used to continue a session with new text
#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    /// Program to spawn
    #[serde(default = "default_command_program")]
    pub program: String,

    /// Arguments; `{session_id}` and `{text}` are substituted
    #[serde(default = "default_command_args")]
    pub args: Vec<String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: default_command_program(),
            args: default_command_args(),
        }
    }
}

fn default_command_program() -> String {
    "claude".to_string()
}

fn default_command_args() -> Vec<String> {
    ["--resume", "{session_id}", "-p", "{text}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the pipeline misbehave
    pub fn validate(&self) -> Result<()> {
        if self.watch.debounce_ms == 0 {
            return Err(Error::Config("watch.debounce_ms must be > 0".to_string()));
        }
        if self.watch.intake_capacity == 0 {
            return Err(Error::Config(
                "watch.intake_capacity must be > 0".to_string(),
            ));
        }
        if self.lifecycle.idle_threshold_secs == 0 || self.lifecycle.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "lifecycle thresholds and sweep interval must be > 0".to_string(),
            ));
        }
        if self.lifecycle.completion_threshold_secs <= self.lifecycle.idle_threshold_secs {
            return Err(Error::Config(
                "lifecycle.completion_threshold_secs must exceed idle_threshold_secs".to_string(),
            ));
        }
        if self.notifications.max_attempts == 0 || self.notifications.queue_capacity == 0 {
            return Err(Error::Config(
                "notifications.max_attempts and queue_capacity must be > 0".to_string(),
            ));
        }
        for (name, channel) in &self.notifications.channels {
            if channel.rate_per_hour == 0 {
                return Err(Error::Config(format!(
                    "notifications.channels.{}.rate_per_hour must be > 0",
                    name
                )));
            }
        }
        self.telegram.validate()
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/skynet/config.toml` (~/.config/skynet/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("skynet").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/skynet/` (~/.local/share/skynet/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("skynet")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/skynet/` (~/.local/state/skynet/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("skynet")
    }

    /// Returns the database file path, honoring `storage.database_path`
    ///
    /// `$XDG_DATA_HOME/skynet/state.db` (~/.local/share/skynet/state.db)
    pub fn database_path(&self) -> PathBuf {
        match &self.storage.database_path {
            Some(path) => expand_home(path),
            None => Self::data_dir().join("state.db"),
        }
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/skynet/skynet.log` (~/.local/state/skynet/skynet.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("skynet.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
