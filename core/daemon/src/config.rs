//! Daemon runtime configuration.
//!
//! Loaded from `~/.switchboard/daemon/config.toml` (or `SWITCHBOARD_CONFIG`).
//! A missing file yields defaults; every key is optional.

use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::debug_trail::DEFAULT_TRAIL_CAPACITY;
use crate::error::ConfigError;
use crate::registry::RegistrySettings;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".switchboard/daemon/config.toml";
const CONFIG_ENV: &str = "SWITCHBOARD_CONFIG";
const SOCKET_ENV: &str = "SWITCHBOARD_DAEMON_SOCKET";
const SOCKET_RELATIVE_PATH: &str = ".switchboard/daemon.sock";
const META_RELATIVE_PATH: &str = ".switchboard/session-meta.json";
const TRANSCRIPT_RELATIVE_ROOT: &str = ".claude/projects";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReconcileConfig {
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,
    #[serde(default = "default_stop_suppress_ms")]
    pub stop_suppress_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: default_grace_window_ms(),
            stop_suppress_ms: default_stop_suppress_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ScannerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_pane_missing_grace_ms")]
    pub pane_missing_grace_ms: u64,
    #[serde(default = "default_display_only_ttl_secs")]
    pub display_only_ttl_secs: u64,
    #[serde(default = "default_input_stale_secs")]
    pub input_stale_secs: u64,
    #[serde(default = "default_permission_stale_secs")]
    pub permission_stale_secs: u64,
    #[serde(default = "default_transcript_tail_lines")]
    pub transcript_tail_lines: usize,
    #[serde(default)]
    pub transcript_root: Option<PathBuf>,
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
            pane_missing_grace_ms: default_pane_missing_grace_ms(),
            display_only_ttl_secs: default_display_only_ttl_secs(),
            input_stale_secs: default_input_stale_secs(),
            permission_stale_secs: default_permission_stale_secs(),
            transcript_tail_lines: default_transcript_tail_lines(),
            transcript_root: None,
            agent_command: default_agent_command(),
        }
    }
}

impl ScannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Transcript root, falling back to `~/.claude/projects`.
    pub fn transcript_root(&self) -> Option<PathBuf> {
        self.transcript_root
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(TRANSCRIPT_RELATIVE_ROOT)))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DebugConfig {
    #[serde(default = "default_trail_capacity")]
    pub trail_capacity: usize,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            trail_capacity: default_trail_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub permission: bool,
    #[serde(default = "default_true")]
    pub input: bool,
    #[serde(default = "default_true")]
    pub complete: bool,
    /// Program and arguments run for each trigger; the trigger JSON is
    /// appended as the final argument.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            permission: true,
            input: true,
            complete: true,
            command: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MetaConfig {
    #[serde(default = "default_tag_max_chars")]
    pub tag_max_chars: usize,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            tag_max_chars: default_tag_max_chars(),
            path: None,
        }
    }
}

impl MetaConfig {
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => home_path(META_RELATIVE_PATH),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct DaemonConfig {
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub debug: DebugConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub meta: MetaConfig,
}

impl DaemonConfig {
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            grace_window: ChronoDuration::milliseconds(self.reconcile.grace_window_ms as i64),
            stop_suppress: ChronoDuration::milliseconds(self.reconcile.stop_suppress_ms as i64),
            trail_capacity: self.debug.trail_capacity,
        }
    }

    /// Replaces unusable values. Returns the adjusted config.
    pub fn validated(mut self) -> Self {
        if self.scanner.interval_ms == 0 {
            warn!("scanner.interval_ms must be positive; using default");
            self.scanner.interval_ms = default_interval_ms();
        }
        if self.reconcile.grace_window_ms == 0 {
            warn!("reconcile.grace_window_ms must be positive; using default");
            self.reconcile.grace_window_ms = default_grace_window_ms();
        }
        if self.reconcile.grace_window_ms < self.scanner.interval_ms {
            let raised = self.scanner.interval_ms * 2;
            warn!(
                grace_window_ms = self.reconcile.grace_window_ms,
                interval_ms = self.scanner.interval_ms,
                raised_to = raised,
                "Grace window shorter than scan interval; raising"
            );
            self.reconcile.grace_window_ms = raised;
        }
        if self.debug.trail_capacity == 0 {
            self.debug.trail_capacity = default_trail_capacity();
        }
        if self.scanner.transcript_tail_lines == 0 {
            self.scanner.transcript_tail_lines = default_transcript_tail_lines();
        }
        if self.meta.tag_max_chars == 0 {
            self.meta.tag_max_chars = default_tag_max_chars();
        }
        if self.scanner.agent_command.trim().is_empty() {
            self.scanner.agent_command = default_agent_command();
        }
        self
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = env_path(CONFIG_ENV) {
        return Ok(path);
    }
    home_path(DEFAULT_CONFIG_RELATIVE_PATH)
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let config = toml::from_str::<DaemonConfig>(&content).map_err(|err| ConfigError::Parse {
        path: config_path.clone(),
        details: err.to_string(),
    })?;
    Ok(config.validated())
}

pub fn socket_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = env_path(SOCKET_ENV) {
        return Ok(path);
    }
    home_path(SOCKET_RELATIVE_PATH)
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn home_path(relative: &str) -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    Ok(home.join(relative))
}

fn default_true() -> bool {
    true
}

fn default_grace_window_ms() -> u64 {
    5000
}

fn default_stop_suppress_ms() -> u64 {
    10_000
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_pane_missing_grace_ms() -> u64 {
    5000
}

fn default_display_only_ttl_secs() -> u64 {
    30 * 60
}

fn default_input_stale_secs() -> u64 {
    15
}

fn default_permission_stale_secs() -> u64 {
    5
}

fn default_transcript_tail_lines() -> usize {
    30
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_trail_capacity() -> usize {
    DEFAULT_TRAIL_CAPACITY
}

fn default_tag_max_chars() -> usize {
    64
}
