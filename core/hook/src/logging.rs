//! File logging for the hook binary.
//!
//! Hooks run inside the agent's process tree, so nothing is written to
//! stderr. Logs go to a daily file under `~/.switchboard/logs/`.

use std::env;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "switchboard-hook.log";
const DEBUG_LOG_ENV: &str = "SWITCHBOARD_DEBUG_LOG";

pub fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".switchboard").join("logs"))
}

/// Installs the global subscriber. The returned guard flushes buffered lines
/// on drop and must live until the process exits.
pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir()?;
    fs_err::create_dir_all(&dir).ok()?;

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
