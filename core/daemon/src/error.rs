//! Error types for the daemon.
//!
//! None of these terminate the engine; each is local to one event, one tick,
//! or one command.

use std::path::PathBuf;

use switchboard_protocol::ErrorInfo;

/// Problems with a single push event before it reaches the registry.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("event payload is required")]
    MissingPayload,

    #[error("malformed event: {0}")]
    MalformedEvent(ErrorInfo),
}

impl IngressError {
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            IngressError::MissingPayload => {
                ErrorInfo::new("invalid_params", "event payload is required")
            }
            IngressError::MalformedEvent(info) => info.clone(),
        }
    }
}

/// A scan tick that could not complete. The tick is skipped and retried.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("tmux is unavailable: {0}")]
    TmuxUnavailable(#[source] std::io::Error),

    #[error("tmux {command} failed: {stderr}")]
    TmuxFailed { command: String, stderr: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{0} is required")]
    MissingArgument(&'static str),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} has no pane")]
    NoPane(String),

    #[error("failed to run tmux: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("tmux {command} failed: {stderr}")]
    Tmux { command: String, stderr: String },
}

impl CommandError {
    pub fn to_error_info(&self) -> ErrorInfo {
        let code = match self {
            CommandError::MissingArgument(_) => "invalid_params",
            CommandError::SessionNotFound(_) => "session_not_found",
            CommandError::NoPane(_) => "no_pane",
            CommandError::Spawn(_) | CommandError::Tmux { .. } => "multiplexer_error",
        };
        ErrorInfo::new(code, self.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("failed to read session metadata {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session metadata malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("failed to write session metadata {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize session metadata: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("home directory not found")]
    NoHome,

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {details}")]
    Parse { path: PathBuf, details: String },
}
