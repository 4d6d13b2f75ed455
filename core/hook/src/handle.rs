//! Event handler for agent hooks.
//!
//! Reads the hook JSON from stdin, maps it onto an [`EventEnvelope`] and
//! pushes it to the daemon. The daemon decides what the event means for
//! session state; this side only normalizes.
//!
//! ```text
//! SessionStart / UserPromptSubmit / PostToolUse → session_start / user_prompt_submit / post_tool_use
//! PreToolUse / PermissionRequest                → pre_tool_use / permission_request
//! Notification                                  → notification
//! Stop / StopFailure                            → stop / error
//! SessionEnd                                    → session_end
//! anything else                                 → skipped
//! ```

use std::env;
use std::io::{self, Read};

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use switchboard_protocol::{EventEnvelope, EventType, TmuxContext};

use crate::daemon_client::{self, ClientError};
use crate::tmux;

const BYPASS_PERMISSION_MODE: &str = "bypassPermissions";

/// Subset of the agent's hook payload the daemon cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub notification_type: Option<String>,
}

impl HookInput {
    pub fn event_type(&self) -> Option<EventType> {
        self.hook_event_name
            .as_deref()
            .and_then(EventType::from_hook_name)
    }

    pub fn command(&self) -> Option<String> {
        self.tool_input
            .as_ref()
            .and_then(|input| input.get("command"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn auto_approved(&self) -> bool {
        self.permission_mode.as_deref() == Some(BYPASS_PERMISSION_MODE)
    }

    /// Builds the wire envelope. `fallback_cwd` is used when the payload
    /// carries none; `None` is returned for hooks the daemon does not track.
    pub fn to_envelope(
        &self,
        event_id: String,
        fallback_cwd: Option<String>,
        tmux: Option<TmuxContext>,
    ) -> Option<EventEnvelope> {
        let event_type = self.event_type()?;
        let cwd = non_empty(self.cwd.clone()).or(fallback_cwd)?;
        Some(EventEnvelope {
            event_id,
            recorded_at: Utc::now().to_rfc3339(),
            event_type,
            cwd: Some(cwd),
            session_id: non_empty(self.session_id.clone()),
            tool_name: non_empty(self.tool_name.clone()),
            command: self.command(),
            auto_approved: Some(self.auto_approved()),
            notification_type: non_empty(self.notification_type.clone()),
            tmux,
        })
    }
}

pub fn run() -> Result<(), ClientError> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(ClientError::Stdin)?;

    if input.trim().is_empty() {
        return Ok(());
    }

    let hook_input: HookInput = serde_json::from_str(&input).map_err(ClientError::HookInput)?;
    handle_hook_input(&hook_input)
}

fn handle_hook_input(hook_input: &HookInput) -> Result<(), ClientError> {
    if !daemon_client::daemon_enabled() {
        tracing::debug!("Daemon disabled; dropping hook event");
        return Ok(());
    }

    let fallback_cwd = env::current_dir()
        .ok()
        .map(|dir| dir.to_string_lossy().to_string());
    let event_id = daemon_client::make_event_id(std::process::id());
    let envelope = match hook_input.to_envelope(event_id, fallback_cwd, tmux::current_context()) {
        Some(envelope) => envelope,
        None => {
            tracing::debug!(
                event = ?hook_input.hook_event_name,
                "Skipping event (untracked hook or missing cwd)"
            );
            return Ok(());
        }
    };

    let event_type = envelope.event_type;
    daemon_client::send_event_with_retry(envelope)?;
    tracing::debug!(
        event = event_type.as_str(),
        session = ?hook_input.session_id,
        "Daemon accepted event"
    );
    Ok(())
}

/// Reports liveness for a session the scanner cannot see (no tmux pane).
pub fn heartbeat(session_id: Option<String>) -> Result<(), ClientError> {
    if !daemon_client::daemon_enabled() {
        return Ok(());
    }
    let Some(cwd) = env::current_dir()
        .ok()
        .map(|dir| dir.to_string_lossy().to_string())
    else {
        tracing::debug!("No working directory; skipping heartbeat");
        return Ok(());
    };
    let event_id = daemon_client::make_event_id(std::process::id());
    let envelope = heartbeat_envelope(event_id, cwd, session_id, tmux::current_context());
    daemon_client::send_event_with_retry(envelope)
}

fn heartbeat_envelope(
    event_id: String,
    cwd: String,
    session_id: Option<String>,
    tmux: Option<TmuxContext>,
) -> EventEnvelope {
    EventEnvelope {
        event_id,
        recorded_at: Utc::now().to_rfc3339(),
        event_type: EventType::Heartbeat,
        cwd: Some(cwd),
        session_id: non_empty(session_id),
        tool_name: None,
        command: None,
        auto_approved: None,
        notification_type: None,
        tmux,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
