//! Normalized candidate updates produced by the push listener and the scanner.
//!
//! Both producers reduce their input to a [`Candidate`] before it reaches the
//! registry. Push events are resolved to a closed [`EventType`] here; nothing
//! downstream looks at raw hook strings.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use switchboard_protocol::{parse_event, EventEnvelope, EventType};
use tracing::debug;

use crate::error::IngressError;
use crate::registry::Registry;
use crate::session::{PendingAction, SessionState};
use crate::shutdown::Shutdown;

const INGEST_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Push,
    Scan,
}

/// Fields used to find the session a candidate belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub session_hint: Option<String>,
    pub pane_target: Option<String>,
    pub cwd: Option<String>,
    pub project_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    PaneGone,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    /// A lifecycle event pushed by the agent.
    Hook {
        kind: EventType,
        tool_name: Option<String>,
        command: Option<String>,
        auto_approved: bool,
    },
    /// A state inferred from pane and transcript inspection.
    Observed {
        state: SessionState,
        pending_action: Option<PendingAction>,
    },
    /// The scanner no longer sees the session's pane.
    Remove { reason: RemovalReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub source: Source,
    pub correlation: Correlation,
    pub proposal: Proposal,
    /// When the producer observed the change, if it knows better than "now".
    pub observed_at: Option<DateTime<Utc>>,
}

impl Candidate {
    /// Label recorded in the debug trail and as the session's `last_event`.
    pub fn label(&self) -> &'static str {
        match &self.proposal {
            Proposal::Hook { kind, .. } => kind.as_str(),
            Proposal::Observed { .. } => "scan",
            Proposal::Remove {
                reason: RemovalReason::PaneGone,
            } => "scan_pane_gone",
            Proposal::Remove {
                reason: RemovalReason::Expired,
            } => "scan_expired",
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match &self.proposal {
            Proposal::Hook { tool_name, .. } => tool_name.as_deref(),
            Proposal::Observed {
                pending_action: Some(action),
                ..
            } => action.tool.as_deref(),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_removal(&self) -> bool {
        matches!(self.proposal, Proposal::Remove { .. })
            || matches!(
                self.proposal,
                Proposal::Hook {
                    kind: EventType::SessionEnd,
                    ..
                }
            )
    }
}

/// Parses raw `event` params into a push candidate.
pub fn candidate_from_params(params: Option<Value>) -> Result<Candidate, IngressError> {
    let params = params.ok_or(IngressError::MissingPayload)?;
    let event = parse_event(params).map_err(IngressError::MalformedEvent)?;
    Ok(candidate_from_event(&event))
}

pub fn candidate_from_event(event: &EventEnvelope) -> Candidate {
    let observed_at = DateTime::parse_from_rfc3339(&event.recorded_at)
        .ok()
        .map(|dt| dt.with_timezone(&Utc));

    Candidate {
        source: Source::Push,
        correlation: Correlation {
            session_hint: trimmed(event.session_id.as_deref()),
            pane_target: event.pane_target(),
            cwd: trimmed(event.cwd.as_deref()),
            project_name: None,
        },
        proposal: Proposal::Hook {
            kind: event.event_type,
            tool_name: trimmed(event.tool_name.as_deref()),
            command: event
                .command
                .as_deref()
                .filter(|command| !command.trim().is_empty())
                .map(str::to_string),
            auto_approved: event.auto_approved.unwrap_or(false),
        },
        observed_at,
    }
}

/// Target state for a push event, or `None` when the event carries no state
/// (it ends the session, or only reports liveness).
pub fn hook_target_state(kind: EventType, auto_approved: bool) -> Option<SessionState> {
    match kind {
        EventType::SessionStart | EventType::UserPromptSubmit | EventType::PostToolUse => {
            Some(SessionState::Processing)
        }
        EventType::PreToolUse if auto_approved => Some(SessionState::Processing),
        EventType::PreToolUse | EventType::PermissionRequest => {
            Some(SessionState::AwaitingPermission)
        }
        EventType::Notification => Some(SessionState::AwaitingInput),
        EventType::Stop => Some(SessionState::Complete),
        EventType::Error => Some(SessionState::Error),
        EventType::SessionEnd | EventType::Heartbeat => None,
    }
}

/// Drains the push queue into the registry in arrival order. On shutdown,
/// candidates already queued are still applied before the worker exits.
pub fn spawn_ingest_worker(
    receiver: Receiver<Candidate>,
    registry: Arc<Registry>,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            match receiver.recv_timeout(INGEST_POLL_INTERVAL) {
                Ok(candidate) => submit(&registry, candidate),
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.is_triggered() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let drained = receiver
            .try_iter()
            .map(|candidate| submit(&registry, candidate))
            .count();
        debug!(drained, "Ingest worker stopped");
    })
}

fn submit(registry: &Registry, candidate: Candidate) {
    // Rejections are already in the debug trail.
    let _ = registry.upsert(candidate);
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
