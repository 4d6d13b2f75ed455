//! Turns accepted transitions into attention triggers.
//!
//! Triggers are derived from revision-tagged change events only. A revision
//! already seen for a session never fires again.

use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::NotificationsConfig;
use crate::registry::ChangeEvent;
use crate::session::SessionState;
use crate::shutdown::Shutdown;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Permission,
    Input,
    Complete,
}

impl TriggerKind {
    fn for_state(state: SessionState) -> Option<Self> {
        match state {
            SessionState::AwaitingPermission => Some(TriggerKind::Permission),
            SessionState::AwaitingInput => Some(TriggerKind::Input),
            SessionState::Complete => Some(TriggerKind::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttentionTrigger {
    pub kind: TriggerKind,
    pub session_id: String,
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pane_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub revision: u64,
}

/// Delivery collaborator for attention triggers (sound, notification, ...).
pub trait TriggerSink: Send {
    fn deliver(&self, trigger: &AttentionTrigger);
}

pub struct LogSink;

impl TriggerSink for LogSink {
    fn deliver(&self, trigger: &AttentionTrigger) {
        info!(
            kind = ?trigger.kind,
            session_id = %trigger.session_id,
            project = %trigger.project_name,
            pane = ?trigger.pane_target,
            detail = ?trigger.detail,
            "Attention needed"
        );
    }
}

/// Runs a configured program per trigger without waiting for it.
pub struct CommandSink {
    argv: Vec<String>,
}

impl CommandSink {
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.first().map(|program| program.trim().is_empty()).unwrap_or(true) {
            return None;
        }
        Some(Self { argv })
    }
}

impl TriggerSink for CommandSink {
    fn deliver(&self, trigger: &AttentionTrigger) {
        let payload = match serde_json::to_string(trigger) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Failed to serialize trigger");
                return;
            }
        };
        let (program, args) = match self.argv.split_first() {
            Some(split) => split,
            None => return,
        };
        let spawned = Command::new(program)
            .args(args)
            .arg(&payload)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            // Reaped off-thread.
            Ok(mut child) => {
                thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(err) => warn!(error = %err, program = %program, "Failed to run notification command"),
        }
    }
}

pub struct Dispatcher {
    config: NotificationsConfig,
    seen: HashMap<String, u64>,
}

impl Dispatcher {
    pub fn new(config: NotificationsConfig) -> Self {
        Self {
            config,
            seen: HashMap::new(),
        }
    }

    /// Trigger for one change event, or `None` when nothing should fire.
    pub fn handle(&mut self, event: &ChangeEvent) -> Option<AttentionTrigger> {
        match event {
            ChangeEvent::Removed { session_id, .. } => {
                self.seen.remove(session_id);
                None
            }
            ChangeEvent::Updated {
                session,
                revision,
                transition,
            } => {
                if self
                    .seen
                    .get(&session.id)
                    .map(|last| *revision <= *last)
                    .unwrap_or(false)
                {
                    debug!(session_id = %session.id, revision, "Duplicate change event ignored");
                    return None;
                }
                self.seen.insert(session.id.clone(), *revision);

                let transition = transition.as_ref()?;
                if transition.from == Some(transition.to) {
                    return None;
                }
                let kind = TriggerKind::for_state(transition.to)?;
                if !self.enabled(kind) {
                    return None;
                }
                Some(AttentionTrigger {
                    kind,
                    session_id: session.id.clone(),
                    project_name: session.project_name.clone(),
                    pane_target: session.pane_target.clone(),
                    detail: session
                        .pending_action
                        .as_ref()
                        .map(|action| action.description.clone()),
                    revision: *revision,
                })
            }
        }
    }

    fn enabled(&self, kind: TriggerKind) -> bool {
        self.config.enabled
            && match kind {
                TriggerKind::Permission => self.config.permission,
                TriggerKind::Input => self.config.input,
                TriggerKind::Complete => self.config.complete,
            }
    }
}

pub fn default_sinks(config: &NotificationsConfig) -> Vec<Box<dyn TriggerSink>> {
    let mut sinks: Vec<Box<dyn TriggerSink>> = vec![Box::new(LogSink)];
    if let Some(sink) = config.command.clone().and_then(CommandSink::new) {
        sinks.push(Box::new(sink));
    }
    sinks
}

pub fn spawn_dispatcher(
    receiver: Receiver<ChangeEvent>,
    config: NotificationsConfig,
    sinks: Vec<Box<dyn TriggerSink>>,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut dispatcher = Dispatcher::new(config);
        loop {
            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(event) => {
                    if let Some(trigger) = dispatcher.handle(&event) {
                        for sink in &sinks {
                            sink.deliver(&trigger);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.is_triggered() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Dispatcher stopped");
    })
}
