//! Direct commands forwarded to tmux. Arguments are passed through verbatim;
//! only emptiness is checked.

use tracing::info;

use crate::error::CommandError;
use crate::registry::Registry;
use crate::tmux::TmuxAdapter;

pub fn focus(adapter: &dyn TmuxAdapter, pane_target: &str) -> Result<(), CommandError> {
    let pane_target = required("pane_target", pane_target)?;
    adapter.select_pane(pane_target)?;
    info!(pane = %pane_target, "Pane focused");
    Ok(())
}

/// Kills the pane and drops the session bound to it. Returns the removed
/// session id, if one was tracked.
pub fn close(
    adapter: &dyn TmuxAdapter,
    registry: &Registry,
    pane_target: &str,
) -> Result<Option<String>, CommandError> {
    let pane_target = required("pane_target", pane_target)?;
    adapter.kill_pane(pane_target)?;
    let removed = registry.find_by_pane(pane_target).and_then(|session| {
        registry.remove(&session.id)?;
        Some(session.id)
    });
    info!(pane = %pane_target, removed = ?removed, "Pane closed");
    Ok(removed)
}

pub fn send_input(
    adapter: &dyn TmuxAdapter,
    registry: &Registry,
    session_id: &str,
    text: &str,
) -> Result<(), CommandError> {
    let session_id = required("session_id", session_id)?;
    if text.is_empty() {
        return Err(CommandError::MissingArgument("text"));
    }
    let session = registry
        .get(session_id)
        .ok_or_else(|| CommandError::SessionNotFound(session_id.to_string()))?;
    let pane_target = session
        .pane_target
        .ok_or_else(|| CommandError::NoPane(session_id.to_string()))?;
    adapter.send_keys(&pane_target, text)?;
    info!(session_id = %session_id, pane = %pane_target, chars = text.chars().count(), "Input sent");
    Ok(())
}

/// Blank arguments are rejected; anything else is returned untouched.
fn required<'a>(name: &'static str, value: &'a str) -> Result<&'a str, CommandError> {
    if value.trim().is_empty() {
        return Err(CommandError::MissingArgument(name));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use crate::ingress::{Candidate, Correlation, Proposal, Source};
    use crate::registry::RegistrySettings;
    use crate::tmux::PaneInfo;
    use std::sync::Mutex;
    use switchboard_protocol::EventType;

    #[derive(Default)]
    struct RecordingAdapter {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingAdapter {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("lock").push(call);
        }
    }

    impl TmuxAdapter for RecordingAdapter {
        fn list_panes(&self) -> Result<Vec<PaneInfo>, ScanError> {
            Ok(Vec::new())
        }

        fn select_pane(&self, target: &str) -> Result<(), CommandError> {
            self.record(format!("select {}", target));
            Ok(())
        }

        fn kill_pane(&self, target: &str) -> Result<(), CommandError> {
            self.record(format!("kill {}", target));
            Ok(())
        }

        fn send_keys(&self, target: &str, text: &str) -> Result<(), CommandError> {
            self.record(format!("send {} {}", target, text));
            Ok(())
        }
    }

    fn registry_with_pane(pane: Option<&str>) -> (Registry, String) {
        let registry = Registry::new(RegistrySettings::default());
        let candidate = Candidate {
            source: Source::Push,
            correlation: Correlation {
                session_hint: Some("agent-1".to_string()),
                pane_target: pane.map(str::to_string),
                cwd: Some("/code/api".to_string()),
                project_name: None,
            },
            proposal: Proposal::Hook {
                kind: EventType::SessionStart,
                tool_name: None,
                command: None,
                auto_approved: false,
            },
            observed_at: None,
        };
        registry.upsert(candidate).expect("applied");
        (registry, "agent-1".to_string())
    }

    #[test]
    fn focus_forwards_target_verbatim() {
        let adapter = RecordingAdapter::default();
        focus(&adapter, "work:1.0").expect("focus");
        focus(&adapter, " =work:{last} ").expect("focus");
        assert_eq!(
            adapter.calls(),
            vec!["select work:1.0", "select  =work:{last} "]
        );
        assert!(matches!(
            focus(&adapter, "  "),
            Err(CommandError::MissingArgument("pane_target"))
        ));
    }

    #[test]
    fn close_kills_pane_and_removes_session() {
        let adapter = RecordingAdapter::default();
        let (registry, session_id) = registry_with_pane(Some("work:1.0"));

        let removed = close(&adapter, &registry, "work:1.0").expect("close");
        assert_eq!(removed, Some(session_id));
        assert!(registry.list().is_empty());
        assert_eq!(adapter.calls(), vec!["kill work:1.0"]);

        assert_eq!(close(&adapter, &registry, "work:9.9").expect("close"), None);
    }

    #[test]
    fn send_input_targets_session_pane() {
        let adapter = RecordingAdapter::default();
        let (registry, session_id) = registry_with_pane(Some("work:1.0"));

        send_input(&adapter, &registry, &session_id, "yes").expect("send");
        assert_eq!(adapter.calls(), vec!["send work:1.0 yes"]);

        assert!(matches!(
            send_input(&adapter, &registry, "missing", "yes"),
            Err(CommandError::SessionNotFound(_))
        ));
        assert!(matches!(
            send_input(&adapter, &registry, &session_id, ""),
            Err(CommandError::MissingArgument("text"))
        ));
    }

    #[test]
    fn send_input_requires_a_pane() {
        let adapter = RecordingAdapter::default();
        let (registry, session_id) = registry_with_pane(None);
        assert!(matches!(
            send_input(&adapter, &registry, &session_id, "yes"),
            Err(CommandError::NoPane(_))
        ));
    }
}
