//! Session records and the lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

const COMMAND_SNIPPET_MAX_CHARS: usize = 100;
const COMMAND_SNIPPET_KEEP_CHARS: usize = 97;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Spawning,
    Processing,
    AwaitingInput,
    AwaitingPermission,
    Complete,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Spawning => "spawning",
            SessionState::Processing => "processing",
            SessionState::AwaitingInput => "awaiting_input",
            SessionState::AwaitingPermission => "awaiting_permission",
            SessionState::Complete => "complete",
            SessionState::Error => "error",
        }
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(
            self,
            SessionState::AwaitingInput | SessionState::AwaitingPermission
        )
    }

    /// Direct edges of the lifecycle graph. Self-edges are always allowed.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        if *self == next || next == SessionState::Error {
            return true;
        }
        match self {
            SessionState::Spawning => next == SessionState::Processing,
            SessionState::Processing => matches!(
                next,
                SessionState::AwaitingInput
                    | SessionState::AwaitingPermission
                    | SessionState::Complete
            ),
            SessionState::AwaitingInput | SessionState::AwaitingPermission => {
                matches!(next, SessionState::Processing | SessionState::Complete)
            }
            SessionState::Complete | SessionState::Error => next == SessionState::Processing,
        }
    }
}

/// Route from `from` to `to`, including both endpoints.
///
/// Targets that are not directly reachable are routed through `Processing`.
/// `Spawning` is only ever an initial state, so it is never a valid target
/// for an existing session. `Error` is only left by an explicit move to
/// `Processing`, never through an implied one.
pub fn transition_path(from: SessionState, to: SessionState) -> Option<Vec<SessionState>> {
    if from == to {
        return Some(vec![from]);
    }
    if to == SessionState::Spawning {
        return None;
    }
    if from == SessionState::Error && to != SessionState::Processing {
        return None;
    }
    if from.can_transition_to(to) {
        return Some(vec![from, to]);
    }
    if from.can_transition_to(SessionState::Processing)
        && SessionState::Processing.can_transition_to(to)
    {
        return Some(vec![from, SessionState::Processing, to]);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Input,
    Permission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingAction {
    pub kind: PendingKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl PendingAction {
    pub fn input() -> Self {
        Self {
            kind: PendingKind::Input,
            description: "Waiting for user input".to_string(),
            tool: None,
            command: None,
        }
    }

    pub fn permission(tool: Option<String>, command: Option<&str>) -> Self {
        let description = format!("Wants to use {}", tool.as_deref().unwrap_or("a tool"));
        Self {
            kind: PendingKind::Permission,
            description,
            tool,
            command: command.map(command_snippet),
        }
    }

    /// Default action for an awaiting state, `None` for every other state.
    pub fn default_for(state: SessionState) -> Option<Self> {
        match state {
            SessionState::AwaitingInput => Some(Self::input()),
            SessionState::AwaitingPermission => Some(Self::permission(None, None)),
            _ => None,
        }
    }

    fn matches_state(&self, state: SessionState) -> bool {
        matches!(
            (self.kind, state),
            (PendingKind::Input, SessionState::AwaitingInput)
                | (PendingKind::Permission, SessionState::AwaitingPermission)
        )
    }
}

pub fn command_snippet(command: &str) -> String {
    if command.chars().count() > COMMAND_SNIPPET_MAX_CHARS {
        let kept: String = command.chars().take(COMMAND_SNIPPET_KEEP_CHARS).collect();
        format!("{}...", kept)
    } else {
        command.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pane_target: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
    pub pending_action: Option<PendingAction>,
}

impl Session {
    pub fn spawning(id: String, project_name: String, at: DateTime<Utc>) -> Self {
        Self {
            id,
            agent_session_id: None,
            project_name,
            project_path: None,
            state: SessionState::Spawning,
            pane_target: None,
            last_activity: at,
            state_changed_at: at,
            last_event: None,
            pending_action: None,
        }
    }

    /// Sets state and pending action together so the awaiting invariant holds.
    ///
    /// A supplied action of the wrong kind is replaced by the state default.
    pub fn set_state(
        &mut self,
        state: SessionState,
        pending_action: Option<PendingAction>,
        at: DateTime<Utc>,
    ) {
        if self.state != state {
            self.state_changed_at = at;
        }
        self.state = state;
        self.pending_action = match pending_action {
            Some(action) if action.matches_state(state) => Some(action),
            _ => PendingAction::default_for(state),
        };
    }

    /// Advances `last_activity`, never moving it backward.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    /// Fills descriptive fields without ever blanking them.
    pub fn refine(
        &mut self,
        project_name: Option<&str>,
        project_path: Option<&str>,
        pane_target: Option<&str>,
    ) {
        if let Some(name) = non_blank(project_name) {
            self.project_name = name.to_string();
        }
        if let Some(path) = non_blank(project_path) {
            self.project_path = Some(path.to_string());
        }
        if let Some(target) = non_blank(pane_target) {
            self.pane_target = Some(target.to_string());
        }
    }

    pub fn pending_invariant_holds(&self) -> bool {
        match &self.pending_action {
            Some(action) => action.matches_state(self.state),
            None => !self.state.is_awaiting(),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Last path component of a working directory, used as a display name.
pub fn name_from_path(path: &str) -> Option<String> {
    std::path::Path::new(path.trim_end_matches('/'))
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("parse")
            .with_timezone(&Utc)
    }

    #[test]
    fn legal_edges_match_lifecycle() {
        use SessionState::*;
        assert!(Spawning.can_transition_to(Processing));
        assert!(!Spawning.can_transition_to(AwaitingInput));
        assert!(Processing.can_transition_to(AwaitingPermission));
        assert!(AwaitingInput.can_transition_to(Complete));
        assert!(!AwaitingInput.can_transition_to(AwaitingPermission));
        assert!(Complete.can_transition_to(Processing));
        assert!(!Complete.can_transition_to(AwaitingInput));
        assert!(AwaitingPermission.can_transition_to(Error));
        assert!(Error.can_transition_to(Processing));
        assert!(!Error.can_transition_to(Complete));
    }

    #[test]
    fn indirect_targets_route_through_processing() {
        use SessionState::*;
        assert_eq!(
            transition_path(Spawning, AwaitingPermission),
            Some(vec![Spawning, Processing, AwaitingPermission])
        );
        assert_eq!(
            transition_path(AwaitingInput, AwaitingPermission),
            Some(vec![AwaitingInput, Processing, AwaitingPermission])
        );
        assert_eq!(transition_path(Complete, Complete), Some(vec![Complete]));
        assert_eq!(transition_path(Processing, Spawning), None);
    }

    #[test]
    fn error_is_left_only_through_processing() {
        use SessionState::*;
        assert_eq!(transition_path(Error, Processing), Some(vec![Error, Processing]));
        assert_eq!(transition_path(Error, Error), Some(vec![Error]));
        assert_eq!(transition_path(Error, Complete), None);
        assert_eq!(transition_path(Error, AwaitingInput), None);
        assert_eq!(transition_path(Error, AwaitingPermission), None);
        assert_eq!(
            transition_path(AwaitingInput, Error),
            Some(vec![AwaitingInput, Error])
        );
    }

    #[test]
    fn set_state_keeps_pending_invariant() {
        let now = at("2026-02-01T10:00:00Z");
        let mut session = Session::spawning("s-1".to_string(), "repo".to_string(), now);

        session.set_state(SessionState::AwaitingInput, None, now);
        assert_eq!(session.pending_action, Some(PendingAction::input()));
        assert!(session.pending_invariant_holds());

        session.set_state(
            SessionState::AwaitingPermission,
            Some(PendingAction::input()),
            now,
        );
        assert_eq!(
            session.pending_action.as_ref().map(|action| action.kind),
            Some(PendingKind::Permission)
        );

        session.set_state(SessionState::Complete, Some(PendingAction::input()), now);
        assert!(session.pending_action.is_none());
        assert!(session.pending_invariant_holds());
    }

    #[test]
    fn touch_never_moves_backward() {
        let later = at("2026-02-01T10:00:05Z");
        let mut session = Session::spawning("s-1".to_string(), "repo".to_string(), later);
        session.touch(at("2026-02-01T10:00:00Z"));
        assert_eq!(session.last_activity, later);
    }

    #[test]
    fn refine_does_not_blank_fields() {
        let now = at("2026-02-01T10:00:00Z");
        let mut session = Session::spawning("s-1".to_string(), "repo".to_string(), now);
        session.refine(Some("api"), Some("/code/api"), Some("work:1.0"));
        session.refine(Some("  "), None, Some(""));
        assert_eq!(session.project_name, "api");
        assert_eq!(session.project_path.as_deref(), Some("/code/api"));
        assert_eq!(session.pane_target.as_deref(), Some("work:1.0"));
    }

    #[test]
    fn command_snippet_truncates_on_char_boundary() {
        let long = "é".repeat(150);
        let snippet = command_snippet(&long);
        assert_eq!(snippet.chars().count(), 100);
        assert!(snippet.ends_with("..."));
        assert_eq!(command_snippet("npm install"), "npm install");
    }

    #[test]
    fn name_from_path_uses_last_component() {
        assert_eq!(name_from_path("/code/api/").as_deref(), Some("api"));
        assert_eq!(name_from_path("/"), None);
    }
}
