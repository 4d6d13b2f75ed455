//! Decides whether and how a candidate update is applied.
//!
//! `decide` is pure: it reads the current sessions and the HookTimestamp
//! table and returns a [`Decision`]. The registry applies the decision under
//! its write lock and does all bookkeeping.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use switchboard_protocol::EventType;

use crate::grace::GraceTable;
use crate::ingress::{hook_target_state, Candidate, Correlation, Proposal, Source};
use crate::session::{name_from_path, transition_path, PendingAction, Session, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    AutoApproved,
    StopRecentlyFired,
    AlreadyComplete,
    ErrorNeedsProcessing,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::AutoApproved => "auto_approved",
            SuppressReason::StopRecentlyFired => "stop_recently_fired",
            SuppressReason::AlreadyComplete => "already_complete",
            SuppressReason::ErrorNeedsProcessing => "error_needs_processing",
        }
    }
}

/// Why a candidate was not applied. Recorded in the debug trail; never
/// surfaced to producers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("session {session_id} is protected by a push {age_ms}ms ago")]
    Protected { session_id: String, age_ms: i64 },

    #[error("malformed candidate: {reason}")]
    Malformed { reason: String },

    #[error("unknown session {session_id}")]
    UnknownSession { session_id: String },

    #[error("unresolvable correlation: {reason}")]
    Unresolvable { reason: String },

    #[error("suppressed: {}", .reason.as_str())]
    Suppressed {
        session_id: Option<String>,
        reason: SuppressReason,
    },
}

impl Rejection {
    pub fn category(&self) -> &'static str {
        match self {
            Rejection::Protected { .. } => "protected",
            Rejection::Malformed { .. } => "malformed",
            Rejection::UnknownSession { .. } => "unknown_session",
            Rejection::Unresolvable { .. } => "unresolvable",
            Rejection::Suppressed { .. } => "suppressed",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Rejection::Protected { session_id, .. } | Rejection::UnknownSession { session_id } => {
                Some(session_id)
            }
            Rejection::Suppressed { session_id, .. } => session_id.as_deref(),
            Rejection::Malformed { .. } | Rejection::Unresolvable { .. } => None,
        }
    }
}

/// How a candidate found its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    SessionId,
    AgentSessionId,
    Pane,
    CwdExact,
    CwdPrefix,
    Adopted,
}

impl MatchKind {
    fn as_str(&self) -> &'static str {
        match self {
            MatchKind::SessionId => "session id",
            MatchKind::AgentSessionId => "agent session id",
            MatchKind::Pane => "pane",
            MatchKind::CwdExact => "cwd",
            MatchKind::CwdPrefix => "cwd prefix",
            MatchKind::Adopted => "adopted pane",
        }
    }
}

/// The record a candidate will produce, plus how it got there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub session: Session,
    /// `None` when the candidate originates the session.
    pub previous_state: Option<SessionState>,
    /// Every state visited, starting from the current (or `Spawning`).
    pub path: Vec<SessionState>,
    /// Protected same-state scan: descriptive fields only.
    pub refresh_only: bool,
    pub note: Option<String>,
}

impl Plan {
    pub fn originated(&self) -> bool {
        self.previous_state.is_none()
    }

    pub fn is_transition(&self) -> bool {
        self.previous_state != Some(self.session.state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Apply(Box<Plan>),
    Remove { session_id: String },
    Reject(Rejection),
}

pub fn decide(
    sessions: &HashMap<String, Session>,
    grace: &GraceTable,
    candidate: &Candidate,
    now: DateTime<Utc>,
) -> Decision {
    let result = match (&candidate.source, &candidate.proposal) {
        (
            Source::Push,
            Proposal::Hook {
                kind,
                tool_name,
                command,
                auto_approved,
            },
        ) => decide_hook(
            sessions,
            grace,
            candidate,
            HookFields {
                kind: *kind,
                tool_name: tool_name.as_deref(),
                command: command.as_deref(),
                auto_approved: *auto_approved,
            },
            now,
        ),
        (
            _,
            Proposal::Observed {
                state,
                pending_action,
            },
        ) => decide_observed(
            sessions,
            grace,
            candidate,
            *state,
            pending_action.clone(),
            now,
        ),
        (_, Proposal::Remove { .. }) => decide_scan_removal(sessions, &candidate.correlation),
        (Source::Scan, Proposal::Hook { .. }) => Err(Rejection::Malformed {
            reason: "hook events must arrive through the push listener".to_string(),
        }),
    };
    match result {
        Ok(decision) => decision,
        Err(rejection) => Decision::Reject(rejection),
    }
}

struct HookFields<'a> {
    kind: EventType,
    tool_name: Option<&'a str>,
    command: Option<&'a str>,
    auto_approved: bool,
}

struct Matched<'a> {
    session: &'a Session,
    via: MatchKind,
    others: usize,
}

impl Matched<'_> {
    fn note(&self) -> Option<String> {
        if self.others > 0 {
            Some(format!(
                "matched by {} over {} other candidate(s)",
                self.via.as_str(),
                self.others
            ))
        } else if self.via != MatchKind::SessionId {
            Some(format!("matched by {}", self.via.as_str()))
        } else {
            None
        }
    }
}

fn decide_hook(
    sessions: &HashMap<String, Session>,
    grace: &GraceTable,
    candidate: &Candidate,
    hook: HookFields<'_>,
    now: DateTime<Utc>,
) -> Result<Decision, Rejection> {
    let correlation = &candidate.correlation;
    if correlation.session_hint.is_none()
        && correlation.pane_target.is_none()
        && correlation.cwd.is_none()
    {
        return Err(Rejection::Malformed {
            reason: "push event carries no session id, pane or cwd".to_string(),
        });
    }

    let matched = correlate_push(sessions, correlation);

    if hook.kind == EventType::Heartbeat {
        return heartbeat(matched, correlation, now);
    }

    if hook.kind == EventType::PermissionRequest && hook.auto_approved {
        return Err(Rejection::Suppressed {
            session_id: matched.map(|m| m.session.id.clone()),
            reason: SuppressReason::AutoApproved,
        });
    }

    let Some(target) = hook_target_state(hook.kind, hook.auto_approved) else {
        return match (matched, correlation.session_hint.as_deref()) {
            (Some(matched), _) => Ok(Decision::Remove {
                session_id: matched.session.id.clone(),
            }),
            (None, Some(hint)) => Err(Rejection::UnknownSession {
                session_id: hint.to_string(),
            }),
            (None, None) => Err(Rejection::Unresolvable {
                reason: format!(
                    "{} matched no session",
                    correlation.cwd.as_deref().unwrap_or("event")
                ),
            }),
        };
    };

    let pending = (target == SessionState::AwaitingPermission).then(|| {
        PendingAction::permission(hook.tool_name.map(str::to_string), hook.command)
    });
    let label = candidate_label(candidate);

    let Some(matched) = matched else {
        let id = originated_push_id(sessions, correlation);
        let name = correlation
            .cwd
            .as_deref()
            .and_then(name_from_path)
            .or_else(|| correlation.pane_target.clone())
            .unwrap_or_else(|| id.clone());
        let mut session = Session::spawning(id, name, now);
        session.agent_session_id = correlation.session_hint.clone();
        session.refine(None, correlation.cwd.as_deref(), correlation.pane_target.as_deref());
        return Ok(originate(session, target, pending, now, label));
    };

    let current = matched.session;
    leave_error_or_reject(current, target)?;
    if hook.kind == EventType::Notification {
        if grace.stopped_recently(&current.id, now) {
            return Err(Rejection::Suppressed {
                session_id: Some(current.id.clone()),
                reason: SuppressReason::StopRecentlyFired,
            });
        }
        if current.state == SessionState::Complete {
            return Err(Rejection::Suppressed {
                session_id: Some(current.id.clone()),
                reason: SuppressReason::AlreadyComplete,
            });
        }
    }

    let path = path_or_reject(current.state, target)?;
    let mut session = current.clone();
    if let Some(hint) = &correlation.session_hint {
        session.agent_session_id = Some(hint.clone());
    }
    if session.project_path.is_none() {
        session.refine(None, correlation.cwd.as_deref(), None);
    }
    session.refine(None, None, correlation.pane_target.as_deref());
    session.set_state(target, pending, now);
    session.touch(now);
    session.last_event = Some(label);

    Ok(Decision::Apply(Box::new(Plan {
        previous_state: Some(current.state),
        note: matched.note(),
        session,
        path,
        refresh_only: false,
    })))
}

/// Advances `last_activity` and nothing else. Heartbeats never originate.
fn heartbeat(
    matched: Option<Matched<'_>>,
    correlation: &Correlation,
    now: DateTime<Utc>,
) -> Result<Decision, Rejection> {
    let Some(matched) = matched else {
        return Err(match correlation.session_hint.as_deref() {
            Some(hint) => Rejection::UnknownSession {
                session_id: hint.to_string(),
            },
            None => Rejection::Unresolvable {
                reason: "heartbeat matched no session".to_string(),
            },
        });
    };
    let current = matched.session;
    let mut session = current.clone();
    session.touch(now);
    Ok(Decision::Apply(Box::new(Plan {
        previous_state: Some(current.state),
        path: vec![current.state],
        refresh_only: false,
        note: matched.note(),
        session,
    })))
}

fn decide_observed(
    sessions: &HashMap<String, Session>,
    grace: &GraceTable,
    candidate: &Candidate,
    state: SessionState,
    pending: Option<PendingAction>,
    now: DateTime<Utc>,
) -> Result<Decision, Rejection> {
    let correlation = &candidate.correlation;
    let Some(pane) = correlation.pane_target.as_deref() else {
        return Err(Rejection::Malformed {
            reason: "scan candidate carries no pane target".to_string(),
        });
    };
    if state == SessionState::Spawning {
        return Err(Rejection::Malformed {
            reason: "spawning is never a proposed state".to_string(),
        });
    }

    let label = candidate_label(candidate);

    let Some(matched) = correlate_scan(sessions, correlation, pane) else {
        let id = format!("tmux:{}", pane);
        let name = display_name(correlation).unwrap_or_else(|| pane.to_string());
        let mut session = Session::spawning(id, name, now);
        session.refine(None, correlation.cwd.as_deref(), Some(pane));
        return Ok(originate(session, state, pending, now, label));
    };

    let current = matched.session;
    let mut session = current.clone();

    if let Some(age) = grace.protection_age(&current.id, now) {
        if current.state != state {
            return Err(Rejection::Protected {
                session_id: current.id.clone(),
                age_ms: age.num_milliseconds(),
            });
        }
        refine_from_scan(&mut session, correlation, pane);
        return Ok(Decision::Apply(Box::new(Plan {
            previous_state: Some(current.state),
            path: vec![current.state],
            refresh_only: true,
            note: matched.note(),
            session,
        })));
    }

    leave_error_or_reject(current, state)?;
    let path = path_or_reject(current.state, state)?;
    refine_from_scan(&mut session, correlation, pane);
    let pending = if current.state == state && pending.is_none() {
        current.pending_action.clone()
    } else {
        pending
    };
    session.set_state(state, pending, now);
    session.touch(now);
    session.last_event = Some(label);

    Ok(Decision::Apply(Box::new(Plan {
        previous_state: Some(current.state),
        note: matched.note(),
        session,
        path,
        refresh_only: false,
    })))
}

fn decide_scan_removal(
    sessions: &HashMap<String, Session>,
    correlation: &Correlation,
) -> Result<Decision, Rejection> {
    let by_id = correlation
        .session_hint
        .as_deref()
        .and_then(|hint| sessions.get(hint));
    let by_pane = || {
        correlation.pane_target.as_deref().and_then(|pane| {
            sessions
                .values()
                .find(|session| session.pane_target.as_deref() == Some(pane))
        })
    };
    match by_id.or_else(by_pane) {
        Some(session) => Ok(Decision::Remove {
            session_id: session.id.clone(),
        }),
        None => Err(Rejection::Unresolvable {
            reason: "removal for a session that is not tracked".to_string(),
        }),
    }
}

fn originate(
    mut session: Session,
    target: SessionState,
    pending: Option<PendingAction>,
    now: DateTime<Utc>,
    label: String,
) -> Decision {
    let path = transition_path(SessionState::Spawning, target)
        .unwrap_or_else(|| vec![SessionState::Spawning]);
    if let Some(state) = path.last() {
        session.set_state(*state, pending, now);
    }
    session.touch(now);
    session.last_event = Some(label);
    Decision::Apply(Box::new(Plan {
        session,
        previous_state: None,
        path,
        refresh_only: false,
        note: None,
    }))
}

/// A session in `Error` stays there until a candidate proposes `Processing`.
fn leave_error_or_reject(current: &Session, target: SessionState) -> Result<(), Rejection> {
    if current.state == SessionState::Error
        && !matches!(target, SessionState::Error | SessionState::Processing)
    {
        return Err(Rejection::Suppressed {
            session_id: Some(current.id.clone()),
            reason: SuppressReason::ErrorNeedsProcessing,
        });
    }
    Ok(())
}

fn path_or_reject(from: SessionState, to: SessionState) -> Result<Vec<SessionState>, Rejection> {
    transition_path(from, to).ok_or_else(|| Rejection::Malformed {
        reason: format!("no path from {} to {}", from.as_str(), to.as_str()),
    })
}

fn refine_from_scan(session: &mut Session, correlation: &Correlation, pane: &str) {
    session.refine(
        correlation.project_name.as_deref(),
        correlation.cwd.as_deref(),
        Some(pane),
    );
}

fn display_name(correlation: &Correlation) -> Option<String> {
    correlation
        .project_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(|| correlation.cwd.as_deref().and_then(name_from_path))
}

fn candidate_label(candidate: &Candidate) -> String {
    candidate.label().to_string()
}

fn originated_push_id(sessions: &HashMap<String, Session>, correlation: &Correlation) -> String {
    if let Some(hint) = &correlation.session_hint {
        if !sessions.contains_key(hint) {
            return hint.clone();
        }
    }
    if let Some(pane) = &correlation.pane_target {
        let id = format!("tmux:{}", pane);
        if !sessions.contains_key(&id) {
            return id;
        }
    }
    format!("hook:{}", ulid::Ulid::new())
}

fn correlate_push<'a>(
    sessions: &'a HashMap<String, Session>,
    correlation: &Correlation,
) -> Option<Matched<'a>> {
    let hint = correlation.session_hint.as_deref();

    if let Some(hint) = hint {
        if let Some(session) = sessions.get(hint) {
            return Some(Matched {
                session,
                via: MatchKind::SessionId,
                others: 0,
            });
        }
        if let Some(session) = sessions
            .values()
            .find(|session| session.agent_session_id.as_deref() == Some(hint))
        {
            return Some(Matched {
                session,
                via: MatchKind::AgentSessionId,
                others: 0,
            });
        }
    }

    if let Some(pane) = correlation.pane_target.as_deref() {
        if let Some(session) = sessions
            .values()
            .find(|session| session.pane_target.as_deref() == Some(pane))
        {
            return Some(Matched {
                session,
                via: MatchKind::Pane,
                others: 0,
            });
        }
    }

    let cwd = normalize_path(correlation.cwd.as_deref()?);
    // A session already bound to a different agent session is never merged.
    let eligible = |session: &&Session| match (hint, session.agent_session_id.as_deref()) {
        (Some(hint), Some(existing)) => hint == existing,
        _ => true,
    };

    let exact = sessions
        .values()
        .filter(eligible)
        .filter(|session| session.project_path.as_deref().map(normalize_path) == Some(cwd))
        .collect::<Vec<_>>();
    if let Some(matched) = best_of(exact, MatchKind::CwdExact) {
        return Some(matched);
    }

    let related = sessions
        .values()
        .filter(eligible)
        .filter(|session| {
            session
                .project_path
                .as_deref()
                .map(|path| paths_related(normalize_path(path), cwd))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    best_of(related, MatchKind::CwdPrefix)
}

fn correlate_scan<'a>(
    sessions: &'a HashMap<String, Session>,
    correlation: &Correlation,
    pane: &str,
) -> Option<Matched<'a>> {
    if let Some(session) = sessions
        .values()
        .find(|session| session.pane_target.as_deref() == Some(pane))
    {
        return Some(Matched {
            session,
            via: MatchKind::Pane,
            others: 0,
        });
    }
    if let Some(session) = sessions.get(&format!("tmux:{}", pane)) {
        return Some(Matched {
            session,
            via: MatchKind::SessionId,
            others: 0,
        });
    }

    let cwd = normalize_path(correlation.cwd.as_deref()?);
    let orphans = sessions
        .values()
        .filter(|session| session.pane_target.is_none())
        .filter(|session| session.project_path.as_deref().map(normalize_path) == Some(cwd))
        .collect::<Vec<_>>();
    best_of(orphans, MatchKind::Adopted)
}

/// Most recently active candidate wins; ties break on id so the choice is stable.
fn best_of(mut candidates: Vec<&Session>, via: MatchKind) -> Option<Matched<'_>> {
    candidates.sort_by(|left, right| {
        right
            .last_activity
            .cmp(&left.last_activity)
            .then_with(|| left.id.cmp(&right.id))
    });
    let others = candidates.len().saturating_sub(1);
    candidates.first().copied().map(|session| Matched {
        session,
        via,
        others,
    })
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim();
    if trimmed.len() > 1 {
        trimmed.trim_end_matches('/')
    } else {
        trimmed
    }
}

fn paths_related(left: &str, right: &str) -> bool {
    is_ancestor(left, right) || is_ancestor(right, left)
}

fn is_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor.is_empty() || ancestor == "/" {
        return false;
    }
    path.strip_prefix(ancestor)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}
