//! Authoritative session map and the single mutation entry point.
//!
//! Every write goes through [`Registry::upsert_at`] or [`Registry::remove`],
//! which hold the write guard across decide, apply, record and notify.
//! Readers take the read guard and clone.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use switchboard_protocol::EventType;
use tracing::{debug, info};

use crate::debug_trail::{DebugTrail, IngressEvent};
use crate::grace::{GraceTable, HookTimestampView};
use crate::ingress::{Candidate, Proposal, Source};
use crate::reconciler::{decide, Decision, Plan, Rejection};
use crate::session::{Session, SessionState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: Option<SessionState>,
    pub to: SessionState,
    pub path: Vec<SessionState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Updated {
        session: Session,
        revision: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        transition: Option<Transition>,
    },
    Removed {
        session_id: String,
        revision: u64,
    },
}

impl ChangeEvent {
    pub fn revision(&self) -> u64 {
        match self {
            ChangeEvent::Updated { revision, .. } | ChangeEvent::Removed { revision, .. } => {
                *revision
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// `revision` is `None` when nothing visible changed.
    Upserted {
        session: Session,
        revision: Option<u64>,
        transition: Option<Transition>,
    },
    Removed {
        session_id: String,
        revision: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    pub revision: u64,
    pub grace_window_ms: i64,
    pub trail: Vec<IngressEvent>,
    pub hook_timestamps: Vec<HookTimestampView>,
    pub sessions: Vec<Session>,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub grace_window: Duration,
    pub stop_suppress: Duration,
    pub trail_capacity: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            grace_window: Duration::milliseconds(5000),
            stop_suppress: Duration::milliseconds(10_000),
            trail_capacity: crate::debug_trail::DEFAULT_TRAIL_CAPACITY,
        }
    }
}

struct Inner {
    sessions: HashMap<String, Session>,
    grace: GraceTable,
    trail: DebugTrail,
    revision: u64,
}

pub struct Registry {
    inner: RwLock<Inner>,
    subscribers: Mutex<Vec<Sender<ChangeEvent>>>,
}

impl Registry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                grace: GraceTable::new(settings.grace_window, settings.stop_suppress),
                trail: DebugTrail::new(settings.trail_capacity),
                revision: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn upsert(&self, candidate: Candidate) -> Result<Applied, Rejection> {
        self.upsert_at(candidate, Utc::now())
    }

    pub fn upsert_at(&self, candidate: Candidate, now: DateTime<Utc>) -> Result<Applied, Rejection> {
        let mut inner = self.write();
        let decision = decide(&inner.sessions, &inner.grace, &candidate, now);

        let result = match decision {
            Decision::Apply(plan) => Ok(self.apply_plan(&mut inner, &candidate, *plan, now)),
            Decision::Remove { session_id } => {
                let previous = inner.sessions.get(&session_id).map(|session| session.state);
                let revision = self.remove_locked(&mut inner, &session_id);
                info!(
                    session_id = %session_id,
                    source = ?candidate.source,
                    label = candidate.label(),
                    "Session removed"
                );
                inner.trail.record(trail_entry(
                    &candidate,
                    now,
                    Some(session_id.clone()),
                    previous,
                    true,
                    Some("removed".to_string()),
                ));
                Ok(Applied::Removed {
                    session_id,
                    revision,
                })
            }
            Decision::Reject(rejection) => {
                debug!(
                    category = rejection.category(),
                    reason = %rejection,
                    source = ?candidate.source,
                    label = candidate.label(),
                    "Candidate rejected"
                );
                inner.trail.record(trail_entry(
                    &candidate,
                    now,
                    rejection.session_id().map(str::to_string),
                    None,
                    false,
                    Some(rejection.to_string()),
                ));
                Err(rejection)
            }
        };

        let Inner {
            sessions, grace, ..
        } = &mut *inner;
        let collected = grace.collect_garbage(now, |id| sessions.contains_key(id));
        if collected > 0 {
            debug!(collected, "Hook timestamps collected");
        }
        result
    }

    fn apply_plan(
        &self,
        inner: &mut Inner,
        candidate: &Candidate,
        plan: Plan,
        now: DateTime<Utc>,
    ) -> Applied {
        let session_id = plan.session.id.clone();
        match (&candidate.source, &candidate.proposal) {
            (Source::Push, Proposal::Hook { kind, .. }) if *kind != EventType::Heartbeat => {
                inner
                    .grace
                    .record_push(&session_id, now, *kind == EventType::Stop);
            }
            (Source::Scan, _) if !plan.refresh_only => inner.grace.confirm_scan(&session_id, now),
            _ => {}
        }

        let transition = plan.is_transition().then(|| Transition {
            from: plan.previous_state,
            to: plan.session.state,
            path: plan.path.clone(),
        });
        let changed = visibly_changed(inner.sessions.get(&session_id), &plan.session);
        debug_assert!(plan.session.pending_invariant_holds(), "{:?}", plan.session);

        let heartbeat = matches!(
            candidate.proposal,
            Proposal::Hook {
                kind: EventType::Heartbeat,
                ..
            }
        );
        let should_record = (candidate.source == Source::Push && !heartbeat) || transition.is_some();
        if should_record {
            inner.trail.record(trail_entry(
                candidate,
                now,
                Some(session_id.clone()),
                Some(plan.session.state),
                true,
                plan.note.clone(),
            ));
        }

        if let Some(transition) = &transition {
            info!(
                session_id = %session_id,
                from = ?transition.from,
                to = ?transition.to,
                path = ?transition.path,
                originated = plan.originated(),
                source = ?candidate.source,
                label = candidate.label(),
                "Session transition"
            );
        }

        inner.sessions.insert(session_id, plan.session.clone());

        let revision = if changed {
            inner.revision += 1;
            self.broadcast(ChangeEvent::Updated {
                session: plan.session.clone(),
                revision: inner.revision,
                transition: transition.clone(),
            });
            Some(inner.revision)
        } else {
            None
        };

        Applied::Upserted {
            session: plan.session,
            revision,
            transition,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.read().sessions.get(session_id).cloned()
    }

    /// Snapshot of every tracked session. Order is not meaningful.
    pub fn list(&self) -> Vec<Session> {
        self.read().sessions.values().cloned().collect()
    }

    pub fn find_by_pane(&self, pane_target: &str) -> Option<Session> {
        self.read()
            .sessions
            .values()
            .find(|session| session.pane_target.as_deref() == Some(pane_target))
            .cloned()
    }

    /// Removes a session and its hook timestamp. Returns the revision, or
    /// `None` when the session was not tracked.
    pub fn remove(&self, session_id: &str) -> Option<u64> {
        let mut inner = self.write();
        if !inner.sessions.contains_key(session_id) {
            return None;
        }
        let revision = self.remove_locked(&mut inner, session_id);
        info!(session_id = %session_id, "Session removed by command");
        Some(revision)
    }

    fn remove_locked(&self, inner: &mut Inner, session_id: &str) -> u64 {
        inner.sessions.remove(session_id);
        inner.grace.remove(session_id);
        inner.revision += 1;
        self.broadcast(ChangeEvent::Removed {
            session_id: session_id.to_string(),
            revision: inner.revision,
        });
        inner.revision
    }

    /// Records a push payload that never became a candidate.
    pub fn record_malformed(&self, reason: &str, params: Option<&Value>) {
        let field = |name: &str| {
            params
                .and_then(|params| params.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let event = IngressEvent {
            recorded_at: Utc::now(),
            observed_at: None,
            source: Source::Push,
            label: field("event_type").unwrap_or_else(|| "malformed".to_string()),
            cwd: field("cwd"),
            tool_name: field("tool_name"),
            matched_session: None,
            resulting_state: None,
            accepted: false,
            reason: Some(format!("skipped: {}", reason)),
        };
        self.write().trail.record(event);
    }

    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let now = Utc::now();
        let inner = self.read();
        DebugSnapshot {
            revision: inner.revision,
            grace_window_ms: inner.grace.window().num_milliseconds(),
            trail: inner.trail.snapshot(),
            hook_timestamps: inner.grace.snapshot(now),
            sessions: inner.sessions.values().cloned().collect(),
        }
    }

    pub fn revision(&self) -> u64 {
        self.read().revision
    }

    fn broadcast(&self, event: ChangeEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `last_activity` alone is not worth a change event; every other field is.
fn visibly_changed(previous: Option<&Session>, next: &Session) -> bool {
    match previous {
        Some(previous) => {
            let mut previous = previous.clone();
            previous.last_activity = next.last_activity;
            previous != *next
        }
        None => true,
    }
}

fn trail_entry(
    candidate: &Candidate,
    now: DateTime<Utc>,
    matched_session: Option<String>,
    resulting_state: Option<SessionState>,
    accepted: bool,
    reason: Option<String>,
) -> IngressEvent {
    IngressEvent {
        recorded_at: now,
        observed_at: candidate.observed_at,
        source: candidate.source,
        label: candidate.label().to_string(),
        cwd: candidate.correlation.cwd.clone(),
        tool_name: candidate.tool_name().map(str::to_string),
        matched_session,
        resulting_state,
        accepted,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationsConfig;
    use crate::dispatcher::{Dispatcher, TriggerKind};
    use crate::ingress::{Correlation, RemovalReason};
    use crate::session::PendingKind;

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("parse")
            .with_timezone(&Utc)
    }

    fn registry() -> Registry {
        Registry::new(RegistrySettings::default())
    }

    fn push(kind: EventType, cwd: &str) -> Candidate {
        Candidate {
            source: Source::Push,
            correlation: Correlation {
                cwd: Some(cwd.to_string()),
                pane_target: Some("work:1.0".to_string()),
                ..Correlation::default()
            },
            proposal: Proposal::Hook {
                kind,
                tool_name: Some("Bash".to_string()),
                command: Some("npm install".to_string()),
                auto_approved: false,
            },
            observed_at: None,
        }
    }

    fn scan(state: SessionState) -> Candidate {
        Candidate {
            source: Source::Scan,
            correlation: Correlation {
                pane_target: Some("work:1.0".to_string()),
                cwd: Some("/code/api".to_string()),
                project_name: Some("api".to_string()),
                ..Correlation::default()
            },
            proposal: Proposal::Observed {
                state,
                pending_action: None,
            },
            observed_at: None,
        }
    }

    fn upserted(applied: Applied) -> (Session, Option<u64>, Option<Transition>) {
        match applied {
            Applied::Upserted {
                session,
                revision,
                transition,
            } => (session, revision, transition),
            other => panic!("expected upsert, got {:?}", other),
        }
    }

    #[test]
    fn pre_tool_use_push_reaches_awaiting_permission() {
        let registry = registry();
        let now = at("2026-02-01T10:00:00Z");
        let (session, revision, transition) = upserted(
            registry
                .upsert_at(push(EventType::PreToolUse, "/code/api"), now)
                .expect("applied"),
        );

        assert_eq!(session.state, SessionState::AwaitingPermission);
        let action = session.pending_action.expect("pending action");
        assert_eq!(action.kind, PendingKind::Permission);
        assert_eq!(action.tool.as_deref(), Some("Bash"));
        assert_eq!(revision, Some(1));
        let transition = transition.expect("transition");
        assert_eq!(transition.from, None);
        assert_eq!(transition.path.len(), 3);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn grace_window_blocks_then_releases_scan() {
        let registry = registry();
        let pushed = at("2026-02-01T10:00:00Z");
        registry
            .upsert_at(push(EventType::PreToolUse, "/code/api"), pushed)
            .expect("push applied");

        let rejection = registry
            .upsert_at(scan(SessionState::Processing), pushed + Duration::seconds(2))
            .unwrap_err();
        assert_eq!(rejection.category(), "protected");
        assert_eq!(
            registry.list()[0].state,
            SessionState::AwaitingPermission
        );

        let (session, _, _) = upserted(
            registry
                .upsert_at(scan(SessionState::Processing), pushed + Duration::seconds(6))
                .expect("scan applied"),
        );
        assert_eq!(session.state, SessionState::Processing);
        assert!(session.pending_action.is_none());

        let debug = registry.debug_snapshot();
        assert!(debug
            .trail
            .iter()
            .any(|event| !event.accepted && event.label == "scan"));
    }

    #[test]
    fn removal_overrides_protection() {
        let registry = registry();
        let pushed = at("2026-02-01T10:00:00Z");
        registry
            .upsert_at(push(EventType::UserPromptSubmit, "/code/api"), pushed)
            .expect("push applied");

        let removal = Candidate {
            source: Source::Scan,
            correlation: Correlation {
                pane_target: Some("work:1.0".to_string()),
                ..Correlation::default()
            },
            proposal: Proposal::Remove {
                reason: RemovalReason::PaneGone,
            },
            observed_at: None,
        };
        let applied = registry
            .upsert_at(removal, pushed + Duration::seconds(1))
            .expect("removal applied");
        assert!(matches!(applied, Applied::Removed { .. }));
        assert!(registry.list().is_empty());
        assert!(registry.debug_snapshot().hook_timestamps.is_empty());
    }

    #[test]
    fn subscribers_see_each_revision_once() {
        let registry = registry();
        let receiver = registry.subscribe();
        let now = at("2026-02-01T10:00:00Z");

        registry
            .upsert_at(push(EventType::UserPromptSubmit, "/code/api"), now)
            .expect("first");
        registry
            .upsert_at(push(EventType::Stop, "/code/api"), now + Duration::seconds(1))
            .expect("second");
        // Same candidate again: activity advances, nothing visible changes.
        let (session, revision, transition) = upserted(
            registry
                .upsert_at(push(EventType::Stop, "/code/api"), now + Duration::seconds(30))
                .expect("third"),
        );
        assert_eq!(session.last_activity, now + Duration::seconds(30));
        assert_eq!(revision, None);
        assert_eq!(transition, None);
        assert_eq!(
            registry.list()[0].last_activity,
            now + Duration::seconds(30)
        );

        let events = receiver.try_iter().collect::<Vec<_>>();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].revision(), 1);
        assert_eq!(events[1].revision(), 2);
        match &events[1] {
            ChangeEvent::Updated {
                transition: Some(transition),
                ..
            } => assert_eq!(transition.to, SessionState::Complete),
            other => panic!("unexpected event {:?}", other),
        }

        let mut dispatcher = Dispatcher::new(NotificationsConfig::default());
        let triggers = events
            .iter()
            .filter_map(|event| dispatcher.handle(event))
            .collect::<Vec<_>>();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].kind, TriggerKind::Complete);
    }

    #[test]
    fn error_survives_scans_after_the_grace_window() {
        let registry = registry();
        let failed_at = at("2026-02-01T10:00:00Z");
        registry
            .upsert_at(push(EventType::Error, "/code/api"), failed_at)
            .expect("error applied");

        let rejection = registry
            .upsert_at(
                scan(SessionState::AwaitingInput),
                failed_at + Duration::seconds(6),
            )
            .unwrap_err();
        assert_eq!(rejection.category(), "suppressed");
        assert_eq!(registry.list()[0].state, SessionState::Error);

        let (session, _, transition) = upserted(
            registry
                .upsert_at(
                    push(EventType::UserPromptSubmit, "/code/api"),
                    failed_at + Duration::seconds(7),
                )
                .expect("prompt applied"),
        );
        assert_eq!(session.state, SessionState::Processing);
        assert_eq!(
            transition.expect("transition").path,
            vec![SessionState::Error, SessionState::Processing]
        );
    }

    #[test]
    fn remove_emits_removed_event() {
        let registry = registry();
        let receiver = registry.subscribe();
        let (session, _, _) = upserted(
            registry
                .upsert(push(EventType::SessionStart, "/code/api"))
                .expect("applied"),
        );

        assert_eq!(registry.remove(&session.id), Some(2));
        assert_eq!(registry.remove(&session.id), None);
        let last = receiver.try_iter().last().expect("event");
        assert_eq!(
            last,
            ChangeEvent::Removed {
                session_id: session.id,
                revision: 2
            }
        );
    }

    #[test]
    fn malformed_payload_is_recorded_as_skipped() {
        let registry = registry();
        let params = serde_json::json!({ "event_type": "bogus", "cwd": "/code/api" });
        registry.record_malformed("unknown event type", Some(&params));

        let trail = registry.debug_snapshot().trail;
        assert_eq!(trail.len(), 1);
        assert!(!trail[0].accepted);
        assert_eq!(trail[0].label, "bogus");
        assert!(trail[0]
            .reason
            .as_deref()
            .map(|reason| reason.starts_with("skipped"))
            .unwrap_or(false));
    }

    #[test]
    fn every_stored_session_keeps_pending_invariant() {
        let registry = registry();
        let now = at("2026-02-01T10:00:00Z");
        let kinds = [
            EventType::SessionStart,
            EventType::PreToolUse,
            EventType::PostToolUse,
            EventType::Notification,
            EventType::UserPromptSubmit,
            EventType::Stop,
            EventType::Error,
        ];
        for (offset, kind) in kinds.into_iter().enumerate() {
            let _ = registry.upsert_at(
                push(kind, "/code/api"),
                now + Duration::seconds(offset as i64 * 20),
            );
            for session in registry.list() {
                assert!(session.pending_invariant_holds(), "{:?}", session);
            }
        }
    }
}
