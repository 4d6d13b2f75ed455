//! HookTimestamp bookkeeping for the push-over-scan grace window.
//!
//! A session that just received a push update is "protected": scan-sourced
//! state changes are held off until the window elapses, so a slower poll
//! cannot overwrite fresher hook state.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookTimestamp {
    pub pushed_at: DateTime<Utc>,
    pub last_stop_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HookTimestampView {
    pub session_id: String,
    pub pushed_at: DateTime<Utc>,
    pub age_ms: i64,
    pub protected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stop_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct GraceTable {
    entries: HashMap<String, HookTimestamp>,
    window: Duration,
    stop_window: Duration,
}

impl GraceTable {
    pub fn new(window: Duration, stop_window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            window,
            stop_window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn record_push(&mut self, session_id: &str, now: DateTime<Utc>, is_stop: bool) {
        let entry = self
            .entries
            .entry(session_id.to_string())
            .or_insert(HookTimestamp {
                pushed_at: now,
                last_stop_at: None,
                confirmed_at: None,
            });
        entry.pushed_at = now;
        if is_stop {
            entry.last_stop_at = Some(now);
        }
    }

    pub fn confirm_scan(&mut self, session_id: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(session_id) {
            entry.confirmed_at = Some(now);
        }
    }

    /// Age of the latest push while it is still inside the grace window.
    pub fn protection_age(&self, session_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        let entry = self.entries.get(session_id)?;
        let age = age_since(entry.pushed_at, now);
        (age < self.window).then_some(age)
    }

    pub fn stopped_recently(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(session_id)
            .and_then(|entry| entry.last_stop_at)
            .map(|stopped_at| age_since(stopped_at, now) < self.stop_window)
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn get(&self, session_id: &str) -> Option<&HookTimestamp> {
        self.entries.get(session_id)
    }

    pub fn remove(&mut self, session_id: &str) {
        self.entries.remove(session_id);
    }

    /// Drops records past the grace window whose session is gone or has since
    /// been confirmed by a scan. Records still needed for stop suppression stay.
    pub fn collect_garbage<F>(&mut self, now: DateTime<Utc>, session_exists: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let window = self.window;
        let stop_window = self.stop_window;
        let before = self.entries.len();
        self.entries.retain(|session_id, entry| {
            if age_since(entry.pushed_at, now) < window {
                return true;
            }
            let stop_pending = entry
                .last_stop_at
                .map(|stopped_at| age_since(stopped_at, now) < stop_window)
                .unwrap_or(false);
            if stop_pending {
                return true;
            }
            let confirmed = entry
                .confirmed_at
                .map(|confirmed_at| confirmed_at > entry.pushed_at)
                .unwrap_or(false);
            session_exists(session_id) && !confirmed
        });
        before - self.entries.len()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<HookTimestampView> {
        let mut views = self
            .entries
            .iter()
            .map(|(session_id, entry)| {
                let age = age_since(entry.pushed_at, now);
                HookTimestampView {
                    session_id: session_id.clone(),
                    pushed_at: entry.pushed_at,
                    age_ms: age.num_milliseconds(),
                    protected: age < self.window,
                    last_stop_at: entry.last_stop_at,
                    confirmed_at: entry.confirmed_at,
                }
            })
            .collect::<Vec<_>>();
        views.sort_by(|left, right| left.session_id.cmp(&right.session_id));
        views
    }
}

fn age_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let age = now.signed_duration_since(then);
    if age < Duration::zero() {
        Duration::zero()
    } else {
        age
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("parse")
            .with_timezone(&Utc)
    }

    fn table() -> GraceTable {
        GraceTable::new(Duration::seconds(5), Duration::seconds(10))
    }

    #[test]
    fn push_protects_until_window_elapses() {
        let mut grace = table();
        let pushed = at("2026-02-01T10:00:00Z");
        grace.record_push("s-1", pushed, false);

        assert!(grace
            .protection_age("s-1", pushed + Duration::seconds(2))
            .is_some());
        assert!(grace
            .protection_age("s-1", pushed + Duration::seconds(6))
            .is_none());
        assert!(grace.protection_age("other", pushed).is_none());
    }

    #[test]
    fn stop_is_remembered_for_stop_window() {
        let mut grace = table();
        let pushed = at("2026-02-01T10:00:00Z");
        grace.record_push("s-1", pushed, true);
        assert!(grace.stopped_recently("s-1", pushed + Duration::seconds(8)));
        assert!(!grace.stopped_recently("s-1", pushed + Duration::seconds(11)));
    }

    #[test]
    fn garbage_collection_respects_liveness_and_confirmation() {
        let mut grace = table();
        let pushed = at("2026-02-01T10:00:00Z");
        grace.record_push("gone", pushed, false);
        grace.record_push("confirmed", pushed, false);
        grace.record_push("live", pushed, false);
        grace.record_push("fresh", pushed + Duration::seconds(9), false);
        grace.confirm_scan("confirmed", pushed + Duration::seconds(7));

        let removed = grace.collect_garbage(pushed + Duration::seconds(10), |id| id != "gone");
        assert_eq!(removed, 2);
        assert!(grace.get("live").is_some());
        assert!(grace.get("fresh").is_some());
        assert!(grace.get("gone").is_none());
        assert!(grace.get("confirmed").is_none());
    }

    #[test]
    fn snapshot_reports_protection() {
        let mut grace = table();
        let pushed = at("2026-02-01T10:00:00Z");
        grace.record_push("s-1", pushed, false);
        let views = grace.snapshot(pushed + Duration::seconds(1));
        assert_eq!(views.len(), 1);
        assert!(views[0].protected);
        assert_eq!(views[0].age_ms, 1000);
    }
}
