//! Bounded trail of recent ingress decisions, for diagnosis only.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::ingress::Source;
use crate::session::SessionState;

pub const DEFAULT_TRAIL_CAPACITY: usize = 50;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngressEvent {
    pub recorded_at: DateTime<Utc>,
    /// Producer-side time (hook `recorded_at`, transcript message time).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    pub source: Source,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub matched_session: Option<String>,
    pub resulting_state: Option<SessionState>,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DebugTrail {
    events: VecDeque<IngressEvent>,
    capacity: usize,
}

impl DebugTrail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, event: IngressEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<IngressEvent> {
        self.events.iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }
}

impl Default for DebugTrail {
    fn default() -> Self {
        Self::new(DEFAULT_TRAIL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(label: &str) -> IngressEvent {
        IngressEvent {
            recorded_at: Utc::now(),
            observed_at: None,
            source: Source::Push,
            label: label.to_string(),
            cwd: None,
            tool_name: None,
            matched_session: None,
            resulting_state: None,
            accepted: false,
            reason: Some("test".to_string()),
        }
    }

    #[test]
    fn keeps_most_recent_entries() {
        let mut trail = DebugTrail::new(3);
        for index in 0..5 {
            trail.record(event(&format!("evt-{}", index)));
        }
        let labels = trail
            .snapshot()
            .into_iter()
            .map(|event| event.label)
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["evt-2", "evt-3", "evt-4"]);
        assert_eq!(trail.len(), 3);
    }

    #[test]
    fn zero_capacity_still_holds_one_entry() {
        let mut trail = DebugTrail::new(0);
        trail.record(event("a"));
        trail.record(event("b"));
        assert_eq!(trail.snapshot().len(), 1);
    }
}
