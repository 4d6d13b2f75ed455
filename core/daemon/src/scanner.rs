//! Poll-based fallback producer.
//!
//! Each tick enumerates tmux panes, picks out agent panes, infers a state
//! for each from the pane title and the transcript, and emits one candidate
//! per agent pane. Nothing here holds the registry lock; candidates are
//! gathered first and submitted one at a time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::error::ScanError;
use crate::ingress::{Candidate, Correlation, Proposal, RemovalReason, Source};
use crate::process::{ProcessSource, ProcessTable};
use crate::registry::Registry;
use crate::session::{name_from_path, Session, SessionState};
use crate::shutdown::Shutdown;
use crate::tmux::{PaneInfo, TmuxAdapter};
use crate::transcript::TranscriptReader;

const IDLE_MARKER: char = '✳';
const SHELLS: [&str; 4] = ["zsh", "bash", "fish", "sh"];

static TITLE_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\x{2733}\x{2734}\x{2800}-\x{28FF}\s]+").expect("valid title marker pattern")
});

pub struct Scanner<A: TmuxAdapter, P: ProcessSource> {
    adapter: A,
    processes: P,
    transcripts: TranscriptReader,
    config: ScannerConfig,
    missing_since: HashMap<String, DateTime<Utc>>,
}

impl<A: TmuxAdapter, P: ProcessSource> Scanner<A, P> {
    pub fn new(adapter: A, processes: P, transcripts: TranscriptReader, config: ScannerConfig) -> Self {
        Self {
            adapter,
            processes,
            transcripts,
            config,
            missing_since: HashMap::new(),
        }
    }

    /// One tick. `sessions` is a snapshot of the registry taken by the caller.
    pub fn scan_once(
        &mut self,
        now: DateTime<Utc>,
        sessions: &[Session],
    ) -> Result<Vec<Candidate>, ScanError> {
        let panes = self.adapter.list_panes()?;
        let mut table: Option<ProcessTable> = None;
        let mut candidates = Vec::new();
        // A pane that no longer hosts the agent counts as gone.
        let mut live_targets = HashSet::new();

        for pane in &panes {
            if !self.is_agent_pane(pane, &mut table) {
                continue;
            }
            live_targets.insert(pane.target.as_str());
            candidates.push(self.observe(pane, now));
        }

        candidates.extend(self.removals(now, sessions, &live_targets));
        Ok(candidates)
    }

    fn is_agent_pane(&self, pane: &PaneInfo, table: &mut Option<ProcessTable>) -> bool {
        let agent = self.config.agent_command.as_str();
        if pane.command.contains(agent) {
            return true;
        }
        if is_shell(&pane.command) {
            return has_agent_title(&pane.title);
        }
        let Some(pid) = pane.pid else {
            return false;
        };
        table
            .get_or_insert_with(|| self.processes.snapshot())
            .has_descendant_matching(pid, agent)
    }

    fn observe(&self, pane: &PaneInfo, now: DateTime<Utc>) -> Candidate {
        let cwd = pane.current_path.as_str();
        let (state, pending_action, observed_at) = if is_shell(&pane.command) {
            (SessionState::Complete, None, self.transcripts.latest_activity(cwd))
        } else if pane.title.trim_start().starts_with(IDLE_MARKER) {
            let inference = self.transcripts.infer(cwd, now);
            (inference.state, inference.pending_action, inference.observed_at)
        } else {
            (SessionState::Processing, None, self.transcripts.latest_activity(cwd))
        };

        Candidate {
            source: Source::Scan,
            correlation: Correlation {
                session_hint: None,
                pane_target: Some(pane.target.clone()),
                cwd: (!cwd.is_empty()).then(|| cwd.to_string()),
                project_name: Some(display_name(pane, &self.config.agent_command)),
            },
            proposal: Proposal::Observed {
                state,
                pending_action,
            },
            observed_at,
        }
    }

    fn removals(
        &mut self,
        now: DateTime<Utc>,
        sessions: &[Session],
        live_targets: &HashSet<&str>,
    ) -> Vec<Candidate> {
        let pane_grace = Duration::milliseconds(self.config.pane_missing_grace_ms as i64);
        let display_ttl = Duration::seconds(self.config.display_only_ttl_secs as i64);
        let mut removals = Vec::new();
        let mut still_missing = HashMap::new();

        for session in sessions {
            match session.pane_target.as_deref() {
                Some(target) if live_targets.contains(target) => {}
                Some(target) => {
                    let since = self
                        .missing_since
                        .get(&session.id)
                        .copied()
                        .unwrap_or(now);
                    if now.signed_duration_since(since) >= pane_grace {
                        debug!(session_id = %session.id, pane = %target, "Pane gone");
                        removals.push(removal(session, RemovalReason::PaneGone));
                    } else {
                        still_missing.insert(session.id.clone(), since);
                    }
                }
                None => {
                    if now.signed_duration_since(session.last_activity) > display_ttl {
                        debug!(session_id = %session.id, "Display-only session expired");
                        removals.push(removal(session, RemovalReason::Expired));
                    }
                }
            }
        }

        self.missing_since = still_missing;
        removals
    }
}

fn removal(session: &Session, reason: RemovalReason) -> Candidate {
    Candidate {
        source: Source::Scan,
        correlation: Correlation {
            session_hint: Some(session.id.clone()),
            pane_target: session.pane_target.clone(),
            cwd: session.project_path.clone(),
            project_name: None,
        },
        proposal: Proposal::Remove { reason },
        observed_at: None,
    }
}

fn is_shell(command: &str) -> bool {
    SHELLS.contains(&command.trim_start_matches('-'))
}

fn has_agent_title(title: &str) -> bool {
    title.contains(IDLE_MARKER) || title.contains("Claude")
}

/// Pane title with agent markers stripped, else the cwd's last component.
pub fn display_name(pane: &PaneInfo, fallback: &str) -> String {
    let cleaned = TITLE_MARKERS.replace(pane.title.trim(), "");
    let cleaned = cleaned.trim();
    if !cleaned.is_empty() && !cleaned.contains("localhost") && !cleaned.ends_with(".local") {
        return cleaned.to_string();
    }
    name_from_path(&pane.current_path).unwrap_or_else(|| fallback.to_string())
}

/// Runs `scanner` every `interval` until shutdown, submitting each
/// candidate to the registry.
pub fn spawn_scanner<A, P>(
    mut scanner: Scanner<A, P>,
    registry: Arc<Registry>,
    interval: std::time::Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    A: TmuxAdapter + 'static,
    P: ProcessSource + 'static,
{
    thread::spawn(move || {
        info!(interval_ms = interval.as_millis() as u64, "Scanner started");
        loop {
            let sessions = registry.list();
            match scanner.scan_once(Utc::now(), &sessions) {
                Ok(candidates) => {
                    let total = candidates.len();
                    let mut applied = 0usize;
                    for candidate in candidates {
                        if registry.upsert(candidate).is_ok() {
                            applied += 1;
                        }
                    }
                    debug!(candidates = total, applied, "Scan tick complete");
                }
                Err(err) => {
                    warn!(error = %err, "Scan tick skipped");
                }
            }
            if shutdown.wait_timeout(interval) {
                break;
            }
        }
        info!("Scanner stopped");
    })
}
