//! State inference from the agent's on-disk JSONL transcript.
//!
//! Transcripts live in `<root>/<cwd with '/' replaced by '-'>/*.jsonl`; the
//! most recently modified file is the active one. Only the tail is read.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use walkdir::WalkDir;

use crate::session::{PendingAction, SessionState};

const INTERRUPT_MARKER: &str = "[Request interrupted by user]";
const BOOKKEEPING_PREFIXES: [&str; 4] = [
    "<local-command-caveat>",
    "<bash-input>",
    "<bash-stdout>",
    "<bash-stderr>",
];
const NOISE_TYPES: [&str; 4] = ["progress", "system", "file-history-snapshot", "summary"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inference {
    pub state: SessionState,
    pub pending_action: Option<PendingAction>,
    /// Latest message timestamp, else the transcript's mtime.
    pub observed_at: Option<DateTime<Utc>>,
}

impl Inference {
    fn new(state: SessionState, observed_at: Option<DateTime<Utc>>) -> Self {
        Self {
            state,
            pending_action: PendingAction::default_for(state),
            observed_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptReader {
    root: PathBuf,
    tail_lines: usize,
    input_stale: Duration,
    permission_stale: Duration,
}

impl TranscriptReader {
    pub fn new(
        root: PathBuf,
        tail_lines: usize,
        input_stale: Duration,
        permission_stale: Duration,
    ) -> Self {
        Self {
            root,
            tail_lines: tail_lines.max(1),
            input_stale,
            permission_stale,
        }
    }

    pub fn project_dir(&self, cwd: &str) -> PathBuf {
        self.root.join(cwd.replace('/', "-"))
    }

    pub fn find_active(&self, cwd: &str) -> Option<PathBuf> {
        WalkDir::new(self.project_dir(cwd))
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map(|ext| ext == "jsonl")
                    .unwrap_or(false)
            })
            .max_by_key(|entry| {
                entry
                    .metadata()
                    .ok()
                    .and_then(|metadata| metadata.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH)
            })
            .map(|entry| entry.into_path())
    }

    /// Infers state for an idle-titled pane. No transcript means the agent
    /// has not written anything yet and is waiting for input.
    pub fn infer(&self, cwd: &str, now: DateTime<Utc>) -> Inference {
        match self.find_active(cwd) {
            Some(path) => self.infer_file(&path, now),
            None => Inference::new(SessionState::AwaitingInput, None),
        }
    }

    /// Latest message timestamp of the active transcript, else its mtime.
    pub fn latest_activity(&self, cwd: &str) -> Option<DateTime<Utc>> {
        let path = self.find_active(cwd)?;
        read_tail(&path, self.tail_lines)
            .iter()
            .rev()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .find_map(|value| message_timestamp(&value))
            .or_else(|| {
                fs_err::metadata(&path)
                    .ok()
                    .and_then(|metadata| metadata.modified().ok())
                    .map(DateTime::<Utc>::from)
            })
    }

    pub fn infer_file(&self, path: &Path, now: DateTime<Utc>) -> Inference {
        let modified = fs_err::metadata(path)
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .map(DateTime::<Utc>::from);
        let age = modified
            .map(|modified| now.signed_duration_since(modified))
            .unwrap_or_else(Duration::zero);

        let lines = read_tail(path, self.tail_lines);
        if lines.is_empty() {
            return Inference::new(SessionState::Processing, modified);
        }
        let parsed = lines
            .iter()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .collect::<Vec<_>>();
        let observed_at = parsed.iter().rev().find_map(message_timestamp).or(modified);

        let last_message = parsed.iter().rev().find(|value| is_conversation_message(value));
        let Some(message) = last_message else {
            let state = if age > self.input_stale {
                SessionState::AwaitingInput
            } else {
                SessionState::Processing
            };
            return Inference::new(state, observed_at);
        };

        self.classify(message, age, observed_at)
    }

    fn classify(
        &self,
        message: &Value,
        age: Duration,
        observed_at: Option<DateTime<Utc>>,
    ) -> Inference {
        let content = message.get("message").and_then(|inner| inner.get("content"));
        let blocks = content.and_then(Value::as_array);
        let has_block = |kind: &str| {
            blocks
                .map(|blocks| blocks.iter().any(|block| block_type(block) == Some(kind)))
                .unwrap_or(false)
        };

        if message_type(message) == "user" {
            if has_block("tool_result") {
                return Inference::new(SessionState::Processing, observed_at);
            }
            let state = if age > self.input_stale {
                SessionState::AwaitingInput
            } else {
                SessionState::Processing
            };
            return Inference::new(state, observed_at);
        }

        if has_block("tool_use") {
            if age <= self.permission_stale {
                return Inference::new(SessionState::Processing, observed_at);
            }
            let tool_use = blocks.and_then(|blocks| {
                blocks
                    .iter()
                    .rev()
                    .find(|block| block_type(block) == Some("tool_use"))
            });
            let tool = tool_use
                .and_then(|block| block.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let command = tool_use
                .and_then(|block| block.get("input"))
                .and_then(|input| input.get("command"))
                .and_then(Value::as_str);
            return Inference {
                state: SessionState::AwaitingPermission,
                pending_action: Some(PendingAction::permission(tool, command)),
                observed_at,
            };
        }

        if has_block("text") || content.map(Value::is_string).unwrap_or(false) {
            return Inference::new(SessionState::AwaitingInput, observed_at);
        }
        Inference::new(SessionState::Processing, observed_at)
    }
}

fn read_tail(path: &Path, count: usize) -> Vec<String> {
    let Ok(content) = fs_err::read_to_string(path) else {
        return Vec::new();
    };
    let lines = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>();
    let start = lines.len().saturating_sub(count);
    lines[start..].iter().map(|line| line.to_string()).collect()
}

fn message_type(value: &Value) -> &str {
    value.get("type").and_then(Value::as_str).unwrap_or("")
}

fn block_type(block: &Value) -> Option<&str> {
    block.get("type").and_then(Value::as_str)
}

fn is_conversation_message(value: &Value) -> bool {
    let kind = message_type(value);
    if NOISE_TYPES.contains(&kind) {
        return false;
    }
    if value.get("isMeta").and_then(Value::as_bool).unwrap_or(false) {
        return false;
    }

    if kind == "user" {
        match value.get("message").and_then(|inner| inner.get("content")) {
            Some(Value::String(text)) => {
                if text == INTERRUPT_MARKER
                    || BOOKKEEPING_PREFIXES
                        .iter()
                        .any(|prefix| text.starts_with(prefix))
                {
                    return false;
                }
            }
            Some(Value::Array(blocks)) => {
                let interrupted = blocks.iter().any(|block| {
                    block_type(block) == Some("text")
                        && block
                            .get("text")
                            .and_then(Value::as_str)
                            .map(|text| text.contains(INTERRUPT_MARKER))
                            .unwrap_or(false)
                });
                if interrupted {
                    return false;
                }
            }
            _ => {}
        }
    }

    let role = value
        .get("message")
        .and_then(|inner| inner.get("role"))
        .and_then(Value::as_str)
        .unwrap_or("");
    matches!((kind, role), ("user", "user") | ("assistant", "assistant"))
}

fn message_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let candidates = [
        value.get("timestamp"),
        value.get("message").and_then(|inner| inner.get("timestamp")),
        value
            .get("data")
            .and_then(|data| data.get("message"))
            .and_then(|inner| inner.get("timestamp")),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find_map(|raw| raw.parse::<DateTime<Utc>>().ok())
}
