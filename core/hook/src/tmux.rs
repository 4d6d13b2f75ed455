//! Resolves the tmux pane the hook is running in.

use std::env;
use std::process::Command;

use switchboard_protocol::TmuxContext;

const PANE_ENV: &str = "TMUX_PANE";
const CONTEXT_FORMAT: &str = "#{session_name}\t#{window_index}\t#{pane_index}\t#{window_name}";

/// `None` outside tmux or when tmux cannot be queried.
pub fn current_context() -> Option<TmuxContext> {
    let pane_id = env::var(PANE_ENV).ok().filter(|value| !value.is_empty())?;
    let output = Command::new("tmux")
        .args(["display-message", "-p", "-t", &pane_id, CONTEXT_FORMAT])
        .output()
        .ok()?;
    if !output.status.success() {
        tracing::debug!(pane = %pane_id, "tmux display-message failed");
        return None;
    }
    parse_context(&String::from_utf8_lossy(&output.stdout))
}

pub fn parse_context(line: &str) -> Option<TmuxContext> {
    let mut fields = line.trim_end_matches(['\r', '\n']).split('\t');
    let session = fields.next()?.to_string();
    let window = fields.next()?.to_string();
    let pane = fields.next()?.to_string();
    let window_name = fields
        .next()
        .map(str::to_string)
        .filter(|name| !name.is_empty());
    let context = TmuxContext {
        session,
        window,
        pane,
        window_name,
    };
    context.pane_target().map(|_| context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_display_message_output() {
        let context = parse_context("work\t3\t1\teditor\n").expect("context");
        assert_eq!(context.pane_target().as_deref(), Some("work:3.1"));
        assert_eq!(context.window_name.as_deref(), Some("editor"));
    }

    #[test]
    fn rejects_incomplete_output() {
        assert!(parse_context("work\t3\n").is_none());
        assert!(parse_context("\t\t\t\n").is_none());
    }
}
