use std::process::{Command, Output};

use crate::error::{CommandError, ScanError};

const LIST_PANES_FORMAT: &str = "#{session_name}:#{window_index}.#{pane_index}\t#{pane_pid}\t#{pane_current_command}\t#{pane_current_path}\t#{pane_title}\t#{window_name}";
const NO_SERVER_MARKERS: [&str; 2] = ["no server running", "error connecting to"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    /// `session:window.pane`
    pub target: String,
    pub pid: Option<u32>,
    pub command: String,
    pub current_path: String,
    pub title: String,
    pub window_name: String,
}

/// Multiplexer operations used by the scanner and the command surface.
pub trait TmuxAdapter: Send + Sync {
    fn list_panes(&self) -> Result<Vec<PaneInfo>, ScanError>;
    fn select_pane(&self, target: &str) -> Result<(), CommandError>;
    fn kill_pane(&self, target: &str) -> Result<(), CommandError>;
    /// Types `text` literally into the pane, then presses Enter.
    fn send_keys(&self, target: &str, text: &str) -> Result<(), CommandError>;
}

#[derive(Debug, Clone, Default)]
pub struct CommandTmuxAdapter;

impl TmuxAdapter for CommandTmuxAdapter {
    fn list_panes(&self) -> Result<Vec<PaneInfo>, ScanError> {
        let output = Command::new("tmux")
            .args(["list-panes", "-a", "-F", LIST_PANES_FORMAT])
            .output()
            .map_err(ScanError::TmuxUnavailable)?;
        if output.status.success() {
            return Ok(parse_panes(&String::from_utf8_lossy(&output.stdout)));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if NO_SERVER_MARKERS
            .iter()
            .any(|marker| stderr.contains(marker))
        {
            return Ok(Vec::new());
        }
        Err(ScanError::TmuxFailed {
            command: "list-panes".to_string(),
            stderr,
        })
    }

    fn select_pane(&self, target: &str) -> Result<(), CommandError> {
        run_command("select-window", &["select-window", "-t", target])?;
        run_command("select-pane", &["select-pane", "-t", target])
    }

    fn kill_pane(&self, target: &str) -> Result<(), CommandError> {
        run_command("kill-pane", &["kill-pane", "-t", target])
    }

    fn send_keys(&self, target: &str, text: &str) -> Result<(), CommandError> {
        run_command("send-keys", &["send-keys", "-t", target, "-l", text])?;
        run_command("send-keys", &["send-keys", "-t", target, "Enter"])
    }
}

fn run_command(name: &str, args: &[&str]) -> Result<(), CommandError> {
    let output = Command::new("tmux")
        .args(args)
        .output()
        .map_err(CommandError::Spawn)?;
    check_status(name, output)
}

fn check_status(name: &str, output: Output) -> Result<(), CommandError> {
    if output.status.success() {
        return Ok(());
    }
    Err(CommandError::Tmux {
        command: name.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

pub fn parse_panes(output: &str) -> Vec<PaneInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let target = parts.next()?.trim();
            if target.is_empty() {
                return None;
            }
            let pid = parts.next()?.trim().parse::<u32>().ok();
            let command = parts.next()?.trim();
            let current_path = parts.next().unwrap_or_default().trim();
            let title = parts.next().unwrap_or_default().trim();
            let window_name = parts.next().unwrap_or_default().trim();
            Some(PaneInfo {
                target: target.to_string(),
                pid,
                command: command.to_string(),
                current_path: current_path.to_string(),
                title: title.to_string(),
                window_name: window_name.to_string(),
            })
        })
        .collect()
}
