//! switchboard-hook: agent hook handler and command-line client for the
//! switchboard daemon.
//!
//! `handle` is wired into the agent's hook configuration and reads the hook
//! payload from stdin. The remaining subcommands are thin clients over the
//! daemon socket and print JSON to stdout.

mod daemon_client;
mod handle;
mod logging;
mod tmux;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use switchboard_protocol::Method;

use daemon_client::ClientError;

#[derive(Parser)]
#[command(name = "switchboard-hook")]
#[command(about = "Switchboard hook handler and daemon client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a hook event (reads JSON from stdin)
    Handle,

    /// Daemon health
    Health,

    /// List sessions, pinned first
    Sessions,

    /// Show one session
    Session {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Dump the ingress trail, hook timestamps and registry contents
    Debug,

    /// Focus a tmux pane (session:window.pane)
    Focus {
        #[arg(value_name = "PANE")]
        pane_target: String,
    },

    /// Kill a tmux pane and drop its session
    Close {
        #[arg(value_name = "PANE")]
        pane_target: String,
    },

    /// Type text into a session's pane followed by Enter
    Send {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        #[arg(value_name = "TEXT")]
        text: String,
    },

    /// Set a session tag; an empty tag clears it
    Tag {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        #[arg(value_name = "TAG", default_value = "")]
        tag: String,
    },

    /// Pin a session to the top of the list
    Pin {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        /// Unpin instead
        #[arg(long)]
        off: bool,
    },

    /// Forget a session
    Remove {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Report that a session without a tmux pane is still alive
    Heartbeat {
        #[arg(long, value_name = "SESSION_ID")]
        session_id: Option<String>,
    },

    /// Stream change events, one JSON object per line
    Watch,

    /// Ask the daemon to exit
    Shutdown,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Handle => {
            if let Err(e) = handle::run() {
                tracing::error!(error = %e, "switchboard-hook handle failed");
                std::process::exit(1);
            }
        }
        Commands::Heartbeat { session_id } => exit_on_error(handle::heartbeat(session_id)),
        Commands::Watch => {
            let result = daemon_client::watch(|event| {
                println!("{}", event);
                true
            });
            exit_on_error(result);
        }
        command => {
            if let Some((method, params)) = request_for(command) {
                let result = daemon_client::call(method, params).map(|data| print_json(&data));
                exit_on_error(result);
            }
        }
    }
}

/// Request for a one-shot command; `None` for the streaming and stdin ones.
fn request_for(command: Commands) -> Option<(Method, Option<Value>)> {
    let request = match command {
        Commands::Health => (Method::GetHealth, None),
        Commands::Sessions => (Method::GetSessions, None),
        Commands::Session { session_id } => {
            (Method::GetSession, Some(json!({ "session_id": session_id })))
        }
        Commands::Debug => (Method::GetDebug, None),
        Commands::Focus { pane_target } => {
            (Method::Focus, Some(json!({ "pane_target": pane_target })))
        }
        Commands::Close { pane_target } => {
            (Method::Close, Some(json!({ "pane_target": pane_target })))
        }
        Commands::Send { session_id, text } => (
            Method::SendInput,
            Some(json!({ "session_id": session_id, "text": text })),
        ),
        Commands::Tag { session_id, tag } => (
            Method::SetMeta,
            Some(json!({ "session_id": session_id, "tag": tag })),
        ),
        Commands::Pin { session_id, off } => (
            Method::SetMeta,
            Some(json!({ "session_id": session_id, "pinned": !off })),
        ),
        Commands::Remove { session_id } => (
            Method::RemoveSession,
            Some(json!({ "session_id": session_id })),
        ),
        Commands::Shutdown => (Method::Shutdown, None),
        Commands::Handle | Commands::Heartbeat { .. } | Commands::Watch => return None,
    };
    Some(request)
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn exit_on_error(result: Result<(), ClientError>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "switchboard-hook command failed");
        eprintln!("switchboard-hook: {}", err);
        std::process::exit(1);
    }
}
