//! Switchboard daemon entrypoint.
//!
//! Owns the session registry for every agent running under tmux. Hook pushes
//! arrive over a Unix socket; a background scanner polls tmux as a fallback.
//! Both feed the same reconciler, and clients read or subscribe over the
//! same socket.

use fs_err as fs;
use std::env;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::{mpsc, Arc};

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod debug_trail;
mod dispatcher;
mod error;
mod grace;
mod ingress;
mod meta;
mod process;
mod reconciler;
mod registry;
mod scanner;
mod server;
mod session;
mod shutdown;
mod tmux;
mod transcript;

use config::DaemonConfig;
use meta::MetaStore;
use process::SysinfoProcessSource;
use registry::Registry;
use scanner::Scanner;
use server::DaemonContext;
use shutdown::Shutdown;
use tmux::CommandTmuxAdapter;
use transcript::TranscriptReader;

const DEBUG_LOG_ENV: &str = "SWITCHBOARD_DEBUG_LOG";

fn main() {
    init_logging();

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            DaemonConfig::default()
        }
    };

    let socket_path = match config::socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let meta_path = match config.meta.store_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve session metadata path");
            std::process::exit(1);
        }
    };

    info!(
        path = %socket_path.display(),
        scanner_enabled = config.scanner.enabled,
        interval_ms = config.scanner.interval_ms,
        grace_window_ms = config.reconcile.grace_window_ms,
        "Switchboard daemon started"
    );

    let registry = Arc::new(Registry::new(config.registry_settings()));
    let shutdown = Shutdown::new();
    let (ingest, ingest_receiver) = mpsc::channel();

    let mut workers = vec![ingress::spawn_ingest_worker(
        ingest_receiver,
        Arc::clone(&registry),
        shutdown.clone(),
    )];
    workers.push(dispatcher::spawn_dispatcher(
        registry.subscribe(),
        config.notifications.clone(),
        dispatcher::default_sinks(&config.notifications),
        shutdown.clone(),
    ));

    if config.scanner.enabled {
        match config.scanner.transcript_root() {
            Some(root) => {
                let transcripts = TranscriptReader::new(
                    root,
                    config.scanner.transcript_tail_lines,
                    ChronoDuration::seconds(config.scanner.input_stale_secs as i64),
                    ChronoDuration::seconds(config.scanner.permission_stale_secs as i64),
                );
                let scanner = Scanner::new(
                    CommandTmuxAdapter,
                    SysinfoProcessSource,
                    transcripts,
                    config.scanner.clone(),
                );
                workers.push(scanner::spawn_scanner(
                    scanner,
                    Arc::clone(&registry),
                    config.scanner.interval(),
                    shutdown.clone(),
                ));
            }
            None => warn!("Transcript root not resolvable; scanner disabled"),
        }
    } else {
        info!("Scanner disabled by config");
    }

    let wake_path = socket_path.clone();
    shutdown::install_signal_handlers(shutdown.clone(), move || {
        server::wake_listener(&wake_path);
    });

    let context = Arc::new(DaemonContext {
        registry,
        meta: MetaStore::new(meta_path, config.meta.tag_max_chars),
        tmux: Box::new(CommandTmuxAdapter),
        ingest,
        shutdown: shutdown.clone(),
        config,
        started_at: Utc::now(),
    });

    server::serve(listener, context);

    shutdown.trigger();
    for worker in workers {
        if worker.join().is_err() {
            warn!("Worker thread panicked during shutdown");
        }
    }
    if let Err(err) = fs::remove_file(&socket_path) {
        warn!(error = %err, "Failed to remove daemon socket");
    }
    info!("Switchboard daemon stopped");
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}
