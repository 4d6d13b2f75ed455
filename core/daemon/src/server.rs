//! Socket front end: one newline-delimited JSON request per connection,
//! answered with one JSON response line. `subscribe` keeps the connection
//! open and streams change events instead.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::mpsc::{RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use switchboard_protocol::{
    parse_pane, parse_send_input, parse_session_id, parse_set_meta, ErrorInfo, Method, Request,
    Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

use crate::commands;
use crate::config::DaemonConfig;
use crate::error::MetaError;
use crate::ingress::{candidate_from_params, Candidate};
use crate::meta::{MetaStore, SessionMeta};
use crate::registry::Registry;
use crate::session::Session;
use crate::shutdown::Shutdown;
use crate::tmux::TmuxAdapter;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const SUBSCRIBE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Everything a request handler may touch.
pub struct DaemonContext {
    pub registry: Arc<Registry>,
    pub meta: MetaStore,
    pub tmux: Box<dyn TmuxAdapter>,
    pub ingest: Sender<Candidate>,
    pub shutdown: Shutdown,
    pub config: DaemonConfig,
    pub started_at: DateTime<Utc>,
}

/// A session as presented to clients: registry state plus user metadata.
#[derive(Debug, Clone, Serialize)]
pub struct PresentedSession {
    #[serde(flatten)]
    pub session: Session,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub pinned: bool,
}

/// Merges metadata into sessions. Pinned first, then most recent activity.
pub fn present(
    sessions: Vec<Session>,
    meta: &std::collections::HashMap<String, SessionMeta>,
) -> Vec<PresentedSession> {
    let mut presented: Vec<PresentedSession> = sessions
        .into_iter()
        .map(|session| {
            let entry = meta.get(&session.id).cloned().unwrap_or_default();
            PresentedSession {
                session,
                tag: entry.tag,
                pinned: entry.pinned,
            }
        })
        .collect();
    presented.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then_with(|| b.session.last_activity.cmp(&a.session.last_activity))
            .then_with(|| a.session.id.cmp(&b.session.id))
    });
    presented
}

/// Accepts connections until shutdown. The loop only notices shutdown on the
/// next accept, so callers wake it with [`wake_listener`].
pub fn serve(listener: UnixListener, context: Arc<DaemonContext>) {
    for stream in listener.incoming() {
        if context.shutdown.is_triggered() {
            break;
        }
        match stream {
            Ok(stream) => {
                let context = Arc::clone(&context);
                thread::spawn(move || handle_connection(stream, context));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
    debug!("Accept loop stopped");
}

pub fn wake_listener(socket_path: &Path) {
    let _ = UnixStream::connect(socket_path);
}

fn handle_connection(mut stream: UnixStream, context: Arc<DaemonContext>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            if !context.shutdown.is_triggered() {
                warn!(code = %err.code, message = %err.message, "Failed to read request");
            }
            let response = Response::error_with_info(None, err);
            let _ = write_line(&mut stream, &response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    if request.protocol_version == PROTOCOL_VERSION && request.method == Method::Subscribe {
        stream_changes(stream, request.id, &context);
        return;
    }
    let response = handle_request(request, &context);
    let _ = write_line(&mut stream, &response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, context: &DaemonContext) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let params = request.params;
    match request.method {
        Method::GetHealth => Response::ok(id, health(context)),
        Method::Event => handle_event(id, params, context),
        Method::GetSessions => {
            let meta = load_meta(&context.meta);
            to_response(id, present(context.registry.list(), &meta))
        }
        Method::GetSession => match parse_session_id(params) {
            Ok(parsed) => match context.registry.get(&parsed.session_id) {
                Some(session) => {
                    let meta = load_meta(&context.meta);
                    match present(vec![session], &meta).pop() {
                        Some(presented) => to_response(id, presented),
                        None => session_not_found(id, &parsed.session_id),
                    }
                }
                None => session_not_found(id, &parsed.session_id),
            },
            Err(err) => Response::error_with_info(id, err),
        },
        Method::RemoveSession => match parse_session_id(params) {
            Ok(parsed) => {
                let revision = context.registry.remove(&parsed.session_id);
                Response::ok(
                    id,
                    json!({ "removed": revision.is_some(), "revision": revision }),
                )
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::Focus => match parse_pane(params) {
            Ok(parsed) => match commands::focus(context.tmux.as_ref(), &parsed.pane_target) {
                Ok(()) => Response::ok(id, json!({ "focused": parsed.pane_target })),
                Err(err) => Response::error_with_info(id, err.to_error_info()),
            },
            Err(err) => Response::error_with_info(id, err),
        },
        Method::Close => match parse_pane(params) {
            Ok(parsed) => match commands::close(
                context.tmux.as_ref(),
                &context.registry,
                &parsed.pane_target,
            ) {
                Ok(removed) => Response::ok(
                    id,
                    json!({ "closed": parsed.pane_target, "removed_session": removed }),
                ),
                Err(err) => Response::error_with_info(id, err.to_error_info()),
            },
            Err(err) => Response::error_with_info(id, err),
        },
        Method::SendInput => match parse_send_input(params) {
            Ok(parsed) => match commands::send_input(
                context.tmux.as_ref(),
                &context.registry,
                &parsed.session_id,
                &parsed.text,
            ) {
                Ok(()) => Response::ok(id, json!({ "sent": true })),
                Err(err) => Response::error_with_info(id, err.to_error_info()),
            },
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetMeta => {
            if params.is_none() {
                return match context.meta.all() {
                    Ok(all) => to_response(id, all),
                    Err(err) => Response::error_with_info(id, meta_error_info(&err)),
                };
            }
            match parse_session_id(params) {
                Ok(parsed) => match context.meta.get(&parsed.session_id) {
                    Ok(meta) => to_response(id, meta),
                    Err(err) => Response::error_with_info(id, meta_error_info(&err)),
                },
                Err(err) => Response::error_with_info(id, err),
            }
        }
        Method::SetMeta => match parse_set_meta(params) {
            Ok(parsed) => match context.meta.set(
                &parsed.session_id,
                parsed.tag.as_deref(),
                parsed.pinned,
            ) {
                Ok(meta) => {
                    info!(session_id = %parsed.session_id, tag = ?meta.tag, pinned = meta.pinned, "Session metadata updated");
                    to_response(id, meta)
                }
                Err(err) => Response::error_with_info(id, meta_error_info(&err)),
            },
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetDebug => {
            let snapshot = context.registry.debug_snapshot();
            match serde_json::to_value(snapshot) {
                Ok(mut value) => {
                    value["meta"] = serde_json::to_value(load_meta(&context.meta))
                        .unwrap_or(Value::Null);
                    value["meta_path"] = json!(context.meta.path().display().to_string());
                    Response::ok(id, value)
                }
                Err(err) => Response::error(
                    id,
                    "serialization_error",
                    format!("failed to serialize debug snapshot: {}", err),
                ),
            }
        }
        // Handled before dispatch; only reached with a bad protocol version.
        Method::Subscribe => Response::error(id, "invalid_request", "subscribe must stream"),
        Method::Shutdown => {
            info!("Shutdown requested over socket");
            context.shutdown.trigger();
            Response::ok(id, json!({ "shutting_down": true }))
        }
    }
}

fn handle_event(id: Option<String>, params: Option<Value>, context: &DaemonContext) -> Response {
    let raw = params.clone();
    let candidate = match candidate_from_params(params) {
        Ok(candidate) => candidate,
        Err(err) => {
            warn!(error = %err, "Rejected malformed event");
            context
                .registry
                .record_malformed(&err.to_string(), raw.as_ref());
            return Response::error_with_info(id, err.to_error_info());
        }
    };

    info!(
        event = candidate.label(),
        session_hint = ?candidate.correlation.session_hint,
        pane = ?candidate.correlation.pane_target,
        cwd = ?candidate.correlation.cwd,
        tool = ?candidate.tool_name(),
        "Received event"
    );

    if context.ingest.send(candidate).is_err() {
        return Response::error(id, "ingest_unavailable", "daemon is shutting down");
    }
    Response::ok(id, json!({ "accepted": true, "queued": true }))
}

fn health(context: &DaemonContext) -> Value {
    let uptime = (Utc::now() - context.started_at).num_seconds().max(0);
    json!({
        "status": "ok",
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "uptime_secs": uptime,
        "sessions": context.registry.list().len(),
        "revision": context.registry.revision(),
        "scanner_enabled": context.config.scanner.enabled,
        "scan_interval_ms": context.config.scanner.interval_ms,
        "grace_window_ms": context.config.reconcile.grace_window_ms,
    })
}

/// Acknowledges the subscription, then writes one change event per line
/// until the client goes away or the daemon shuts down.
fn stream_changes(mut stream: UnixStream, id: Option<String>, context: &DaemonContext) {
    let receiver = context.registry.subscribe();
    let ack = Response::ok(
        id,
        json!({ "subscribed": true, "revision": context.registry.revision() }),
    );
    if write_line(&mut stream, &ack).is_err() {
        return;
    }
    info!("Subscriber attached");

    loop {
        match receiver.recv_timeout(SUBSCRIBE_POLL_INTERVAL) {
            Ok(event) => {
                if let Err(err) = write_line(&mut stream, &event) {
                    debug!(error = %err, revision = event.revision(), "Subscriber went away");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if context.shutdown.is_triggered() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("Subscriber detached");
}

fn load_meta(store: &MetaStore) -> std::collections::HashMap<String, SessionMeta> {
    store.all().unwrap_or_else(|err| {
        warn!(error = %err, "Failed to read session metadata; presenting without it");
        Default::default()
    })
}

fn meta_error_info(err: &MetaError) -> ErrorInfo {
    ErrorInfo::new("meta_error", err.to_string())
}

fn session_not_found(id: Option<String>, session_id: &str) -> Response {
    Response::error(
        id,
        "session_not_found",
        format!("no session with id {}", session_id),
    )
}

fn to_response<T: Serialize>(id: Option<String>, value: T) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("failed to serialize response: {}", err),
        ),
    }
}

fn write_line<T: Serialize>(stream: &mut UnixStream, value: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, value)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
