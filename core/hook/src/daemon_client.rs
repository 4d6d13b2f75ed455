//! Client helpers for talking to the switchboard daemon.
//!
//! Hook pushes use short timeouts and a single retry so a missing daemon never
//! stalls the agent. Interactive commands wait longer.

use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use switchboard_protocol::{
    ErrorInfo, EventEnvelope, Method, Request, Response, MAX_REQUEST_BYTES,
};
use thiserror::Error;

const ENABLE_ENV: &str = "SWITCHBOARD_DAEMON_ENABLED";
const SOCKET_ENV: &str = "SWITCHBOARD_DAEMON_SOCKET";
const SOCKET_RELATIVE_PATH: &str = ".switchboard/daemon.sock";
const HOOK_TIMEOUT: Duration = Duration::from_millis(600);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("home directory not found")]
    NoHome,
    #[error("failed to read stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("failed to parse hook input: {0}")]
    HookInput(#[source] serde_json::Error),
    #[error("failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write request: {0}")]
    Write(#[source] std::io::Error),
    #[error("timed out waiting for daemon response")]
    Timeout,
    #[error("failed to read response: {0}")]
    Read(#[source] std::io::Error),
    #[error("daemon response was empty")]
    EmptyResponse,
    #[error("response exceeded maximum size")]
    ResponseTooLarge,
    #[error("failed to parse response JSON: {0}")]
    InvalidResponse(#[source] serde_json::Error),
    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("daemon error {}", .0)]
    Daemon(ErrorInfo),
}

pub fn daemon_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => !matches!(value.as_str(), "0" | "false" | "FALSE" | "no" | "NO"),
        Err(_) => true,
    }
}

pub fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ClientError::NoHome)?;
    Ok(home.join(SOCKET_RELATIVE_PATH))
}

pub fn make_event_id(pid: u32) -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!("evt-{}-{}-{:x}", Utc::now().timestamp_millis(), pid, rand)
}

/// Pushes an event, retrying once with the same event id.
pub fn send_event_with_retry(event: EventEnvelope) -> Result<(), ClientError> {
    let params = serde_json::to_value(&event).map_err(ClientError::Serialize)?;
    let build = || Request::new(Method::Event, Some(event.event_id.clone()), Some(params.clone()));

    match expect_ok(send_request(build(), HOOK_TIMEOUT)) {
        Ok(_) => Ok(()),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send event to daemon");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            expect_ok(send_request(build(), HOOK_TIMEOUT))
                .map(|_| ())
                .map_err(|retry_err| {
                    tracing::warn!(error = %retry_err, "Retry failed sending event to daemon");
                    retry_err
                })
        }
    }
}

/// Sends a command request and returns its `data` payload.
pub fn call(method: Method, params: Option<Value>) -> Result<Value, ClientError> {
    let request = Request::new(method, Some(format!("{:?}", method)), params);
    expect_ok(send_request(request, COMMAND_TIMEOUT))
}

/// Subscribes to change events. `on_event` is called for the acknowledgement
/// and every event after it; returning `false` ends the stream.
pub fn watch<F>(mut on_event: F) -> Result<(), ClientError>
where
    F: FnMut(Value) -> bool,
{
    let mut stream = connect()?;
    write_request(&mut stream, &Request::new(Method::Subscribe, None, None))?;

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line.map_err(ClientError::Read)?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line).map_err(ClientError::InvalidResponse)?;
        if value.get("ok") == Some(&Value::Bool(false)) {
            let response: Response =
                serde_json::from_value(value).map_err(ClientError::InvalidResponse)?;
            return Err(daemon_error(response));
        }
        if !on_event(value) {
            break;
        }
    }
    Ok(())
}

fn expect_ok(response: Result<Response, ClientError>) -> Result<Value, ClientError> {
    let response = response?;
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(daemon_error(response))
    }
}

fn daemon_error(response: Response) -> ClientError {
    ClientError::Daemon(
        response
            .error
            .unwrap_or_else(|| ErrorInfo::new("unknown", "unknown daemon error")),
    )
}

fn connect() -> Result<UnixStream, ClientError> {
    let path = socket_path()?;
    UnixStream::connect(&path).map_err(|source| ClientError::Connect { path, source })
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<(), ClientError> {
    let mut payload = serde_json::to_vec(request).map_err(ClientError::Serialize)?;
    payload.push(b'\n');
    stream.write_all(&payload).map_err(ClientError::Write)?;
    stream.flush().map_err(ClientError::Write)
}

fn send_request(request: Request, timeout: Duration) -> Result<Response, ClientError> {
    let mut stream = connect()?;
    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));
    write_request(&mut stream, &request)?;
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::ResponseTooLarge);
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
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(ClientError::Read(err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(ClientError::EmptyResponse);
    }

    serde_json::from_slice(response_bytes).map_err(ClientError::InvalidResponse)
}
