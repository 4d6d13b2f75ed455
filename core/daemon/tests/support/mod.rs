#![allow(dead_code)]

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use switchboard_protocol::{Method, Request, Response};

pub struct DaemonGuard {
    pub child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Starts the daemon under a throwaway HOME with the scanner off, so only
/// pushed events reach the registry.
pub fn spawn_daemon(home: &Path) -> DaemonGuard {
    let config_dir = home.join(".switchboard").join("daemon");
    std::fs::create_dir_all(&config_dir).expect("create config dir");
    std::fs::write(
        config_dir.join("config.toml"),
        "[scanner]\nenabled = false\n\n[notifications]\nenabled = false\n",
    )
    .expect("write config");

    let child = Command::new(env!("CARGO_BIN_EXE_switchboard-daemon"))
        .env("HOME", home)
        .env_remove("SWITCHBOARD_CONFIG")
        .env_remove("SWITCHBOARD_DAEMON_SOCKET")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn switchboard-daemon");
    DaemonGuard { child }
}

pub fn socket_path(home: &Path) -> PathBuf {
    home.join(".switchboard").join("daemon.sock")
}

pub fn can_bind_socket(home: &Path) -> bool {
    let probe_path = home.join("probe.sock");
    match UnixListener::bind(&probe_path) {
        Ok(listener) => {
            drop(listener);
            let _ = std::fs::remove_file(&probe_path);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

pub fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for daemon socket at {}", path.display());
}

pub fn request(method: Method, params: Option<Value>) -> Request {
    Request::new(method, Some(format!("{:?}", method)), params)
}

pub fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("failed to serialize request");
    stream.write_all(b"\n").expect("failed to write request");
    stream.flush().expect("failed to flush request");
    read_response(&mut stream)
}

pub fn send_raw_request(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    stream.write_all(payload).expect("failed to write raw payload");
    stream.flush().expect("failed to flush raw payload");
    read_response(&mut stream)
}

pub fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    serde_json::from_slice(response_bytes).expect("failed to parse response JSON")
}

pub fn event(event_id: &str, event_type: &str, cwd: &Path) -> Value {
    json!({
        "event_id": event_id,
        "recorded_at": Utc::now().to_rfc3339(),
        "event_type": event_type,
        "cwd": cwd.to_string_lossy(),
    })
}

pub fn send_event(socket: &Path, params: Value) -> Response {
    send_request(socket, request(Method::Event, Some(params)))
}

pub fn sessions(socket: &Path) -> Vec<Value> {
    let response = send_request(socket, request(Method::GetSessions, None));
    assert!(response.ok, "get_sessions failed: {:?}", response.error);
    response
        .data
        .and_then(|data| data.as_array().cloned())
        .expect("sessions payload is array")
}

/// Polls `get_sessions` until `predicate` holds; pushes are applied
/// asynchronously after the event is acknowledged.
pub fn wait_for_sessions<F>(socket: &Path, timeout: Duration, predicate: F) -> Vec<Value>
where
    F: Fn(&[Value]) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let current = sessions(socket);
        if predicate(&current) {
            return current;
        }
        if Instant::now() >= deadline {
            panic!("sessions never reached expected shape: {:?}", current);
        }
        sleep(Duration::from_millis(25));
    }
}
