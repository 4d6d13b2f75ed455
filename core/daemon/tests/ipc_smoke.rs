mod support;

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use support::*;
use switchboard_protocol::Method;
use tempfile::TempDir;

const SETTLE: Duration = Duration::from_secs(3);

#[test]
fn pushed_permission_request_surfaces_as_awaiting_permission() {
    let home = TempDir::new().expect("failed to create temp HOME");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping smoke test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let health = send_request(&socket, request(Method::GetHealth, None));
    assert!(health.ok, "health response was not ok");
    let data = health.data.expect("health payload");
    assert_eq!(data["status"], "ok");
    assert_eq!(data["scanner_enabled"], false);

    let project = home.path().join("api");
    let mut pre_tool = event("evt-1", "pre_tool_use", &project);
    pre_tool["tool_name"] = json!("Bash");
    pre_tool["command"] = json!("npm install");
    let response = send_event(&socket, pre_tool);
    assert!(response.ok, "pre_tool_use was not accepted: {:?}", response.error);
    assert_eq!(response.data.expect("ack")["queued"], true);

    let mut permission = event("evt-2", "permission_request", &project);
    permission["tool_name"] = json!("Bash");
    permission["command"] = json!("npm install");
    assert!(send_event(&socket, permission).ok);

    let sessions = wait_for_sessions(&socket, SETTLE, |sessions| {
        sessions.len() == 1 && sessions[0]["state"] == "awaiting_permission"
    });
    let session = &sessions[0];
    assert_eq!(session["project_name"], "api");
    assert_eq!(session["pending_action"]["kind"], "permission");
    assert_eq!(session["pending_action"]["tool"], "Bash");

    // A follow-up without a session id lands on the same session.
    assert!(send_event(&socket, event("evt-3", "post_tool_use", &project)).ok);
    let sessions = wait_for_sessions(&socket, SETTLE, |sessions| {
        sessions.len() == 1 && sessions[0]["state"] == "processing"
    });
    let session_id = sessions[0]["id"].as_str().expect("session id").to_string();

    let response = send_request(
        &socket,
        request(Method::GetSession, Some(json!({ "session_id": session_id }))),
    );
    assert!(response.ok);
    assert_eq!(response.data.expect("session")["id"], session_id.as_str());

    let response = send_request(
        &socket,
        request(Method::RemoveSession, Some(json!({ "session_id": session_id }))),
    );
    assert_eq!(response.data.expect("removal")["removed"], true);
    assert!(sessions_now_empty(&socket));
}

#[test]
fn malformed_event_is_rejected_and_visible_in_debug() {
    let home = TempDir::new().expect("failed to create temp HOME");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping smoke test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut bogus = event("evt-bad", "pre_tool_use", home.path());
    bogus["recorded_at"] = json!("yesterday");
    let response = send_event(&socket, bogus);
    assert!(!response.ok, "malformed event must be rejected");

    let debug = send_request(&socket, request(Method::GetDebug, None));
    assert!(debug.ok);
    let data = debug.data.expect("debug payload");
    let trail = data["trail"].as_array().expect("trail array");
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0]["accepted"], false);
    assert!(trail[0]["reason"]
        .as_str()
        .unwrap_or_default()
        .starts_with("skipped"));
    assert!(sessions(&socket).is_empty());
}

#[test]
fn meta_is_merged_into_session_list() {
    let home = TempDir::new().expect("failed to create temp HOME");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping smoke test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut start = event("evt-1", "session_start", &home.path().join("web"));
    start["session_id"] = json!("agent-web");
    assert!(send_event(&socket, start).ok);
    wait_for_sessions(&socket, SETTLE, |sessions| sessions.len() == 1);

    let response = send_request(
        &socket,
        request(
            Method::SetMeta,
            Some(json!({ "session_id": "agent-web", "tag": "  frontend  ", "pinned": true })),
        ),
    );
    assert!(response.ok, "set_meta failed: {:?}", response.error);

    let listed = sessions(&socket);
    assert_eq!(listed[0]["tag"], "frontend");
    assert_eq!(listed[0]["pinned"], true);
    assert!(home
        .path()
        .join(".switchboard")
        .join("session-meta.json")
        .exists());
}

#[test]
fn subscriber_sees_updates_and_shutdown_cleans_up() {
    let home = TempDir::new().expect("failed to create temp HOME");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping smoke test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(home.path());
    let mut guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut stream = UnixStream::connect(&socket).expect("connect subscriber");
    serde_json::to_writer(&mut stream, &request(Method::Subscribe, None)).expect("serialize");
    stream.write_all(b"\n").expect("write subscribe");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).expect("subscribe ack");
    let ack: Value = serde_json::from_str(&line).expect("ack json");
    assert_eq!(ack["data"]["subscribed"], true);

    let mut start = event("evt-1", "session_start", &home.path().join("svc"));
    start["session_id"] = json!("agent-svc");
    assert!(send_event(&socket, start).ok);

    line.clear();
    reader.read_line(&mut line).expect("change event");
    let change: Value = serde_json::from_str(&line).expect("change json");
    assert_eq!(change["type"], "updated");
    assert_eq!(change["session"]["id"], "agent-svc");
    assert_eq!(change["transition"]["to"], "processing");

    let response = send_request(&socket, request(Method::Shutdown, None));
    assert!(response.ok);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(status) = guard.child.try_wait().expect("try_wait") {
            assert!(status.success(), "daemon exited with {:?}", status);
            break;
        }
        assert!(Instant::now() < deadline, "daemon did not exit after shutdown");
        std::thread::sleep(Duration::from_millis(25));
    }
    assert!(!socket.exists(), "socket should be removed on shutdown");
}

fn sessions_now_empty(socket: &std::path::Path) -> bool {
    wait_for_sessions(socket, SETTLE, |sessions| sessions.is_empty()).is_empty()
}
