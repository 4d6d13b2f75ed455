//! IPC protocol types and validation for switchboard-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_EVENT_ID_LEN: usize = 128;
pub const MAX_IDENTIFIER_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Event,
    GetSessions,
    GetSession,
    RemoveSession,
    Focus,
    Close,
    SendInput,
    GetMeta,
    SetMeta,
    GetDebug,
    Subscribe,
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Agent lifecycle points the daemon understands.
///
/// Resolved once at the protocol boundary; unknown kinds fail to parse.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum EventType {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    PermissionRequest,
    Notification,
    Stop,
    Error,
    SessionEnd,
    /// Liveness only: the session is still there, nothing else changed.
    Heartbeat,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session_start",
            EventType::UserPromptSubmit => "user_prompt_submit",
            EventType::PreToolUse => "pre_tool_use",
            EventType::PostToolUse => "post_tool_use",
            EventType::PermissionRequest => "permission_request",
            EventType::Notification => "notification",
            EventType::Stop => "stop",
            EventType::Error => "error",
            EventType::SessionEnd => "session_end",
            EventType::Heartbeat => "heartbeat",
        }
    }

    /// Maps an agent hook name (`PreToolUse`, `Stop`, ...) to an event type.
    pub fn from_hook_name(name: &str) -> Option<Self> {
        match name {
            "SessionStart" => Some(EventType::SessionStart),
            "UserPromptSubmit" => Some(EventType::UserPromptSubmit),
            "PreToolUse" => Some(EventType::PreToolUse),
            "PostToolUse" | "PostToolUseFailure" => Some(EventType::PostToolUse),
            "PermissionRequest" => Some(EventType::PermissionRequest),
            "Notification" => Some(EventType::Notification),
            "Stop" => Some(EventType::Stop),
            "StopFailure" => Some(EventType::Error),
            "SessionEnd" => Some(EventType::SessionEnd),
            _ => None,
        }
    }
}

/// tmux address components reported by the hook alongside an event.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TmuxContext {
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub window: String,
    #[serde(default)]
    pub pane: String,
    #[serde(default)]
    pub window_name: Option<String>,
}

impl TmuxContext {
    /// `session:window.pane`, or `None` when any component is blank.
    pub fn pane_target(&self) -> Option<String> {
        let session = self.session.trim();
        let window = self.window.trim();
        let pane = self.pane.trim();
        if session.is_empty() || window.is_empty() || pane.is_empty() {
            return None;
        }
        Some(format!("{}:{}.{}", session, window, pane))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EventEnvelope {
    pub event_id: String,
    pub recorded_at: String,
    pub event_type: EventType,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub auto_approved: Option<bool>,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub tmux: Option<TmuxContext>,
}

impl EventEnvelope {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_id", "event_id is required"));
        }
        if self.event_id.len() > MAX_EVENT_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                "event_id must be 128 characters or fewer",
            ));
        }

        if DateTime::parse_from_rfc3339(&self.recorded_at).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "recorded_at must be RFC3339",
            ));
        }

        require_string(&self.cwd, "cwd")?;
        optional_identifier(&self.session_id, "session_id")?;
        optional_identifier(&self.tool_name, "tool_name")?;

        Ok(())
    }

    pub fn pane_target(&self) -> Option<String> {
        self.tmux.as_ref().and_then(TmuxContext::pane_target)
    }
}

pub fn parse_event(params: Value) -> Result<EventEnvelope, ErrorInfo> {
    let envelope: EventEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid JSON: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionIdParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PaneParams {
    pub pane_target: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SendInputParams {
    pub session_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SetMetaParams {
    pub session_id: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
}

pub fn parse_session_id(params: Option<Value>) -> Result<SessionIdParams, ErrorInfo> {
    let parsed: SessionIdParams = parse_params(params)?;
    require_string(&Some(parsed.session_id.clone()), "session_id")?;
    Ok(parsed)
}

pub fn parse_pane(params: Option<Value>) -> Result<PaneParams, ErrorInfo> {
    let parsed: PaneParams = parse_params(params)?;
    require_string(&Some(parsed.pane_target.clone()), "pane_target")?;
    Ok(parsed)
}

pub fn parse_send_input(params: Option<Value>) -> Result<SendInputParams, ErrorInfo> {
    let parsed: SendInputParams = parse_params(params)?;
    require_string(&Some(parsed.session_id.clone()), "session_id")?;
    if parsed.text.is_empty() {
        return Err(ErrorInfo::new("missing_field", "text is required"));
    }
    Ok(parsed)
}

pub fn parse_set_meta(params: Option<Value>) -> Result<SetMetaParams, ErrorInfo> {
    let parsed: SetMetaParams = parse_params(params)?;
    require_string(&Some(parsed.session_id.clone()), "session_id")?;
    Ok(parsed)
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params =
        params.ok_or_else(|| ErrorInfo::new("invalid_params", "params are required"))?;
    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("invalid params: {}", err)))
}

fn require_string(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    if let Some(candidate) = value {
        if !candidate.trim().is_empty() {
            return Ok(());
        }
    }
    Err(ErrorInfo::new(
        "missing_field",
        format!("{} is required", field),
    ))
}

fn optional_identifier(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    match value {
        Some(candidate) if candidate.len() > MAX_IDENTIFIER_LEN => Err(ErrorInfo::new(
            "invalid_field",
            format!("{} must be {} characters or fewer", field, MAX_IDENTIFIER_LEN),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event(event_type: EventType) -> EventEnvelope {
        EventEnvelope {
            event_id: "evt-1".to_string(),
            recorded_at: "2026-01-30T12:00:00Z".to_string(),
            event_type,
            cwd: Some("/repo".to_string()),
            session_id: None,
            tool_name: None,
            command: None,
            auto_approved: None,
            notification_type: None,
            tmux: None,
        }
    }

    #[test]
    fn validates_event_without_session_id() {
        let event = base_event(EventType::PreToolUse);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn rejects_missing_cwd() {
        let mut event = base_event(EventType::Stop);
        event.cwd = Some("   ".to_string());
        assert_eq!(
            event.validate().unwrap_err().code,
            "missing_field".to_string()
        );
    }

    #[test]
    fn rejects_bad_timestamp() {
        let mut event = base_event(EventType::SessionEnd);
        event.recorded_at = "not-a-time".to_string();
        assert!(event.validate().is_err());
    }

    #[test]
    fn rejects_long_event_id() {
        let mut event = base_event(EventType::SessionEnd);
        event.event_id = "a".repeat(256);
        assert!(event.validate().is_err());
    }

    #[test]
    fn parse_event_rejects_unknown_kind() {
        let payload = serde_json::json!({
            "event_id": "evt-1",
            "recorded_at": "2026-01-30T12:00:00Z",
            "event_type": "subagent_start",
            "cwd": "/repo",
        });
        let err = parse_event(payload).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn heartbeat_parses_but_is_not_a_hook_name() {
        let payload = serde_json::json!({
            "event_id": "evt-2",
            "recorded_at": "2026-01-30T12:00:00Z",
            "event_type": "heartbeat",
            "cwd": "/repo",
            "session_id": "abc",
        });
        let event = parse_event(payload).expect("heartbeat");
        assert_eq!(event.event_type, EventType::Heartbeat);
        assert_eq!(EventType::from_hook_name("Heartbeat"), None);
    }

    #[test]
    fn tmux_context_builds_pane_target() {
        let mut event = base_event(EventType::PreToolUse);
        event.tmux = Some(TmuxContext {
            session: "work".to_string(),
            window: "2".to_string(),
            pane: "1".to_string(),
            window_name: Some("api".to_string()),
        });
        assert_eq!(event.pane_target().as_deref(), Some("work:2.1"));

        event.tmux = Some(TmuxContext {
            session: "work".to_string(),
            ..TmuxContext::default()
        });
        assert_eq!(event.pane_target(), None);
    }

    #[test]
    fn hook_names_map_to_event_types() {
        assert_eq!(
            EventType::from_hook_name("PreToolUse"),
            Some(EventType::PreToolUse)
        );
        assert_eq!(
            EventType::from_hook_name("PostToolUseFailure"),
            Some(EventType::PostToolUse)
        );
        assert_eq!(EventType::from_hook_name("SubagentStop"), None);
    }

    #[test]
    fn send_input_requires_text() {
        let params = serde_json::json!({ "session_id": "s-1", "text": "" });
        assert!(parse_send_input(Some(params)).is_err());
    }

    #[test]
    fn params_must_be_object() {
        let err = parse_session_id(Some(serde_json::json!("s-1"))).unwrap_err();
        assert_eq!(err.code, "invalid_params");
        assert!(parse_pane(None).is_err());
    }
}
