//! JSON-RPC 2.0 frame model shared by the bridge server and the client
//! crate, plus the method names and bridge-local error codes that cross
//! the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

// Method names crossing the bridge. Canonical names are retained for
// compatibility with existing agent frontends.
pub const METHOD_SESSION_NEW: &str = "session/new";
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
pub const METHOD_SESSION_CANCEL: &str = "session/cancel";
pub const METHOD_SESSION_UPDATE: &str = "session/update";
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";
pub const METHOD_PROVIDE_PERMISSION: &str = "session/provide_permission";
pub const METHOD_SUBMIT_AUTH_CODE: &str = "gemini/submitAuthCode";
pub const METHOD_AUTHENTICATE: &str = "authenticate";
pub const METHOD_AUTH_URL: &str = "gemini/authUrl";
pub const METHOD_FS_READ_TEXT_FILE: &str = "fs/read_text_file";
pub const METHOD_FS_WRITE_TEXT_FILE: &str = "fs/write_text_file";
pub const METHOD_REPLAY: &str = "bridge/replay";
pub const METHOD_STRUCTURED_EVENT: &str = "bridge/structured_event";
pub const METHOD_AGENT_EXIT: &str = "bridge/agentExit";

// Bridge-local error codes. Standard JSON-RPC codes are reused for
// everything else.
pub const ERROR_INVALID_TOOL_PATH: i32 = -32602;
pub const ERROR_FILE_TOOL_IO: i32 = -32000;

// Non-protocol fields carried inside a replay envelope's `data` object so
// a reconnecting client can reconstitute per-turn hidden behavior.
pub const REPLAY_TURN_FIELD: &str = "_turn";
pub const REPLAY_HIDDEN_FIELD: &str = "_hidden";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

impl JsonRpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

impl JsonRpcMessage {
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(req) => Some(&req.method),
            JsonRpcMessage::Notification(notif) => Some(&notif.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            JsonRpcMessage::Request(req) => req.params.as_ref(),
            JsonRpcMessage::Notification(notif) => notif.params.as_ref(),
            JsonRpcMessage::Response(_) => None,
        }
    }
}

/// Per-turn visibility setting. The mode lives on the prompt that opened
/// the turn and is inherited by every event of that turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HiddenMode {
    #[default]
    None,
    User,
    Assistant,
    Turn,
}

impl HiddenMode {
    pub fn from_meta(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("user") => HiddenMode::User,
            Some("assistant") => HiddenMode::Assistant,
            Some("turn") => HiddenMode::Turn,
            _ => HiddenMode::None,
        }
    }

    pub fn suppresses_user(self) -> bool {
        matches!(self, HiddenMode::User | HiddenMode::Turn)
    }

    /// Assistant-side suppression also forces auto-rejection of tool
    /// approvals.
    pub fn suppresses_assistant(self) -> bool {
        matches!(self, HiddenMode::Assistant | HiddenMode::Turn)
    }
}

pub fn extract_session_id(message: &JsonRpcMessage) -> Option<String> {
    let params = match message {
        JsonRpcMessage::Request(req) => req.params.as_ref(),
        JsonRpcMessage::Response(resp) => resp.result.as_ref(),
        JsonRpcMessage::Notification(notif) => notif.params.as_ref(),
    };

    params
        .and_then(Value::as_object)
        .and_then(|obj| obj.get("sessionId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The `sessionUpdate` discriminator of a `session/update` notification,
/// if the frame is one.
pub fn session_update_kind(message: &JsonRpcMessage) -> Option<&str> {
    match message {
        JsonRpcMessage::Notification(notif) if notif.method == METHOD_SESSION_UPDATE => notif
            .params
            .as_ref()?
            .get("update")?
            .get("sessionUpdate")?
            .as_str(),
        _ => None,
    }
}

/// Whether the frame terminates a turn: an `end_of_turn` session update,
/// or a response whose result carries a `stopReason`.
pub fn is_end_of_turn(message: &JsonRpcMessage) -> bool {
    match message {
        JsonRpcMessage::Response(resp) => resp
            .result
            .as_ref()
            .map(|r| r.get("stopReason").is_some())
            .unwrap_or(false),
        _ => session_update_kind(message) == Some("end_of_turn"),
    }
}
