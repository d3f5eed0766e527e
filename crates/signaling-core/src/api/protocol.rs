//! External API wire frames.
//!
//! Requests are `{class, subclass, cmd, data, tid}`; responses echo the
//! `tid`; event frames are `{class: "event", data: {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One command frame, client → hub or hub → client (invite/cancel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFrame {
    pub class: String,
    pub subclass: String,
    pub cmd: String,
    #[serde(default)]
    pub data: Value,
    pub tid: u64,
}

/// Response to a command frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub tid: u64,
    /// `"ok"` or `"error"`.
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok(tid: u64, data: Option<Value>) -> Self {
        Self {
            tid,
            result: "ok".to_string(),
            data,
            code: None,
            error: None,
        }
    }

    pub fn error(tid: u64, code: u32, error: impl Into<String>) -> Self {
        Self {
            tid,
            result: "error".to_string(),
            data: None,
            code: Some(code),
            error: Some(error.into()),
        }
    }
}

/// Payload of an event frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventData {
    pub srv_id: String,
    pub class: String,
    pub subclass: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub obj_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

/// Event frame pushed to subscribed clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventFrame {
    pub class: String,
    pub data: ApiEventData,
}

/// Anything the hub sends to an API client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiOut {
    Response(ApiResponse),
    Event(ApiEventFrame),
    /// Hub-initiated command (call invite/cancel toward a bound user).
    Request(ApiFrame),
}
