//! Verto JSON-RPC 2.0 frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One JSON-RPC frame, request or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertoFrame {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VertoErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertoErrorBody {
    pub code: u32,
    pub message: String,
}

impl VertoFrame {
    pub fn request(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn response(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<u64>, code: u32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(VertoErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

/// `login` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginParams {
    pub login: String,
    pub passwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessid: Option<String>,
}

/// Common dialog parameters carried by call methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogParams {
    #[serde(rename = "callID")]
    pub call_id: String,
    #[serde(
        rename = "destination_number",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub destination_number: Option<String>,
}

/// `verto.invite` / `verto.answer` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpParams {
    #[serde(rename = "dialogParams")]
    pub dialog_params: DialogParams,
    pub sdp: String,
}

/// `verto.bye` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByeParams {
    #[serde(rename = "dialogParams")]
    pub dialog_params: DialogParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// `verto.info` parameters (DTMF).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoParams {
    #[serde(rename = "dialogParams")]
    pub dialog_params: DialogParams,
    pub dtmf: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invite_params_round_trip() {
        let frame: VertoFrame = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "verto.invite",
            "params": {
                "dialogParams": {"callID": "c-1", "destination_number": "e"},
                "sdp": "v=0"
            }
        }))
        .unwrap();
        assert_eq!(frame.method.as_deref(), Some("verto.invite"));
        let params: SdpParams = serde_json::from_value(frame.params.unwrap()).unwrap();
        assert_eq!(params.dialog_params.call_id, "c-1");
        assert_eq!(params.dialog_params.destination_number.as_deref(), Some("e"));
    }
}
