//! Control-channel protocol: JSON-RPC envelope and error codes.
//!
//! Frames tagged with the control index carry one JSON value per logical
//! message. Requests and server-to-client notifications share the
//! [`MethodCall`] shape; [`Reply`] answers a request by id. Error codes are
//! integers from 4000 up and appear both in replies and in unsolicited
//! `warn` notifications.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use thiserror::Error;

/// Channel index reserved for the control channel.
pub const CONTROL_INDEX: u16 = 0xffff;

/// Bytes of channel index prefixed to every client-facing data frame.
pub const INDEX_PREFIX_LEN: u64 = 2;

/// Protocol error codes. Serialized as bare integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("Error parsing payload as JSON")]
    BadJson = 4000,
    #[error("The provided frame was too short, it must start with an socket index, or 0")]
    FrameTooShort = 4001,
    #[error("Maximum websocket frame length exceeded")]
    FrameTooLong = 4002,
    #[error("Unknown method name")]
    UnknownMethod = 4003,
    #[error("You are trying to send to a connection which does not exist")]
    UnknownConnection = 4004,
    #[error("Invalid URL provided")]
    InvalidUrl = 4005,
    #[error("You are not allowd to connect to that hostname")]
    InvalidHostname = 4007,
    #[error("Error dialing the remote server")]
    DialError = 4008,
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(*self as u16)
    }
}

impl ErrorCode {
    /// Wrap the code and its canonical message into a reply error.
    pub fn response_error(self) -> ResponseError {
        ResponseError {
            code: self,
            message: self.to_string(),
            path: None,
        }
    }

    /// Like [`ErrorCode::response_error`], tagged with the offending field.
    pub fn with_path(self, path: &str) -> ResponseError {
        ResponseError {
            code: self,
            message: self.to_string(),
            path: Some(path.to_string()),
        }
    }
}

/// An error embedded in a reply or a `warn` notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ResponseError {
    pub fn dial_error(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::DialError,
            message: message.into(),
            path: Some("url".to_string()),
        }
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A method call: client requests and server notifications both take this
/// shape. Server-initiated notifications carry `id: 0` and expect no reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodCall {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl MethodCall {
    /// Build a server-to-client notification.
    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        Self {
            id: 0,
            kind: "method".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// A reply to a [`MethodCall`], echoing its id. Exactly one of `result` and
/// `error` is present.
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: i64,
    pub result: Option<serde_json::Value>,
    pub error: Option<ResponseError>,
}

impl Reply {
    pub fn result(id: i64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: i64, error: ResponseError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

impl Serialize for Reply {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = usize::from(self.result.is_some()) + usize::from(self.error.is_some());
        let mut s = serializer.serialize_struct("Reply", 2 + extra)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("type", "reply")?;
        if let Some(result) = &self.result {
            s.serialize_field("result", result)?;
        }
        if let Some(error) = &self.error {
            s.serialize_field("error", error)?;
        }
        s.end()
    }
}

/// `connect` request parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectCommand {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub subprotocols: Vec<String>,
    /// Requested dial timeout in milliseconds; bounded by the server config.
    #[serde(default)]
    pub timeout: u64,
}

/// `connect` reply: the slot index allocated for the new upstream.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnectResponse {
    pub index: u16,
}

/// `terminate` request parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminateCommand {
    pub index: u16,
    #[serde(default = "default_close_code")]
    pub code: u16,
    #[serde(default)]
    pub reason: String,
}

fn default_close_code() -> u16 {
    1000
}

/// `onSocketClosed` notification parameters.
#[derive(Debug, Clone, Serialize)]
pub struct SocketClosedParams {
    pub index: u16,
    pub code: u16,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn warn_notification_matches_wire_shape() {
        let warn = MethodCall::notification(
            "warn",
            serde_json::to_value(ErrorCode::UnknownConnection.response_error()).unwrap(),
        );
        let encoded = serde_json::to_value(&warn).unwrap();
        assert_eq!(
            encoded,
            json!({
                "id": 0,
                "type": "method",
                "method": "warn",
                "params": {
                    "code": 4004,
                    "message": "You are trying to send to a connection which does not exist"
                }
            })
        );
    }

    #[test]
    fn reply_omits_absent_fields() {
        let ok = Reply::result(3, json!({"index": 0}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": 3, "type": "reply", "result": {"index": 0}})
        );

        let err = Reply::error(0, ErrorCode::InvalidHostname.with_path("url"));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({
                "id": 0,
                "type": "reply",
                "error": {
                    "code": 4007,
                    "message": "You are not allowd to connect to that hostname",
                    "path": "url"
                }
            })
        );
    }

    #[test]
    fn method_call_defaults() {
        let call: MethodCall =
            serde_json::from_str(r#"{"type":"method","method":"connect","params":{"url":"x"}}"#)
                .unwrap();
        assert_eq!(call.id, 0);
        assert_eq!(call.method, "connect");

        let cmd: ConnectCommand = serde_json::from_value(call.params).unwrap();
        assert_eq!(cmd.url, "x");
        assert!(cmd.headers.is_empty());
        assert!(cmd.subprotocols.is_empty());
        assert_eq!(cmd.timeout, 0);
    }

    #[test]
    fn terminate_defaults_to_normal_closure() {
        let cmd: TerminateCommand = serde_json::from_str(r#"{"index":2}"#).unwrap();
        assert_eq!(cmd.index, 2);
        assert_eq!(cmd.code, 1000);
        assert_eq!(cmd.reason, "");
    }
}
