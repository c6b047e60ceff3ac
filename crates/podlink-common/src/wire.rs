//! Tunnel wire format
//!
//! Every tunnel frame is a JSON text message shaped `{"type": ..., "payload": ...}`.
//! Clients send `exec`, `portforward` and `file`; the broker answers with
//! `exec_response`, `portforward_response`, `file_response` and `error`.
//!
//! Decoding happens in two steps so that an unknown `type` can be told apart
//! from a known type carrying a bad payload. Both are answered with an
//! `error` frame and neither closes the connection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Raw frame envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelMessage {
    /// Message tag
    #[serde(rename = "type")]
    pub kind: String,
    /// Tag-specific body
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Why an inbound frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not a `{type, payload}` JSON object
    #[error("invalid message format: {0}")]
    Malformed(String),
    /// Tag not handled by the broker
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// Known tag, payload did not match its schema
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Message tag
        kind: String,
        /// Deserializer message
        reason: String,
    },
}

/// A decoded client request
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Run a command in the workload
    Exec(ExecRequest),
    /// Open, feed or close a forwarded port
    PortForward(PortForwardRequest),
    /// File primitive executed inside the workload
    File(FileRequest),
}

impl ClientMessage {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, WireError> {
        let envelope: TunnelMessage =
            serde_json::from_str(text).map_err(|e| WireError::Malformed(e.to_string()))?;

        fn payload<T: serde::de::DeserializeOwned>(
            envelope: TunnelMessage,
        ) -> Result<T, WireError> {
            serde_json::from_value(envelope.payload).map_err(|e| WireError::InvalidPayload {
                kind: envelope.kind,
                reason: e.to_string(),
            })
        }

        match envelope.kind.as_str() {
            "exec" => payload(envelope).map(ClientMessage::Exec),
            "portforward" => payload(envelope).map(ClientMessage::PortForward),
            "file" => payload(envelope).map(ClientMessage::File),
            other => Err(WireError::UnknownType(other.to_string())),
        }
    }
}

/// A broker reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Output chunk or completion of an `exec`
    ExecResponse(ExecResponse),
    /// Port-forward state change or data
    PortforwardResponse(PortForwardResponse),
    /// Result of a `file` operation
    FileResponse(FileResponse),
    /// Protocol or session error
    Error(ErrorPayload),
}

impl ServerMessage {
    /// Build an `error` frame
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            error: message.into(),
            reason: None,
        })
    }

    /// Build an `error` frame carrying a machine-readable reason
    pub fn error_with_reason(message: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            error: message.into(),
            reason: Some(reason.into()),
        })
    }

    /// Serialize to a text frame
    pub fn encode(&self) -> String {
        // Every variant is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","payload":{"error":"encoding failed"}}"#.to_string()
        })
    }
}

/// `exec` request payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Correlation id echoed on every response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Program to run
    pub command: String,
    /// Program arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Data written to the process stdin, which is then closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Target container, when the workload has several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl ExecRequest {
    /// Full argv: command followed by args
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// `exec_response` payload
///
/// Output chunks carry `stdout` and/or `stderr`; the final message carries
/// `exit_code` and `done: true`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResponse {
    /// Correlation id copied from the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Stdout chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Stderr chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Process exit code, set on the final message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Whether this is the final message for the request
    #[serde(default)]
    pub done: bool,
}

/// What a `portforward` request asks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortForwardAction {
    /// Start forwarding the port
    #[default]
    Open,
    /// Bytes for the workload side of the port
    Data,
    /// Stop forwarding the port
    Close,
}

/// `portforward` request payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortForwardRequest {
    /// Workload port
    pub port: u16,
    /// Requested action, `open` when omitted
    #[serde(default)]
    pub action: PortForwardAction,
    /// Base64 bytes for `data`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Port-forward state reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortForwardStatus {
    /// Forwarding is established
    Opened,
    /// Bytes from the workload side
    Data,
    /// Forwarding ended
    Closed,
    /// Forwarding failed
    Error,
}

/// `portforward_response` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortForwardResponse {
    /// Workload port
    pub port: u16,
    /// State change
    pub status: PortForwardStatus,
    /// Base64 bytes for `data`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Human-readable detail for `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PortForwardResponse {
    /// Response carrying only a state change
    pub fn status(port: u16, status: PortForwardStatus) -> Self {
        Self {
            port,
            status,
            data: None,
            message: None,
        }
    }
}

/// File primitive requested by a `file` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    /// Return file content
    Read,
    /// Replace file content
    Write,
    /// List a directory
    List,
    /// Remove a file or directory
    Delete,
}

impl FromStr for FileOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(FileOperation::Read),
            "write" => Ok(FileOperation::Write),
            "list" => Ok(FileOperation::List),
            "delete" => Ok(FileOperation::Delete),
            other => Err(format!("unsupported operation: {}", other)),
        }
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileOperation::Read => "read",
            FileOperation::Write => "write",
            FileOperation::List => "list",
            FileOperation::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// `file` request payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRequest {
    /// Correlation id echoed on the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// One of `read`, `write`, `list`, `delete`
    pub operation: String,
    /// Path inside the workload
    pub path: String,
    /// New content for `write`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// `file_response` payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileResponse {
    /// Correlation id copied from the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Whether the operation succeeded
    pub success: bool,
    /// File content or directory listing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `error` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable message
    pub error: String,
    /// Machine-readable reason, e.g. `session_expired`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
