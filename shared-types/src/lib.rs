//! IPC types shared between the worker host and the UI
//!
//! Two named channels carry the same message shapes, one for model workers
//! and one for param-finder workers:
//! - UI → host: [`InboundMessage`]
//! - host → UI: [`OutboundMessage`], one per worker event
//! - `list` is answered directly with a [`ListResponse`]
//!
//! Serializable with serde for JSON over WebSocket

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Channel carrying model worker traffic.
pub const MODEL_CHANNEL: &str = "models";

/// Channel carrying param-finder worker traffic.
pub const PARAM_FINDER_CHANNEL: &str = "param-finders";

// ============================================================================
// Inbound (UI → host)
// ============================================================================

/// Commands the UI can issue for a worker id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export_to = "ipc.ts")]
pub enum Command {
    Create,
    Remove,
    List,
    SendInput,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Create => write!(f, "create"),
            Command::Remove => write!(f, "remove"),
            Command::List => write!(f, "list"),
            Command::SendInput => write!(f, "sendInput"),
        }
    }
}

/// A command message sent by the UI on a worker channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export_to = "ipc.ts")]
pub struct InboundMessage {
    /// Caller-supplied worker id. Ignored by `list`.
    #[serde(default)]
    pub id: String,

    pub command: Command,

    /// Command parameters, opaque to the transport.
    /// `create` on the model channel: `{ inputOpt, aggOpt?, modelOpt }`.
    /// `create` on the param-finder channel: `{ inputOpt }`.
    /// `sendInput`: the record to write to the worker's stdin.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    #[ts(type = "unknown")]
    pub params: serde_json::Value,
}

impl InboundMessage {
    pub fn new(id: impl Into<String>, command: Command) -> Self {
        Self {
            id: id.into(),
            command,
            params: serde_json::Value::Null,
        }
    }

    /// Attach params (builder pattern)
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Direct reply to a `list` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export_to = "ipc.ts")]
pub struct ListResponse {
    pub ids: Vec<String>,
}

// ============================================================================
// Outbound (host → UI)
// ============================================================================

/// Kind of event forwarded to the UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export_to = "ipc.ts")]
pub enum EventKind {
    /// One complete output record from the worker.
    Data,
    /// A classified failure; payload is an [`ErrorPayload`].
    Error,
    /// The worker process exited; payload is the exit code or null.
    Close,
}

/// One event for one worker id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export_to = "ipc.ts")]
pub struct OutboundMessage {
    pub id: String,
    pub command: EventKind,
    #[ts(type = "unknown")]
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    pub fn data(id: impl Into<String>, record: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: EventKind::Data,
            payload: serde_json::Value::String(record.into()),
        }
    }

    pub fn close(id: impl Into<String>, code: Option<i32>) -> Self {
        Self {
            id: id.into(),
            command: EventKind::Close,
            payload: code.map_or(serde_json::Value::Null, serde_json::Value::from),
        }
    }

    pub fn error(id: impl Into<String>, payload: &ErrorPayload) -> Self {
        Self {
            id: id.into(),
            command: EventKind::Error,
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Decode the payload of an `error` message.
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if self.command != EventKind::Error {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Closed taxonomy of failures reported to the UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[ts(export_to = "ipc.ts")]
pub enum ErrorKind {
    /// The admission policy denied a new worker.
    #[serde(rename = "MaximumConcurrencyError")]
    MaximumConcurrency,
    /// The id is already active.
    #[serde(rename = "DuplicateIDError")]
    DuplicateId,
    /// The id is not active.
    #[serde(rename = "NotFoundError")]
    NotFound,
    /// The OS failed to start the worker process.
    #[serde(rename = "SpawnError")]
    Spawn,
    /// The worker wrote to its error stream.
    #[serde(rename = "RuntimeError")]
    Runtime,
    /// The worker exited with a non-zero code or was killed by a signal.
    #[serde(rename = "AbnormalExitError")]
    AbnormalExit,
    /// The command or its params could not be understood.
    #[serde(rename = "InvalidRequestError")]
    InvalidRequest,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::MaximumConcurrency => "MaximumConcurrencyError",
            ErrorKind::DuplicateId => "DuplicateIDError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Spawn => "SpawnError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::AbnormalExit => "AbnormalExitError",
            ErrorKind::InvalidRequest => "InvalidRequestError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export_to = "ipc.ts")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    /// Extra detail from the worker, e.g. a traceback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Payload of every outbound `error` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export_to = "ipc.ts")]
pub struct ErrorPayload {
    pub error: ClassifiedError,
    /// Present when the failure was raised while handling a UI command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originating_command: Option<InboundMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ts_rs::Config;

    #[test]
    fn test_inbound_message_wire_shape() {
        let raw = r#"{"id":"m1","command":"sendInput","params":[1438649711,835.9]}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.command, Command::SendInput);
        assert_eq!(msg.params, serde_json::json!([1438649711, 835.9]));
    }

    #[test]
    fn test_list_without_id_or_params() {
        let msg: InboundMessage = serde_json::from_str(r#"{"command":"list"}"#).unwrap();
        assert_eq!(msg.command, Command::List);
        assert!(msg.id.is_empty());
        assert!(msg.params.is_null());

        let json = serde_json::to_string(&InboundMessage::new("", Command::List)).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let parsed = serde_json::from_str::<InboundMessage>(r#"{"id":"x","command":"start"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_error_kind_names() {
        let json = serde_json::to_string(&ErrorKind::DuplicateId).unwrap();
        assert_eq!(json, "\"DuplicateIDError\"");
        assert_eq!(ErrorKind::AbnormalExit.to_string(), "AbnormalExitError");
    }

    #[test]
    fn test_error_payload_camel_case() {
        let payload = ErrorPayload {
            error: ClassifiedError {
                kind: ErrorKind::NotFound,
                message: "worker m1 not found".to_string(),
                diagnostic: None,
            },
            originating_command: Some(InboundMessage::new("m1", Command::Remove)),
        };
        let msg = OutboundMessage::error("m1", &payload);
        assert_eq!(msg.payload["originatingCommand"]["command"], "remove");
        assert_eq!(msg.payload["error"]["kind"], "NotFoundError");
        assert_eq!(msg.error_payload(), Some(payload));
    }

    #[test]
    fn test_close_payload_carries_code() {
        assert_eq!(OutboundMessage::close("a", Some(0)).payload, serde_json::json!(0));
        assert!(OutboundMessage::close("a", None).payload.is_null());
    }

    #[test]
    fn export_types() {
        // The export_to attribute in each type's #[ts] macro specifies the output file
        let config = Config::default();
        Command::export(&config).unwrap();
        InboundMessage::export(&config).unwrap();
        ListResponse::export(&config).unwrap();
        EventKind::export(&config).unwrap();
        OutboundMessage::export(&config).unwrap();
        ErrorKind::export(&config).unwrap();
        ClassifiedError::export(&config).unwrap();
        ErrorPayload::export(&config).unwrap();
    }
}
