use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Closed set of wire message types. Anything else is rejected at the codec
/// boundary before routing.
pub const MESSAGE_TYPES: &[&str] = &[
    "ping",
    "pong",
    "devices_list",
    "connect_device",
    "get_telemetry",
    "device_connected",
    "connection_status",
    "telemetry",
    "command",
    "command_status",
    "webrtc",
    "error",
];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("frame has no type field")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed {kind} frame: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Error kind reported back to the peer that sent the offending frame.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            DecodeError::UnknownType(_) => ErrorKind::UnsupportedMessage,
            _ => ErrorKind::Malformed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Malformed,
    UnsupportedMessage,
    PeerUnavailable,
    DeviceUnavailable,
    QueueOverflow,
    HeartbeatTimeout,
    TransportError,
    Superseded,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Close,
    Error,
}

/// One entry in the device directory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub connected: bool,
}

/// Decoded wire envelope, tagged by the `type` field.
///
/// Payload-carrying variants keep their category-specific bodies as an opaque
/// flattened map; the router only ever reads addressing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Ping,
    Pong,
    DevicesList {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        devices: Option<Vec<DeviceEntry>>,
    },
    ConnectDevice {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    GetTelemetry {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    DeviceConnected {
        #[serde(rename = "deviceId")]
        device_id: String,
        status: LinkStatus,
    },
    ConnectionStatus {
        #[serde(rename = "deviceId")]
        device_id: String,
        status: LinkStatus,
    },
    Telemetry {
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    Command {
        #[serde(rename = "deviceId")]
        device_id: String,
        command: String,
        command_id: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    CommandStatus {
        command_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    Webrtc {
        subtype: SignalKind,
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    Error {
        #[serde(alias = "error")]
        kind: ErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Envelope {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Envelope::Error {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn connection_status(device_id: impl Into<String>, status: LinkStatus) -> Self {
        Envelope::ConnectionStatus {
            device_id: device_id.into(),
            status,
        }
    }

    pub fn device_connected(device_id: impl Into<String>, status: LinkStatus) -> Self {
        Envelope::DeviceConnected {
            device_id: device_id.into(),
            status,
        }
    }
}

/// Decode a textual frame into an envelope.
///
/// Unknown `type` values are rejected here, not deep in the router; every
/// other failure is reported as malformed.
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Parse)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;
    if !MESSAGE_TYPES.contains(&kind) {
        return Err(DecodeError::UnknownType(kind.to_string()));
    }
    let kind = kind.to_string();
    serde_json::from_value(value).map_err(|source| DecodeError::Invalid { kind, source })
}

/// Encode an envelope as a textual frame. Server-built envelopes always
/// serialize; the fallback exists only to keep the write path total.
pub fn encode(envelope: &Envelope) -> String {
    serde_json::to_string(envelope)
        .unwrap_or_else(|_| r#"{"type":"error","kind":"malformed"}"#.to_string())
}
