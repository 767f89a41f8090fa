//! JSON wire protocol between clients and the relay.
//!
//! Every frame is a JSON text message tagged by `type`:
//! ```text
//! client → relay   register | unregister | join_groups | send_logs
//! relay  → client  registered | error | receive_logs | user_online | user_offline
//! ```
//! Log batches carry [`LogEventWire`] only. Large batches swap the `logs`
//! array for a `compressedData` string (see [`crate::transmission`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{LogEvent, LogEventWire};
use crate::transmission::{self, TransmissionError};

/// Where a `send_logs` batch should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    Friends,
    Group {
        #[serde(rename = "groupId")]
        group_id: String,
    },
    Public,
}

/// Log batch body, shared by outbound and inbound frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPayload {
    #[serde(default)]
    pub logs: Vec<LogEventWire>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_data: Option<String>,
}

impl LogPayload {
    /// Strip UI-only fields and compress if the batch warrants it.
    pub fn from_events(events: &[LogEvent]) -> Result<Self, TransmissionError> {
        let wire: Vec<LogEventWire> = events.iter().map(LogEventWire::from).collect();
        if transmission::should_compress(&wire) {
            Ok(Self {
                logs: Vec::new(),
                compressed: true,
                compressed_data: Some(transmission::compress(&wire)?),
            })
        } else {
            Ok(Self {
                logs: wire,
                compressed: false,
                compressed_data: None,
            })
        }
    }

    pub fn into_events(self) -> Result<Vec<LogEvent>, TransmissionError> {
        let wire = match (self.compressed, self.compressed_data) {
            (true, Some(data)) => transmission::decompress::<Vec<LogEventWire>>(&data)?,
            _ => self.logs,
        };
        Ok(wire.into_iter().map(LogEvent::from).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendLogsData {
    #[serde(flatten)]
    pub payload: LogPayload,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveLogsData {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(flatten)]
    pub payload: LogPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGroupsData {
    pub group_ids: Vec<String>,
}

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Register {
        user_id: String,
        token: String,
        #[serde(default)]
        metadata: serde_json::Map<String, Value>,
    },
    Unregister {
        user_id: String,
    },
    JoinGroups {
        data: JoinGroupsData,
    },
    SendLogs {
        data: SendLogsData,
    },
}

impl ClientFrame {
    pub fn register(
        user_id: impl Into<String>,
        token: impl Into<String>,
        metadata: serde_json::Map<String, Value>,
    ) -> Self {
        Self::Register {
            user_id: user_id.into(),
            token: token.into(),
            metadata,
        }
    }

    pub fn unregister(user_id: impl Into<String>) -> Self {
        Self::Unregister {
            user_id: user_id.into(),
        }
    }

    pub fn join_groups(group_ids: Vec<String>) -> Self {
        Self::JoinGroups {
            data: JoinGroupsData { group_ids },
        }
    }

    pub fn send_logs(events: &[LogEvent], target: Target) -> Result<Self, ProtocolError> {
        let payload = LogPayload::from_events(events)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        Ok(Self::SendLogs {
            data: SendLogsData { payload, target },
        })
    }

    /// Wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::JoinGroups { .. } => "join_groups",
            Self::SendLogs { .. } => "send_logs",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Frames sent by the relay. Unrecognized `type` tags decode to `Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Registered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    ReceiveLogs {
        data: ReceiveLogsData,
    },
    UserOnline {
        user_id: String,
    },
    UserOffline {
        user_id: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: Some(message.into()),
            data: None,
        }
    }

    /// Human-readable text of an `error` frame.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Error { error: Some(e), .. } => Some(e.clone()),
            Self::Error { data: Some(Value::String(s)), .. } => Some(s.clone()),
            Self::Error { data: Some(other), .. } => Some(other.to_string()),
            Self::Error { .. } => Some("unknown server error".to_string()),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidPayload(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
