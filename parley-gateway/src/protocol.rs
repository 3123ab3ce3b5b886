//! Wire protocol.
//!
//! Clients speak JSON text frames:
//! ```text
//! client → server   {"action":"send-message","ref":"7","chatId":"c1","content":"hi"}
//! server → client   {"type":"reply","ref":"7","ok":true,"data":{"messageId":"…","status":"SENT"}}
//!                   {"type":"event","event":"status-update","data":{"messageId":"…","status":"DELIVERED"}}
//!                   {"type":"ready","connectionId":"…","userId":"alice"}
//! ```
//!
//! Processes exchange [`BusEnvelope`]s over the fan-out bus, bincode-encoded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ChatError;
use crate::model::{ChatId, ConnectionId, DeliveryStatus, Message, MessageId, UserId};
use crate::presence::{PresenceRecord, PresenceStatus};

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

// ───────────────────────────────────────────────────────────────────
// Client → server
// ───────────────────────────────────────────────────────────────────

/// Inbound client actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ClientAction {
    SendMessage {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        content: String,
    },
    JoinRoom {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
    },
    LeaveRoom {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
    },
    ReadAck {
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },
    ListOnline,
    GetPresence {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    SetAway {
        away: bool,
    },
    FetchMessages {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl ClientAction {
    pub fn name(&self) -> &'static str {
        match self {
            ClientAction::SendMessage { .. } => "send-message",
            ClientAction::JoinRoom { .. } => "join-room",
            ClientAction::LeaveRoom { .. } => "leave-room",
            ClientAction::ReadAck { .. } => "read-ack",
            ClientAction::ListOnline => "list-online",
            ClientAction::GetPresence { .. } => "get-presence",
            ClientAction::SetAway { .. } => "set-away",
            ClientAction::FetchMessages { .. } => "fetch-messages",
        }
    }
}

/// A decoded inbound frame: the action plus its optional correlation ref.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub reference: Option<String>,
    pub action: ClientAction,
}

impl Inbound {
    pub fn new(reference: Option<String>, action: ClientAction) -> Self {
        Self { reference, action }
    }

    /// Decode a text frame. The `ref` field sits next to the action tag,
    /// so the frame is parsed once into a `Value` and read twice.
    ///
    /// When the action itself is malformed the error carries whatever
    /// `ref` could be recovered so the reply can still be correlated.
    pub fn decode(text: &str) -> Result<Self, (Option<String>, ProtocolError)> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| (None, ProtocolError::Deserialization(e.to_string())))?;
        let reference = value.get("ref").and_then(|r| match r {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        match serde_json::from_value::<ClientAction>(value) {
            Ok(action) => Ok(Self { reference, action }),
            Err(e) => Err((reference, ProtocolError::Deserialization(e.to_string()))),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut value = serde_json::to_value(&self.action)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if let (Some(reference), Value::Object(map)) = (&self.reference, &mut value) {
            map.insert("ref".to_string(), Value::String(reference.clone()));
        }
        Ok(value.to_string())
    }
}

// ───────────────────────────────────────────────────────────────────
// Server → client
// ───────────────────────────────────────────────────────────────────

/// Events pushed to connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// New message in a joined room.
    Message(Message),
    StatusUpdate {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        status: DeliveryStatus,
    },
    PresenceUpdate {
        #[serde(rename = "userId")]
        user_id: UserId,
        online: bool,
        status: PresenceStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&ChatError> for ErrorBody {
    fn from(err: &ChatError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Response to one inbound action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn success(reference: Option<String>, data: Value) -> Self {
        Self {
            reference,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(reference: Option<String>, err: &ChatError) -> Self {
        Self {
            reference,
            ok: false,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Every frame the server writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Ready {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    Reply(Reply),
    Event(ServerEvent),
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Successful action results, serialized into `Reply::data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActionReply {
    MessageAccepted {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        status: DeliveryStatus,
    },
    Ok {
        ok: bool,
    },
    OnlineUsers {
        #[serde(rename = "userIds")]
        user_ids: Vec<UserId>,
    },
    Presence {
        presence: Option<PresenceRecord>,
    },
    Messages {
        messages: Vec<Message>,
    },
}

impl ActionReply {
    pub fn ok() -> Self {
        ActionReply::Ok { ok: true }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Why a connection closed. The code lets clients tell a clean disconnect
/// from one that should trigger reconnect logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportError,
    AuthenticationFailed,
    IdleTimeout,
    ServerShutdown,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::ClientClosed | CloseReason::TransportError => 1000,
            CloseReason::ServerShutdown => 1001,
            CloseReason::AuthenticationFailed => 4001,
            CloseReason::IdleTimeout => 4008,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::TransportError => "transport error",
            CloseReason::AuthenticationFailed => "authentication failed",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::ServerShutdown => "server shutdown",
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Process ↔ process
// ───────────────────────────────────────────────────────────────────

/// Events carried by the fan-out bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusEvent {
    Message(Message),
    StatusUpdate {
        message_id: MessageId,
        chat_id: ChatId,
        status: DeliveryStatus,
    },
    Presence {
        user_id: UserId,
        status: PresenceStatus,
    },
}

impl BusEvent {
    pub fn into_server_event(self) -> ServerEvent {
        match self {
            BusEvent::Message(message) => ServerEvent::Message(message),
            BusEvent::StatusUpdate {
                message_id,
                chat_id,
                status,
            } => ServerEvent::StatusUpdate {
                message_id,
                chat_id,
                status,
            },
            BusEvent::Presence { user_id, status } => ServerEvent::PresenceUpdate {
                user_id,
                online: status.is_online(),
                status,
            },
        }
    }
}

/// Bus message with routing metadata.
///
/// `origin_connection` is set for room messages so the sending socket is
/// not echoed its own message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub origin_process: Uuid,
    pub origin_connection: Option<ConnectionId>,
    pub event: BusEvent,
}

impl BusEnvelope {
    pub fn new(origin_process: Uuid, origin_connection: Option<ConnectionId>, event: BusEvent) -> Self {
        Self {
            origin_process,
            origin_connection,
            event,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }
}
