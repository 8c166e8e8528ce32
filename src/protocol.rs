use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Flag bits carried in [`ProtocolMessage::flags`]. The low bits describe
/// connection/attach state, the high bits are channel modes.
pub mod flags {
    pub const HAS_PRESENCE: u32 = 1 << 0;
    pub const HAS_BACKLOG: u32 = 1 << 1;
    pub const RESUMED: u32 = 1 << 2;
    pub const HAS_LOCAL_PRESENCE: u32 = 1 << 3;
    pub const TRANSIENT: u32 = 1 << 4;
    pub const ATTACH_RESUME: u32 = 1 << 5;

    pub const PRESENCE: u32 = 1 << 16;
    pub const PUBLISH: u32 = 1 << 17;
    pub const SUBSCRIBE: u32 = 1 << 18;
    pub const PRESENCE_SUBSCRIBE: u32 = 1 << 19;

    /// Channel modes granted in an `Attached` response.
    pub const CHANNEL_MODES: u32 = PRESENCE | PUBLISH | SUBSCRIBE | PRESENCE_SUBSCRIBE;
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Decode(serde_json::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(serde_json::Error),

    #[error("unknown action code: {0}")]
    UnknownAction(u8),
}

/// Protocol actions, encoded as integers on the wire.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(into = "u8", try_from = "u8")]
pub enum Action {
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
    Auth = 17,
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, ProtocolError> {
        let action = match code {
            0 => Action::Heartbeat,
            1 => Action::Ack,
            2 => Action::Nack,
            3 => Action::Connect,
            4 => Action::Connected,
            5 => Action::Disconnect,
            6 => Action::Disconnected,
            7 => Action::Close,
            8 => Action::Closed,
            9 => Action::Error,
            10 => Action::Attach,
            11 => Action::Attached,
            12 => Action::Detach,
            13 => Action::Detached,
            14 => Action::Presence,
            15 => Action::Message,
            16 => Action::Sync,
            17 => Action::Auth,
            other => return Err(ProtocolError::UnknownAction(other)),
        };

        Ok(action)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status_code: None,
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frame_size: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// One protocol-level message unit. An envelope always travels as a single
/// text frame; absent optional fields are omitted from the wire form.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    pub msg_serial: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<HashMap<String, String>>,
}

impl Default for ProtocolMessage {
    fn default() -> Self {
        Self {
            action: Action::Heartbeat,
            channel: None,
            channel_serial: None,
            flags: None,
            count: None,
            error: None,
            id: None,
            connection_id: None,
            connection_serial: None,
            msg_serial: 0,
            timestamp: None,
            messages: None,
            auth: None,
            connection_details: None,
            params: None,
        }
    }
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(Action::Heartbeat)
    }

    pub fn close() -> Self {
        Self::new(Action::Close)
    }

    pub fn attach(channel: &str) -> Self {
        Self {
            channel: Some(channel.to_owned()),
            ..Self::new(Action::Attach)
        }
    }

    pub fn attached(channel: &str, channel_serial: &str) -> Self {
        Self {
            channel: Some(channel.to_owned()),
            channel_serial: Some(channel_serial.to_owned()),
            flags: Some(flags::CHANNEL_MODES),
            ..Self::new(Action::Attached)
        }
    }

    /// Watermark acknowledgment for all messages up to and including `serial`.
    pub fn ack(serial: i64) -> Self {
        Self {
            count: Some(1),
            msg_serial: serial,
            ..Self::new(Action::Ack)
        }
    }

    pub fn message(channel: &str, serial: i64, body: Value) -> Self {
        Self {
            channel: Some(channel.to_owned()),
            msg_serial: serial,
            messages: Some(vec![body]),
            ..Self::new(Action::Message)
        }
    }

    pub fn error_from(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::new(Action::Error)
        }
    }

    /// Whether the peer expects this message to be acknowledged.
    pub fn requires_ack(&self) -> bool {
        matches!(self.action, Action::Message | Action::Presence)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}
