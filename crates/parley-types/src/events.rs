use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageStatus};

/// Commands sent FROM client TO server over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayCommand {
    /// Bind this connection to a user id. Expected as the first frame.
    Auth(AuthFrame),

    /// Send a message to another user.
    Message(SendMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame {
    pub user_id: String,
}

/// Inbound send request. Every field is optional on the wire so that a
/// missing field surfaces as a validation error to the sender instead of
/// an undecodable frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub id: Option<String>,
    pub sender_id: Option<String>,
    pub receiver_id: Option<String>,
    pub content: Option<String>,
    pub timestamp: Option<i64>,
}

/// Events sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayEvent {
    /// Auth handshake completed
    Ready(ReadyFrame),

    /// A message relayed live to its recipient
    Message(MessagePayload),

    /// The sender's message has been stored
    Ack(AckFrame),

    /// A frame from this connection was rejected
    Error(ErrorFrame),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyFrame {
    pub user_id: String,
}

/// Outbound copy of a stored message, same shape as the inbound send frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub id: String,
    pub timestamp: i64,
}

impl From<&Message> for MessagePayload {
    fn from(msg: &Message) -> Self {
        Self {
            sender_id: msg.sender_id.clone(),
            receiver_id: msg.receiver_id.clone(),
            content: msg.content.clone(),
            id: msg.id.clone(),
            timestamp: msg.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    pub id: String,
    pub status: MessageStatus,
    /// True when the id was already stored and this send was a no-op.
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Store,
    UnknownUser,
}
