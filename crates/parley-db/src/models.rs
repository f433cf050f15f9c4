//! Database row types: these map directly to SQLite rows.
//! Distinct from parley-types API models to keep the DB layer independent.

use parley_types::models::{Message, MessageStatus};
use tracing::warn;

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub timestamp: i64,
    pub status: String,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        let status = MessageStatus::parse(&row.status).unwrap_or_else(|| {
            warn!("Corrupt status '{}' on message '{}'", row.status, row.id);
            MessageStatus::Sent
        });

        Message {
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
            timestamp: row.timestamp,
            status,
        }
    }
}
