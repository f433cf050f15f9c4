use anyhow::Result;
use parley_types::models::Message;

use crate::Database;

/// Result of appending a message whose id may already be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Durable, append-only message log used by the relay.
///
/// Implementations must make the duplicate-id check and the insert a single
/// atomic step. History is ordered by timestamp with insertion order as the
/// tie-breaker; export is plain insertion order.
pub trait MessageStore: Send + Sync {
    fn append(&self, msg: &Message) -> Result<InsertOutcome>;

    fn history(&self, user_id: &str, other_user_id: &str) -> Result<Vec<Message>>;

    fn export(&self, user_id: &str) -> Result<Vec<Message>>;
}

/// Account lookups the gateway needs to validate an auth handshake.
pub trait Accounts: Send + Sync {
    fn user_exists(&self, user_id: &str) -> Result<bool>;
}

impl MessageStore for Database {
    fn append(&self, msg: &Message) -> Result<InsertOutcome> {
        self.insert_message(msg)
    }

    fn history(&self, user_id: &str, other_user_id: &str) -> Result<Vec<Message>> {
        self.get_conversation(user_id, other_user_id)
    }

    fn export(&self, user_id: &str) -> Result<Vec<Message>> {
        self.get_messages_for_user(user_id)
    }
}

impl Accounts for Database {
    fn user_exists(&self, user_id: &str) -> Result<bool> {
        Database::user_exists(self, user_id)
    }
}
