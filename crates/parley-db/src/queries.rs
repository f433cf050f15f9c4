use crate::models::{MessageRow, UserRow};
use crate::store::InsertOutcome;
use crate::Database;
use anyhow::Result;
use parley_types::models::Message;
use rusqlite::{Connection, Row};

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, timestamp, status";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, username, password FROM users WHERE username = ?1")?;

            let row = stmt
                .query_row([username], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password: row.get(2)?,
                    })
                })
                .optional()?;

            Ok(row)
        })
    }

    pub fn user_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Messages --

    /// Insert a message unless its id is already stored. The uniqueness check
    /// and the write are one statement, so concurrent retries of the same id
    /// cannot both insert.
    pub fn insert_message(&self, msg: &Message) -> Result<InsertOutcome> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, content, timestamp, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO NOTHING",
                rusqlite::params![
                    msg.id,
                    msg.sender_id,
                    msg.receiver_id,
                    msg.content,
                    msg.timestamp,
                    msg.status.as_str(),
                ],
            )?;

            Ok(if changed == 0 {
                InsertOutcome::Duplicate
            } else {
                InsertOutcome::Inserted
            })
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
            let row = conn.query_row(&sql, [id], map_message_row).optional()?;
            Ok(row.map(Message::from))
        })
    }

    /// All messages exchanged between two users, oldest timestamp first.
    /// Equal timestamps keep insertion order.
    pub fn get_conversation(&self, user_id: &str, other_user_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY timestamp ASC, seq ASC",
                MESSAGE_COLUMNS
            );
            query_messages(conn, &sql, rusqlite::params![user_id, other_user_id])
        })
    }

    /// Every message the user sent or received, in insertion order.
    pub fn get_messages_for_user(&self, user_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM messages
                 WHERE sender_id = ?1 OR receiver_id = ?1
                 ORDER BY seq ASC",
                MESSAGE_COLUMNS
            );
            query_messages(conn, &sql, rusqlite::params![user_id])
        })
    }

    /// Receipt from the recipient: `sent -> delivered`. Returns false when no
    /// message with this id is addressed to `receiver_id`.
    pub fn mark_delivered(&self, id: &str, receiver_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'delivered' WHERE id = ?1 AND receiver_id = ?2",
                [id, receiver_id],
            )?;
            Ok(changed > 0)
        })
    }
}

fn query_messages(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, map_message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().map(Message::from).collect())
}

fn map_message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        status: row.get(5)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::models::MessageStatus;

    fn msg(id: &str, from: &str, to: &str, timestamp: i64) -> Message {
        Message {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            content: format!("body of {}", id),
            timestamp,
            status: MessageStatus::Sent,
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_user_crud() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "alice", "hash").unwrap();

        assert!(db.user_exists("u1").unwrap());
        assert!(!db.user_exists("u2").unwrap());

        let by_name = db.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(by_name.id, "u1");
        assert_eq!(by_name.username, "alice");
        assert!(db.get_user_by_username("bob").unwrap().is_none());

        // usernames are unique
        assert!(db.create_user("u2", "alice", "hash").is_err());
    }

    #[test]
    fn test_duplicate_id_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(
            db.insert_message(&msg("m1", "a1", "b1", 1000)).unwrap(),
            InsertOutcome::Inserted
        );

        let mut retry = msg("m1", "a1", "b1", 5000);
        retry.content = "changed".into();
        assert_eq!(db.insert_message(&retry).unwrap(), InsertOutcome::Duplicate);

        let history = db.get_conversation("a1", "b1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "body of m1");
        assert_eq!(history[0].timestamp, 1000);
    }

    #[test]
    fn test_conversation_sorted_by_timestamp() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&msg("late", "a1", "b1", 2000)).unwrap();
        db.insert_message(&msg("early", "b1", "a1", 1000)).unwrap();
        db.insert_message(&msg("other", "a1", "c1", 1500)).unwrap();

        let history = db.get_conversation("a1", "b1").unwrap();
        assert_eq!(ids(&history), vec!["early", "late"]);

        // symmetric in its arguments
        let reversed = db.get_conversation("b1", "a1").unwrap();
        assert_eq!(ids(&reversed), vec!["early", "late"]);
    }

    #[test]
    fn test_timestamp_ties_keep_insertion_order() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&msg("first", "a1", "b1", 1000)).unwrap();
        db.insert_message(&msg("second", "b1", "a1", 1000)).unwrap();
        db.insert_message(&msg("third", "a1", "b1", 1000)).unwrap();

        let history = db.get_conversation("a1", "b1").unwrap();
        assert_eq!(ids(&history), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_export_uses_insertion_order() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&msg("m1", "a1", "b1", 3000)).unwrap();
        db.insert_message(&msg("m2", "c1", "a1", 1000)).unwrap();
        db.insert_message(&msg("m3", "b1", "c1", 2000)).unwrap();
        db.insert_message(&msg("m4", "a1", "a1", 500)).unwrap();

        let exported = db.get_messages_for_user("a1").unwrap();
        assert_eq!(ids(&exported), vec!["m1", "m2", "m4"]);
    }

    #[test]
    fn test_mark_delivered_only_by_receiver() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&msg("m1", "a1", "b1", 1000)).unwrap();

        assert!(!db.mark_delivered("m1", "a1").unwrap());
        assert!(!db.mark_delivered("missing", "b1").unwrap());
        assert_eq!(
            db.get_message("m1").unwrap().unwrap().status,
            MessageStatus::Sent
        );

        assert!(db.mark_delivered("m1", "b1").unwrap());
        // idempotent
        assert!(db.mark_delivered("m1", "b1").unwrap());
        assert_eq!(
            db.get_message("m1").unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }
}
