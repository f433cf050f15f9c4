use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, info};

use parley_db::{InsertOutcome, MessageStore};
use parley_types::events::{GatewayEvent, SendMessage};
use parley_types::models::{Message, MessageStatus};

use crate::error::{DeliveryError, RelayError};
use crate::handle::ConnectionHandle;
use crate::registry::Registry;

/// What happened to an accepted send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// The id was already stored; nothing was written or pushed.
    pub duplicate: bool,
    /// A live push to the recipient was queued.
    pub pushed: bool,
}

/// Turns send requests into stored messages plus a best-effort live push.
#[derive(Clone)]
pub struct Relay {
    registry: Registry,
    store: Arc<dyn MessageStore>,
}

impl Relay {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            registry: Registry::new(),
            store,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Bind `user_id` to the connection and make it reachable. Rebinding an
    /// already bound connection leaves the old registry entry in place.
    pub async fn handle_auth(&self, handle: &ConnectionHandle, user_id: &str) {
        if let Some(previous) = handle.bind(user_id) {
            if previous != user_id {
                debug!(
                    "connection {} rebinding from {} to {}; registry entry for {} left in place",
                    handle.conn_id(),
                    previous,
                    user_id,
                    previous
                );
            }
        }

        if let Some(displaced) = self.registry.register(user_id, handle.clone()).await {
            if !displaced.same_connection(handle) {
                info!(
                    "{} reconnected; connection {} replaces {}",
                    user_id,
                    handle.conn_id(),
                    displaced.conn_id()
                );
            }
        }
    }

    /// Persist a message and push it to the recipient if they are online.
    ///
    /// Re-sending a stored id succeeds without a second record or push. Only
    /// validation and store failures are errors; an offline or unwritable
    /// recipient is not.
    pub async fn handle_send(&self, req: SendMessage) -> Result<SendOutcome, RelayError> {
        let message = validate(req)?;

        let store = self.store.clone();
        let to_store = message.clone();
        let outcome = tokio::task::spawn_blocking(move || store.append(&to_store))
            .await
            .map_err(|e| RelayError::Store(anyhow!("store task failed: {}", e)))?
            .map_err(RelayError::Store)?;

        if outcome == InsertOutcome::Duplicate {
            debug!("message {} already stored, ignoring resend", message.id);
            return Ok(SendOutcome {
                message,
                duplicate: true,
                pushed: false,
            });
        }

        let pushed = match self.deliver(&message).await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "message {} to {} stored only: {}",
                    message.id, message.receiver_id, e
                );
                false
            }
        };

        Ok(SendOutcome {
            message,
            duplicate: false,
            pushed,
        })
    }

    /// Drop the connection's registry entry if it still owns it.
    pub async fn handle_disconnect(&self, handle: &ConnectionHandle) -> bool {
        match handle.user_id() {
            Some(user_id) => self.registry.unregister(&user_id, handle).await,
            None => false,
        }
    }

    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        // Registry lock is released before the push.
        let handle = self
            .registry
            .lookup(&message.receiver_id)
            .await
            .ok_or(DeliveryError::Offline)?;

        if !handle.is_live() {
            return Err(DeliveryError::Transport);
        }
        handle.push(GatewayEvent::Message(message.into()))
    }
}

fn validate(req: SendMessage) -> Result<Message, RelayError> {
    fn required(value: Option<String>, field: &str) -> Result<String, RelayError> {
        match value {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(RelayError::Validation(format!("missing {}", field))),
        }
    }

    Ok(Message {
        id: required(req.id, "id")?,
        sender_id: required(req.sender_id, "senderId")?,
        receiver_id: required(req.receiver_id, "receiverId")?,
        content: req
            .content
            .ok_or_else(|| RelayError::Validation("missing content".into()))?,
        timestamp: req
            .timestamp
            .ok_or_else(|| RelayError::Validation("missing timestamp".into()))?,
        status: MessageStatus::Sent,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parley_db::Database;
    use parley_types::events::MessagePayload;
    use tokio::sync::mpsc::error::TryRecvError;

    fn relay() -> Relay {
        Relay::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn send(id: &str, from: &str, to: &str, content: &str, timestamp: i64) -> SendMessage {
        SendMessage {
            id: Some(id.into()),
            sender_id: Some(from.into()),
            receiver_id: Some(to.into()),
            content: Some(content.into()),
            timestamp: Some(timestamp),
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    pub(crate) struct FailingStore;

    impl MessageStore for FailingStore {
        fn append(&self, _msg: &Message) -> anyhow::Result<InsertOutcome> {
            Err(anyhow!("disk full"))
        }

        fn history(&self, _user_id: &str, _other_user_id: &str) -> anyhow::Result<Vec<Message>> {
            Ok(vec![])
        }

        fn export(&self, _user_id: &str) -> anyhow::Result<Vec<Message>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn offline_recipient_then_live_push() {
        let relay = relay();

        let outcome = relay.handle_send(send("m1", "a1", "b1", "hi", 1000)).await.unwrap();
        assert!(!outcome.duplicate);
        assert!(!outcome.pushed);

        let history = relay.store().history("a1", "b1").unwrap();
        assert_eq!(ids(&history), vec!["m1"]);
        assert_eq!(history[0].status, MessageStatus::Sent);
        assert_eq!(history[0].content, "hi");

        let (hb, mut rx_b) = ConnectionHandle::new(8);
        relay.handle_auth(&hb, "b1").await;

        let outcome = relay.handle_send(send("m2", "a1", "b1", "again", 2000)).await.unwrap();
        assert!(outcome.pushed);

        let pushed = rx_b.try_recv().unwrap();
        assert_eq!(
            pushed,
            GatewayEvent::Message(MessagePayload {
                sender_id: "a1".into(),
                receiver_id: "b1".into(),
                content: "again".into(),
                id: "m2".into(),
                timestamp: 2000,
            })
        );
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));

        let history = relay.store().history("a1", "b1").unwrap();
        assert_eq!(ids(&history), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn resend_of_same_id_is_idempotent() {
        let relay = relay();
        let (hb, mut rx_b) = ConnectionHandle::new(8);
        relay.handle_auth(&hb, "b1").await;

        let first = relay.handle_send(send("m1", "a1", "b1", "hi", 1000)).await.unwrap();
        assert!(!first.duplicate);
        let second = relay.handle_send(send("m1", "a1", "b1", "hi", 1000)).await.unwrap();
        assert!(second.duplicate);
        assert!(!second.pushed);

        assert_eq!(ids(&relay.store().history("a1", "b1").unwrap()), vec!["m1"]);

        // exactly one push for the two sends
        assert!(rx_b.try_recv().is_ok());
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn history_orders_by_timestamp_not_arrival() {
        let relay = relay();
        relay.handle_send(send("late", "a1", "b1", "2", 2000)).await.unwrap();
        relay.handle_send(send("early", "b1", "a1", "1", 1000)).await.unwrap();

        let history = relay.store().history("a1", "b1").unwrap();
        assert_eq!(ids(&history), vec!["early", "late"]);

        let exported = relay.store().export("a1").unwrap();
        assert_eq!(ids(&exported), vec!["late", "early"]);
    }

    #[tokio::test]
    async fn missing_field_is_rejected_before_persisting() {
        let relay = relay();

        let mut req = send("m1", "a1", "b1", "hi", 1000);
        req.timestamp = None;
        let err = relay.handle_send(req).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        let req = send("", "a1", "b1", "hi", 1000);
        assert!(matches!(
            relay.handle_send(req).await,
            Err(RelayError::Validation(_))
        ));

        let mut req = send("m2", "a1", "b1", "hi", 1000);
        req.receiver_id = None;
        assert!(matches!(
            relay.handle_send(req).await,
            Err(RelayError::Validation(_))
        ));

        assert!(relay.store().export("a1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_recipient_connection_keeps_message_stored() {
        let relay = relay();
        let (hb, rx_b) = ConnectionHandle::new(8);
        relay.handle_auth(&hb, "b1").await;
        drop(rx_b);

        let outcome = relay.handle_send(send("m1", "a1", "b1", "hi", 1000)).await.unwrap();
        assert!(!outcome.pushed);

        let history = relay.store().history("a1", "b1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let relay = Relay::new(Arc::new(FailingStore));
        let (hb, mut rx_b) = ConnectionHandle::new(8);
        relay.handle_auth(&hb, "b1").await;

        let err = relay.handle_send(send("m1", "a1", "b1", "hi", 1000)).await.unwrap_err();
        assert!(matches!(err, RelayError::Store(_)));
        assert!(err.to_string().contains("disk full"));

        // nothing is relayed for a message that was never stored
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnect_survives_stale_disconnect() {
        let relay = relay();
        let (old, _rx_old) = ConnectionHandle::new(8);
        let (new, mut rx_new) = ConnectionHandle::new(8);

        relay.handle_auth(&old, "b1").await;
        relay.handle_auth(&new, "b1").await;

        // the old connection's late disconnect must not evict the new one
        assert!(!relay.handle_disconnect(&old).await);

        let outcome = relay.handle_send(send("m1", "a1", "b1", "hi", 1000)).await.unwrap();
        assert!(outcome.pushed);
        assert!(rx_new.try_recv().is_ok());

        assert!(relay.handle_disconnect(&new).await);
        assert!(!relay.handle_disconnect(&new).await);
        assert!(relay.registry().lookup("b1").await.is_none());
    }

    #[tokio::test]
    async fn unauthenticated_disconnect_is_a_noop() {
        let relay = relay();
        let (h, _rx) = ConnectionHandle::new(8);
        assert!(!relay.handle_disconnect(&h).await);
    }

    #[tokio::test]
    async fn rebind_leaves_previous_entry() {
        let relay = relay();
        let (h, mut rx) = ConnectionHandle::new(8);

        relay.handle_auth(&h, "a1").await;
        relay.handle_auth(&h, "b1").await;
        assert_eq!(h.user_id().as_deref(), Some("b1"));

        // a1 still routes to this connection until it closes
        let stale = relay.registry().lookup("a1").await.unwrap();
        assert!(stale.same_connection(&h));
        let outcome = relay.handle_send(send("m1", "c1", "a1", "hi", 1000)).await.unwrap();
        assert!(outcome.pushed);
        assert!(rx.try_recv().is_ok());

        // disconnect only clears the currently bound user
        assert!(relay.handle_disconnect(&h).await);
        assert!(relay.registry().lookup("b1").await.is_none());
    }
}
