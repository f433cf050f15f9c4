use std::sync::{Arc, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

use crate::error::DeliveryError;

/// Reference to one live WebSocket connection.
///
/// Clones share the same connection: identity is the connection id, not the
/// bound user. The handle stays live while the connection's writer task holds
/// the receiving end of the outbound queue.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    conn_id: Uuid,
    user_id: RwLock<Option<String>>,
    tx: mpsc::Sender<GatewayEvent>,
}

impl ConnectionHandle {
    /// Create a handle with a bounded outbound queue. The receiver belongs to
    /// the connection's writer task.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<GatewayEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            inner: Arc::new(HandleInner {
                conn_id: Uuid::new_v4(),
                user_id: RwLock::new(None),
                tx,
            }),
        };
        (handle, rx)
    }

    pub fn conn_id(&self) -> Uuid {
        self.inner.conn_id
    }

    /// User bound by the auth handshake, if any.
    pub fn user_id(&self) -> Option<String> {
        self.inner
            .user_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Bind (or rebind) the user id. Returns the previous binding.
    pub(crate) fn bind(&self, user_id: &str) -> Option<String> {
        let mut slot = self.inner.user_id.write().unwrap_or_else(|e| e.into_inner());
        slot.replace(user_id.to_string())
    }

    pub fn is_live(&self) -> bool {
        !self.inner.tx.is_closed()
    }

    /// Queue a frame for the remote peer without waiting. A full queue or a
    /// gone writer drops the frame.
    pub fn push(&self, event: GatewayEvent) -> Result<(), DeliveryError> {
        self.inner.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) | TrySendError::Closed(_) => DeliveryError::Transport,
        })
    }

    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.inner.conn_id == other.inner.conn_id
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("conn_id", &self.inner.conn_id)
            .field("user_id", &self.user_id())
            .field("live", &self.is_live())
            .finish()
    }
}
