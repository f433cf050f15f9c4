use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::handle::ConnectionHandle;

/// Maps a user id to at most one live connection.
///
/// Last registration wins. The registry never closes a displaced connection;
/// that connection simply stops receiving pushes. Lookups hand out a clone so
/// no caller holds the lock while writing to a socket.
#[derive(Clone, Default)]
pub struct Registry {
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `user_id` to `handle`, returning whatever handle it displaced.
    pub async fn register(&self, user_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections
            .write()
            .await
            .insert(user_id.to_string(), handle)
    }

    /// Remove the mapping, but only if it still points at `handle`.
    /// A newer connection for the same user is left untouched.
    pub async fn unregister(&self, user_id: &str, handle: &ConnectionHandle) -> bool {
        let mut connections = self.connections.write().await;
        let is_current = connections
            .get(user_id)
            .is_some_and(|stored| stored.same_connection(handle));

        if is_current {
            connections.remove(user_id);
        }
        is_current
    }

    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(user_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}
