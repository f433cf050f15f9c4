pub mod connection;
pub mod error;
pub mod handle;
pub mod registry;
pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use parley_db::{Accounts, MessageStore};

use crate::relay::Relay;

/// Per-connection tunables for the WebSocket gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long a new connection may stay unauthenticated before it is closed.
    pub auth_timeout: Duration,
    /// Ping interval. Two consecutive missed Pongs drop the connection.
    pub heartbeat_interval: Duration,
    /// Outbound frames queued per connection before pushes start dropping.
    pub outbound_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            outbound_capacity: 256,
        }
    }
}

/// Shared state handed to every WebSocket connection.
#[derive(Clone)]
pub struct Gateway {
    pub relay: Relay,
    accounts: Arc<dyn Accounts>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn MessageStore>,
        accounts: Arc<dyn Accounts>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            relay: Relay::new(store),
            accounts,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}
