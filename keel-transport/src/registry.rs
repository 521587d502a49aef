//! Connection pooling keyed by account identity.

use std::collections::HashMap;
use std::sync::Arc;

use keel_config::TransportConfig;
use keel_core::Environment;
use tokio::sync::Mutex;
use tracing::info;

use crate::client::{ConnectionState, Credentials, RpcClient};
use crate::error::TransportResult;

/// Identity of one venue connection. Production and testnet sessions for the
/// same account are distinct connections.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConnectionKey {
    pub user: String,
    pub account: String,
    pub environment: Environment,
}

/// Shares one [`RpcClient`] per [`ConnectionKey`].
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: Mutex<HashMap<ConnectionKey, Arc<RpcClient>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live client for `key`, dialing a new one if none exists or
    /// the previous one has permanently disconnected.
    pub async fn get_or_connect(
        &self,
        key: ConnectionKey,
        endpoint: &str,
        credentials: Credentials,
        config: TransportConfig,
    ) -> TransportResult<Arc<RpcClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(&key) {
            if existing.state() != ConnectionState::Disconnected {
                return Ok(Arc::clone(existing));
            }
            // A latched or exhausted client never revives itself.
            clients.remove(&key);
        }

        info!(user = %key.user, account = %key.account, environment = %key.environment, "opening connection");
        let client = Arc::new(RpcClient::connect(endpoint, credentials, config).await?);
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    /// Disconnect and drop the client for `key`, if present. The registry
    /// never reconnects on its own; the next `get_or_connect` dials fresh.
    pub async fn disconnect(&self, key: &ConnectionKey) {
        let removed = self.clients.lock().await.remove(key);
        if let Some(client) = removed {
            client.disconnect().await;
            info!(user = %key.user, account = %key.account, "connection closed");
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}
