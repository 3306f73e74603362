//! Registry of live server-side connections

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Connection;

/// Connections that completed their handshake and have not closed yet
#[derive(Debug, Default)]
pub struct Registry {
    clients: RwLock<HashMap<Uuid, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; returns false if it was already present
    pub async fn insert(&self, connection: Arc<Connection>) -> bool {
        let mut clients = self.clients.write().await;
        if clients.contains_key(&connection.id()) {
            return false;
        }
        clients.insert(connection.id(), connection);
        true
    }

    /// Remove a connection; idempotent
    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.clients.write().await.remove(id)
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Remove and return every connection
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        self.clients
            .write()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect()
    }
}
