use crate::data::types::BufferCounts;
use crate::monitor::ClientId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Public view of one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ClientId,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    /// Totals last reported to the client by a header read, data read or wait.
    pub seen: BufferCounts,
}

struct Entry {
    info: ConnectionInfo,
    disconnect: watch::Sender<bool>,
}

/// Live connections keyed by client id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ClientId, Entry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a connection and returns the receiver its handler watches for
    /// a forced disconnect.
    pub async fn register(&self, id: ClientId, addr: SocketAddr) -> watch::Receiver<bool> {
        let (disconnect, rx) = watch::channel(false);
        let info = ConnectionInfo {
            id,
            addr,
            connected_at: Utc::now(),
            seen: BufferCounts::default(),
        };
        self.connections
            .write()
            .await
            .insert(id, Entry { info, disconnect });
        rx
    }

    /// Removes a connection. Returns false if it was already gone.
    pub async fn remove(&self, id: ClientId) -> bool {
        self.connections.write().await.remove(&id).is_some()
    }

    /// Records the totals a client was last told about.
    pub async fn record_seen(&self, id: ClientId, seen: BufferCounts) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.info.seen = seen;
        }
    }

    /// Asks one handler to close its connection.
    pub async fn disconnect(&self, id: ClientId) -> bool {
        match self.connections.read().await.get(&id) {
            Some(entry) => {
                entry.disconnect.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Asks every handler to close. Entries are removed by the handlers themselves.
    pub async fn disconnect_all(&self) -> usize {
        let connections = self.connections.read().await;
        for entry in connections.values() {
            entry.disconnect.send_replace(true);
        }
        connections.len()
    }

    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self
            .connections
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }
}
