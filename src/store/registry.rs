//! Replica Registry
//!
//! Tracks the replicas streaming from this primary and the positions they
//! have acknowledged, so retention never deletes a record a known replica
//! still needs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::stream::StreamPosition;
use crate::txlog::Position;

/// State of a single replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaState {
    /// Replica node id
    pub node_id: String,
    /// Peer address of its latest connection
    pub address: String,
    /// Open stream sessions
    pub sessions: u32,
    pub connected: bool,
    /// When the first session was opened
    pub connected_at: chrono::DateTime<chrono::Utc>,
    /// Last subscribe, ack or disconnect (not serialized)
    #[serde(skip)]
    pub last_seen: Option<Instant>,
    /// Acknowledged position per database
    pub positions: HashMap<String, Position>,
}

impl ReplicaState {
    fn new(node_id: String, address: String) -> Self {
        Self {
            node_id,
            address,
            sessions: 0,
            connected: false,
            connected_at: chrono::Utc::now(),
            last_seen: None,
            positions: HashMap::new(),
        }
    }

    fn touch(&mut self) {
        self.last_seen = Some(Instant::now());
    }

    /// Whether retention still has to honour this replica
    pub fn is_retained(&self, grace: Duration) -> bool {
        if self.connected {
            return true;
        }
        match self.last_seen {
            Some(last) => last.elapsed() < grace,
            None => false,
        }
    }
}

/// Replica tracker for one primary term
pub struct ReplicaRegistry {
    replicas: RwLock<HashMap<String, ReplicaState>>,
    /// How long a disconnected replica still holds back retention
    grace: Duration,
}

impl ReplicaRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            replicas: RwLock::new(HashMap::new()),
            grace,
        }
    }

    /// Register a subscribing replica with the positions it reported
    pub async fn connect(&self, node_id: &str, address: &str, positions: &[StreamPosition]) {
        let mut replicas = self.replicas.write().await;
        let replica = replicas
            .entry(node_id.to_string())
            .or_insert_with(|| ReplicaState::new(node_id.to_string(), address.to_string()));

        if replica.sessions == 0 {
            replica.connected_at = chrono::Utc::now();
        }
        replica.sessions += 1;
        replica.connected = true;
        replica.address = address.to_string();
        replica.touch();

        // A subscribe is authoritative: the replica may have lost data
        for p in positions {
            let position = if p.resync { 0 } else { p.position };
            replica.positions.insert(p.database.clone(), position);
        }

        tracing::info!(
            "Replica {} connected from {} ({} session(s))",
            node_id,
            address,
            replica.sessions
        );
    }

    /// Record acknowledged positions
    pub async fn record_ack(&self, node_id: &str, positions: &[StreamPosition]) {
        let mut replicas = self.replicas.write().await;
        let Some(replica) = replicas.get_mut(node_id) else {
            tracing::warn!("Ack from unregistered replica {}", node_id);
            return;
        };

        replica.touch();
        for p in positions {
            let entry = replica.positions.entry(p.database.clone()).or_insert(0);
            if p.position > *entry {
                *entry = p.position;
            }
        }
    }

    /// Close one session of a replica
    pub async fn disconnect(&self, node_id: &str) {
        let mut replicas = self.replicas.write().await;
        if let Some(replica) = replicas.get_mut(node_id) {
            replica.sessions = replica.sessions.saturating_sub(1);
            replica.connected = replica.sessions > 0;
            replica.touch();
            if !replica.connected {
                tracing::info!("Replica {} disconnected", node_id);
            }
        }
    }

    /// Positions of `database` that retention must keep, one per retained
    /// replica. A replica that never reported the database counts as 0.
    pub async fn floor_positions(&self, database: &str) -> Vec<Position> {
        let replicas = self.replicas.read().await;
        replicas
            .values()
            .filter(|r| r.is_retained(self.grace))
            .map(|r| r.positions.get(database).copied().unwrap_or(0))
            .collect()
    }

    /// Forget replicas that have been gone longer than the grace window
    pub async fn prune(&self) -> Vec<String> {
        let mut replicas = self.replicas.write().await;
        let expired: Vec<String> = replicas
            .values()
            .filter(|r| !r.is_retained(self.grace))
            .map(|r| r.node_id.clone())
            .collect();

        for id in &expired {
            replicas.remove(id);
            tracing::debug!("Forgot replica {}", id);
        }
        expired
    }

    /// Current state of all replicas
    pub async fn snapshot(&self) -> Vec<ReplicaState> {
        let replicas = self.replicas.read().await;
        let mut list: Vec<ReplicaState> = replicas.values().cloned().collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }

    pub async fn clear(&self) {
        self.replicas.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(database: &str, position: Position) -> StreamPosition {
        StreamPosition {
            database: database.into(),
            position,
            checksum: 0,
            resync: false,
        }
    }

    #[tokio::test]
    async fn test_ack_only_advances() {
        let registry = ReplicaRegistry::new(Duration::from_secs(60));
        registry.connect("node-2", "10.0.0.2:4000", &[pos("app.db", 5)]).await;

        registry.record_ack("node-2", &[pos("app.db", 9)]).await;
        registry.record_ack("node-2", &[pos("app.db", 7)]).await;

        assert_eq!(registry.floor_positions("app.db").await, vec![9]);
        assert_eq!(registry.floor_positions("other.db").await, vec![0]);
    }

    #[tokio::test]
    async fn test_resubscribe_resets_position() {
        let registry = ReplicaRegistry::new(Duration::from_secs(60));
        registry.connect("node-2", "a", &[pos("app.db", 9)]).await;
        registry.disconnect("node-2").await;

        let mut wiped = pos("app.db", 9);
        wiped.resync = true;
        registry.connect("node-2", "a", &[wiped]).await;
        assert_eq!(registry.floor_positions("app.db").await, vec![0]);
    }

    #[tokio::test]
    async fn test_grace_window() {
        let registry = ReplicaRegistry::new(Duration::from_millis(20));
        registry.connect("node-2", "a", &[pos("app.db", 3)]).await;
        registry.connect("node-2", "a", &[pos("app.db", 3)]).await;

        registry.disconnect("node-2").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Still one open session
        assert_eq!(registry.floor_positions("app.db").await, vec![3]);

        registry.disconnect("node-2").await;
        assert_eq!(registry.floor_positions("app.db").await, vec![3]);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(registry.floor_positions("app.db").await.is_empty());
        assert_eq!(registry.prune().await, vec!["node-2".to_string()]);
        assert!(registry.snapshot().await.is_empty());
    }
}
