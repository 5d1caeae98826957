//! Data-node registry and liveness tracking.
//!
//! Nodes register on startup and refresh a heartbeat timestamp; a node
//! whose heartbeat goes stale is considered dead and its channels are
//! handed over by the channel manager's reconcile loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use vectorstream_core::NodeId;
use vectorstream_rpc::DataNodeService;

struct NodeEntry {
    client: Arc<dyn DataNodeService>,
    last_heartbeat_ms: i64,
}

pub struct Cluster {
    stale_after: Duration,
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Cluster {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, node_id: NodeId, client: Arc<dyn DataNodeService>) {
        info!(node_id, "data node registered");
        self.nodes.write().await.insert(
            node_id,
            NodeEntry {
                client,
                last_heartbeat_ms: now_ms(),
            },
        );
    }

    pub async fn deregister(&self, node_id: NodeId) {
        if self.nodes.write().await.remove(&node_id).is_some() {
            warn!(node_id, "data node deregistered");
        }
    }

    pub async fn heartbeat(&self, node_id: NodeId) {
        if let Some(entry) = self.nodes.write().await.get_mut(&node_id) {
            entry.last_heartbeat_ms = now_ms();
        }
    }

    pub async fn client(&self, node_id: NodeId) -> Option<Arc<dyn DataNodeService>> {
        self.nodes.read().await.get(&node_id).map(|e| e.client.clone())
    }

    pub async fn is_live(&self, node_id: NodeId) -> bool {
        let cutoff = now_ms() - self.stale_after.as_millis() as i64;
        self.nodes
            .read()
            .await
            .get(&node_id)
            .is_some_and(|e| e.last_heartbeat_ms >= cutoff)
    }

    pub async fn live_nodes(&self) -> Vec<NodeId> {
        let cutoff = now_ms() - self.stale_after.as_millis() as i64;
        let mut ids: Vec<_> = self
            .nodes
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.last_heartbeat_ms >= cutoff)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Registered nodes whose heartbeat has gone stale.
    pub async fn dead_nodes(&self) -> Vec<NodeId> {
        let cutoff = now_ms() - self.stale_after.as_millis() as i64;
        self.nodes
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.last_heartbeat_ms < cutoff)
            .map(|(id, _)| *id)
            .collect()
    }
}
