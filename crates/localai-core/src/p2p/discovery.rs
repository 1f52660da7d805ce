//! Service announcements and the peer table built from them.

use super::ledger::Ledger;
use super::token::NetworkToken;
use crate::cancel::CancellationToken;
use crate::config::P2pConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a node publishes about a service it exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub service_id: String,
    /// `host:port` that accepts connections for the service.
    pub tunnel_address: String,
    pub last_seen: DateTime<Utc>,
}

impl NodeData {
    pub fn is_online(&self) -> bool {
        self.is_online_at(Utc::now())
    }

    pub fn is_online_at(&self, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(P2pConfig::ONLINE_WINDOW)
            .unwrap_or_else(|_| chrono::Duration::seconds(40));
        now - self.last_seen < window
    }

    pub fn listing(&self) -> NodeListing {
        NodeListing {
            id: self.id.clone(),
            name: self.name.clone(),
            tunnel_address: self.tunnel_address.clone(),
            service_id: self.service_id.clone(),
            last_seen: self.last_seen,
            online: self.is_online(),
        }
    }
}

/// A peer as shown by the node listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeListing {
    pub id: String,
    pub name: String,
    pub tunnel_address: String,
    pub service_id: String,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
}

/// Peers of one service keyed by node id. Reads copy out.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    nodes: Arc<RwLock<HashMap<String, NodeData>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Older announcements are ignored.
    pub fn upsert(&self, node: NodeData) -> bool {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        match nodes.get(&node.id) {
            Some(current) if current.last_seen >= node.last_seen => false,
            _ => {
                nodes.insert(node.id.clone(), node);
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<NodeData> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// All peers sorted by id.
    pub fn list(&self) -> Vec<NodeData> {
        let mut nodes: Vec<NodeData> = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn online(&self) -> Vec<NodeData> {
        let now = Utc::now();
        self.list()
            .into_iter()
            .filter(|node| node.is_online_at(now))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Comma-separated tunnel addresses, the format llama.cpp expects for its
/// RPC worker list.
pub fn worker_addresses(nodes: &[NodeData]) -> String {
    nodes
        .iter()
        .map(|node| node.tunnel_address.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Keeps a [`PeerTable`] in step with a service's announcements.
#[derive(Debug, Clone)]
pub struct ServiceDiscoverer {
    ledger: Ledger,
    service_id: String,
    service_key: String,
    table: PeerTable,
}

impl ServiceDiscoverer {
    pub fn new(ledger: Ledger, token: &NetworkToken, service_id: impl Into<String>) -> Self {
        let service_id = service_id.into();
        Self {
            ledger,
            service_key: token.service_key(&service_id),
            service_id,
            table: PeerTable::new(),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn table(&self) -> &PeerTable {
        &self.table
    }

    /// Read the service bucket once. Returns how many peers were refreshed.
    pub fn refresh(&self) -> usize {
        let mut refreshed = 0;
        for (key, value) in self.ledger.current_data(&self.service_key) {
            match serde_json::from_value::<NodeData>(value) {
                Ok(node) => {
                    if self.table.upsert(node) {
                        refreshed += 1;
                    }
                }
                Err(e) => warn!("Ignoring malformed announcement {}: {}", key, e),
            }
        }
        refreshed
    }

    /// Refresh every `interval` until cancelled, handing the online peers
    /// to `on_refresh` after each pass.
    pub fn run<F>(self, interval: Duration, cancel: CancellationToken, on_refresh: F) -> JoinHandle<()>
    where
        F: Fn(&[NodeData]) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let refreshed = self.refresh();
                        if refreshed > 0 {
                            debug!("{} {} peer(s) refreshed", refreshed, self.service_id);
                        }
                        on_refresh(&self.table.online());
                    }
                }
            }
        })
    }
}

/// Announce `tunnel_address` under `service_id` until cancelled.
pub fn expose_service(
    ledger: &Ledger,
    token: &NetworkToken,
    name: impl Into<String>,
    service_id: impl Into<String>,
    tunnel_address: impl Into<String>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let service_id = service_id.into();
    let template = NodeData {
        id: ledger.node_id().to_string(),
        name: name.into(),
        tunnel_address: tunnel_address.into(),
        last_seen: Utc::now(),
        service_id: service_id.clone(),
    };
    ledger.announce_with(
        token.service_key(&service_id),
        template.id.clone(),
        interval,
        cancel,
        move || {
            let node = NodeData {
                last_seen: Utc::now(),
                ..template.clone()
            };
            serde_json::to_value(node).unwrap_or_default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, age_secs: i64) -> NodeData {
        NodeData {
            id: id.into(),
            name: id.into(),
            service_id: "worker".into(),
            tunnel_address: format!("{}:50052", id),
            last_seen: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_online_window() {
        assert!(node("a", 0).is_online());
        assert!(node("a", 39).is_online());
        assert!(!node("a", 41).is_online());
        assert!(!node("a", 41).listing().online);
    }

    #[test]
    fn test_peer_table_keeps_newest() {
        let table = PeerTable::new();
        assert!(table.upsert(node("a", 10)));
        assert!(!table.upsert(node("a", 20)));
        assert!(table.upsert(node("a", 1)));
        table.upsert(node("b", 100));

        assert_eq!(table.len(), 2);
        let online: Vec<_> = table.online().into_iter().map(|n| n.id).collect();
        assert_eq!(online, vec!["a".to_string()]);
        assert_eq!(worker_addresses(&table.list()), "a:50052,b:50052");
    }

    #[tokio::test]
    async fn test_exposed_service_is_discovered() {
        let token = NetworkToken::new("net", "secret");
        let ledger = Ledger::new("node-1");
        let cancel = CancellationToken::new();
        let handle = expose_service(
            &ledger,
            &token,
            "gpu-box",
            P2pConfig::WORKER_SERVICE_ID,
            "10.0.0.5:50052",
            Duration::from_secs(20),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        ledger.add(&token.service_key("worker"), "broken", serde_json::json!("nope"));
        let discoverer = ServiceDiscoverer::new(ledger.clone(), &token, "worker");
        assert_eq!(discoverer.refresh(), 1);

        let found = discoverer.table().get("node-1").unwrap();
        assert_eq!(found.name, "gpu-box");
        assert_eq!(found.tunnel_address, "10.0.0.5:50052");

        // Other services stay separate.
        let federated = ServiceDiscoverer::new(ledger, &token, "federated");
        assert_eq!(federated.refresh(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
