//! TCP proxy that forwards each inbound connection to a worker peer.

use super::discovery::{NodeData, PeerTable};
use crate::cancel::CancellationToken;
use crate::error::{LocalAiError, Result};
use rand::seq::IndexedRandom;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FederatedServer {
    table: PeerTable,
    service_id: String,
    worker_target: Option<String>,
    load_balanced: bool,
    counters: Arc<Mutex<HashMap<String, u64>>>,
}

impl FederatedServer {
    pub fn new(table: PeerTable, service_id: impl Into<String>) -> Self {
        Self {
            table,
            service_id: service_id.into(),
            worker_target: None,
            load_balanced: false,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Always route to the peer with this id.
    pub fn with_worker_target(mut self, target: Option<String>) -> Self {
        self.worker_target = target.filter(|t| !t.is_empty());
        self
    }

    pub fn with_load_balancing(mut self, enabled: bool) -> Self {
        self.load_balanced = enabled;
        self
    }

    /// Pick the peer for the next connection.
    pub fn select_target(&self) -> Result<NodeData> {
        if let Some(target) = &self.worker_target {
            let node = self
                .table
                .get(target)
                .ok_or_else(|| LocalAiError::PeerNotFound { id: target.clone() })?;
            if !node.is_online() {
                return Err(self.no_peers());
            }
            return Ok(node);
        }

        let online = self.table.online();
        if online.is_empty() {
            return Err(self.no_peers());
        }

        let mut rng = rand::rng();
        if self.load_balanced {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.retain(|id, _| online.iter().any(|node| &node.id == id));
            let least = online
                .iter()
                .map(|node| counters.get(&node.id).copied().unwrap_or(0))
                .min()
                .unwrap_or(0);
            let candidates: Vec<&NodeData> = online
                .iter()
                .filter(|node| counters.get(&node.id).copied().unwrap_or(0) == least)
                .collect();
            return candidates
                .choose(&mut rng)
                .map(|node| (*node).clone())
                .ok_or_else(|| self.no_peers());
        }

        online.choose(&mut rng).cloned().ok_or_else(|| self.no_peers())
    }

    pub fn record_request(&self, peer_id: &str) {
        *self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(peer_id.to_string())
            .or_insert(0) += 1;
    }

    /// Snapshot of the per-peer request counters.
    pub fn requests(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Accept connections until cancelled.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Federated server for {} listening on {}", self.service_id, addr);
        }
        loop {
            let (stream, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            let server = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream, cancel).await {
                    debug!("Proxy connection from {} ended: {}", remote, e);
                }
            });
        }
        debug!("Federated server for {} stopped", self.service_id);
        Ok(())
    }

    async fn handle(&self, mut inbound: TcpStream, cancel: CancellationToken) -> Result<()> {
        let node = match self.select_target() {
            Ok(node) => node,
            Err(e) => {
                warn!("No route for federated connection: {}", e);
                write_error(&mut inbound, e.http_status()).await?;
                return Ok(());
            }
        };

        let mut outbound = match TcpStream::connect(&node.tunnel_address).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to reach peer {} at {}: {}", node.id, node.tunnel_address, e);
                write_error(&mut inbound, 503).await?;
                return Ok(());
            }
        };
        self.record_request(&node.id);
        debug!("Proxying connection to {} ({})", node.id, node.tunnel_address);

        tokio::select! {
            _ = cancel.cancelled() => {}
            copied = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
                copied?;
            }
        }
        Ok(())
    }

    fn no_peers(&self) -> LocalAiError {
        LocalAiError::NoPeersOnline {
            service_id: self.service_id.clone(),
        }
    }
}

async fn write_error(stream: &mut TcpStream, status: u16) -> Result<()> {
    let reason = match status {
        404 => "Not Found",
        _ => "Service Unavailable",
    };
    let body = format!("<html><body><h1>{} {}</h1></body></html>", status, reason);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::io::AsyncReadExt;

    fn peer(id: &str, address: &str, age_secs: i64) -> NodeData {
        NodeData {
            id: id.into(),
            name: id.into(),
            service_id: "worker".into(),
            tunnel_address: address.into(),
            last_seen: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_static_target() {
        let table = PeerTable::new();
        table.upsert(peer("a", "127.0.0.1:1", 0));
        table.upsert(peer("stale", "127.0.0.1:2", 120));

        let server = FederatedServer::new(table.clone(), "worker")
            .with_worker_target(Some("a".into()));
        assert_eq!(server.select_target().unwrap().id, "a");

        let missing = FederatedServer::new(table.clone(), "worker")
            .with_worker_target(Some("zz".into()));
        assert_eq!(missing.select_target().unwrap_err().http_status(), 404);

        let offline = FederatedServer::new(table, "worker").with_worker_target(Some("stale".into()));
        assert_eq!(offline.select_target().unwrap_err().http_status(), 503);
    }

    #[test]
    fn test_load_balancing_prefers_least_used() {
        let table = PeerTable::new();
        table.upsert(peer("a", "127.0.0.1:1", 0));
        table.upsert(peer("b", "127.0.0.1:2", 0));
        let server = FederatedServer::new(table.clone(), "worker").with_load_balancing(true);

        for _ in 0..10 {
            let chosen = server.select_target().unwrap();
            server.record_request(&chosen.id);
        }
        let counts = server.requests();
        assert_eq!(counts["a"], 5);
        assert_eq!(counts["b"], 5);

        // Peers no longer online drop out of the counters.
        server.record_request("gone");
        server.select_target().unwrap();
        assert!(!server.requests().contains_key("gone"));
    }

    #[test]
    fn test_no_peers_online() {
        let table = PeerTable::new();
        table.upsert(peer("stale", "127.0.0.1:1", 120));
        let err = FederatedServer::new(table, "worker").select_target().unwrap_err();
        assert!(matches!(err, LocalAiError::NoPeersOnline { .. }));
    }

    #[tokio::test]
    async fn test_proxy_answers_503_without_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = FederatedServer::new(PeerTable::new(), "worker");
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { server.serve(listener, cancel).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(response.contains("Content-Type: text/html"));
        assert!(response.contains("Connection: close"));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
