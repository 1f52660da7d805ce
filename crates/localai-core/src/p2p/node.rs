//! Overlay node: serves the gossip and ledger endpoints and pushes the
//! ledger to a few random peers on every tick.

use super::ledger::{Ledger, LedgerSnapshot};
use super::token::NetworkToken;
use crate::cancel::CancellationToken;
use crate::config::P2pConfig;
use crate::error::{LocalAiError, Result};
use crate::network::HttpClient;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Consecutive failed exchanges after which a learned peer is dropped.
const MAX_PEER_FAILURES: u32 = 3;

/// Body of a gossip exchange, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub node_id: String,
    /// Where the sender can be reached, if it serves gossip.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub ledger: LedgerSnapshot,
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub name: String,
    pub gossip_interval: Duration,
    pub fanout: usize,
    /// Address announced to peers. Defaults to the bound address.
    pub advertise: Option<String>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            gossip_interval: P2pConfig::GOSSIP_INTERVAL,
            fanout: P2pConfig::GOSSIP_FANOUT,
            advertise: None,
        }
    }
}

impl NodeOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn with_advertise(mut self, address: impl Into<String>) -> Self {
        self.advertise = Some(address.into());
        self
    }
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    token: NetworkToken,
    encoded_token: String,
    bearer: String,
    node_id: String,
    options: NodeOptions,
    ledger: Ledger,
    client: HttpClient,
    /// Gossip address to consecutive failures.
    peers: RwLock<HashMap<String, u32>>,
    advertise: RwLock<Option<String>>,
}

impl Node {
    pub fn new(token: NetworkToken, options: NodeOptions) -> Result<Self> {
        let node_id = uuid::Uuid::new_v4().to_string();
        let client = HttpClient::new()?;
        let peers = token.peers.iter().map(|p| (p.clone(), 0)).collect();
        Ok(Self {
            inner: Arc::new(NodeInner {
                encoded_token: token.encode(),
                bearer: token.bearer(),
                ledger: Ledger::new(node_id.clone()),
                node_id,
                advertise: RwLock::new(options.advertise.clone()),
                options,
                client,
                peers: RwLock::new(peers),
                token,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn name(&self) -> &str {
        if self.inner.options.name.is_empty() {
            &self.inner.node_id
        } else {
            &self.inner.options.name
        }
    }

    pub fn token(&self) -> &NetworkToken {
        &self.inner.token
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    /// Address other nodes use to gossip with us, once known.
    pub fn address(&self) -> Option<String> {
        self.inner
            .advertise
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Known gossip peers, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .inner
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    pub fn add_peer(&self, address: impl Into<String>) {
        let address = address.into();
        if address.is_empty() || Some(&address) == self.address().as_ref() {
            return;
        }
        self.inner
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(address)
            .or_insert(0);
    }

    /// HTTP routes for gossip and the ledger view.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/p2p/gossip", post(handle_gossip))
            .route("/ledger/:bucket", get(get_bucket))
            .route("/ledger/:bucket/:key", get(get_key).post(put_key))
            .with_state(self.clone())
    }

    /// Serve on `listen` and start gossiping. Returns the bound address.
    pub async fn start(&self, listen: &str, cancel: CancellationToken) -> Result<SocketAddr> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| LocalAiError::Network {
                message: format!("Failed to bind gossip listener on {}: {}", listen, e),
                cause: None,
            })?;
        let bound = listener.local_addr()?;

        {
            let mut advertise = self
                .inner
                .advertise
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if advertise.is_none() {
                let host = if bound.ip().is_unspecified() {
                    "127.0.0.1".to_string()
                } else {
                    bound.ip().to_string()
                };
                *advertise = Some(format!("{}:{}", host, bound.port()));
            }
        }

        let router = self.router();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                warn!("Gossip server stopped: {}", e);
            }
        });

        let node = self.clone();
        tokio::spawn(async move { node.run_gossip_loop(cancel).await });

        info!(
            "P2P node {} listening on {} (network {})",
            self.name(),
            bound,
            self.inner.token.network_id
        );
        Ok(bound)
    }

    async fn run_gossip_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.options.gossip_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.gossip_round().await,
            }
        }
        debug!("Gossip loop for {} stopped", self.name());
    }

    /// Exchange ledgers with up to `fanout` random peers.
    pub async fn gossip_round(&self) {
        let targets = self.random_peers(self.inner.options.fanout);
        let exchanges = targets.iter().map(|addr| async move {
            if let Err(e) = self.sync_with(addr).await {
                debug!("Gossip with {} failed: {}", addr, e);
                self.record_failure(addr);
            }
        });
        futures::future::join_all(exchanges).await;
    }

    /// One push/pull exchange with the node at `addr`.
    pub async fn sync_with(&self, addr: &str) -> Result<()> {
        let url = format!("http://{}/p2p/gossip", addr);
        let response = self
            .inner
            .client
            .post_json(&url, &self.message(), Some(&self.inner.bearer))
            .await?;
        let reply: GossipMessage = response.json().await?;
        self.absorb(reply);

        if let Some(failures) = self
            .inner
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(addr)
        {
            *failures = 0;
        }
        Ok(())
    }

    fn message(&self) -> GossipMessage {
        GossipMessage {
            node_id: self.inner.node_id.clone(),
            address: self.address(),
            peers: self.peers(),
            ledger: self.inner.ledger.snapshot(),
        }
    }

    fn absorb(&self, message: GossipMessage) {
        let changed = self.inner.ledger.merge(message.ledger);
        if changed > 0 {
            debug!("Merged {} ledger entries from {}", changed, message.node_id);
        }
        if let Some(address) = message.address {
            self.add_peer(address);
        }
        for peer in message.peers {
            self.add_peer(peer);
        }
    }

    fn random_peers(&self, count: usize) -> Vec<String> {
        let mut peers = self.peers();
        peers.shuffle(&mut rand::rng());
        peers.truncate(count);
        peers
    }

    fn record_failure(&self, addr: &str) {
        let mut peers = self.inner.peers.write().unwrap_or_else(|e| e.into_inner());
        let seed = self.inner.token.peers.iter().any(|p| p == addr);
        if let Some(failures) = peers.get_mut(addr) {
            *failures += 1;
            if *failures >= MAX_PEER_FAILURES && !seed {
                peers.remove(addr);
                debug!("Dropped unreachable peer {}", addr);
            }
        }
    }

    fn has_bearer(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|v| v == self.inner.bearer)
    }

    fn has_auth_token(&self, headers: &HeaderMap) -> bool {
        headers
            .get(P2pConfig::AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == self.inner.encoded_token)
    }
}

async fn handle_gossip(
    State(node): State<Node>,
    headers: HeaderMap,
    Json(message): Json<GossipMessage>,
) -> Response {
    if !node.has_bearer(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    node.absorb(message);
    Json(node.message()).into_response()
}

async fn get_bucket(
    State(node): State<Node>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
) -> Response {
    if !node.has_auth_token(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(node.ledger().current_data(&bucket)).into_response()
}

async fn get_key(
    State(node): State<Node>,
    headers: HeaderMap,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    if !node.has_auth_token(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match node.ledger().get(&bucket, &key) {
        Some(value) => Json(value).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_key(
    State(node): State<Node>,
    headers: HeaderMap,
    Path((bucket, key)): Path<(String, String)>,
    Json(value): Json<serde_json::Value>,
) -> Response {
    if !node.has_auth_token(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    node.ledger().add(&bucket, &key, value);
    StatusCode::OK.into_response()
}
