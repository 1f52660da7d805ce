//! Peer-to-peer federation.
//!
//! Nodes holding the same [`NetworkToken`] gossip a small replicated
//! [`Ledger`]. On top of it sit service announcements ([`expose_service`],
//! [`ServiceDiscoverer`]), a TCP proxy to worker peers ([`FederatedServer`])
//! and the shared list of installed models ([`StateSync`]).

mod discovery;
mod federated;
mod ledger;
mod node;
mod sync;
mod token;

pub use discovery::{
    expose_service, worker_addresses, NodeData, NodeListing, PeerTable, ServiceDiscoverer,
};
pub use federated::FederatedServer;
pub use ledger::{Ledger, LedgerEntry, LedgerSnapshot};
pub use node::{GossipMessage, Node, NodeOptions};
pub use sync::{StateSync, SyncReport};
pub use token::{generate_token, NetworkToken};

use crate::cancel::CancellationToken;
use crate::config::{EnvVars, P2pConfig};
use crate::error::{LocalAiError, Result};
use crate::runtime::ModelLoader;
use crate::services::GalleryService;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A local service announced to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedService {
    pub service_id: String,
    /// `host:port` other nodes connect to.
    pub address: String,
}

/// How this instance joins the network.
#[derive(Debug, Clone)]
pub struct P2pOptions {
    /// Encoded [`NetworkToken`].
    pub token: String,
    pub node_name: String,
    pub gossip_listen: String,
    pub gossip_advertise: Option<String>,
    pub gossip_interval: Duration,
    pub discovery_interval: Duration,
    pub announce_interval: Duration,
    /// Run the federated proxy on this address.
    pub federated_listen: Option<String>,
    /// Node id the proxy always routes to.
    pub worker_target: Option<String>,
    pub load_balanced: bool,
    pub expose: Vec<ExposedService>,
    /// Share the installed model list and install what others have.
    pub sync_models: bool,
    pub sync_interval: Duration,
}

impl P2pOptions {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            node_name: String::new(),
            gossip_listen: "0.0.0.0:0".to_string(),
            gossip_advertise: None,
            gossip_interval: P2pConfig::GOSSIP_INTERVAL,
            discovery_interval: P2pConfig::DISCOVERY_INTERVAL,
            announce_interval: P2pConfig::ANNOUNCE_INTERVAL,
            federated_listen: None,
            worker_target: None,
            load_balanced: false,
            expose: Vec::new(),
            sync_models: true,
            sync_interval: P2pConfig::SYNC_INTERVAL,
        }
    }

    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn with_gossip_listen(mut self, listen: impl Into<String>) -> Self {
        self.gossip_listen = listen.into();
        self
    }

    pub fn with_gossip_advertise(mut self, address: impl Into<String>) -> Self {
        self.gossip_advertise = Some(address.into());
        self
    }

    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_federated_listen(mut self, listen: impl Into<String>) -> Self {
        self.federated_listen = Some(listen.into());
        self
    }

    pub fn with_worker_target(mut self, target: impl Into<String>) -> Self {
        self.worker_target = Some(target.into());
        self
    }

    pub fn with_load_balancing(mut self, enabled: bool) -> Self {
        self.load_balanced = enabled;
        self
    }

    pub fn with_exposed_service(
        mut self,
        service_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        self.expose.push(ExposedService {
            service_id: service_id.into(),
            address: address.into(),
        });
        self
    }

    pub fn with_sync(mut self, enabled: bool, interval: Duration) -> Self {
        self.sync_models = enabled;
        self.sync_interval = interval;
        self
    }
}

/// A running membership in the network. Dropping it does not stop the
/// background tasks; call [`P2pNetwork::stop`] or cancel the parent token.
pub struct P2pNetwork {
    node: Node,
    gossip_addr: SocketAddr,
    workers: ServiceDiscoverer,
    federated: ServiceDiscoverer,
    proxy: Option<(FederatedServer, SocketAddr)>,
    announce_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for P2pNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pNetwork")
            .field("node", &self.node.id())
            .field("gossip_addr", &self.gossip_addr)
            .finish_non_exhaustive()
    }
}

impl P2pNetwork {
    /// Join the network and start every configured background task.
    ///
    /// Online worker addresses are handed to `loader` through
    /// `LLAMACPP_GRPC_SERVERS`; `service` receives installs from state sync.
    pub async fn start(
        options: &P2pOptions,
        loader: Option<ModelLoader>,
        service: Option<GalleryService>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let cancel = parent.child_token();
        let token = NetworkToken::decode(&options.token)?;

        let mut node_options = NodeOptions::default()
            .with_name(options.node_name.clone())
            .with_gossip_interval(options.gossip_interval);
        if let Some(advertise) = &options.gossip_advertise {
            node_options = node_options.with_advertise(advertise.clone());
        }
        let node = Node::new(token.clone(), node_options)?;
        let gossip_addr = node.start(&options.gossip_listen, cancel.clone()).await?;

        let mut tasks = Vec::new();

        let workers = ServiceDiscoverer::new(
            node.ledger().clone(),
            &token,
            P2pConfig::WORKER_SERVICE_ID,
        );
        tasks.push(workers.clone().run(
            options.discovery_interval,
            cancel.clone(),
            move |online| {
                if let Some(loader) = &loader {
                    if !online.is_empty() {
                        loader.set_backend_env(
                            EnvVars::LLAMACPP_GRPC_SERVERS,
                            worker_addresses(online),
                        );
                    }
                }
            },
        ));

        let federated = ServiceDiscoverer::new(
            node.ledger().clone(),
            &token,
            P2pConfig::FEDERATED_SERVICE_ID,
        );
        tasks.push(
            federated
                .clone()
                .run(options.discovery_interval, cancel.clone(), |_| {}),
        );

        let proxy = match &options.federated_listen {
            Some(listen) => {
                let listener =
                    TcpListener::bind(listen)
                        .await
                        .map_err(|e| LocalAiError::Network {
                            message: format!("Failed to bind federated listener on {}: {}", listen, e),
                            cause: None,
                        })?;
                let addr = listener.local_addr()?;
                let server = FederatedServer::new(
                    federated.table().clone(),
                    P2pConfig::FEDERATED_SERVICE_ID,
                )
                .with_worker_target(options.worker_target.clone())
                .with_load_balancing(options.load_balanced);
                let serving = server.clone();
                let proxy_cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = serving.serve(listener, proxy_cancel).await {
                        warn!("Federated server failed: {}", e);
                    }
                }));
                Some((server, addr))
            }
            None => None,
        };

        for exposed in &options.expose {
            tasks.push(expose_service(
                node.ledger(),
                &token,
                node.name().to_string(),
                exposed.service_id.clone(),
                exposed.address.clone(),
                options.announce_interval,
                cancel.clone(),
            ));
        }

        if options.sync_models {
            if let Some(service) = service {
                let sync = StateSync::new(node.ledger().clone(), service)
                    .with_interval(options.sync_interval);
                tasks.push(sync.run(cancel.clone()));
            }
        }

        info!(
            "Joined P2P network {} as {} ({})",
            token.network_id,
            node.name(),
            gossip_addr
        );
        Ok(Self {
            node,
            gossip_addr,
            workers,
            federated,
            proxy,
            announce_interval: options.announce_interval,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn ledger(&self) -> &Ledger {
        self.node.ledger()
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.gossip_addr
    }

    pub fn federated_server(&self) -> Option<&FederatedServer> {
        self.proxy.as_ref().map(|(server, _)| server)
    }

    pub fn federated_addr(&self) -> Option<SocketAddr> {
        self.proxy.as_ref().map(|(_, addr)| *addr)
    }

    /// Known peers of `service_id`, refreshed from the ledger first.
    pub fn nodes(&self, service_id: &str) -> Vec<NodeListing> {
        let discoverer = if service_id == P2pConfig::FEDERATED_SERVICE_ID {
            &self.federated
        } else if service_id == P2pConfig::WORKER_SERVICE_ID {
            &self.workers
        } else {
            return Vec::new();
        };
        discoverer.refresh();
        discoverer
            .table()
            .list()
            .iter()
            .map(NodeData::listing)
            .collect()
    }

    /// Advertise `host:port` under `service_id` until the network stops.
    pub fn expose_service(&self, host: &str, port: u16, service_id: &str) {
        let handle = expose_service(
            self.node.ledger(),
            self.node.token(),
            self.node.name().to_string(),
            service_id,
            format!("{}:{}", host, port),
            self.announce_interval,
            self.cancel.clone(),
        );
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Stop every background task and wait for them.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        futures::future::join_all(tasks).await;
        info!("Left P2P network");
    }
}
