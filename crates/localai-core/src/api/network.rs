//! P2P methods. Every one is a no-op when federation is disabled.

use crate::config::P2pConfig;
use crate::p2p::{NodeListing, P2pNetwork};
use crate::LocalAiApi;
use std::collections::BTreeMap;

impl LocalAiApi {
    pub fn p2p(&self) -> Option<&P2pNetwork> {
        self.inner.p2p.as_ref()
    }

    pub fn p2p_enabled(&self) -> bool {
        self.inner.p2p.is_some()
    }

    /// Known peers of `service_id`.
    pub fn p2p_nodes(&self, service_id: &str) -> Vec<NodeListing> {
        self.p2p()
            .map(|network| network.nodes(service_id))
            .unwrap_or_default()
    }

    pub fn worker_nodes(&self) -> Vec<NodeListing> {
        self.p2p_nodes(P2pConfig::WORKER_SERVICE_ID)
    }

    pub fn federated_nodes(&self) -> Vec<NodeListing> {
        self.p2p_nodes(P2pConfig::FEDERATED_SERVICE_ID)
    }

    /// Live ledger values of `bucket`.
    pub fn ledger_bucket(&self, bucket: &str) -> BTreeMap<String, serde_json::Value> {
        self.p2p()
            .map(|network| network.ledger().current_data(bucket))
            .unwrap_or_default()
    }

    pub fn ledger_value(&self, bucket: &str, key: &str) -> Option<serde_json::Value> {
        self.p2p()?.ledger().get(bucket, key)
    }

    /// Advertise a local `host:port` under `service_id`.
    pub fn expose_service(&self, host: &str, port: u16, service_id: &str) -> bool {
        match self.p2p() {
            Some(network) => {
                network.expose_service(host, port, service_id);
                true
            }
            None => false,
        }
    }
}
