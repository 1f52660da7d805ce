//! Keeps the set of installed models aligned across the network.
//!
//! Every node publishes the union of the models it knows about at
//! `shared_state/models` and installs whatever the shared list names but it
//! does not have. There is no leader; the last writer wins for the key and
//! duplicate installs are harmless.

use super::ledger::Ledger;
use crate::cancel::CancellationToken;
use crate::config::P2pConfig;
use crate::error::{LocalAiError, Result};
use crate::gallery::InstallRequest;
use crate::services::{GalleryOp, GalleryService};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one sync pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// The shared list was (re)written by this node.
    pub announced: bool,
    /// Models queued for installation.
    pub enqueued: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StateSync {
    ledger: Ledger,
    service: GalleryService,
    interval: Duration,
}

impl StateSync {
    pub fn new(ledger: Ledger, service: GalleryService) -> Self {
        Self {
            ledger,
            service,
            interval: P2pConfig::SYNC_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn sync_once(&self) -> Result<SyncReport> {
        let gallery = self.service.gallery().clone();
        let local: BTreeSet<String> = tokio::task::spawn_blocking(move || gallery.installed_models())
            .await
            .map_err(|e| LocalAiError::Other(format!("model listing task failed: {}", e)))??
            .into_iter()
            .collect();

        let mut report = SyncReport::default();
        let remote = match self
            .ledger
            .get(P2pConfig::SHARED_STATE_BUCKET, P2pConfig::MODELS_KEY)
        {
            Some(value) => serde_json::from_value::<BTreeSet<String>>(value)?,
            None => {
                self.publish(&local);
                report.announced = true;
                return Ok(report);
            }
        };

        if !local.is_subset(&remote) {
            let union: BTreeSet<String> = remote.union(&local).cloned().collect();
            self.publish(&union);
            report.announced = true;
        }

        let cache = self.service.op_cache();
        for name in remote.difference(&local) {
            if cache.exists(name) {
                debug!("Install of {} already queued", name);
                continue;
            }
            self.service
                .enqueue(GalleryOp::install_model(name.clone(), InstallRequest::default()))?;
            info!("Queued install of {} from shared state", name);
            report.enqueued.push(name.clone());
        }
        Ok(report)
    }

    /// Sync every interval until cancelled. Failures are logged and retried
    /// on the next tick.
    pub fn run(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sync_once().await {
                            warn!("Shared state sync failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    fn publish(&self, models: &BTreeSet<String>) {
        debug!("Announcing {} shared model(s)", models.len());
        self.ledger.add(
            P2pConfig::SHARED_STATE_BUCKET,
            P2pConfig::MODELS_KEY,
            serde_json::json!(models),
        );
    }
}
