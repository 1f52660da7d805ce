//! Replicated key/value ledger.
//!
//! Keys live in buckets. Every entry carries the time it was written and the
//! node that wrote it; merging keeps the newest entry per key, with the
//! origin id breaking ties so that every node converges on the same value.

use crate::cancel::CancellationToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    /// Tombstone; deleted keys still replicate so removals win over stale copies.
    #[serde(default)]
    pub deleted: bool,
    pub origin: String,
}

impl LedgerEntry {
    fn supersedes(&self, other: &LedgerEntry) -> bool {
        (self.updated_at, &self.origin) > (other.updated_at, &other.origin)
    }
}

/// Bucket name to key to entry.
pub type LedgerSnapshot = BTreeMap<String, BTreeMap<String, LedgerEntry>>;

#[derive(Debug, Clone)]
pub struct Ledger {
    node_id: Arc<str>,
    data: Arc<RwLock<LedgerSnapshot>>,
}

impl Ledger {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into().into(),
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Write `value` at `bucket/key` stamped with the current time.
    pub fn add(&self, bucket: &str, key: &str, value: serde_json::Value) {
        self.write_entry(bucket, key, value, false);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<serde_json::Value> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(bucket)?
            .get(key)
            .filter(|entry| !entry.deleted)
            .map(|entry| entry.value.clone())
    }

    /// Live values of a bucket.
    pub fn current_data(&self, bucket: &str) -> BTreeMap<String, serde_json::Value> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(bucket)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, entry)| !entry.deleted)
                    .map(|(key, entry)| (key.clone(), entry.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn delete(&self, bucket: &str, key: &str) {
        self.write_entry(bucket, key, serde_json::Value::Null, true);
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.data.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Merge a remote snapshot. Returns how many keys changed locally.
    pub fn merge(&self, remote: LedgerSnapshot) -> usize {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0;
        for (bucket, entries) in remote {
            let local = data.entry(bucket).or_default();
            for (key, entry) in entries {
                let newer = local
                    .get(&key)
                    .map(|current| entry.supersedes(current))
                    .unwrap_or(true);
                if newer {
                    local.insert(key, entry);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Write `bucket/key` now and again every `interval` until cancelled,
    /// recomputing the value each time.
    pub fn announce_with<F>(
        &self,
        bucket: impl Into<String>,
        key: impl Into<String>,
        interval: Duration,
        cancel: CancellationToken,
        value: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> serde_json::Value + Send + 'static,
    {
        let ledger = self.clone();
        let bucket = bucket.into();
        let key = key.into();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        ledger.add(&bucket, &key, value());
                    }
                }
            }
            debug!("Stopped announcing {}/{}", bucket, key);
        })
    }

    /// Announce a fixed value periodically.
    pub fn announce(
        &self,
        bucket: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.announce_with(bucket, key, interval, cancel, move || value.clone())
    }

    fn write_entry(&self, bucket: &str, key: &str, value: serde_json::Value, deleted: bool) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let entries = data.entry(bucket.to_string()).or_default();
        // Keep local writes strictly after whatever is stored so a write
        // never loses to an entry merged from a peer with a skewed clock.
        let mut updated_at = Utc::now();
        if let Some(current) = entries.get(key) {
            if current.updated_at >= updated_at {
                updated_at = current.updated_at + chrono::Duration::microseconds(1);
            }
        }
        entries.insert(
            key.to_string(),
            LedgerEntry {
                value,
                updated_at,
                deleted,
                origin: self.node_id.to_string(),
            },
        );
    }
}
