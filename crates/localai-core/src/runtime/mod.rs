//! Backend process lifecycle.
//!
//! Models are served by backend executables started on demand. The
//! [`ModelLoader`] owns every running backend: it starts at most one process
//! per model, serialises requests per model, and lets the watchdog evict
//! idle or stuck processes.

mod loader;
mod process;
mod registry;
mod watchdog;

pub use loader::{LoadedModel, ModelLoader};
pub use process::{BackendProcess, ExitInfo, LaunchSpec, ReadinessProbe, TcpProbe};
pub use registry::{BackendCommand, BackendRegistry};
pub use watchdog::{collect_expired, lru_victim, ActivitySnapshot, WatchdogOptions};

use crate::config::RuntimeConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Loading,
    Ready,
    Busy,
    Idle,
    Failed,
    Stopped,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Snapshot of one loaded model, as reported by [`ModelLoader::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub backend: String,
    pub pid: Option<u32>,
    pub address: Option<String>,
    pub state: ProcessState,
    pub last_used: Option<DateTime<Utc>>,
    pub last_request_started: Option<DateTime<Utc>>,
}

/// Tunables for the [`ModelLoader`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Allow concurrent requests to one model up to its declared parallelism.
    pub parallel_requests: bool,
    pub stop_grace_period: Duration,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub watchdog: WatchdogOptions,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            parallel_requests: false,
            stop_grace_period: RuntimeConfig::STOP_GRACE_PERIOD,
            ready_timeout: RuntimeConfig::READY_TIMEOUT,
            ready_poll_interval: RuntimeConfig::READY_POLL_INTERVAL,
            watchdog: WatchdogOptions::default(),
        }
    }
}

impl RuntimeOptions {
    pub fn with_parallel_requests(mut self, enable: bool) -> Self {
        self.parallel_requests = enable;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogOptions) -> Self {
        self.watchdog = watchdog;
        self
    }
}
