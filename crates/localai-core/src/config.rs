//! Centralized configuration for the LocalAI core.
//!
//! Constants are grouped on unit structs by concern. [`ApplicationConfig`] is
//! the runtime configuration assembled by the server from CLI flags and the
//! dynamic JSON files found in the configuration directory.

use crate::gallery::GalleryRef;
use crate::p2p::P2pOptions;
use crate::runtime::WatchdogOptions;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const USER_AGENT: &'static str = "LocalAI/1.0";
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const PARTIAL_SUFFIX: &'static str = ".partial";
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
    pub const HUGGINGFACE_ENDPOINT: &'static str = "https://huggingface.co";
    pub const GITHUB_RAW_ENDPOINT: &'static str = "https://raw.githubusercontent.com";
    pub const OLLAMA_REGISTRY: &'static str = "registry.ollama.ai";
    pub const DOCKER_HUB_REGISTRY: &'static str = "registry-1.docker.io";
    pub const CATALOG_FETCH_ATTEMPTS: u32 = 3;
}

/// Backend runtime configuration.
pub struct RuntimeConfig;

impl RuntimeConfig {
    pub const READY_TIMEOUT: Duration = Duration::from_secs(120);
    pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
    pub const LOG_TAIL_LINES: usize = 64;
    pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
    pub const WATCHDOG_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
    pub const WATCHDOG_BUSY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const BACKEND_HOST: &'static str = "127.0.0.1";
}

/// P2P federation timings and ledger keys.
pub struct P2pConfig;

impl P2pConfig {
    pub const ONLINE_WINDOW: Duration = Duration::from_secs(40);
    pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(20);
    pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
    pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(5);
    pub const GOSSIP_FANOUT: usize = 3;
    pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);
    pub const SHARED_STATE_BUCKET: &'static str = "shared_state";
    pub const MODELS_KEY: &'static str = "models";
    pub const WORKER_SERVICE_ID: &'static str = "worker";
    pub const FEDERATED_SERVICE_ID: &'static str = "federated";
    pub const AUTH_HEADER: &'static str = "X-Auth-Token";
}

/// File and directory names.
pub struct PathsConfig;

impl PathsConfig {
    pub const RUN_FILE: &'static str = "run.sh";
    pub const ALIAS_FILE: &'static str = "alias";
    pub const METADATA_FILE: &'static str = "metadata.json";
    pub const LIB_DIR: &'static str = "lib";
    pub const API_KEYS_FILE: &'static str = "api_keys.json";
    pub const EXTERNAL_BACKENDS_FILE: &'static str = "external_backends.json";
    pub const GALLERY_FILE_PREFIX: &'static str = "._gallery_";
    pub const DEFAULT_CAPABILITY_RUN_FILE: &'static str = "/run/localai/capability";
}

/// Environment variables read by the core.
pub struct EnvVars;

impl EnvVars {
    pub const FORCE_CAPABILITY: &'static str = "LOCALAI_FORCE_META_BACKEND_CAPABILITY";
    pub const CAPABILITY_RUN_FILE: &'static str = "LOCALAI_FORCE_META_BACKEND_CAPABILITY_RUN_FILE";
    pub const SKIP_LIBRARY_PATH: &'static str = "LOCALAI_SKIP_LIBRARY_PATH";
    pub const P2P_LOGLEVEL: &'static str = "LOCALAI_P2P_LOGLEVEL";
    pub const LLAMACPP_GRPC_SERVERS: &'static str = "LLAMACPP_GRPC_SERVERS";
    pub const HF_ENDPOINT: &'static str = "HF_ENDPOINT";
}

/// Runtime configuration of an application instance.
#[derive(Debug, Clone)]
pub struct ApplicationConfig {
    pub models_path: PathBuf,
    pub backends_path: PathBuf,
    pub backends_system_path: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub galleries: Vec<GalleryRef>,
    pub backend_galleries: Vec<GalleryRef>,
    /// Install the backend named by a model's config when installing the model.
    pub autoload_backend_galleries: bool,
    /// Run the HuggingFace safety scan before installing gallery models.
    pub enforce_safety_scan: bool,
    /// Replace error messages in op statuses and HTTP 500s with blanks.
    pub opaque_errors: bool,
    pub parallel_backend_requests: bool,
    pub watchdog: WatchdogOptions,
    pub p2p: Option<P2pOptions>,
    pub api_keys: Vec<String>,
    /// Backend name to run command.
    pub external_backends: HashMap<String, String>,
    /// Extra directories `file://` URIs may read from.
    pub trusted_paths: Vec<PathBuf>,
}

impl ApplicationConfig {
    /// Create a config rooted at the given models and backends directories.
    pub fn new(models_path: impl Into<PathBuf>, backends_path: impl Into<PathBuf>) -> Self {
        Self {
            models_path: models_path.into(),
            backends_path: backends_path.into(),
            backends_system_path: None,
            config_dir: None,
            galleries: Vec::new(),
            backend_galleries: Vec::new(),
            autoload_backend_galleries: false,
            enforce_safety_scan: true,
            opaque_errors: false,
            parallel_backend_requests: false,
            watchdog: WatchdogOptions::default(),
            p2p: None,
            api_keys: Vec::new(),
            external_backends: HashMap::new(),
            trusted_paths: Vec::new(),
        }
    }

    pub fn with_backends_system_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backends_system_path = Some(path.into());
        self
    }

    pub fn with_config_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(path.into());
        self
    }

    pub fn with_galleries(mut self, galleries: Vec<GalleryRef>) -> Self {
        self.galleries = galleries;
        self
    }

    pub fn with_backend_galleries(mut self, galleries: Vec<GalleryRef>) -> Self {
        self.backend_galleries = galleries;
        self
    }

    pub fn with_autoload_backend_galleries(mut self, enable: bool) -> Self {
        self.autoload_backend_galleries = enable;
        self
    }

    pub fn with_safety_scan(mut self, enforce: bool) -> Self {
        self.enforce_safety_scan = enforce;
        self
    }

    pub fn with_opaque_errors(mut self, enable: bool) -> Self {
        self.opaque_errors = enable;
        self
    }

    pub fn with_parallel_backend_requests(mut self, enable: bool) -> Self {
        self.parallel_backend_requests = enable;
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogOptions) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_p2p(mut self, p2p: P2pOptions) -> Self {
        self.p2p = Some(p2p);
        self
    }

    pub fn with_api_keys(mut self, keys: Vec<String>) -> Self {
        self.api_keys = keys;
        self
    }

    pub fn with_external_backend(
        mut self,
        name: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        self.external_backends.insert(name.into(), command.into());
        self
    }

    pub fn with_trusted_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trusted_paths.push(path.into());
        self
    }

    /// Directories a `file://` URI may point into.
    ///
    /// The models and backends directories, the directory of every local
    /// gallery catalog, and any path added with [`Self::with_trusted_path`].
    pub fn trusted_file_bases(&self) -> Vec<PathBuf> {
        let mut bases = vec![self.models_path.clone(), self.backends_path.clone()];
        bases.extend(self.backends_system_path.clone());
        for gallery in self.galleries.iter().chain(&self.backend_galleries) {
            let Some(path) = gallery.url.strip_prefix("file://") else {
                continue;
            };
            let path = Path::new(path);
            let dir = if path.is_dir() { Some(path) } else { path.parent() };
            bases.extend(dir.map(Path::to_path_buf));
        }
        for path in &self.trusted_paths {
            if !bases.contains(path) {
                bases.push(path.clone());
            }
        }
        bases
    }

    /// Merge `api_keys.json` and `external_backends.json` from the config dir.
    ///
    /// Missing or malformed files are logged and skipped; values already
    /// present in the config take precedence over file values.
    pub fn load_dynamic_files(&mut self) {
        let Some(dir) = self.config_dir.clone() else {
            return;
        };

        if let Some(keys) = read_json_file::<Vec<String>>(&dir.join(PathsConfig::API_KEYS_FILE)) {
            for key in keys {
                if !self.api_keys.contains(&key) {
                    self.api_keys.push(key);
                }
            }
        }

        if let Some(backends) = read_json_file::<BTreeMap<String, String>>(
            &dir.join(PathsConfig::EXTERNAL_BACKENDS_FILE),
        ) {
            for (name, command) in backends {
                self.external_backends.entry(name).or_insert(command);
            }
        }
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Optional config file {} not present", path.display());
            return None;
        }
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring malformed {}: {}", path.display(), e);
            None
        }
    }
}
