//! Command-line flags and their mapping onto [`ApplicationConfig`].

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use localai_core::p2p::P2pOptions;
use localai_core::{generate_token, ApplicationConfig, GalleryRef, WatchdogOptions};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "localai-server")]
#[command(about = "Self-hosted model server: galleries, backends and P2P federation")]
pub struct Args {
    /// Address the HTTP API binds to
    #[arg(long, env = "LOCALAI_ADDRESS", default_value = "127.0.0.1:8080")]
    pub address: String,

    #[arg(long, env = "LOCALAI_MODELS_PATH", default_value = "./models")]
    pub models_path: PathBuf,

    #[arg(long, env = "LOCALAI_BACKENDS_PATH", default_value = "./backends")]
    pub backends_path: PathBuf,

    /// Read-only directory with backends provided by the system
    #[arg(long, env = "LOCALAI_BACKENDS_SYSTEM_PATH")]
    pub backends_system_path: Option<PathBuf>,

    /// Directory holding api_keys.json and external_backends.json
    #[arg(long, env = "LOCALAI_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Extra directories `file://` URIs may read from (comma separated)
    #[arg(long = "trusted-paths", env = "LOCALAI_TRUSTED_PATHS", value_delimiter = ',')]
    pub trusted_paths: Vec<PathBuf>,

    /// Model galleries as a JSON list of {"name", "url"}
    #[arg(long, env = "LOCALAI_GALLERIES")]
    pub galleries: Option<String>,

    /// Backend galleries as a JSON list of {"name", "url"}
    #[arg(long, env = "LOCALAI_BACKEND_GALLERIES")]
    pub backend_galleries: Option<String>,

    /// Install the backend a model needs when installing the model
    #[arg(long, env = "LOCALAI_AUTOLOAD_BACKEND_GALLERIES")]
    pub autoload_backend_galleries: bool,

    /// Skip the HuggingFace safety scan
    #[arg(long, env = "LOCALAI_DISABLE_SAFETY_SCAN")]
    pub disable_safety_scan: bool,

    /// Hide error details in responses and operation statuses
    #[arg(long, env = "LOCALAI_OPAQUE_ERRORS")]
    pub opaque_errors: bool,

    #[arg(long, env = "LOCALAI_PARALLEL_REQUESTS")]
    pub parallel_requests: bool,

    /// API keys required on every request (comma separated)
    #[arg(long = "api-keys", env = "LOCALAI_API_KEY", value_delimiter = ',')]
    pub api_keys: Vec<String>,

    /// Evict backends idle for longer than this (e.g. 15m)
    #[arg(long, env = "LOCALAI_WATCHDOG_IDLE_TIMEOUT", value_parser = parse_duration)]
    pub watchdog_idle_timeout: Option<Duration>,

    /// Evict backends busy on one request for longer than this (e.g. 5m)
    #[arg(long, env = "LOCALAI_WATCHDOG_BUSY_TIMEOUT", value_parser = parse_duration)]
    pub watchdog_busy_timeout: Option<Duration>,

    #[arg(long, env = "LOCALAI_WATCHDOG_INTERVAL", value_parser = parse_duration)]
    pub watchdog_interval: Option<Duration>,

    /// Maximum number of models loaded at once (0 = unlimited)
    #[arg(long, env = "LOCALAI_MAX_ACTIVE_BACKENDS", default_value_t = 0)]
    pub max_active_backends: usize,

    /// Join a P2P network
    #[arg(long, env = "LOCALAI_P2P")]
    pub p2p: bool,

    /// Network token; a fresh one is generated when --p2p is set without it
    #[arg(long, env = "LOCALAI_P2P_TOKEN")]
    pub p2p_token: Option<String>,

    #[arg(long, env = "LOCALAI_P2P_LISTEN", default_value = "0.0.0.0:0")]
    pub p2p_listen: String,

    /// Address other nodes use to reach this node's gossip endpoint
    #[arg(long, env = "LOCALAI_P2P_ADVERTISE")]
    pub p2p_advertise: Option<String>,

    #[arg(long, env = "LOCALAI_NODE_NAME", default_value = "")]
    pub node_name: String,

    /// Run the federated proxy on this address
    #[arg(long, env = "LOCALAI_FEDERATED_ADDRESS")]
    pub federated_address: Option<String>,

    /// Always route federated traffic to this node id
    #[arg(long, env = "LOCALAI_TARGET_WORKER")]
    pub target_worker: Option<String>,

    /// Pick the least-used worker instead of a random one
    #[arg(long, env = "LOCALAI_LOAD_BALANCED")]
    pub load_balanced: bool,

    /// Announce a local worker (host:port) to the network
    #[arg(long, env = "LOCALAI_P2P_WORKER")]
    pub expose_worker: Option<String>,

    /// Do not share the installed model list with other nodes
    #[arg(long, env = "LOCALAI_P2P_DISABLE_SYNC")]
    pub disable_model_sync: bool,

    /// Enable debug logging
    #[arg(long, short)]
    pub debug: bool,

    #[arg(long, env = "LOCALAI_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    /// Build the core configuration. Also returns the P2P token when one was
    /// generated here, so it can be shown to the operator.
    pub fn application_config(&self) -> Result<(ApplicationConfig, Option<String>)> {
        let mut config = ApplicationConfig::new(&self.models_path, &self.backends_path)
            .with_galleries(parse_galleries(self.galleries.as_deref(), "galleries")?)
            .with_backend_galleries(parse_galleries(
                self.backend_galleries.as_deref(),
                "backend galleries",
            )?)
            .with_autoload_backend_galleries(self.autoload_backend_galleries)
            .with_safety_scan(!self.disable_safety_scan)
            .with_opaque_errors(self.opaque_errors)
            .with_parallel_backend_requests(self.parallel_requests)
            .with_watchdog(self.watchdog_options())
            .with_api_keys(
                self.api_keys
                    .iter()
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect(),
            );

        if let Some(path) = &self.backends_system_path {
            config = config.with_backends_system_path(path);
        }
        if let Some(dir) = &self.config_dir {
            config = config.with_config_dir(dir);
        }
        for path in &self.trusted_paths {
            config = config.with_trusted_path(path);
        }

        let mut generated = None;
        if self.p2p || self.p2p_token.is_some() {
            let token = match &self.p2p_token {
                Some(token) => token.clone(),
                None => {
                    let token = generate_token();
                    generated = Some(token.clone());
                    token
                }
            };
            config = config.with_p2p(self.p2p_options(token)?);
        }

        Ok((config, generated))
    }

    fn watchdog_options(&self) -> WatchdogOptions {
        let mut options = WatchdogOptions::default();
        if let Some(timeout) = self.watchdog_idle_timeout {
            options = options.with_idle_timeout(timeout);
        }
        if let Some(timeout) = self.watchdog_busy_timeout {
            options = options.with_busy_timeout(timeout);
        }
        if let Some(interval) = self.watchdog_interval {
            options.interval = interval;
        }
        options.lru_limit = self.max_active_backends;
        options
    }

    fn p2p_options(&self, token: String) -> Result<P2pOptions> {
        let mut options = P2pOptions::new(token)
            .with_node_name(self.node_name.clone())
            .with_gossip_listen(self.p2p_listen.clone())
            .with_load_balancing(self.load_balanced);
        options.sync_models = !self.disable_model_sync;

        if let Some(advertise) = &self.p2p_advertise {
            options = options.with_gossip_advertise(advertise.clone());
        }
        if let Some(listen) = &self.federated_address {
            options = options.with_federated_listen(listen.clone());
        }
        if let Some(target) = &self.target_worker {
            options = options.with_worker_target(target.clone());
        }
        if let Some(worker) = &self.expose_worker {
            if !worker.contains(':') {
                bail!("--expose-worker expects host:port, got {}", worker);
            }
            options = options.with_exposed_service("worker", worker.clone());
        }
        Ok(options)
    }
}

fn parse_galleries(raw: Option<&str>, what: &str) -> Result<Vec<GalleryRef>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(json) => {
            serde_json::from_str(json).with_context(|| format!("Invalid {} JSON", what))
        }
    }
}

/// Parse `90`, `30s`, `15m`, `2h` or `500ms`.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {:?}", raw))?;

    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit {:?} in {:?}", other, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn test_config_from_flags() {
        let args = Args::parse_from([
            "localai-server",
            "--models-path",
            "/srv/models",
            "--galleries",
            r#"[{"name":"localai","url":"github:mudler/LocalAI/gallery/index.yaml@master"}]"#,
            "--watchdog-idle-timeout",
            "15m",
            "--api-keys",
            "a, b",
            "--p2p",
            "--load-balanced",
            "--trusted-paths",
            "/mnt/weights",
        ]);

        let (config, generated) = args.application_config().unwrap();
        assert_eq!(config.models_path, PathBuf::from("/srv/models"));
        assert_eq!(config.galleries[0].name, "localai");
        assert!(config.watchdog.idle_check);
        assert_eq!(config.watchdog.idle_timeout, Duration::from_secs(900));
        assert_eq!(config.api_keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.trusted_paths, vec![PathBuf::from("/mnt/weights")]);

        let p2p = config.p2p.unwrap();
        assert!(p2p.load_balanced);
        assert_eq!(Some(p2p.token), generated);
    }

    #[test]
    fn test_invalid_gallery_json_is_rejected() {
        let args = Args::parse_from(["localai-server", "--galleries", "{oops"]);
        assert!(args.application_config().is_err());
    }
}
