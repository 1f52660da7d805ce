//! Builder for configuring LocalAiApi initialization.

use std::sync::Arc;

use crate::api::state::ApiState;
use crate::cancel::CancellationToken;
use crate::config::ApplicationConfig;
use crate::downloader::{Downloader, Endpoints};
use crate::error::{LocalAiError, Result};
use crate::gallery::Gallery;
use crate::network::HttpClient;
use crate::p2p::P2pNetwork;
use crate::runtime::{BackendRegistry, ModelLoader, ReadinessProbe, RuntimeOptions};
use crate::services::{GalleryService, ServiceOptions};
use crate::system::SystemState;
use crate::LocalAiApi;

/// Builder for configuring LocalAiApi initialization.
///
/// # Example
///
/// ```rust,no_run
/// use localai_core::{ApplicationConfig, LocalAiApi};
///
/// # async fn run() -> localai_core::Result<()> {
/// let config = ApplicationConfig::new("./models", "./backends");
/// let api = LocalAiApi::builder(config)
///     .auto_create_dirs(true)
///     .build()
///     .await?;
/// # api.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct LocalAiApiBuilder {
    config: ApplicationConfig,
    auto_create_dirs: bool,
    system: Option<SystemState>,
    endpoints: Option<Endpoints>,
    probe: Option<Arc<dyn ReadinessProbe>>,
    parent: Option<CancellationToken>,
}

impl LocalAiApiBuilder {
    pub fn new(config: ApplicationConfig) -> Self {
        Self {
            config,
            auto_create_dirs: false,
            system: None,
            endpoints: None,
            probe: None,
            parent: None,
        }
    }

    /// Create the models and backends directories if they don't exist.
    ///
    /// Default: `false` (directories must exist)
    pub fn auto_create_dirs(mut self, enable: bool) -> Self {
        self.auto_create_dirs = enable;
        self
    }

    /// Use a fixed host description instead of probing the machine.
    pub fn with_system_state(mut self, state: SystemState) -> Self {
        self.system = Some(state);
        self
    }

    /// Override the remote endpoints (defaults honour `HF_ENDPOINT`).
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// How the runtime decides a freshly spawned backend is serving.
    pub fn with_readiness_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Tie every background task to `parent`.
    pub fn with_cancellation(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    fn prepare_directories(&self) -> Result<()> {
        let dirs = [&self.config.models_path, &self.config.backends_path];
        for dir in dirs {
            if dir.exists() {
                continue;
            }
            if !self.auto_create_dirs {
                return Err(LocalAiError::Config {
                    message: format!("Directory does not exist: {}", dir.display()),
                });
            }
            std::fs::create_dir_all(dir).map_err(|e| LocalAiError::Io {
                message: format!("Failed to create directory: {}", dir.display()),
                path: Some(dir.clone()),
                source: Some(e),
            })?;
        }
        Ok(())
    }

    /// Build the LocalAiApi instance and start its background tasks.
    pub async fn build(mut self) -> Result<LocalAiApi> {
        self.prepare_directories()?;
        self.config.load_dynamic_files();
        let config = self.config;

        let system = Arc::new(match self.system {
            Some(system) => system,
            None => SystemState::builder(&config.models_path, &config.backends_path)
                .backends_system_path(config.backends_system_path.clone())
                .detect(),
        });

        let mut endpoints = self.endpoints.unwrap_or_else(Endpoints::from_env);
        endpoints.trusted_file_bases.extend(config.trusted_file_bases());
        let downloader = Downloader::new(HttpClient::new()?, endpoints);
        let gallery = Gallery::new(downloader, system.clone());

        let registry = BackendRegistry::new();
        match gallery.list_system_backends().await {
            Ok(backends) => registry.register_system_backends(&backends),
            Err(e) => tracing::warn!("Failed to scan installed backends: {}", e),
        }
        registry.register_external(&config.external_backends);

        let options = RuntimeOptions::default()
            .with_parallel_requests(config.parallel_backend_requests)
            .with_watchdog(config.watchdog.clone());
        let loader = match self.probe {
            Some(probe) => {
                ModelLoader::with_probe(&config.models_path, registry, options, probe)
            }
            None => ModelLoader::new(&config.models_path, registry, options),
        };

        let cancel = self
            .parent
            .map(|parent| parent.child_token())
            .unwrap_or_default();

        let service = GalleryService::new(
            gallery.clone(),
            ServiceOptions::from_config(&config),
            Some(loader.clone()),
        );
        let mut tasks = vec![service.start(cancel.child_token())?];
        if let Some(watchdog) = loader.start_watchdog(cancel.child_token()) {
            tasks.push(watchdog);
        }

        let p2p = match &config.p2p {
            Some(options) => {
                match P2pNetwork::start(options, Some(loader.clone()), Some(service.clone()), &cancel)
                    .await
                {
                    Ok(network) => Some(network),
                    Err(e) => {
                        cancel.cancel();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        tracing::info!(
            "LocalAI core ready (models: {}, backends: {}, capability: {})",
            config.models_path.display(),
            config.backends_path.display(),
            system.capability()
        );

        Ok(LocalAiApi {
            inner: Arc::new(ApiState {
                config,
                system,
                gallery,
                loader,
                service,
                p2p,
                cancel,
                tasks: tokio::sync::Mutex::new(tasks),
            }),
        })
    }
}
