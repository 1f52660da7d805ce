//! LocalAI Core - headless library behind a self-hosted inference server.
//!
//! It installs models and backends from remote galleries, runs each loaded
//! model in its own backend subprocess, and optionally federates several
//! instances over a token-secured P2P network. It can be used
//! programmatically without the HTTP layer of `localai-server`.
//!
//! # Example
//!
//! ```rust,no_run
//! use localai_core::{ApplicationConfig, CancellationToken, GalleryRef, LocalAiApi};
//!
//! #[tokio::main]
//! async fn main() -> localai_core::Result<()> {
//!     let config = ApplicationConfig::new("./models", "./backends").with_galleries(vec![
//!         GalleryRef::new("localai", "github:mudler/LocalAI/gallery/index.yaml@master"),
//!     ]);
//!     let api = LocalAiApi::builder(config).auto_create_dirs(true).build().await?;
//!
//!     let op = api.apply_model("localai@phi-2", Default::default())?;
//!     println!("queued {}", op);
//!
//!     let model = api.load_model("phi-2", &CancellationToken::new()).await?;
//!     println!("serving on {}", model.address());
//!
//!     api.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fanout;
pub mod gallery;
pub mod job;
pub mod network;
pub mod p2p;
pub mod paths;
pub mod runtime;
pub mod services;
pub mod system;

mod api;

// Re-export commonly used types
pub use api::{GalleryQuery, LocalAiApiBuilder, SystemInfo};
pub use cancel::{CancellationToken, CancelledError};
pub use config::ApplicationConfig;
pub use downloader::{Downloader, Endpoints, Progress, Uri, UriKind};
pub use error::{ErrorKind, LocalAiError, Result};
pub use gallery::{
    Gallery, GalleryBackend, GalleryModel, GalleryRef, InstallRequest, ModelConfig,
    SystemBackend,
};
pub use job::JobResult;
pub use p2p::{generate_token, NetworkToken, NodeListing, P2pNetwork, P2pOptions};
pub use runtime::{LoadedModel, ModelLoader, ProcessState, ProcessStatus, WatchdogOptions};
pub use services::{GalleryOp, GalleryOpStatus, GalleryService, TaskType};
pub use system::{GpuVendor, SystemState};

use std::sync::Arc;

use api::ApiState;

/// Main API struct for LocalAI operations.
///
/// Owns the gallery, the installer queue, the backend runtime and, when
/// configured, the P2P membership. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct LocalAiApi {
    inner: Arc<ApiState>,
}

impl std::fmt::Debug for LocalAiApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAiApi")
            .field("models_path", &self.inner.config.models_path)
            .field("backends_path", &self.inner.config.backends_path)
            .finish_non_exhaustive()
    }
}

impl LocalAiApi {
    /// Create a builder for LocalAiApi.
    ///
    /// Use the builder for more control over initialization options:
    /// - `auto_create_dirs`: Create the models and backends directories
    /// - `with_system_state`: Skip hardware detection
    /// - `with_endpoints`: Point downloads at other origins
    pub fn builder(config: ApplicationConfig) -> LocalAiApiBuilder {
        LocalAiApiBuilder::new(config)
    }

    /// Create a LocalAiApi with default options.
    ///
    /// The models and backends directories must already exist.
    pub async fn new(config: ApplicationConfig) -> Result<Self> {
        Self::builder(config).build().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::{ElementMetadata, GalleryFile};
    use crate::system::GpuVendor;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestEnv {
        _dir: TempDir,
        api: LocalAiApi,
    }

    async fn create_test_env(gallery_yaml: &str) -> TestEnv {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("index.yaml");
        std::fs::write(&index, gallery_yaml).unwrap();

        let config = ApplicationConfig::new(dir.path().join("models"), dir.path().join("backends"))
            .with_galleries(vec![GalleryRef::new(
                "local",
                format!("file://{}", index.display()),
            )]);
        let system = SystemState::builder(&config.models_path, &config.backends_path)
            .gpu(GpuVendor::None, 0)
            .capability("default")
            .detect();
        let api = LocalAiApi::builder(config)
            .auto_create_dirs(true)
            .with_system_state(system)
            .build()
            .await
            .unwrap();
        TestEnv { _dir: dir, api }
    }

    async fn wait_for(api: &LocalAiApi, id: &str) -> GalleryOpStatus {
        for _ in 0..200 {
            if let Some(status) = api.operation_status(id) {
                if status.processed {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("operation {} never finished", id);
    }

    #[tokio::test]
    async fn test_missing_dirs_rejected_without_auto_create() {
        let dir = TempDir::new().unwrap();
        let config = ApplicationConfig::new(dir.path().join("m"), dir.path().join("b"));
        let err = LocalAiApi::new(config).await.unwrap_err();
        assert!(matches!(err, LocalAiError::Config { .. }));
    }

    #[tokio::test]
    async fn test_install_list_and_delete_inline_model() {
        let env = create_test_env(
            "- name: tiny\n  description: tiny test model\n  config_file: |\n    backend: llama-cpp\n",
        )
        .await;
        let api = &env.api;

        let listed = api.list_gallery_models(&GalleryQuery::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].metadata.installed);

        let id = api.apply_model("tiny", InstallRequest::default()).unwrap();
        let status = wait_for(api, &id).await;
        assert!(status.error.is_none(), "{:?}", status.error);
        assert_eq!(api.installed_models().await.unwrap(), vec!["tiny".to_string()]);
        assert_eq!(
            api.model_config("tiny").await.unwrap().backend.as_deref(),
            Some("llama-cpp")
        );

        let id = api.delete_model("tiny").unwrap();
        let status = wait_for(api, &id).await;
        assert!(status.deletion);
        assert!(api.installed_models().await.unwrap().is_empty());

        api.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_definition_and_p2p_disabled() {
        let env = create_test_env("[]\n").await;
        let api = &env.api;

        let model = GalleryModel {
            metadata: ElementMetadata {
                name: "custom".into(),
                ..Default::default()
            },
            config_file: Some(serde_yaml::from_str("backend: whisper").unwrap()),
            ..Default::default()
        };
        let id = api.apply_model_definition(model, InstallRequest::default()).unwrap();
        assert!(wait_for(api, &id).await.error.is_none());
        assert_eq!(api.installed_models().await.unwrap(), vec!["custom".to_string()]);

        assert!(!api.p2p_enabled());
        assert!(api.worker_nodes().is_empty());
        assert!(api.ledger_value("shared_state", "models").is_none());
        assert!(!api.expose_service("127.0.0.1", 50052, "worker"));
        assert!(api.apply_model("  ", InstallRequest::default()).is_err());

        api.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_file_outside_trusted_dirs_is_not_copied() {
        let env = create_test_env("- name: tiny\n  config_file: |\n    backend: llama-cpp\n").await;
        let api = &env.api;
        let outside = TempDir::new().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "top-secret").unwrap();

        let request = InstallRequest {
            files: vec![GalleryFile {
                filename: "leak".into(),
                uri: format!("file://{}", secret.display()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let id = api.apply_model("tiny", request).unwrap();
        let status = wait_for(api, &id).await;

        assert!(status.error.is_some());
        assert!(!api.config().models_path.join("leak").exists());

        api.shutdown().await;
    }
}
