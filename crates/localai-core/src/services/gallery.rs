//! Background worker applying gallery operations one at a time.

use super::operation::{GalleryOp, GalleryOpStatus, OpAction, OpCache};
use crate::cancel::CancellationToken;
use crate::config::ApplicationConfig;
use crate::downloader::{format_bytes, DownloadStatus, Progress, Uri};
use crate::error::{LocalAiError, Result};
use crate::gallery::{
    import_model, ElementMetadata, Gallery, GalleryBackend, GalleryRef, InstallOptions,
};
use crate::runtime::ModelLoader;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const OPAQUE_ERROR: &str = "an error occurred";

/// Settings the worker applies to every operation.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    pub galleries: Vec<GalleryRef>,
    pub backend_galleries: Vec<GalleryRef>,
    pub enforce_safety_scan: bool,
    pub autoload_backend_galleries: bool,
    pub opaque_errors: bool,
}

impl ServiceOptions {
    pub fn from_config(config: &ApplicationConfig) -> Self {
        Self {
            galleries: config.galleries.clone(),
            backend_galleries: config.backend_galleries.clone(),
            enforce_safety_scan: config.enforce_safety_scan,
            autoload_backend_galleries: config.autoload_backend_galleries,
            opaque_errors: config.opaque_errors,
        }
    }

    fn install_options(&self) -> InstallOptions {
        let options = InstallOptions::default().with_scan(self.enforce_safety_scan);
        if self.autoload_backend_galleries {
            options.with_backend_galleries(self.backend_galleries.clone())
        } else {
            options
        }
    }
}

struct ServiceInner {
    gallery: Gallery,
    options: ServiceOptions,
    loader: Option<ModelLoader>,
    tx: mpsc::UnboundedSender<GalleryOp>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<GalleryOp>>>,
    statuses: Mutex<HashMap<String, GalleryOpStatus>>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
    root: CancellationToken,
    op_cache: OpCache,
}

/// Queue of model and backend installs and deletions.
///
/// Operations run in enqueue order on a single worker. Each one gets a
/// status entry that ends in a completed, error or cancelled state.
#[derive(Clone)]
pub struct GalleryService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for GalleryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GalleryService")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl GalleryService {
    /// Create the service. `loader` is told about backend changes and
    /// stops models before they are deleted.
    pub fn new(gallery: Gallery, options: ServiceOptions, loader: Option<ModelLoader>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ServiceInner {
                gallery,
                options,
                loader,
                tx,
                rx: Mutex::new(Some(rx)),
                statuses: Mutex::new(HashMap::new()),
                cancellations: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
                op_cache: OpCache::new(),
            }),
        }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.inner.gallery
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.inner.options
    }

    pub fn op_cache(&self) -> &OpCache {
        &self.inner.op_cache
    }

    /// Start the worker. It stops when `cancel` fires; running operations
    /// are cancelled with it.
    pub fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut rx = self
            .inner
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| LocalAiError::Other("gallery service already started".to_string()))?;

        let service = self.clone();
        Ok(tokio::spawn(async move {
            info!("Gallery service started");
            loop {
                let op = tokio::select! {
                    _ = cancel.cancelled() => break,
                    op = rx.recv() => match op {
                        Some(op) => op,
                        None => break,
                    },
                };
                service.process(op).await;
            }
            service.inner.root.cancel();
            info!("Gallery service stopped");
        }))
    }

    /// Queue `op` and return its id.
    pub fn enqueue(&self, op: GalleryOp) -> Result<String> {
        let id = op.id.clone();
        self.lock_cancellations()
            .insert(id.clone(), self.inner.root.child_token());
        if op.action.is_backend() {
            self.inner
                .op_cache
                .set_backend(op.gallery_element_name.clone(), id.clone());
        } else {
            self.inner.op_cache.set(op.gallery_element_name.clone(), id.clone());
        }

        debug!(op = %id, element = %op.gallery_element_name, "Queued gallery operation");
        if self.inner.tx.send(op).is_err() {
            self.lock_cancellations().remove(&id);
            self.inner.op_cache.delete_op(&id);
            return Err(LocalAiError::Other("gallery service is not running".to_string()));
        }
        Ok(id)
    }

    /// Latest status of `id`; `None` while it is still queued.
    pub fn status(&self, id: &str) -> Option<GalleryOpStatus> {
        self.lock_statuses().get(id).cloned()
    }

    pub fn all_statuses(&self) -> HashMap<String, GalleryOpStatus> {
        self.lock_statuses().clone()
    }

    /// Cancel a queued or running operation.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let mut statuses = self.lock_statuses();
        if statuses.get(id).is_some_and(|s| s.cancelled) {
            return Err(LocalAiError::Validation {
                field: "id".to_string(),
                message: format!("operation {} is already cancelled", id),
            });
        }

        let token = self
            .lock_cancellations()
            .remove(id)
            .ok_or_else(|| LocalAiError::OperationNotFound { id: id.to_string() })?;
        token.cancel();

        let element = statuses
            .get(id)
            .map(|s| s.gallery_element_name.clone())
            .unwrap_or_default();
        statuses.insert(id.to_string(), GalleryOpStatus::cancelled(id, &element));
        drop(statuses);

        self.inner.op_cache.delete_op(id);
        info!(op = %id, "Cancelled gallery operation");
        Ok(())
    }

    async fn process(&self, op: GalleryOp) {
        let token = self
            .lock_cancellations()
            .get(&op.id)
            .cloned()
            .filter(|t| !t.is_cancelled());
        let Some(token) = token else {
            self.set_status(GalleryOpStatus::cancelled(&op.id, &op.gallery_element_name));
            self.inner.op_cache.delete_op(&op.id);
            return;
        };

        let deletion = op.action.is_deletion();
        self.set_status(GalleryOpStatus {
            id: op.id.clone(),
            message: format!("processing {}", op.gallery_element_name),
            deletion,
            gallery_element_name: op.gallery_element_name.clone(),
            cancellable: true,
            ..Default::default()
        });

        let progress = self.progress_for(&op);
        let result = self.run(&op, &progress, &token).await;
        self.lock_cancellations().remove(&op.id);

        let status = match result {
            _ if token.is_cancelled() => {
                GalleryOpStatus::cancelled(&op.id, &op.gallery_element_name)
            }
            Err(e) if e.is_cancelled() => {
                GalleryOpStatus::cancelled(&op.id, &op.gallery_element_name)
            }
            Ok(()) => {
                info!(op = %op.id, element = %op.gallery_element_name, "Gallery operation completed");
                GalleryOpStatus {
                    id: op.id.clone(),
                    message: "completed".to_string(),
                    progress: 100.0,
                    processed: true,
                    deletion,
                    gallery_element_name: op.gallery_element_name.clone(),
                    ..Default::default()
                }
            }
            Err(e) => {
                warn!(op = %op.id, element = %op.gallery_element_name, "Gallery operation failed: {}", e);
                let (message, error) = if self.inner.options.opaque_errors {
                    (String::new(), OPAQUE_ERROR.to_string())
                } else {
                    (format!("error: {}", e), e.to_string())
                };
                GalleryOpStatus {
                    id: op.id.clone(),
                    message,
                    processed: true,
                    deletion,
                    error: Some(error),
                    gallery_element_name: op.gallery_element_name.clone(),
                    ..Default::default()
                }
            }
        };
        self.set_status(status);
        self.inner.op_cache.delete_op(&op.id);
    }

    async fn run(&self, op: &GalleryOp, progress: &Progress, cancel: &CancellationToken) -> Result<()> {
        let gallery = &self.inner.gallery;
        let options = &self.inner.options;
        let name = op.gallery_element_name.as_str();

        match &op.action {
            OpAction::InstallModel { request, model } => {
                let install = options.install_options();
                match model {
                    Some(model) => {
                        gallery
                            .install_gallery_model(model, request, &install, progress, cancel)
                            .await?
                    }
                    None if Uri::new(name).kind().is_some() => {
                        let model = import_model(gallery.downloader(), name).await?;
                        gallery
                            .install_gallery_model(&model, request, &install, progress, cancel)
                            .await?
                    }
                    None => {
                        gallery
                            .install_model_from_gallery(
                                &options.galleries,
                                name,
                                request,
                                &install,
                                progress,
                                cancel,
                            )
                            .await?
                    }
                }
                if options.autoload_backend_galleries {
                    self.refresh_backends().await;
                }
                Ok(())
            }
            OpAction::DeleteModel => {
                if let Some(loader) = &self.inner.loader {
                    match loader.shutdown_model(name).await {
                        Ok(()) | Err(LocalAiError::ModelNotFound { .. }) => {}
                        Err(e) => warn!(model = %name, "Failed to stop model before delete: {}", e),
                    }
                }
                gallery.delete_model(name).await
            }
            OpAction::InstallBackend { force } => {
                gallery
                    .install_backend_from_gallery(
                        &options.backend_galleries,
                        name,
                        *force,
                        progress,
                        cancel,
                    )
                    .await?;
                self.refresh_backends().await;
                Ok(())
            }
            OpAction::InstallBackendFromUri { uri, alias } => {
                let backend = GalleryBackend {
                    metadata: ElementMetadata {
                        name: name.to_string(),
                        ..Default::default()
                    },
                    uri: uri.clone(),
                    alias: alias.clone(),
                    ..Default::default()
                };
                gallery.install_backend(&backend, progress, cancel).await?;
                self.refresh_backends().await;
                Ok(())
            }
            OpAction::DeleteBackend => {
                gallery.delete_backend(name).await?;
                if let Some(loader) = &self.inner.loader {
                    loader.registry().unregister(name);
                }
                self.refresh_backends().await;
                Ok(())
            }
        }
    }

    /// Re-register installed backends with the runtime.
    async fn refresh_backends(&self) {
        let Some(loader) = &self.inner.loader else {
            return;
        };
        match self.inner.gallery.list_system_backends().await {
            Ok(backends) => loader.registry().register_system_backends(&backends),
            Err(e) => warn!("Failed to rescan backends: {}", e),
        }
    }

    fn progress_for(&self, op: &GalleryOp) -> Progress {
        let service = self.clone();
        let id = op.id.clone();
        let element = op.gallery_element_name.clone();
        let deletion = op.action.is_deletion();
        Progress::new(Arc::new(move |s: &DownloadStatus| {
            let total = format_bytes(s.total);
            let current = format_bytes(s.downloaded);
            let mut statuses = service.lock_statuses();
            if statuses.get(&id).is_some_and(|existing| existing.cancelled) {
                return;
            }
            statuses.insert(
                id.clone(),
                GalleryOpStatus {
                    id: id.clone(),
                    message: format!(
                        "processing file: {}. Total: {}. Current: {}",
                        s.file_name, total, current
                    ),
                    progress: s.percent,
                    file_size: total,
                    downloaded_size: current,
                    deletion,
                    file_name: s.file_name.clone(),
                    gallery_element_name: element.clone(),
                    cancellable: true,
                    ..Default::default()
                },
            );
        }))
    }

    fn set_status(&self, status: GalleryOpStatus) {
        self.lock_statuses().insert(status.id.clone(), status);
    }

    fn lock_statuses(&self) -> std::sync::MutexGuard<'_, HashMap<String, GalleryOpStatus>> {
        self.inner.statuses.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_cancellations(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.inner.cancellations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{Downloader, Endpoints};
    use crate::gallery::{GalleryModel, InstallRequest, ModelConfig};
    use crate::network::HttpClient;
    use crate::system::{GpuVendor, SystemState};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestEnv {
        _dir: TempDir,
        models: PathBuf,
        gallery: Gallery,
        galleries: Vec<GalleryRef>,
    }

    fn create_test_env() -> TestEnv {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let models = root.join("models");
        let state = SystemState::builder(&models, root.join("backends"))
            .gpu(GpuVendor::None, 0)
            .capability("default")
            .detect();
        let gallery = Gallery::new(
            Downloader::new(
                HttpClient::new().unwrap(),
                Endpoints::default().with_trusted_base(&root),
            ),
            Arc::new(state),
        );

        let weights = root.join("src").join("tiny.bin");
        std::fs::create_dir_all(weights.parent().unwrap()).unwrap();
        std::fs::write(&weights, b"tiny weights").unwrap();
        let index = root.join("index.yaml");
        std::fs::write(
            &index,
            format!(
                r#"
- name: tiny
  description: A tiny test model
  config_file: |
    backend: llama-cpp
    parameters:
      model: tiny.bin
  files:
    - filename: tiny.bin
      uri: file://{}
"#,
                weights.display()
            ),
        )
        .unwrap();

        TestEnv {
            galleries: vec![GalleryRef::new("local", format!("file://{}", index.display()))],
            _dir: dir,
            models,
            gallery,
        }
    }

    fn service(env: &TestEnv, opaque_errors: bool) -> GalleryService {
        GalleryService::new(
            env.gallery.clone(),
            ServiceOptions {
                galleries: env.galleries.clone(),
                enforce_safety_scan: false,
                opaque_errors,
                ..Default::default()
            },
            None,
        )
    }

    async fn wait_processed(service: &GalleryService, id: &str) -> GalleryOpStatus {
        for _ in 0..200 {
            if let Some(status) = service.status(id).filter(|s| s.processed) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("operation {} did not finish", id);
    }

    #[tokio::test]
    async fn test_install_then_delete() {
        let env = create_test_env();
        let service = service(&env, false);
        let cancel = CancellationToken::new();
        let worker = service.start(cancel.clone()).unwrap();

        let id = service
            .enqueue(GalleryOp::install_model("local@tiny", InstallRequest::default()))
            .unwrap();
        let status = wait_processed(&service, &id).await;
        assert_eq!(status.message, "completed");
        assert_eq!(status.progress, 100.0);
        assert!(status.error.is_none());
        assert_eq!(
            ModelConfig::load_named(&env.models, "tiny").unwrap().weights_file(),
            Some("tiny.bin")
        );
        assert!(!service.op_cache().exists("local@tiny"));

        let id = service.enqueue(GalleryOp::delete_model("tiny")).unwrap();
        let status = wait_processed(&service, &id).await;
        assert!(status.deletion);
        assert!(status.error.is_none(), "{:?}", status.error);
        assert!(!env.models.join("tiny.yaml").exists());
        assert!(!env.models.join("tiny.bin").exists());

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_are_reported_and_worker_continues() {
        let env = create_test_env();
        let service = service(&env, false);
        let cancel = CancellationToken::new();
        service.start(cancel.clone()).unwrap();

        let missing = service
            .enqueue(GalleryOp::install_model("does-not-exist", InstallRequest::default()))
            .unwrap();
        let ok = service
            .enqueue(GalleryOp::install_model("tiny", InstallRequest::default()))
            .unwrap();

        let status = wait_processed(&service, &missing).await;
        let error = status.error.unwrap();
        assert!(error.contains("does-not-exist"), "{}", error);
        assert!(status.message.starts_with("error: "));

        assert_eq!(wait_processed(&service, &ok).await.message, "completed");
        assert_eq!(service.all_statuses().len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_opaque_errors() {
        let env = create_test_env();
        let service = service(&env, true);
        let cancel = CancellationToken::new();
        service.start(cancel.clone()).unwrap();

        let id = service
            .enqueue(GalleryOp::install_model("does-not-exist", InstallRequest::default()))
            .unwrap();
        let status = wait_processed(&service, &id).await;
        assert_eq!(status.error.as_deref(), Some("an error occurred"));
        assert!(status.message.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_queued_operation() {
        let env = create_test_env();
        let service = service(&env, false);

        let id = service
            .enqueue(GalleryOp::install_model("tiny", InstallRequest::default()))
            .unwrap();
        assert!(service.op_cache().exists("tiny"));
        service.cancel(&id).unwrap();

        let err = service.cancel(&id).unwrap_err();
        assert!(matches!(err, LocalAiError::Validation { .. }));
        let err = service.cancel("unknown-op").unwrap_err();
        assert_eq!(err.http_status(), 404);

        let cancel = CancellationToken::new();
        service.start(cancel.clone()).unwrap();
        let status = wait_processed(&service, &id).await;
        assert!(status.cancelled);
        assert_eq!(status.message, "cancelled");
        assert!(!env.models.join("tiny.yaml").exists());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_install_direct_element() {
        let env = create_test_env();
        let service = service(&env, false);
        let cancel = CancellationToken::new();
        service.start(cancel.clone()).unwrap();

        let model: GalleryModel =
            serde_yaml::from_str("name: inline\nconfig_file: 'backend: whisper'\n").unwrap();
        let op = GalleryOp::new(
            "inline",
            OpAction::InstallModel {
                request: InstallRequest::default(),
                model: Some(Box::new(model)),
            },
        );
        let id = service.enqueue(op).unwrap();
        assert_eq!(wait_processed(&service, &id).await.message, "completed");
        assert_eq!(
            ModelConfig::load_named(&env.models, "inline").unwrap().backend.as_deref(),
            Some("whisper")
        );
        assert!(service.start(cancel.clone()).is_err());
        cancel.cancel();
    }
}
