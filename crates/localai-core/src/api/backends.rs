//! Backend methods.

use crate::api::models::GalleryQuery;
use crate::error::{LocalAiError, Result};
use crate::gallery::{GalleryBackend, SystemBackend};
use crate::services::{GalleryOp, OpAction};
use crate::LocalAiApi;

impl LocalAiApi {
    /// Backends offered by the configured backend galleries.
    pub async fn list_gallery_backends(&self, query: &GalleryQuery) -> Result<Vec<GalleryBackend>> {
        let backends = self
            .inner
            .gallery
            .available_backends(&self.inner.config.backend_galleries)
            .await?;
        Ok(query.apply(backends))
    }

    /// Installed backends, including system-provided ones.
    pub async fn installed_backends(&self) -> Result<Vec<SystemBackend>> {
        let backends = self.inner.gallery.list_system_backends().await?;
        Ok(backends.all().into_iter().cloned().collect())
    }

    /// Queue installation of gallery backend `name`.
    pub fn apply_backend(&self, name: &str, force: bool) -> Result<String> {
        self.inner
            .service
            .enqueue(GalleryOp::new(name, OpAction::InstallBackend { force }))
    }

    /// Queue installation of a backend straight from an OCI image, URL or
    /// directory, installed as `name`.
    pub fn apply_backend_uri(&self, name: &str, uri: &str, alias: &str) -> Result<String> {
        if name.trim().is_empty() || uri.trim().is_empty() {
            return Err(LocalAiError::Validation {
                field: "uri".to_string(),
                message: "backend name and uri are required".to_string(),
            });
        }
        self.inner.service.enqueue(GalleryOp::new(
            name,
            OpAction::InstallBackendFromUri {
                uri: uri.to_string(),
                alias: alias.to_string(),
            },
        ))
    }

    /// Queue deletion of installed backend `name`.
    pub fn delete_backend(&self, name: &str) -> Result<String> {
        self.inner.service.enqueue(GalleryOp::delete_backend(name))
    }

    /// Names the runtime can start, sorted.
    pub fn runnable_backends(&self) -> Vec<String> {
        self.inner.loader.registry().names()
    }
}
