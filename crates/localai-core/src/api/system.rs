//! Accessors and lifecycle.

use crate::config::ApplicationConfig;
use crate::gallery::Gallery;
use crate::runtime::ModelLoader;
use crate::services::GalleryService;
use crate::system::SystemState;
use crate::LocalAiApi;
use serde::Serialize;
use tracing::info;

/// Host facts shown by the system endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub gpu_vendor: String,
    pub vram_bytes: u64,
    pub capability: String,
    pub models_path: String,
    pub backends_path: String,
    pub p2p: bool,
}

impl LocalAiApi {
    pub fn config(&self) -> &ApplicationConfig {
        &self.inner.config
    }

    pub fn system_state(&self) -> &SystemState {
        &self.inner.system
    }

    pub fn system_info(&self) -> SystemInfo {
        let system = &self.inner.system;
        SystemInfo {
            os: system.os().to_string(),
            arch: system.arch().to_string(),
            gpu_vendor: system.gpu_vendor().as_str().to_string(),
            vram_bytes: system.vram_bytes(),
            capability: system.capability().to_string(),
            models_path: system.models_path().display().to_string(),
            backends_path: system.backends_path().display().to_string(),
            p2p: self.inner.p2p.is_some(),
        }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.inner.gallery
    }

    pub fn loader(&self) -> &ModelLoader {
        &self.inner.loader
    }

    pub fn gallery_service(&self) -> &GalleryService {
        &self.inner.service
    }

    /// Stop background tasks, leave the P2P network and stop every backend.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(network) = &self.inner.p2p {
            network.stop().await;
        }
        let tasks: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        futures::future::join_all(tasks).await;
        self.inner.loader.stop_all().await;
        info!("LocalAI core stopped");
    }
}
