//! Remote catalogs of installable models and backends.
//!
//! A [`Gallery`] reads catalog YAML through the [`Downloader`], matches
//! entries by name and materializes them under the models and backends
//! directories of the [`SystemState`]. It owns the on-disk layout of both.

mod backends;
mod catalog;
mod importer;
mod models;
mod search;

pub use backends::{
    BackendMetadata, GalleryBackend, SystemBackend, SystemBackends,
};
pub use importer::{import_model, import_model_with, ImportPreferences};
pub use models::{
    GalleryFile, GalleryModel, InstallOptions, InstallRequest, ModelConfig, ModelDefinition,
    ModelParameters, PromptTemplate,
};
pub use search::{find_element, paginate, search, sort_elements, SortField, SortOrder};

use crate::downloader::Downloader;
use crate::network::RetryConfig;
use crate::system::SystemState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A named remote catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GalleryRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

impl GalleryRef {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Fields shared by every catalog entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Populated when the catalog is loaded.
    #[serde(default)]
    pub gallery: GalleryRef,
    /// Computed at listing time.
    #[serde(default)]
    pub installed: bool,
}

impl ElementMetadata {
    /// `gallery@name`
    pub fn id(&self) -> String {
        format!("{}@{}", self.gallery.name, self.name)
    }
}

/// Behaviour common to models and backends in a catalog.
pub trait GalleryElement:
    Clone + serde::de::DeserializeOwned + Send + Sync + 'static
{
    fn metadata(&self) -> &ElementMetadata;
    fn metadata_mut(&mut self) -> &mut ElementMetadata;
    /// Whether this entry is materialized on this host.
    fn is_installed(&self, state: &SystemState) -> bool;

    fn name(&self) -> &str {
        &self.metadata().name
    }
}

/// Catalog reader and installer.
#[derive(Debug, Clone)]
pub struct Gallery {
    downloader: Downloader,
    state: Arc<SystemState>,
    retry: RetryConfig,
}

impl Gallery {
    pub fn new(downloader: Downloader, state: Arc<SystemState>) -> Self {
        Self {
            downloader,
            state,
            retry: RetryConfig::new()
                .with_max_attempts(crate::config::NetworkConfig::CATALOG_FETCH_ATTEMPTS),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn state(&self) -> &Arc<SystemState> {
        &self.state
    }
}
