//! Backend entries: install (including meta-backend resolution), uninstall
//! and enumeration of what is installed.

use super::{find_element, ElementMetadata, Gallery, GalleryElement, GalleryRef};
use crate::cancel::CancellationToken;
use crate::config::PathsConfig;
use crate::downloader::{Progress, Uri};
use crate::error::{LocalAiError, Result};
use crate::paths::{verify_path, write_atomic};
use crate::system::SystemState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A backend offered by a catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GalleryBackend {
    #[serde(flatten)]
    pub metadata: ElementMetadata,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
    /// Capability to concrete backend name, for meta-backends.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub capabilities: HashMap<String, String>,
}

impl GalleryBackend {
    /// A meta-backend has no payload of its own and resolves by capability.
    pub fn is_meta(&self) -> bool {
        self.uri.is_empty() && !self.capabilities.is_empty()
    }
}

impl GalleryElement for GalleryBackend {
    fn metadata(&self) -> &ElementMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ElementMetadata {
        &mut self.metadata
    }

    fn is_installed(&self, state: &SystemState) -> bool {
        let name = &self.metadata.name;
        if name.is_empty() {
            return false;
        }
        state.backends_path().join(name).is_dir()
            || state
                .backends_system_path()
                .map(|p| p.join(name).join(PathsConfig::RUN_FILE).exists())
                .unwrap_or(false)
    }
}

/// Contents of `<backend>/metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    /// Set on meta-backend directories: the concrete backend they stand for.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub meta_backend_for: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gallery_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub installed_at: String,
}

impl BackendMetadata {
    fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(PathsConfig::METADATA_FILE);
        match std::fs::read(&path) {
            Ok(body) => Ok(Some(serde_json::from_slice(&body).map_err(|e| {
                LocalAiError::Json {
                    message: format!("Failed to parse {}: {}", path.display(), e),
                    source: Some(e),
                }
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LocalAiError::io_with_path(e, path)),
        }
    }

    fn write(&self, dir: &Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        write_atomic(&dir.join(PathsConfig::METADATA_FILE), &body)
    }
}

/// An installed backend, addressable by name.
#[derive(Debug, Clone, Serialize)]
pub struct SystemBackend {
    pub name: String,
    pub run_file: PathBuf,
    pub is_meta: bool,
    /// Provided read-only by the host; cannot be uninstalled.
    pub is_system: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BackendMetadata>,
}

/// Installed backends by name. Concrete names, aliases and meta names all
/// appear as keys.
#[derive(Debug, Clone, Default)]
pub struct SystemBackends(BTreeMap<String, SystemBackend>);

impl SystemBackends {
    pub fn exists(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&SystemBackend> {
        self.0.get(name)
    }

    pub fn all(&self) -> Vec<&SystemBackend> {
        self.0.values().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SystemBackend)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn list_dirs(path: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Pick the alias candidate whose name carries the earliest preference token.
fn best_candidate<'a>(
    candidates: &'a [(String, PathBuf, BackendMetadata)],
    tokens: &[&str],
) -> Option<&'a (String, PathBuf, BackendMetadata)> {
    for token in tokens {
        if let Some(found) = candidates
            .iter()
            .find(|(name, _, _)| name.to_lowercase().contains(token))
        {
            return Some(found);
        }
    }
    candidates.first()
}

fn scan_backends(state: &SystemState) -> Result<SystemBackends> {
    let mut backends = BTreeMap::new();

    if let Some(system_path) = state.backends_system_path() {
        for dir in list_dirs(system_path) {
            let run_file = dir.join(PathsConfig::RUN_FILE);
            if run_file.exists() {
                let name = dir_name(&dir);
                backends.insert(
                    name.clone(),
                    SystemBackend {
                        name,
                        run_file,
                        is_meta: false,
                        is_system: true,
                        metadata: None,
                    },
                );
            }
        }
    }

    let backends_path = state.backends_path();
    let mut aliases: BTreeMap<String, Vec<(String, PathBuf, BackendMetadata)>> = BTreeMap::new();
    let mut metas = Vec::new();

    for dir in list_dirs(backends_path) {
        let name = dir_name(&dir);
        let run_file = dir.join(PathsConfig::RUN_FILE);

        let mut metadata = match BackendMetadata::read(&dir) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => BackendMetadata {
                name: name.clone(),
                ..Default::default()
            },
            Err(e) => {
                warn!(backend = %name, "Ignoring unreadable backend metadata: {}", e);
                BackendMetadata {
                    name: name.clone(),
                    ..Default::default()
                }
            }
        };
        if metadata.alias.is_empty() {
            if let Ok(alias) = std::fs::read_to_string(dir.join(PathsConfig::ALIAS_FILE)) {
                metadata.alias = alias.trim().to_string();
            }
        }

        if !metadata.meta_backend_for.is_empty() {
            metas.push(metadata);
            continue;
        }
        if !run_file.exists() {
            debug!(backend = %name, "Skipping directory without {}", PathsConfig::RUN_FILE);
            continue;
        }

        backends.entry(name.clone()).or_insert_with(|| SystemBackend {
            name: name.clone(),
            run_file: run_file.clone(),
            is_meta: false,
            is_system: false,
            metadata: Some(metadata.clone()),
        });
        if !metadata.alias.is_empty() {
            aliases
                .entry(metadata.alias.clone())
                .or_default()
                .push((name, run_file, metadata));
        }
    }

    let tokens = state.preference_tokens();
    for (alias, candidates) in &aliases {
        if backends.get(alias).map(|b| b.is_system).unwrap_or(false) {
            continue;
        }
        if let Some((name, run_file, metadata)) = best_candidate(candidates, tokens) {
            if candidates.len() > 1 {
                debug!(alias = %alias, "Alias resolves to {} among {} candidates", name, candidates.len());
            }
            backends.insert(
                alias.clone(),
                SystemBackend {
                    name: alias.clone(),
                    run_file: run_file.clone(),
                    is_meta: false,
                    is_system: false,
                    metadata: Some(metadata.clone()),
                },
            );
        }
    }

    for metadata in metas {
        let run_file = backends_path
            .join(&metadata.meta_backend_for)
            .join(PathsConfig::RUN_FILE);
        backends.insert(
            metadata.name.clone(),
            SystemBackend {
                name: metadata.name.clone(),
                run_file,
                is_meta: true,
                is_system: false,
                metadata: Some(metadata),
            },
        );
    }

    Ok(SystemBackends(backends))
}

impl Gallery {
    /// Every installed backend, with aliases resolved for this host.
    pub async fn list_system_backends(&self) -> Result<SystemBackends> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || scan_backends(&state))
            .await
            .map_err(|e| LocalAiError::Other(format!("Backend scan task failed: {}", e)))?
    }

    /// Install backend `name` from `galleries`.
    ///
    /// Meta-backends resolve to the concrete entry named for this host's
    /// capability (or `default`); that entry is installed, and a directory
    /// holding only `metadata.json` is created under the meta name. Without
    /// `force`, an already installed name is left alone.
    pub async fn install_backend_from_gallery(
        &self,
        galleries: &[GalleryRef],
        name: &str,
        force: bool,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(LocalAiError::Validation {
                field: "name".to_string(),
                message: "backend name is empty".to_string(),
            });
        }
        if !force && self.list_system_backends().await?.exists(name) {
            debug!(backend = %name, "Backend already installed");
            return Ok(());
        }

        let backends = self.available_backends(galleries).await?;
        let backend = find_element(&backends, name).ok_or_else(|| {
            LocalAiError::GalleryEntryNotFound {
                name: name.to_string(),
            }
        })?;

        if !backend.is_meta() {
            return self.install_backend(backend, progress, cancel).await;
        }

        let concrete_name = self.state.capability_value(&backend.capabilities).ok_or_else(|| {
            LocalAiError::UnresolvableMetaBackend {
                name: backend.metadata.name.clone(),
                capability: self.state.capability().to_string(),
            }
        })?;
        let concrete = find_element(&backends, concrete_name).ok_or_else(|| {
            LocalAiError::GalleryEntryNotFound {
                name: concrete_name.to_string(),
            }
        })?;
        info!(
            backend = %backend.metadata.name,
            capability = %self.state.capability(),
            "Meta backend resolves to {}",
            concrete.metadata.name
        );

        self.install_backend(concrete, progress, cancel).await?;

        let meta_dir = verify_path(&backend.metadata.name, self.state.backends_path())?;
        tokio::fs::create_dir_all(&meta_dir)
            .await
            .map_err(|e| LocalAiError::io("Failed to create meta backend directory", &meta_dir, e))?;
        BackendMetadata {
            name: backend.metadata.name.clone(),
            meta_backend_for: concrete.metadata.name.clone(),
            gallery_url: backend.metadata.gallery.url.clone(),
            installed_at: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        }
        .write(&meta_dir)
    }

    /// Materialize a concrete backend into `<backends>/<name>/`, trying
    /// mirrors in order when the primary URI fails.
    pub async fn install_backend(
        &self,
        backend: &GalleryBackend,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if backend.is_meta() {
            return Err(LocalAiError::Validation {
                field: "uri".to_string(),
                message: format!(
                    "meta backend {} cannot be installed directly",
                    backend.metadata.name
                ),
            });
        }
        let name = &backend.metadata.name;
        let backends_path = self.state.backends_path();
        let dir = verify_path(name, backends_path)?;
        let existed = dir.exists();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| LocalAiError::io("Failed to create backend directory", &dir, e))?;

        let sources = std::iter::once(&backend.uri)
            .chain(backend.mirrors.iter())
            .filter(|s| !s.is_empty());
        let mut last_error = None;
        let mut installed = false;
        for source in sources {
            match self
                .downloader
                .install_tree(&Uri::new(source.as_str()), &dir, progress, cancel)
                .await
            {
                Ok(()) => {
                    installed = true;
                    break;
                }
                Err(e) if e.is_cancelled() => {
                    last_error = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(backend = %name, "Failed to fetch backend from {}: {}", source, e);
                    last_error = Some(e);
                }
            }
        }

        if !installed {
            if !existed {
                let _ = tokio::fs::remove_dir_all(&dir).await;
            }
            return Err(last_error.unwrap_or_else(|| LocalAiError::Validation {
                field: "uri".to_string(),
                message: format!("backend {} declares no uri", name),
            }));
        }

        if !backend.alias.is_empty() {
            write_atomic(&dir.join(PathsConfig::ALIAS_FILE), backend.alias.as_bytes())?;
        }
        BackendMetadata {
            name: name.clone(),
            alias: backend.alias.clone(),
            gallery_url: backend.metadata.gallery.url.clone(),
            installed_at: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        }
        .write(&dir)?;

        info!(backend = %name, "Installed backend");
        Ok(())
    }

    /// Uninstall backend `name`, which may be a concrete name, an alias or a
    /// meta name (which also removes the concrete backend it points at).
    pub async fn delete_backend(&self, name: &str) -> Result<()> {
        let installed = self.list_system_backends().await?;
        let entry = installed
            .get(name)
            .ok_or_else(|| LocalAiError::BackendNotFound {
                name: name.to_string(),
            })?;
        if entry.is_system {
            return Err(LocalAiError::SystemBackend {
                name: name.to_string(),
            });
        }

        let backends_path = self.state.backends_path();
        let mut dir = verify_path(name, backends_path)?;
        if !dir.is_dir() {
            let by_alias = list_dirs(backends_path).into_iter().find(|candidate| {
                let alias = BackendMetadata::read(candidate)
                    .ok()
                    .flatten()
                    .map(|m| m.alias)
                    .filter(|a| !a.is_empty())
                    .or_else(|| {
                        std::fs::read_to_string(candidate.join(PathsConfig::ALIAS_FILE))
                            .ok()
                            .map(|a| a.trim().to_string())
                    });
                alias.as_deref() == Some(name)
            });
            dir = by_alias.ok_or_else(|| LocalAiError::BackendNotFound {
                name: name.to_string(),
            })?;
        }

        if let Some(metadata) = BackendMetadata::read(&dir)? {
            if !metadata.meta_backend_for.is_empty() {
                let concrete = verify_path(&metadata.meta_backend_for, backends_path)?;
                debug!(backend = %name, "Removing concrete backend {}", concrete.display());
                if concrete.is_dir() {
                    tokio::fs::remove_dir_all(&concrete)
                        .await
                        .map_err(|e| LocalAiError::io_with_path(e, &concrete))?;
                }
            }
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| LocalAiError::io_with_path(e, &dir))?;
        info!(backend = %name, "Deleted backend");
        Ok(())
    }
}
