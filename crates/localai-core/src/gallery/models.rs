//! Model entries: install, uninstall, installed listing.
//!
//! Installing a model materializes, under the models directory:
//!
//! - every declared file, checksummed;
//! - `<template>.tmpl` for each prompt template;
//! - `._gallery_<name>.yaml`, the record of what was installed;
//! - `<name>.yaml`, the runtime config, written last and atomically.
//!
//! A model is installed iff its `<name>.yaml` exists.

use super::{find_element, ElementMetadata, Gallery, GalleryElement, GalleryRef};
use crate::cancel::CancellationToken;
use crate::config::PathsConfig;
use crate::downloader::{Progress, Uri};
use crate::error::{LocalAiError, Result};
use crate::paths::{sanitize_model_name, verify_path, write_atomic};
use crate::system::SystemState;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A file to fetch into the models directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryFile {
    #[serde(default)]
    pub filename: String,
    #[serde(default, alias = "sha")]
    pub sha256: String,
    #[serde(default)]
    pub uri: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
}

/// The document a catalog entry's `url` points at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub icon: String,
    /// Base runtime config, as YAML text.
    #[serde(default)]
    pub config_file: String,
    #[serde(default)]
    pub files: Vec<GalleryFile>,
    #[serde(default)]
    pub prompt_templates: Vec<PromptTemplate>,
}

/// A model offered by a catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GalleryModel {
    #[serde(flatten)]
    pub metadata: ElementMetadata,
    /// Location of the [`ModelDefinition`]; empty when `config_file` is inline.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Inline base config, either a mapping or YAML text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<Value>,
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub overrides: Mapping,
    #[serde(default, rename = "files", skip_serializing_if = "Vec::is_empty")]
    pub additional_files: Vec<GalleryFile>,
}

impl GalleryElement for GalleryModel {
    fn metadata(&self) -> &ElementMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ElementMetadata {
        &mut self.metadata
    }

    fn is_installed(&self, state: &SystemState) -> bool {
        config_path(state.models_path(), &sanitize_model_name(&self.metadata.name)).exists()
    }
}

/// Prediction parameters of a model config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Weights file, relative to the models directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(flatten)]
    pub extra: Mapping,
}

/// The `<name>.yaml` runtime config of an installed model.
///
/// Only the fields the core acts on are typed; everything else round-trips
/// through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ModelParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_usecases: Vec<String>,
    /// Concurrent requests the backend accepts for this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    #[serde(flatten)]
    pub extra: Mapping,
}

impl ModelConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read(path).map_err(|e| LocalAiError::io_with_path(e, path))?;
        serde_yaml::from_slice(&body).map_err(|e| LocalAiError::Yaml {
            message: format!("Failed to parse {}: {}", path.display(), e),
            source: Some(e),
        })
    }

    /// Config of the installed model `name`.
    pub fn load_named(models_path: &Path, name: &str) -> Result<Self> {
        let path = config_path(models_path, &sanitize_model_name(name));
        if !path.exists() {
            return Err(LocalAiError::ModelNotFound {
                name: name.to_string(),
            });
        }
        let mut config = Self::load(&path)?;
        if config.name.is_empty() {
            config.name = name.to_string();
        }
        Ok(config)
    }

    /// Names of every installed model, sorted.
    pub fn list_installed(models_path: &Path) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(models_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LocalAiError::io_with_path(e, models_path)),
        };

        let mut names = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with('.') || !entry.path().is_file() {
                continue;
            }
            if let Some(stem) = file_name.strip_suffix(".yaml") {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn weights_file(&self) -> Option<&str> {
        self.parameters
            .as_ref()
            .map(|p| p.model.as_str())
            .filter(|m| !m.is_empty())
    }
}

/// Caller-supplied adjustments to a gallery install.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallRequest {
    /// Install under this name instead of the entry's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<GalleryFile>,
    /// Merged over the entry's own overrides.
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub overrides: Mapping,
}

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub enforce_scan: bool,
    /// When set, the backend a model config names is installed from these.
    pub backend_galleries: Option<Vec<GalleryRef>>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            enforce_scan: true,
            backend_galleries: None,
        }
    }
}

impl InstallOptions {
    pub fn with_scan(mut self, enforce: bool) -> Self {
        self.enforce_scan = enforce;
        self
    }

    pub fn with_backend_galleries(mut self, galleries: Vec<GalleryRef>) -> Self {
        self.backend_galleries = Some(galleries);
        self
    }
}

/// What `._gallery_<name>.yaml` holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InstallRecord {
    name: String,
    #[serde(default)]
    gallery: GalleryRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    url: String,
    /// Paths relative to the models directory.
    #[serde(default)]
    files: Vec<String>,
}

fn config_path(models_path: &Path, name: &str) -> PathBuf {
    models_path.join(format!("{}.yaml", name))
}

fn record_path(models_path: &Path, name: &str) -> PathBuf {
    models_path.join(format!("{}{}.yaml", PathsConfig::GALLERY_FILE_PREFIX, name))
}

/// Parse inline config that is either a mapping or YAML text.
fn config_mapping(value: &Value) -> Result<Mapping> {
    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(map) => Ok(map.clone()),
        Value::String(text) => parse_config_text(text),
        other => Err(LocalAiError::Validation {
            field: "config_file".to_string(),
            message: format!("expected a mapping or YAML text, got {:?}", other),
        }),
    }
}

fn parse_config_text(text: &str) -> Result<Mapping> {
    if text.trim().is_empty() {
        return Ok(Mapping::new());
    }
    match serde_yaml::from_str::<Value>(text)? {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(map) => Ok(map),
        _ => Err(LocalAiError::Validation {
            field: "config_file".to_string(),
            message: "config is not a mapping".to_string(),
        }),
    }
}

/// Recursively merge `overlay` into `base`; `overlay` wins on conflicts.
pub(crate) fn merge_mapping(base: &mut Mapping, overlay: &Mapping) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                merge_mapping(existing, incoming)
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

impl Gallery {
    /// Install the catalog entry `name` (or `gallery@name`) from `galleries`.
    pub async fn install_model_from_gallery(
        &self,
        galleries: &[GalleryRef],
        name: &str,
        request: &InstallRequest,
        options: &InstallOptions,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let models = self.available_models(galleries).await?;
        let model = find_element(&models, name).ok_or_else(|| {
            LocalAiError::GalleryEntryNotFound {
                name: name.to_string(),
            }
        })?;
        self.install_gallery_model(model, request, options, progress, cancel)
            .await
    }

    /// Install `model`. Either everything lands, or nothing new is left
    /// under the models directory apart from `.partial` files.
    pub async fn install_gallery_model(
        &self,
        model: &GalleryModel,
        request: &InstallRequest,
        options: &InstallOptions,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let models_path = self.state.models_path().to_path_buf();
        let raw_name = request
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&model.metadata.name);
        verify_path(format!("{}.yaml", raw_name), &models_path)?;
        let name = sanitize_model_name(raw_name);

        tokio::fs::create_dir_all(&models_path)
            .await
            .map_err(|e| LocalAiError::io("Failed to create models directory", &models_path, e))?;

        let definition = self.model_definition(model).await?;

        let mut files = definition.files.clone();
        files.extend(request.files.iter().cloned());
        files.extend(model.additional_files.iter().cloned());

        // Resolve every destination before touching the disk.
        let mut targets = Vec::with_capacity(files.len());
        for file in &files {
            let filename = if file.filename.is_empty() {
                Uri::new(file.uri.as_str())
                    .file_name()
                    .ok_or_else(|| LocalAiError::Validation {
                        field: "filename".to_string(),
                        message: format!("cannot derive a file name from {}", file.uri),
                    })?
            } else {
                file.filename.clone()
            };
            let destination = verify_path(&filename, &models_path)?;
            targets.push((filename, destination));
        }
        let mut template_targets = Vec::with_capacity(definition.prompt_templates.len());
        for template in &definition.prompt_templates {
            let filename = format!("{}.tmpl", template.name);
            let destination = verify_path(&filename, &models_path)?;
            template_targets.push((filename, destination));
        }

        if options.enforce_scan {
            self.scan_files(&files).await?;
        }

        let mut config = match &model.config_file {
            Some(inline) if model.url.is_empty() => config_mapping(inline)?,
            _ => parse_config_text(&definition.config_file)?,
        };
        merge_mapping(&mut config, &model.overrides);
        merge_mapping(&mut config, &request.overrides);
        config.insert(Value::from("name"), Value::from(name.clone()));

        let mut created: Vec<PathBuf> = Vec::new();
        let result = self
            .materialize_model(
                &name,
                model,
                &files,
                &targets,
                &definition.prompt_templates,
                &template_targets,
                &config,
                options,
                progress,
                cancel,
                &mut created,
            )
            .await;

        if let Err(e) = result {
            if !created.is_empty() {
                warn!(model = %name, "Install failed, removing {} new files", created.len());
                remove_files(&created).await;
            }
            return Err(e);
        }

        info!(model = %name, "Installed model");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn materialize_model(
        &self,
        name: &str,
        model: &GalleryModel,
        files: &[GalleryFile],
        targets: &[(String, PathBuf)],
        templates: &[PromptTemplate],
        template_targets: &[(String, PathBuf)],
        config: &Mapping,
        options: &InstallOptions,
        progress: &Progress,
        cancel: &CancellationToken,
        created: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let models_path = self.state.models_path();
        let count = files.len();

        for (index, (file, (filename, destination))) in files.iter().zip(targets).enumerate() {
            cancel.check()?;
            debug!(model = %name, "Fetching {} from {}", filename, file.uri);
            let existed = destination.exists();
            let sha = Some(file.sha256.as_str()).filter(|s| !s.is_empty());
            if !existed {
                // Registered up front so a failed download is cleaned up too.
                created.push(destination.clone());
            }
            self.downloader
                .download_file(
                    &Uri::new(file.uri.as_str()),
                    destination,
                    sha,
                    &progress.for_file(index, count),
                    cancel,
                )
                .await?;
        }

        for (template, (_, destination)) in templates.iter().zip(template_targets) {
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| LocalAiError::io("Failed to create directory", parent, e))?;
            }
            if !destination.exists() {
                created.push(destination.clone());
            }
            tokio::fs::write(destination, template.content.as_bytes())
                .await
                .map_err(|e| LocalAiError::io("Failed to write prompt template", destination, e))?;
            debug!(model = %name, "Prompt template {} written", template.name);
        }

        if let Some(galleries) = &options.backend_galleries {
            let backend = config
                .get("backend")
                .and_then(Value::as_str)
                .filter(|b| !b.is_empty());
            if let Some(backend) = backend {
                let installed = self.list_system_backends().await?;
                if !installed.exists(backend) {
                    info!(model = %name, backend = %backend, "Installing backend required by model");
                    self.install_backend_from_gallery(galleries, backend, false, progress, cancel)
                        .await?;
                }
            }
        }

        let record = InstallRecord {
            name: name.to_string(),
            gallery: model.metadata.gallery.clone(),
            url: model.url.clone(),
            files: targets
                .iter()
                .chain(template_targets)
                .map(|(filename, _)| filename.clone())
                .collect(),
        };
        let record_file = record_path(models_path, name);
        let record_body = serde_yaml::to_string(&record)?;
        if !record_file.exists() {
            created.push(record_file.clone());
        }
        write_atomic(&record_file, record_body.as_bytes())?;

        let config_file = config_path(models_path, name);
        let config_body = serde_yaml::to_string(config)?;
        cancel.check()?;
        write_atomic(&config_file, config_body.as_bytes())?;
        debug!(model = %name, "Written config file {}", config_file.display());
        Ok(())
    }

    async fn model_definition(&self, model: &GalleryModel) -> Result<ModelDefinition> {
        if model.url.is_empty() {
            return Ok(ModelDefinition {
                name: model.metadata.name.clone(),
                description: model.metadata.description.clone(),
                license: model.metadata.license.clone(),
                urls: model.metadata.urls.clone(),
                icon: model.metadata.icon.clone(),
                ..Default::default()
            });
        }

        let uri = Uri::new(model.url.as_str());
        let body = self.fetch_with_retry(&uri).await?;
        serde_yaml::from_slice(&body).map_err(|e| LocalAiError::Yaml {
            message: format!("Failed to parse model definition {}: {}", model.url, e),
            source: Some(e),
        })
    }

    /// Run the HuggingFace safety scan over every HF file of `model`.
    pub async fn safety_scan(&self, model: &GalleryModel) -> Result<()> {
        self.scan_files(&model.additional_files).await
    }

    async fn scan_files(&self, files: &[GalleryFile]) -> Result<()> {
        let repositories: BTreeSet<String> = files
            .iter()
            .filter_map(|f| Uri::new(f.uri.as_str()).huggingface_parts())
            .map(|parts| parts.repository)
            .collect();
        if repositories.is_empty() {
            return Ok(());
        }

        let hf = self.downloader.hf();
        for repository in repositories {
            match hf.safety_check(&repository).await {
                Ok(()) => debug!("Safety scan passed for {}", repository),
                Err(e @ LocalAiError::UnsafeFilesFound { .. }) => return Err(e),
                Err(e) => debug!("Safety scan unavailable for {}: {}", repository, e),
            }
        }
        Ok(())
    }

    /// Remove an installed model: its config, its install record and every
    /// file the record lists.
    pub async fn delete_model(&self, name: &str) -> Result<()> {
        let models_path = self.state.models_path();
        verify_path(format!("{}.yaml", name), models_path)?;
        let name = sanitize_model_name(name);

        let config_file = config_path(models_path, &name);
        let record_file = record_path(models_path, &name);
        if !config_file.exists() && !record_file.exists() {
            return Err(LocalAiError::ModelNotFound { name });
        }

        let mut to_remove = Vec::new();
        if record_file.exists() {
            match std::fs::read(&record_file)
                .map_err(LocalAiError::from)
                .and_then(|body| Ok(serde_yaml::from_slice::<InstallRecord>(&body)?))
            {
                Ok(record) => {
                    for file in &record.files {
                        match verify_path(file, models_path) {
                            Ok(path) => to_remove.push(path),
                            Err(e) => warn!(model = %name, "Not removing {}: {}", file, e),
                        }
                    }
                }
                Err(e) => warn!(model = %name, "Unreadable install record: {}", e),
            }
        }
        to_remove.push(config_file);
        to_remove.push(record_file);

        remove_files(&to_remove).await;
        info!(model = %name, "Deleted model");
        Ok(())
    }

    /// Names of installed models.
    pub fn installed_models(&self) -> Result<Vec<String>> {
        ModelConfig::list_installed(self.state.models_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{Downloader, Endpoints};
    use crate::error::ErrorKind;
    use crate::network::HttpClient;
    use crate::system::GpuVendor;
    use sha2::{Digest, Sha256};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct TestEnv {
        _dir: TempDir,
        root: PathBuf,
        models: PathBuf,
        gallery: Gallery,
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
        TestEnv {
            _dir: dir,
            root,
            models,
            gallery,
        }
    }

    fn source_file(env: &TestEnv, name: &str, content: &[u8]) -> (String, String) {
        let src = env.root.join("src");
        std::fs::create_dir_all(&src).unwrap();
        let path = src.join(name);
        std::fs::write(&path, content).unwrap();
        (
            format!("file://{}", path.display()),
            hex::encode(Sha256::digest(content)),
        )
    }

    fn entry(yaml: &str) -> GalleryModel {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_install_inline_config_with_overrides() {
        let env = create_test_env();
        let (uri, sha) = source_file(&env, "w.bin", b"weights");
        let mut model = entry(
            r#"
name: tiny
config_file: |
  backend: llama-cpp
  parameters:
    model: w.bin
    temperature: 0.2
  context_size: 512
overrides:
  context_size: 1024
  parameters:
    top_k: 40
"#,
        );
        model.additional_files.push(GalleryFile {
            filename: "w.bin".into(),
            sha256: sha,
            uri,
        });

        let mut request = InstallRequest::default();
        request
            .overrides
            .insert(Value::from("context_size"), Value::from(2048));

        env.gallery
            .install_gallery_model(
                &model,
                &request,
                &InstallOptions::default(),
                &Progress::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(env.models.join("w.bin")).unwrap(), b"weights");
        let config = ModelConfig::load_named(&env.models, "tiny").unwrap();
        assert_eq!(config.name, "tiny");
        assert_eq!(config.backend.as_deref(), Some("llama-cpp"));
        assert_eq!(config.weights_file(), Some("w.bin"));
        let params = config.parameters.unwrap();
        assert!(params.extra.contains_key("temperature"));
        assert!(params.extra.contains_key("top_k"));
        assert_eq!(config.extra.get("context_size").and_then(Value::as_u64), Some(2048));

        assert!(model.is_installed(env.gallery.state()));
        assert_eq!(env.gallery.installed_models().unwrap(), vec!["tiny"]);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let env = create_test_env();
        let model = entry("name: ../../../foo\nconfig_file: 'backend: x'\n");

        let err = env
            .gallery
            .install_gallery_model(
                &model,
                &InstallRequest::default(),
                &InstallOptions::default(),
                &Progress::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathEscape);
        assert!(!env.root.join("foo.yaml").exists());
        assert!(!env.models.exists() || std::fs::read_dir(&env.models).unwrap().count() == 0);
    }

    #[tokio::test]
    async fn test_escaping_file_name_rejected_before_download() {
        let env = create_test_env();
        let (uri, _) = source_file(&env, "w.bin", b"weights");
        let mut model = entry("name: ok\n");
        model.additional_files.push(GalleryFile {
            filename: "../outside.bin".into(),
            sha256: String::new(),
            uri,
        });

        let err = env
            .gallery
            .install_gallery_model(
                &model,
                &InstallRequest::default(),
                &InstallOptions::default(),
                &Progress::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathEscape);
        assert!(!env.root.join("outside.bin").exists());
    }

    #[tokio::test]
    async fn test_failed_install_leaves_nothing() {
        let env = create_test_env();
        let (good, good_sha) = source_file(&env, "a.bin", b"aaa");
        let (bad, _) = source_file(&env, "b.bin", b"bbb");
        let mut model = entry("name: broken\nconfig_file: 'backend: x'\n");
        model.additional_files = vec![
            GalleryFile {
                filename: "a.bin".into(),
                sha256: good_sha,
                uri: good,
            },
            GalleryFile {
                filename: "b.bin".into(),
                sha256: "0".repeat(64),
                uri: bad,
            },
        ];

        let err = env
            .gallery
            .install_gallery_model(
                &model,
                &InstallRequest::default(),
                &InstallOptions::default(),
                &Progress::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        let left: Vec<_> = std::fs::read_dir(&env.models)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !n.ends_with(".partial"))
            .collect();
        assert!(left.is_empty(), "unexpected files: {:?}", left);
    }

    #[tokio::test]
    async fn test_definition_from_url_and_delete() {
        let env = create_test_env();
        let (uri, sha) = source_file(&env, "m.gguf", b"gguf-bytes");
        let definition = format!(
            r#"
name: from-url
config_file: |
  backend: llama-cpp
  parameters:
    model: m.gguf
files:
  - filename: m.gguf
    sha256: {}
    uri: {}
prompt_templates:
  - name: chat
    content: "{{{{.Input}}}}"
"#,
            sha, uri
        );
        let def_path = env.root.join("def.yaml");
        std::fs::write(&def_path, definition).unwrap();
        let model = entry(&format!(
            "name: from-url\nurl: file://{}\n",
            def_path.display()
        ));

        env.gallery
            .install_gallery_model(
                &model,
                &InstallRequest {
                    name: Some("owner/renamed".into()),
                    ..Default::default()
                },
                &InstallOptions::default(),
                &Progress::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(env.models.join("owner__renamed.yaml").exists());
        assert!(env.models.join("._gallery_owner__renamed.yaml").exists());
        assert_eq!(
            std::fs::read_to_string(env.models.join("chat.tmpl")).unwrap(),
            "{{.Input}}"
        );

        env.gallery.delete_model("owner/renamed").await.unwrap();
        assert!(!env.models.join("owner__renamed.yaml").exists());
        assert!(!env.models.join("m.gguf").exists());
        assert!(!env.models.join("chat.tmpl").exists());
        assert!(!env.models.join("._gallery_owner__renamed.yaml").exists());

        let err = env.gallery.delete_model("owner/renamed").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_cancelled_install_creates_nothing() {
        let env = create_test_env();
        let (uri, _) = source_file(&env, "w.bin", b"weights");
        let mut model = entry("name: cancelled\n");
        model.additional_files.push(GalleryFile {
            filename: "w.bin".into(),
            sha256: String::new(),
            uri,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = env
            .gallery
            .install_gallery_model(
                &model,
                &InstallRequest::default(),
                &InstallOptions::default(),
                &Progress::none(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!env.models.join("cancelled.yaml").exists());
        assert!(!env.models.join("w.bin").exists());
    }

    #[test]
    fn test_merge_mapping_is_deep() {
        let mut base: Mapping = serde_yaml::from_str("a: 1\nb: {c: 2, d: 3}\n").unwrap();
        let overlay: Mapping = serde_yaml::from_str("b: {c: 20}\ne: 5\n").unwrap();
        merge_mapping(&mut base, &overlay);
        let expected: Mapping = serde_yaml::from_str("a: 1\nb: {c: 20, d: 3}\ne: 5\n").unwrap();
        assert_eq!(base, expected);
    }

    #[test]
    fn test_config_mapping_forms() {
        let text = Value::from("backend: whisper\n");
        assert_eq!(
            config_mapping(&text).unwrap().get("backend"),
            Some(&Value::from("whisper"))
        );
        assert!(config_mapping(&Value::Null).unwrap().is_empty());
        assert!(config_mapping(&Value::from(3)).is_err());
    }
}
