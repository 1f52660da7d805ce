//! Turn a bare URI into an installable gallery model.
//!
//! Supported inputs: a HuggingFace repository (`huggingface://owner/repo`),
//! a direct `.gguf` file under any fetchable scheme, and `ollama://` models.
//! All of them become llama.cpp models.

use super::{ElementMetadata, GalleryFile, GalleryModel};
use crate::downloader::hf::HfFile;
use crate::downloader::{Downloader, Uri, UriKind};
use crate::error::{LocalAiError, Result};
use crate::paths::sanitize_model_name;
use serde_yaml::{Mapping, Value};
use tracing::debug;

const GGUF_EXTENSION: &str = ".gguf";
const MMPROJ_MARKER: &str = "mmproj";
const MMPROJ_DIR: &str = "mmproj";
const IMPORT_BACKEND: &str = "llama-cpp";

/// Knobs for [`import_model_with`].
#[derive(Debug, Clone)]
pub struct ImportPreferences {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Quantisation markers tried in order when a repository has several GGUFs.
    pub quantizations: Vec<String>,
    pub mmproj_quantizations: Vec<String>,
}

impl Default for ImportPreferences {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            quantizations: vec!["q4_k_m".to_string()],
            mmproj_quantizations: vec!["fp16".to_string()],
        }
    }
}

/// [`import_model_with`] using default preferences.
pub async fn import_model(downloader: &Downloader, uri: &str) -> Result<GalleryModel> {
    import_model_with(downloader, uri, &ImportPreferences::default()).await
}

pub async fn import_model_with(
    downloader: &Downloader,
    uri: &str,
    preferences: &ImportPreferences,
) -> Result<GalleryModel> {
    let parsed = Uri::new(uri);
    let unsupported = || LocalAiError::UnsupportedUri {
        uri: uri.to_string(),
    };

    let (default_name, files) = match parsed.kind() {
        Some(UriKind::Ollama) => {
            let reference = uri.trim_start_matches("ollama://");
            let stem = sanitize_model_name(&reference.replace(':', "__"));
            let file = GalleryFile {
                filename: format!("{}{}", stem, GGUF_EXTENSION),
                sha256: String::new(),
                uri: uri.to_string(),
            };
            (stem, vec![file])
        }
        Some(UriKind::HuggingFace) => {
            let parts = parsed.huggingface_parts().ok_or_else(unsupported)?;
            match &parts.file {
                Some(file) if file.to_lowercase().ends_with(GGUF_EXTENSION) => {
                    let sha = match downloader.hf().file_sha(&parts.repository, file).await {
                        Ok(sha) => sha.unwrap_or_default(),
                        Err(e) => {
                            debug!("No checksum for {}: {}", uri, e);
                            String::new()
                        }
                    };
                    let filename = parsed.file_name().ok_or_else(unsupported)?;
                    (
                        file_stem(&filename),
                        vec![GalleryFile {
                            filename,
                            sha256: sha,
                            uri: uri.to_string(),
                        }],
                    )
                }
                Some(_) => return Err(unsupported()),
                None => {
                    let listing = downloader.hf().list_files(&parts.repository).await?;
                    let files = select_repository_files(&parts.repository, &listing, preferences)?;
                    let name = parts
                        .repository
                        .rsplit('/')
                        .next()
                        .unwrap_or(&parts.repository)
                        .to_string();
                    (name, files)
                }
            }
        }
        Some(UriKind::Oci) | None => return Err(unsupported()),
        Some(_) => {
            let filename = parsed
                .file_name()
                .filter(|f| f.to_lowercase().ends_with(GGUF_EXTENSION))
                .ok_or_else(unsupported)?;
            (
                file_stem(&filename),
                vec![GalleryFile {
                    filename,
                    sha256: String::new(),
                    uri: uri.to_string(),
                }],
            )
        }
    };

    let name = preferences.name.clone().unwrap_or(default_name);
    let description = preferences
        .description
        .clone()
        .unwrap_or_else(|| format!("Imported from {}", uri));
    debug!(model = %name, "Imported {} with {} files", uri, files.len());

    Ok(GalleryModel {
        metadata: ElementMetadata {
            name: name.clone(),
            description,
            urls: vec![uri.to_string()],
            ..Default::default()
        },
        config_file: Some(Value::Mapping(llama_cpp_config(&name, &files))),
        additional_files: files,
        ..Default::default()
    })
}

fn file_stem(filename: &str) -> String {
    std::path::Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string())
}

/// First entry matching the earliest marker in `markers`.
fn preferred<'a>(entries: &[&'a HfFile], markers: &[String]) -> Option<&'a HfFile> {
    markers.iter().find_map(|marker| {
        let marker = marker.to_lowercase();
        entries
            .iter()
            .find(|e| e.path.to_lowercase().contains(&marker))
            .copied()
    })
}

/// Choose the weights (and projector, if any) to install from a repository.
fn select_repository_files(
    repository: &str,
    listing: &[HfFile],
    preferences: &ImportPreferences,
) -> Result<Vec<GalleryFile>> {
    let to_file = |entry: &HfFile, filename: String| GalleryFile {
        filename,
        sha256: entry.sha256().unwrap_or_default().to_string(),
        uri: format!("huggingface://{}/{}", repository, entry.path),
    };

    let (projectors, weights_files): (Vec<&HfFile>, Vec<&HfFile>) = listing
        .iter()
        .filter(|e| e.path.to_lowercase().ends_with(GGUF_EXTENSION))
        .partition(|e| e.path.to_lowercase().contains(MMPROJ_MARKER));

    let weights = preferred(&weights_files, &preferences.quantizations)
        .or_else(|| weights_files.first().copied())
        .ok_or_else(|| LocalAiError::Validation {
            field: "uri".to_string(),
            message: format!("no GGUF files found in {}", repository),
        })?;
    let projector = preferred(&projectors, &preferences.mmproj_quantizations)
        .or_else(|| projectors.last().copied());

    let mut files = vec![to_file(weights, weights.file_name().to_string())];
    if let Some(projector) = projector {
        files.push(to_file(
            projector,
            format!("{}/{}", MMPROJ_DIR, projector.file_name()),
        ));
    }
    Ok(files)
}

fn llama_cpp_config(name: &str, files: &[GalleryFile]) -> Mapping {
    let mut parameters = Mapping::new();
    if let Some(weights) = files.first() {
        parameters.insert(Value::from("model"), Value::from(weights.filename.clone()));
    }

    let mut template = Mapping::new();
    template.insert(Value::from("use_tokenizer_template"), Value::from(true));

    let mut config = Mapping::new();
    config.insert(Value::from("name"), Value::from(name));
    config.insert(Value::from("backend"), Value::from(IMPORT_BACKEND));
    config.insert(Value::from("parameters"), Value::Mapping(parameters));
    config.insert(Value::from("template"), Value::Mapping(template));
    config.insert(
        Value::from("known_usecases"),
        Value::Sequence(vec![Value::from("chat")]),
    );
    if let Some(projector) = files
        .iter()
        .find(|f| f.filename.starts_with(&format!("{}/", MMPROJ_DIR)))
    {
        config.insert(Value::from("mmproj"), Value::from(projector.filename.clone()));
    }
    config
}
