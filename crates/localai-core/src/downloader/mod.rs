//! Fetching artifacts by URI.
//!
//! The [`Downloader`] resolves a [`Uri`] by scheme and streams its contents to
//! disk through a `.partial` file, verifying SHA-256 when one is declared.
//! Registry content (`oci://`, `ollama://`) goes through [`oci::OciClient`];
//! HuggingFace repository metadata through [`hf::HfApi`].

pub mod archive;
mod download;
pub mod hashing;
pub mod hf;
pub mod oci;
pub mod uri;

pub use download::{format_bytes, DownloadOutcome};
pub use uri::{Endpoints, HuggingFaceRef, Uri, UriKind};

use crate::cancel::CancellationToken;
use crate::error::{LocalAiError, Result};
use crate::network::HttpClient;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Progress of a single file within a (possibly multi-file) operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DownloadStatus {
    pub file_name: String,
    pub downloaded: u64,
    pub total: u64,
    /// Overall percentage across all files of the operation.
    pub percent: f64,
}

/// Progress callback.
pub type ProgressFn = Arc<dyn Fn(&DownloadStatus) + Send + Sync>;

/// Progress reporter scoped to one file of a multi-file operation.
#[derive(Clone, Default)]
pub struct Progress {
    callback: Option<ProgressFn>,
    file_index: usize,
    file_count: usize,
}

impl Progress {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(callback: ProgressFn) -> Self {
        Self {
            callback: Some(callback),
            file_index: 0,
            file_count: 1,
        }
    }

    /// Scope the reporter to file `index` of `count`.
    pub fn for_file(&self, index: usize, count: usize) -> Self {
        Self {
            callback: self.callback.clone(),
            file_index: index,
            file_count: count.max(1),
        }
    }

    /// Scale a per-file percentage onto the whole operation.
    pub fn overall_percent(&self, file_percent: f64) -> f64 {
        let count = self.file_count.max(1) as f64;
        (self.file_index as f64 * 100.0 + file_percent.clamp(0.0, 100.0)) / count
    }

    pub fn report(&self, file_name: &str, downloaded: u64, total: u64) {
        let Some(callback) = &self.callback else {
            return;
        };
        let file_percent = if total > 0 {
            downloaded as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        callback(&DownloadStatus {
            file_name: file_name.to_string(),
            downloaded,
            total,
            percent: self.overall_percent(file_percent),
        });
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("file_index", &self.file_index)
            .field("file_count", &self.file_count)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Scheme-aware fetcher shared by the gallery and the importer.
#[derive(Debug, Clone)]
pub struct Downloader {
    http: HttpClient,
    endpoints: Arc<Endpoints>,
}

impl Downloader {
    pub fn new(http: HttpClient, endpoints: Endpoints) -> Self {
        Self {
            http,
            endpoints: Arc::new(endpoints),
        }
    }

    /// Downloader against the public endpoints.
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::new(HttpClient::new()?, Endpoints::from_env()))
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn oci(&self) -> oci::OciClient {
        oci::OciClient::new(self.http.clone(), self.endpoints.clone())
    }

    pub fn hf(&self) -> hf::HfApi {
        hf::HfApi::new(self.http.clone(), &self.endpoints.huggingface)
    }

    /// Read a small document (catalog, config) fully into memory.
    pub async fn fetch_bytes(&self, uri: &Uri) -> Result<bytes::Bytes> {
        match uri.kind() {
            Some(UriKind::File) => {
                let path = uri.trusted_file_path(&self.endpoints)?;
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(|e| LocalAiError::io_with_path(e, &path))?;
                Ok(bytes::Bytes::from(data))
            }
            Some(UriKind::Oci | UriKind::Ollama) | None => Err(LocalAiError::UnsupportedUri {
                uri: uri.to_string(),
            }),
            Some(_) => {
                let url = uri.resolve_url(&self.endpoints)?;
                debug!("Fetching {}", url);
                self.http.get_bytes(&url).await
            }
        }
    }

    /// Materialize an OCI image or a local directory into `dest_dir`.
    pub async fn install_tree(
        &self,
        uri: &Uri,
        dest_dir: &Path,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match uri.kind() {
            Some(UriKind::Oci) => {
                let image = oci::ImageReference::parse(uri.as_str())?;
                self.oci()
                    .pull_and_extract(&image, dest_dir, progress, cancel)
                    .await
            }
            Some(UriKind::File) => {
                let source = uri.trusted_file_path(&self.endpoints)?;
                if source.is_dir() {
                    copy_dir(&source, dest_dir).await
                } else {
                    let dest = dest_dir.join(uri.file_name().unwrap_or_else(|| "payload".into()));
                    self.download_file(uri, &dest, None, progress, cancel)
                        .await
                        .map(|_| ())
                }
            }
            Some(_) => {
                let file_name = uri.file_name().ok_or_else(|| LocalAiError::UnsupportedUri {
                    uri: uri.to_string(),
                })?;
                self.download_file(uri, &dest_dir.join(file_name), None, progress, cancel)
                    .await
                    .map(|_| ())
            }
            None => Err(LocalAiError::UnsupportedUri {
                uri: uri.to_string(),
            }),
        }
    }
}

/// Recursively copy a directory tree.
pub async fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || copy_dir_blocking(&source, &dest))
        .await
        .map_err(|e| LocalAiError::Other(format!("Copy task failed: {}", e)))?
}

fn copy_dir_blocking(source: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(|e| LocalAiError::Other(format!("Walk failed: {}", e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| LocalAiError::Other(e.to_string()))?;
        let target: PathBuf = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| LocalAiError::io_with_path(e, &target))?;
        } else {
            std::fs::copy(entry.path(), &target)
                .map_err(|e| LocalAiError::io_with_path(e, &target))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_progress_scaling() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = Progress::new(Arc::new(move |s: &DownloadStatus| {
            sink.lock().unwrap().push(s.percent)
        }));

        progress.for_file(0, 2).report("a", 50, 100);
        progress.for_file(1, 2).report("b", 100, 100);
        progress.for_file(1, 2).report("b", 10, 0);

        assert_eq!(*seen.lock().unwrap(), vec![25.0, 100.0, 50.0]);
    }

    #[tokio::test]
    async fn test_copy_dir() {
        let src = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("lib")).unwrap();
        std::fs::write(src.path().join("run.sh"), "#!/bin/sh").unwrap();
        std::fs::write(src.path().join("lib/a.so"), "so").unwrap();

        let dest = tempfile::TempDir::new().unwrap();
        copy_dir(src.path(), &dest.path().join("backend")).await.unwrap();
        assert!(dest.path().join("backend/run.sh").exists());
        assert!(dest.path().join("backend/lib/a.so").exists());
    }

    #[tokio::test]
    async fn test_fetch_bytes_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.yaml"), "- name: a\n").unwrap();
        let downloader = Downloader::new(
            HttpClient::new().unwrap(),
            Endpoints::default().with_trusted_base(dir.path()),
        );

        let uri = Uri::new(format!("file://{}", dir.path().join("index.yaml").display()));
        let body = downloader.fetch_bytes(&uri).await.unwrap();
        assert_eq!(&body[..], b"- name: a\n");
    }

    #[tokio::test]
    async fn test_local_copy_is_staged_through_partial() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("src").join("weights.bin");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        let content: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &content).unwrap();

        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        let destination = models.join("weights.bin");
        let partial = models.join("weights.bin.partial");
        std::fs::write(&partial, &content[..1000]).unwrap();

        let downloader = Downloader::new(
            HttpClient::new().unwrap(),
            Endpoints::default().with_trusted_base(dir.path()),
        );
        let uri = Uri::new(format!("file://{}", source.display()));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = downloader
            .download_file(&uri, &destination, None, &Progress::none(), &cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, LocalAiError::Cancelled));
        assert!(!destination.exists());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = Progress::new(Arc::new(move |s: &DownloadStatus| {
            sink.lock().unwrap().push(s.downloaded)
        }));
        downloader
            .download_file(&uri, &destination, None, &progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), content);
        assert!(!partial.exists());
        assert_eq!(seen.lock().unwrap().last().copied(), Some(content.len() as u64));
    }

    #[tokio::test]
    async fn test_local_copy_checksum_mismatch_leaves_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("a.bin");
        std::fs::write(&source, b"abc").unwrap();
        let destination = dir.path().join("models").join("a.bin");
        let downloader = Downloader::new(
            HttpClient::new().unwrap(),
            Endpoints::default().with_trusted_base(dir.path()),
        );

        let err = downloader
            .download_file(
                &Uri::new(format!("file://{}", source.display())),
                &destination,
                Some(&"0".repeat(64)),
                &Progress::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LocalAiError::HashMismatch { .. }));
        assert!(!destination.exists());
        assert!(!dir.path().join("models").join("a.bin.partial").exists());
    }
}
