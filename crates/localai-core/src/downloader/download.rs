//! Streaming, resumable, checksummed file downloads.

use super::archive::{self, ArchiveFormat};
use super::hashing::{self, digests_match};
use super::{Downloader, Progress, Uri, UriKind};
use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{LocalAiError, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// What [`Downloader::download_file`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The destination already held the expected content.
    Skipped,
    /// Bytes were transferred; `resumed_from` is the size of the reused partial.
    Downloaded { bytes: u64, resumed_from: u64 },
}

/// Format a byte count as `1.5 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exp.min(5)];
    format!("{:.1} {}iB", bytes as f64 / div as f64, prefix)
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(NetworkConfig::PARTIAL_SUFFIX);
    PathBuf::from(name)
}

impl Downloader {
    /// Fetch `uri` into `destination`, verifying `sha256` when given.
    ///
    /// An existing destination with the right checksum (or any existing
    /// destination when no checksum is declared) is left alone. Interrupted
    /// transfers leave `<destination>.partial` behind and resume from it.
    pub async fn download_file(
        &self,
        uri: &Uri,
        destination: &Path,
        sha256: Option<&str>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let sha256 = sha256.map(str::trim).filter(|s| !s.is_empty());
        cancel.check()?;

        if destination.exists() {
            match sha256 {
                None => {
                    debug!("{} already exists, skipping download", destination.display());
                    return Ok(DownloadOutcome::Skipped);
                }
                Some(expected) => {
                    let actual = hashing::sha256_file(destination).await?;
                    if digests_match(expected, &actual) {
                        debug!("{} already present with matching SHA", destination.display());
                        return Ok(DownloadOutcome::Skipped);
                    }
                    warn!(
                        "SHA mismatch for existing {}, downloading again",
                        destination.display()
                    );
                    tokio::fs::remove_file(destination)
                        .await
                        .map_err(|e| LocalAiError::io_with_path(e, destination))?;
                }
            }
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LocalAiError::io("Failed to create directory", parent, e))?;
        }

        let outcome = match uri.kind() {
            Some(UriKind::File) => {
                self.copy_local(uri, destination, sha256, progress, cancel)
                    .await?
            }
            Some(UriKind::Ollama) => {
                let reference = super::oci::OllamaReference::parse(uri.as_str())?;
                let blob = self.oci().ollama_blob(&reference).await?;
                let declared = sha256.map(str::to_string).or(Some(blob.digest.clone()));
                self.fetch_http(&blob.url, destination, declared.as_deref(), progress, cancel)
                    .await?
            }
            Some(UriKind::Oci) | None => {
                return Err(LocalAiError::UnsupportedUri {
                    uri: uri.to_string(),
                })
            }
            Some(_) => {
                let url = uri.resolve_url(self.endpoints())?;
                self.fetch_http(&url, destination, sha256, progress, cancel)
                    .await?
            }
        };

        if let Some(format) = ArchiveFormat::detect(destination) {
            let archive_path = destination.to_path_buf();
            let parent = destination
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            tokio::task::spawn_blocking(move || archive::extract(&archive_path, format, &parent))
                .await
                .map_err(|e| LocalAiError::Other(format!("Extraction task failed: {}", e)))??;
        }

        Ok(outcome)
    }

    async fn copy_local(
        &self,
        uri: &Uri,
        destination: &Path,
        sha256: Option<&str>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let source = uri.trusted_file_path(self.endpoints())?;
        let file = tokio::fs::File::open(&source)
            .await
            .map_err(|e| LocalAiError::io("Failed to open local file", &source, e))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| LocalAiError::io("Failed to read local file", &source, e))?
            .len();

        let chunks = ReaderStream::new(file).map(|chunk| {
            chunk.map_err(|e| LocalAiError::io("Failed to read local file", &source, e))
        });
        Transfer::new(destination, 0, total, Sha256::new())
            .write(chunks, sha256, progress, cancel)
            .await
    }

    async fn fetch_http(
        &self,
        url: &str,
        destination: &Path,
        sha256: Option<&str>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let partial = partial_path(destination);

        let mut offset = match tokio::fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut response = cancel.run(self.http().get_stream(url, offset, &[])).await??;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!("Server rejected resume of {}, starting over", partial.display());
            let _ = tokio::fs::remove_file(&partial).await;
            offset = 0;
            response = cancel.run(self.http().get_stream(url, 0, &[])).await??;
        }
        if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            debug!("Server ignored range request for {}, starting over", url);
            offset = 0;
        }

        let hasher = if offset > 0 {
            info!("Resuming {} from {}", destination.display(), format_bytes(offset));
            let seed_path = partial.clone();
            tokio::task::spawn_blocking(move || -> Result<Sha256> {
                let mut hasher = Sha256::new();
                hashing::update_from_file(&mut hasher, &seed_path)?;
                Ok(hasher)
            })
            .await
            .map_err(|e| LocalAiError::Other(format!("Hashing task failed: {}", e)))??
        } else {
            Sha256::new()
        };

        let total = response.content_length().map(|len| len + offset).unwrap_or(0);
        let chunks = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| LocalAiError::Network {
                message: format!("Error reading download stream from {}: {}", url, e),
                cause: std::error::Error::source(&e).map(|s| s.to_string()),
            })
        });
        Transfer::new(destination, offset, total, hasher)
            .write(chunks, sha256, progress, cancel)
            .await
    }
}

/// One transfer into `<destination>.partial`, renamed into place once complete.
struct Transfer<'a> {
    destination: &'a Path,
    partial: PathBuf,
    file_name: String,
    /// Bytes already in the partial; the hasher has seen them.
    offset: u64,
    total: u64,
    hasher: Sha256,
}

impl<'a> Transfer<'a> {
    fn new(destination: &'a Path, offset: u64, total: u64, hasher: Sha256) -> Self {
        Self {
            destination,
            partial: partial_path(destination),
            file_name: destination
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            offset,
            total,
            hasher,
        }
    }

    async fn write<S>(
        mut self,
        chunks: S,
        sha256: Option<&str>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        let partial = &self.partial;
        let mut file = if self.offset > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(partial)
                .await
        } else {
            tokio::fs::File::create(partial).await
        }
        .map_err(|e| LocalAiError::io("Failed to open partial file", partial, e))?;

        let mut chunks = std::pin::pin!(chunks);
        let mut written = self.offset;
        let mut last_report = Instant::now();
        progress.report(&self.file_name, written, self.total);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = file.flush().await;
                    debug!("Transfer of {} cancelled, keeping partial", self.file_name);
                    return Err(LocalAiError::Cancelled);
                }
                chunk = chunks.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            file.write_all(&chunk)
                .await
                .map_err(|e| LocalAiError::io("Failed to write partial file", partial, e))?;
            self.hasher.update(&chunk);
            written += chunk.len() as u64;

            if last_report.elapsed() >= NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL {
                progress.report(&self.file_name, written, self.total);
                last_report = Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| LocalAiError::io("Failed to flush partial file", partial, e))?;
        file.sync_all()
            .await
            .map_err(|e| LocalAiError::io("Failed to sync partial file", partial, e))?;
        drop(file);

        let destination = self.destination;
        tokio::fs::rename(partial, destination)
            .await
            .map_err(|e| LocalAiError::io("Failed to move download into place", destination, e))?;
        progress.report(&self.file_name, written, self.total.max(written));

        let actual = hex::encode(self.hasher.finalize());
        if let Some(expected) = sha256 {
            if !digests_match(expected, &actual) {
                let _ = tokio::fs::remove_file(destination).await;
                return Err(LocalAiError::HashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        info!("Stored {} ({})", destination.display(), format_bytes(written));
        Ok(DownloadOutcome::Downloaded {
            bytes: written - self.offset,
            resumed_from: self.offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(1_572_864), "1.5 MiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/models/a.gguf")),
            PathBuf::from("/models/a.gguf.partial")
        );
    }
}
