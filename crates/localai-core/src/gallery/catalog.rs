//! Catalog loading.

use super::{Gallery, GalleryBackend, GalleryElement, GalleryModel, GalleryRef};
use crate::downloader::{Uri, UriKind};
use crate::error::{LocalAiError, Result};
use crate::fanout::fan_in;
use crate::network::retry_async;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

const REF_SUFFIX: &str = ".ref";

impl Gallery {
    /// Every model offered by `galleries`, with `installed` computed.
    pub async fn available_models(&self, galleries: &[GalleryRef]) -> Result<Vec<GalleryModel>> {
        self.load_elements(galleries).await
    }

    /// Every backend offered by `galleries`, with `installed` computed.
    pub async fn available_backends(
        &self,
        galleries: &[GalleryRef],
    ) -> Result<Vec<GalleryBackend>> {
        self.load_elements(galleries).await
    }

    /// Load and merge catalogs in gallery order.
    ///
    /// A gallery that fails to load is skipped with a warning as long as at
    /// least one other gallery loaded; otherwise the first error is returned.
    pub async fn load_elements<T: GalleryElement>(&self, galleries: &[GalleryRef]) -> Result<Vec<T>> {
        let catalogs = galleries
            .iter()
            .map(|gallery| self.catalog_stream::<T>(gallery))
            .collect::<Vec<_>>();
        let (loaded, mut errors) = fan_in(catalogs).await.into_flat();

        if !galleries.is_empty() && errors.len() == galleries.len() {
            if let Some((_, first)) = errors.drain(..).next() {
                return Err(first);
            }
        }
        for (index, error) in &errors {
            warn!(
                gallery = %galleries[*index].name,
                "Failed to load gallery: {}",
                error
            );
        }
        Ok(loaded)
    }

    /// The entries of one gallery; a load failure is the stream's only item.
    fn catalog_stream<'a, T: GalleryElement>(
        &'a self,
        gallery: &'a GalleryRef,
    ) -> BoxStream<'a, Result<T>> {
        stream::once(self.load_gallery::<T>(gallery))
            .flat_map(|loaded| match loaded {
                Ok(elements) => {
                    stream::iter(elements.into_iter().map(Ok::<T, LocalAiError>)).left_stream()
                }
                Err(e) => stream::iter(std::iter::once(Err(e))).right_stream(),
            })
            .boxed()
    }

    async fn load_gallery<T: GalleryElement>(&self, gallery: &GalleryRef) -> Result<Vec<T>> {
        let url = if gallery.url.ends_with(REF_SUFFIX) {
            self.follow_reference(&gallery.url).await?
        } else {
            gallery.url.clone()
        };
        let uri = Uri::new(url);
        debug!(gallery = %gallery.name, "Loading catalog from {}", uri);

        let mut elements: Vec<T> = match uri.kind() {
            Some(UriKind::File) if uri.file_path().map(|p| p.is_dir()).unwrap_or(false) => {
                let dir = uri.trusted_file_path(self.downloader.endpoints())?;
                load_catalog_dir(&dir).await?
            }
            _ => {
                let body = self.fetch_with_retry(&uri).await?;
                parse_catalog(&body, uri.as_str())?
            }
        };

        for element in &mut elements {
            element.metadata_mut().gallery = gallery.clone();
            let installed = element.is_installed(&self.state);
            element.metadata_mut().installed = installed;
        }
        Ok(elements)
    }

    /// A `.ref` file holds the location of the real catalog, relative to itself.
    async fn follow_reference(&self, url: &str) -> Result<String> {
        let body = self.fetch_with_retry(&Uri::new(url)).await?;
        let target = String::from_utf8_lossy(&body).trim().to_string();
        if target.is_empty() {
            return Err(LocalAiError::Config {
                message: format!("invalid reference file at url {}: empty body", url),
            });
        }
        if Uri::new(target.as_str()).kind().is_some() {
            return Ok(target);
        }
        let cut = url.rfind('/').map(|i| i + 1).unwrap_or(0);
        Ok(format!("{}{}", &url[..cut], target))
    }

    pub(super) async fn fetch_with_retry(&self, uri: &Uri) -> Result<bytes::Bytes> {
        let (result, stats) = retry_async(
            &self.retry,
            || self.downloader.fetch_bytes(uri),
            |e: &LocalAiError| e.is_retryable(),
        )
        .await;
        if stats.attempts > 1 {
            debug!("Fetched {} after {} attempts", uri, stats.attempts);
        }
        result
    }
}

/// Parse a catalog body: one or more YAML documents, each a list of entries
/// or a single entry. Malformed entries and documents are skipped.
pub(super) fn parse_catalog<T: GalleryElement>(body: &[u8], source: &str) -> Result<Vec<T>> {
    let mut elements = Vec::new();
    let mut first_error = None;

    for document in serde_yaml::Deserializer::from_slice(body) {
        let value = match serde_yaml::Value::deserialize(document) {
            Ok(value) => value,
            Err(e) => {
                warn!("Skipping malformed document in {}: {}", source, e);
                first_error.get_or_insert(e);
                break;
            }
        };

        let items = match value {
            serde_yaml::Value::Sequence(items) => items,
            serde_yaml::Value::Null => continue,
            other => vec![other],
        };
        for item in items {
            match serde_yaml::from_value::<T>(item) {
                Ok(element) if !element.name().is_empty() => elements.push(element),
                Ok(_) => debug!("Skipping unnamed entry in {}", source),
                Err(e) => warn!("Skipping malformed entry in {}: {}", source, e),
            }
        }
    }

    match first_error {
        Some(e) if elements.is_empty() => Err(e.into()),
        _ => Ok(elements),
    }
}

async fn load_catalog_dir<T: GalleryElement>(dir: &Path) -> Result<Vec<T>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| LocalAiError::io_with_path(e, dir))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| LocalAiError::io_with_path(e, dir))?
    {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false);
        if is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    let mut elements = Vec::new();
    for path in paths {
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                continue;
            }
        };
        match parse_catalog::<T>(&body, &path.display().to_string()) {
            Ok(parsed) => elements.extend(parsed),
            Err(e) => warn!("Skipping catalog document {}: {}", path.display(), e),
        }
    }
    Ok(elements)
}
