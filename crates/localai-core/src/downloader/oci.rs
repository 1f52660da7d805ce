//! OCI registry (distribution v2) and Ollama registry access.
//!
//! Only what installing backends and Ollama models needs: manifest and blob
//! fetches with anonymous bearer negotiation or credentials from the docker
//! config, platform selection in manifest lists, and layer extraction with
//! whiteout handling.

use super::hashing::digests_match;
use super::{Endpoints, Progress};
use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{LocalAiError, Result};
use crate::network::HttpClient;
use crate::paths::verify_path;
use base64::Engine;
use flate2::read::GzDecoder;
use futures::StreamExt;
use reqwest::header::{self, HeaderName};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const OLLAMA_MODEL_MEDIA_TYPE: &str = "application/vnd.ollama.image.model";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// A parsed `oci://[registry/]repository[:tag|@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Tag or digest.
    pub reference: String,
}

impl ImageReference {
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw.strip_prefix(super::uri::OCI_PREFIX).unwrap_or(raw).trim();
        if rest.is_empty() {
            return Err(LocalAiError::UnsupportedUri {
                uri: raw.to_string(),
            });
        }

        let (name, reference) = if let Some((name, digest)) = rest.split_once('@') {
            (name, digest.to_string())
        } else {
            // A colon after the last slash separates the tag; earlier ones are ports.
            let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
            match rest[last_slash..].rfind(':') {
                Some(i) => (&rest[..last_slash + i], rest[last_slash + i + 1..].to_string()),
                None => (rest, "latest".to_string()),
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), remainder.to_string())
            }
            _ => {
                let repository = if name.contains('/') {
                    name.to_string()
                } else {
                    format!("library/{}", name)
                };
                (NetworkConfig::DOCKER_HUB_REGISTRY.to_string(), repository)
            }
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sep = if self.reference.starts_with("sha256:") { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

/// A parsed `ollama://[namespace/]name[:tag]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OllamaReference {
    pub repository: String,
    pub tag: String,
}

impl OllamaReference {
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw.strip_prefix(super::uri::OLLAMA_PREFIX).unwrap_or(raw).trim();
        let (name, tag) = match rest.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') && !tag.is_empty() => (name, tag),
            _ => (rest, "latest"),
        };
        if name.is_empty() {
            return Err(LocalAiError::UnsupportedUri {
                uri: raw.to_string(),
            });
        }
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };
        Ok(Self {
            repository,
            tag: tag.to_string(),
        })
    }
}

/// Location of an Ollama model blob.
#[derive(Debug, Clone)]
pub struct OllamaBlob {
    pub url: String,
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Vec<PlatformDescriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    media_type: String,
    digest: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformDescriptor {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry client for one pull.
#[derive(Debug, Clone)]
pub struct OciClient {
    http: HttpClient,
    endpoints: Arc<Endpoints>,
}

impl OciClient {
    pub fn new(http: HttpClient, endpoints: Arc<Endpoints>) -> Self {
        Self { http, endpoints }
    }

    fn base_url(&self, registry: &str) -> String {
        format!("{}://{}", self.endpoints.registry_scheme(registry), registry)
    }

    /// Pull `image` for the host platform and unpack its layers into `dest`.
    pub async fn pull_and_extract(
        &self,
        image: &ImageReference,
        dest: &Path,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let base = self.base_url(&image.registry);
        let mut session = RegistrySession::new(self.http.clone(), &image.registry, &image.repository);

        let manifest_url = format!("{}/v2/{}/manifests/{}", base, image.repository, image.reference);
        let mut manifest: Manifest = session.get_json(&manifest_url, MANIFEST_ACCEPT).await?;

        if !manifest.manifests.is_empty() {
            let digest = select_platform(&manifest.manifests).ok_or_else(|| {
                LocalAiError::DownloadFailed {
                    url: manifest_url.clone(),
                    message: "manifest list has no entries".into(),
                }
            })?;
            debug!("Selected platform manifest {} for {}", digest, image);
            let url = format!("{}/v2/{}/manifests/{}", base, image.repository, digest);
            manifest = session.get_json(&url, MANIFEST_ACCEPT).await?;
        }
        debug!(
            "Manifest for {} ({:?}) has {} layers",
            image,
            manifest.media_type,
            manifest.layers.len()
        );

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| LocalAiError::io_with_path(e, dest))?;

        let total: u64 = manifest.layers.iter().map(|l| l.size).sum();
        let label = image.to_string();
        let mut completed = 0u64;

        for layer in &manifest.layers {
            cancel.check()?;
            let blob_url = format!("{}/v2/{}/blobs/{}", base, image.repository, layer.digest);
            let staged = tempfile::NamedTempFile::new()
                .map_err(|e| LocalAiError::io("Failed to stage layer", dest, e))?;
            let staged_path = staged.path().to_path_buf();

            let fetched = session
                .fetch_blob(&blob_url, &staged_path, |bytes| {
                    progress.report(&label, completed + bytes, total)
                }, cancel)
                .await?;
            if !digests_match(&layer.digest, &fetched.digest) {
                return Err(LocalAiError::HashMismatch {
                    expected: layer.digest.clone(),
                    actual: fetched.digest,
                });
            }
            completed += fetched.size;

            let media_type = layer.media_type.clone();
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || apply_layer_file(&staged_path, &media_type, &dest))
                .await
                .map_err(|e| LocalAiError::Other(format!("Layer extraction task failed: {}", e)))??;
            drop(staged);
        }

        info!("Extracted {} into {}", image, dest.display());
        Ok(())
    }

    /// Resolve the model blob of an Ollama manifest.
    pub async fn ollama_blob(&self, reference: &OllamaReference) -> Result<OllamaBlob> {
        let base = self.endpoints.ollama_registry.trim_end_matches('/');
        let url = format!(
            "{}/v2/{}/manifests/{}",
            base, reference.repository, reference.tag
        );
        let response = self
            .http
            .get_with_headers(&url, &[(header::ACCEPT, DOCKER_MANIFEST_V2.to_string())])
            .await?;
        let response = HttpClient::ensure_success(response, &url)?;
        let manifest: Manifest = response.json().await?;

        let layer = manifest
            .layers
            .into_iter()
            .find(|l| l.media_type == OLLAMA_MODEL_MEDIA_TYPE)
            .ok_or_else(|| LocalAiError::DownloadFailed {
                url: url.clone(),
                message: "no model layer in manifest".into(),
            })?;

        Ok(OllamaBlob {
            url: format!("{}/v2/{}/blobs/{}", base, reference.repository, layer.digest),
            digest: layer.digest,
            size: layer.size,
        })
    }
}

struct FetchedBlob {
    digest: String,
    size: u64,
}

/// Carries the bearer token negotiated for one repository.
struct RegistrySession {
    http: HttpClient,
    registry: String,
    repository: String,
    token: Option<String>,
}

impl RegistrySession {
    fn new(http: HttpClient, registry: &str, repository: &str) -> Self {
        Self {
            http,
            registry: registry.to_string(),
            repository: repository.to_string(),
            token: None,
        }
    }

    fn headers(&self, accept: Option<&str>) -> Vec<(HeaderName, String)> {
        let mut headers = Vec::new();
        if let Some(accept) = accept {
            headers.push((header::ACCEPT, accept.to_string()));
        }
        if let Some(token) = &self.token {
            headers.push((header::AUTHORIZATION, format!("Bearer {}", token)));
        }
        headers
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&mut self, url: &str, accept: &str) -> Result<T> {
        let mut response = self.http.get_with_headers(url, &self.headers(Some(accept))).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.authenticate(&response).await?;
            response = self.http.get_with_headers(url, &self.headers(Some(accept))).await?;
        }
        let response = HttpClient::ensure_success(response, url)?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn authenticate(&mut self, challenge: &reqwest::Response) -> Result<()> {
        let header_value = challenge
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let params = parse_challenge(header_value);
        let Some(realm) = params.get("realm") else {
            return Err(LocalAiError::Network {
                message: format!("Registry {} requires auth without a bearer realm", self.registry),
                cause: None,
            });
        };

        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", self.repository));
        let mut token_url = url::Url::parse(realm).map_err(|e| LocalAiError::Network {
            message: format!("Invalid auth realm {}: {}", realm, e),
            cause: None,
        })?;
        {
            let mut query = token_url.query_pairs_mut();
            if let Some(service) = params.get("service") {
                query.append_pair("service", service);
            }
            query.append_pair("scope", &scope);
        }

        let mut headers = Vec::new();
        if let Some(basic) = docker_config_auth(&self.registry) {
            headers.push((header::AUTHORIZATION, format!("Basic {}", basic)));
        }
        let response = self.http.get_with_headers(token_url.as_str(), &headers).await?;
        let response = HttpClient::ensure_success(response, token_url.as_str())?;
        let token: TokenResponse = response.json().await?;
        self.token = token.token.or(token.access_token);
        debug!("Obtained registry token for {}", self.registry);
        Ok(())
    }

    async fn fetch_blob(
        &mut self,
        url: &str,
        target: &Path,
        mut on_bytes: impl FnMut(u64),
        cancel: &CancellationToken,
    ) -> Result<FetchedBlob> {
        let response = cancel
            .run(self.http.get_stream(url, 0, &self.headers(None)))
            .await??;
        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| LocalAiError::io_with_path(e, target))?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LocalAiError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| LocalAiError::io_with_path(e, target))?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            on_bytes(size);
        }
        file.flush()
            .await
            .map_err(|e| LocalAiError::io_with_path(e, target))?;

        Ok(FetchedBlob {
            digest: format!("sha256:{}", hex::encode(hasher.finalize())),
            size,
        })
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn parse_challenge(value: &str) -> HashMap<String, String> {
    let params = value
        .trim()
        .strip_prefix("Bearer ")
        .or_else(|| value.trim().strip_prefix("bearer "))
        .unwrap_or_default();

    let mut out = HashMap::new();
    let mut rest = params;
    while let Some((key, after)) = rest.split_once('=') {
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.split_once('"') {
                Some((value, remainder)) => (value.to_string(), remainder),
                None => (quoted.to_string(), ""),
            },
            None => match after.split_once(',') {
                Some((value, remainder)) => (value.to_string(), remainder),
                None => (after.to_string(), ""),
            },
        };
        out.insert(key, value);
        rest = remainder;
    }
    out
}

/// Base64 `user:pass` for `registry` from `~/.docker/config.json`.
fn docker_config_auth(registry: &str) -> Option<String> {
    let path = std::env::var_os("DOCKER_CONFIG")
        .map(std::path::PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".docker")))?
        .join("config.json");
    let contents = std::fs::read_to_string(path).ok()?;
    let config: serde_json::Value = serde_json::from_str(&contents).ok()?;
    let auths = config.get("auths")?.as_object()?;

    let candidates = [
        registry.to_string(),
        format!("https://{}", registry),
        if registry == NetworkConfig::DOCKER_HUB_REGISTRY {
            "https://index.docker.io/v1/".to_string()
        } else {
            String::new()
        },
    ];
    candidates.iter().filter(|c| !c.is_empty()).find_map(|c| {
        let entry = auths.get(c)?;
        if let Some(auth) = entry.get("auth").and_then(|a| a.as_str()) {
            return Some(auth.to_string());
        }
        let user = entry.get("username")?.as_str()?;
        let pass = entry.get("password")?.as_str()?;
        Some(base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass)))
    })
}

fn host_platform() -> (&'static str, &'static str) {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    (os, arch)
}

fn select_platform(manifests: &[PlatformDescriptor]) -> Option<String> {
    let (os, arch) = host_platform();
    let matches = |want_os: &str| {
        manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .map(|p| p.os == want_os && p.architecture == arch)
                .unwrap_or(false)
        })
    };
    matches(os)
        .or_else(|| matches("linux"))
        .or_else(|| manifests.first())
        .map(|m| m.digest.clone())
}

fn apply_layer_file(path: &Path, media_type: &str, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(path).map_err(|e| LocalAiError::io_with_path(e, path))?;
    if media_type.contains("zstd") {
        let decoder = zstd::stream::read::Decoder::new(file)
            .map_err(|e| LocalAiError::io("Failed to open zstd layer", path, e))?;
        apply_layer(decoder, dest)
    } else if media_type.contains("gzip") || media_type.ends_with(".tar.gz") {
        apply_layer(GzDecoder::new(file), dest)
    } else {
        apply_layer(file, dest)
    }
}

/// Unpack one image layer over `dest`, honouring whiteout entries.
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .map_err(|e| LocalAiError::io("Failed to read layer", dest, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| LocalAiError::io("Corrupt layer entry", dest, e))?;
        let entry_path = entry
            .path()
            .map(|p| p.into_owned())
            .map_err(|e| LocalAiError::io("Invalid layer entry path", dest, e))?;
        let file_name = entry_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = entry_path.parent().unwrap_or_else(|| Path::new(""));
        let parent_dir = if parent.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            verify_path(parent, dest)?
        };

        if file_name == OPAQUE_WHITEOUT {
            if let Ok(children) = std::fs::read_dir(&parent_dir) {
                for child in children.flatten() {
                    remove_any(&child.path());
                }
            }
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let target = verify_path(parent.join(hidden), dest)?;
            remove_any(&target);
            continue;
        }

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| LocalAiError::io("Failed to unpack layer entry", dest.join(&entry_path), e))?;
        if !unpacked {
            return Err(LocalAiError::PathEscape {
                path: entry_path,
                base: dest.to_path_buf(),
            });
        }
    }
    Ok(())
}

fn remove_any(path: &Path) {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = result {
        debug!("Failed to apply whiteout for {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_image_reference() {
        let r = ImageReference::parse("oci://quay.io/go-skynet/local-ai-backends:latest-cpu-llama-cpp")
            .unwrap();
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.repository, "go-skynet/local-ai-backends");
        assert_eq!(r.reference, "latest-cpu-llama-cpp");

        let r = ImageReference::parse("oci://ubuntu").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/ubuntu");
        assert_eq!(r.reference, "latest");

        let r = ImageReference::parse("oci://localhost:5000/backends/cpu").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "backends/cpu");
        assert_eq!(r.reference, "latest");

        let r = ImageReference::parse("oci://ghcr.io/a/b@sha256:abc").unwrap();
        assert_eq!(r.reference, "sha256:abc");
        assert_eq!(r.to_string(), "ghcr.io/a/b@sha256:abc");
    }

    #[test]
    fn test_parse_ollama_reference() {
        let r = OllamaReference::parse("ollama://gemma:2b").unwrap();
        assert_eq!(r.repository, "library/gemma");
        assert_eq!(r.tag, "2b");

        let r = OllamaReference::parse("ollama://mudler/tiny").unwrap();
        assert_eq!(r.repository, "mudler/tiny");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_parse_challenge() {
        let params = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/ubuntu:pull""#,
        );
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/ubuntu:pull");
    }

    fn layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_apply_layers_with_whiteouts() {
        let dest = TempDir::new().unwrap();
        apply_layer(
            &layer(&[("run.sh", b"v1"), ("old.txt", b"x"), ("cache/a", b"a")])[..],
            dest.path(),
        )
        .unwrap();
        apply_layer(
            &layer(&[("run.sh", b"v2"), (".wh.old.txt", b""), ("cache/.wh..wh..opq", b"")])[..],
            dest.path(),
        )
        .unwrap();

        assert_eq!(std::fs::read(dest.path().join("run.sh")).unwrap(), b"v2");
        assert!(!dest.path().join("old.txt").exists());
        assert!(dest.path().join("cache").exists());
        assert!(!dest.path().join("cache/a").exists());
    }
}
