//! URI schemes understood by the downloader.
//!
//! `github:` and `huggingface://` forms are shorthands for HTTPS URLs and are
//! rewritten by [`Uri::resolve_url`]. `oci://` and `ollama://` name registry
//! content and are handled by [`super::oci`]. `file://` names a local path.

use crate::config::{EnvVars, NetworkConfig};
use crate::error::{LocalAiError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const HTTP_PREFIX: &str = "http://";
pub const HTTPS_PREFIX: &str = "https://";
pub const FILE_PREFIX: &str = "file://";
pub const GITHUB_PREFIX: &str = "github:";
pub const GITHUB_PREFIX_2: &str = "github://";
pub const HUGGINGFACE_PREFIX: &str = "huggingface://";
pub const HF_PREFIX: &str = "hf://";
pub const OCI_PREFIX: &str = "oci://";
pub const OLLAMA_PREFIX: &str = "ollama://";

/// The scheme family of a [`Uri`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
    Http,
    File,
    Github,
    HuggingFace,
    Oci,
    Ollama,
}

/// Hosts that shorthand URIs expand onto.
///
/// Overridable so tests can point every scheme at a local mock origin.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub huggingface: String,
    pub github_raw: String,
    /// Base URL of the Ollama registry, scheme included.
    pub ollama_registry: String,
    /// Registries contacted over plain HTTP in addition to localhost.
    pub insecure_registries: Vec<String>,
    /// `file://` URIs must resolve under one of these; empty means unrestricted.
    pub trusted_file_bases: Vec<PathBuf>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            huggingface: NetworkConfig::HUGGINGFACE_ENDPOINT.to_string(),
            github_raw: NetworkConfig::GITHUB_RAW_ENDPOINT.to_string(),
            ollama_registry: format!("https://{}", NetworkConfig::OLLAMA_REGISTRY),
            insecure_registries: Vec::new(),
            trusted_file_bases: Vec::new(),
        }
    }
}

impl Endpoints {
    /// Defaults, honouring `HF_ENDPOINT` when set.
    pub fn from_env() -> Self {
        let mut endpoints = Self::default();
        if let Ok(hf) = std::env::var(EnvVars::HF_ENDPOINT) {
            if !hf.trim().is_empty() {
                endpoints.huggingface = hf.trim().trim_end_matches('/').to_string();
            }
        }
        endpoints
    }

    /// Point every HTTP-based scheme at one origin.
    pub fn all_at(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            huggingface: base.clone(),
            github_raw: base.clone(),
            ollama_registry: base,
            insecure_registries: Vec::new(),
            trusted_file_bases: Vec::new(),
        }
    }

    pub fn with_trusted_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.trusted_file_bases.push(base.into());
        self
    }

    /// `http` for localhost and configured insecure registries, else `https`.
    pub fn registry_scheme(&self, host: &str) -> &'static str {
        let bare = host.split(':').next().unwrap_or(host);
        if bare == "localhost"
            || bare == "127.0.0.1"
            || self.insecure_registries.iter().any(|r| r == host)
        {
            "http"
        } else {
            "https"
        }
    }
}

/// An opaque artifact reference as written in catalogs and requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> Option<UriKind> {
        let s = self.0.as_str();
        if s.starts_with(HTTP_PREFIX) || s.starts_with(HTTPS_PREFIX) {
            Some(UriKind::Http)
        } else if s.starts_with(FILE_PREFIX) {
            Some(UriKind::File)
        } else if s.starts_with(HUGGINGFACE_PREFIX) || s.starts_with(HF_PREFIX) {
            Some(UriKind::HuggingFace)
        } else if s.starts_with(GITHUB_PREFIX) {
            Some(UriKind::Github)
        } else if s.starts_with(OCI_PREFIX) {
            Some(UriKind::Oci)
        } else if s.starts_with(OLLAMA_PREFIX) {
            Some(UriKind::Ollama)
        } else {
            None
        }
    }

    /// Whether the string is something the downloader can fetch over HTTP.
    pub fn looks_like_url(&self) -> bool {
        matches!(
            self.kind(),
            Some(UriKind::Http | UriKind::Github | UriKind::HuggingFace)
        )
    }

    pub fn is_oci(&self) -> bool {
        self.kind() == Some(UriKind::Oci)
    }

    pub fn is_ollama(&self) -> bool {
        self.kind() == Some(UriKind::Ollama)
    }

    /// Rewrite shorthand schemes into a fetchable URL.
    ///
    /// HTTP(S), `file://`, `oci://` and `ollama://` URIs are returned
    /// unchanged, so the function is idempotent.
    pub fn resolve_url(&self, endpoints: &Endpoints) -> Result<String> {
        match self.kind() {
            Some(UriKind::Github) => {
                let rest = self
                    .0
                    .strip_prefix(GITHUB_PREFIX_2)
                    .or_else(|| self.0.strip_prefix(GITHUB_PREFIX))
                    .unwrap_or_default();
                let (path, reference) = split_ref(rest);
                let mut parts = path.splitn(3, '/');
                let (Some(owner), Some(repo)) = (parts.next(), parts.next()) else {
                    return Err(self.unsupported());
                };
                let file = parts.next().unwrap_or_default();
                Ok(format!(
                    "{}/{}/{}/{}/{}",
                    endpoints.github_raw.trim_end_matches('/'),
                    owner,
                    repo,
                    reference,
                    file
                ))
            }
            Some(UriKind::HuggingFace) => {
                let parsed = self.huggingface_parts().ok_or_else(|| self.unsupported())?;
                let Some(file) = parsed.file else {
                    return Err(LocalAiError::UnsupportedUri {
                        uri: format!("{} (no file in repository URI)", self.0),
                    });
                };
                Ok(format!(
                    "{}/{}/resolve/{}/{}",
                    endpoints.huggingface.trim_end_matches('/'),
                    parsed.repository,
                    parsed.reference,
                    file
                ))
            }
            Some(_) => Ok(self.0.clone()),
            None => Err(self.unsupported()),
        }
    }

    /// Split a `huggingface://owner/repo[/file][@ref]` URI.
    pub fn huggingface_parts(&self) -> Option<HuggingFaceRef> {
        let rest = self
            .0
            .strip_prefix(HUGGINGFACE_PREFIX)
            .or_else(|| self.0.strip_prefix(HF_PREFIX))?;
        let (path, reference) = split_ref(rest);
        let mut parts = path.splitn(3, '/');
        let owner = parts.next().filter(|s| !s.is_empty())?;
        let repo = parts.next().filter(|s| !s.is_empty())?;
        let file = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        Some(HuggingFaceRef {
            repository: format!("{}/{}", owner, repo),
            file,
            reference: reference.to_string(),
        })
    }

    /// The local path of a `file://` URI.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.0.strip_prefix(FILE_PREFIX).map(PathBuf::from)
    }

    /// Resolve a `file://` URI through symlinks and check it against the trusted bases.
    ///
    /// With no trusted base configured every local path is rejected.
    pub fn trusted_file_path(&self, endpoints: &Endpoints) -> Result<PathBuf> {
        let raw = self.file_path().ok_or_else(|| self.unsupported())?;
        let resolved = raw
            .canonicalize()
            .map_err(|e| LocalAiError::io_with_path(e, &raw))?;

        let trusted = endpoints.trusted_file_bases.iter().any(|base| {
            base.canonicalize()
                .map(|base| resolved.starts_with(base))
                .unwrap_or(false)
        });
        if trusted {
            Ok(resolved)
        } else {
            Err(LocalAiError::PathEscape {
                path: resolved,
                base: endpoints
                    .trusted_file_bases
                    .first()
                    .cloned()
                    .unwrap_or_default(),
            })
        }
    }

    /// Last path segment, without query string or `@ref`.
    pub fn file_name(&self) -> Option<String> {
        let without_query = self.0.split(['?', '#']).next().unwrap_or_default();
        let (path, _) = match self.kind() {
            Some(UriKind::Github | UriKind::HuggingFace) => split_ref(without_query),
            _ => (without_query, ""),
        };
        Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
    }

    fn unsupported(&self) -> LocalAiError {
        LocalAiError::UnsupportedUri {
            uri: self.0.clone(),
        }
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(s: &str) -> Self {
        Uri::new(s)
    }
}

impl From<String> for Uri {
    fn from(s: String) -> Self {
        Uri::new(s)
    }
}

/// Parsed `huggingface://` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuggingFaceRef {
    /// `owner/repo`
    pub repository: String,
    /// Path inside the repository, if any.
    pub file: Option<String>,
    pub reference: String,
}

fn split_ref(s: &str) -> (&str, &str) {
    match s.rsplit_once('@') {
        Some((path, reference)) if !reference.is_empty() && !reference.contains('/') => {
            (path, reference)
        }
        _ => (s, "main"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_forms() {
        let endpoints = Endpoints::default();
        assert_eq!(
            Uri::new("github:mudler/LocalAI/gallery/index.yaml@master")
                .resolve_url(&endpoints)
                .unwrap(),
            "https://raw.githubusercontent.com/mudler/LocalAI/master/gallery/index.yaml"
        );
        assert_eq!(
            Uri::new("github://go-skynet/model-gallery/gpt4all-j.yaml")
                .resolve_url(&endpoints)
                .unwrap(),
            "https://raw.githubusercontent.com/go-skynet/model-gallery/main/gpt4all-j.yaml"
        );
    }

    #[test]
    fn test_huggingface_form() {
        let endpoints = Endpoints::default();
        assert_eq!(
            Uri::new("huggingface://TheBloke/Mixtral-8x7B-v0.1-GGUF/mixtral-8x7b-v0.1.Q2_K.gguf")
                .resolve_url(&endpoints)
                .unwrap(),
            "https://huggingface.co/TheBloke/Mixtral-8x7B-v0.1-GGUF/resolve/main/mixtral-8x7b-v0.1.Q2_K.gguf"
        );
        assert_eq!(
            Uri::new("huggingface://owner/repo/sub/file.bin@v2")
                .resolve_url(&endpoints)
                .unwrap(),
            "https://huggingface.co/owner/repo/resolve/v2/sub/file.bin"
        );
    }

    #[test]
    fn test_huggingface_repository_only() {
        let uri = Uri::new("huggingface://mudler/LocalAI-functioncall-qwen2.5-7b-v0.5-Q4_K_M-GGUF");
        let parts = uri.huggingface_parts().unwrap();
        assert_eq!(
            parts.repository,
            "mudler/LocalAI-functioncall-qwen2.5-7b-v0.5-Q4_K_M-GGUF"
        );
        assert!(parts.file.is_none());
        assert!(uri.resolve_url(&Endpoints::default()).is_err());
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let endpoints = Endpoints::default();
        for raw in [
            "https://example.com/model.bin",
            "github:mudler/LocalAI/gallery/index.yaml",
            "huggingface://a/b/c.gguf@dev",
            "oci://quay.io/go-skynet/local-ai-backends:latest-cpu",
            "ollama://gemma:2b",
        ] {
            let once = Uri::new(raw).resolve_url(&endpoints).unwrap();
            let twice = Uri::new(once.clone()).resolve_url(&endpoints).unwrap();
            assert_eq!(once, twice, "{}", raw);
        }
    }

    #[test]
    fn test_unknown_scheme() {
        let err = Uri::new("ftp://host/file").resolve_url(&Endpoints::default()).unwrap_err();
        assert!(matches!(err, LocalAiError::UnsupportedUri { .. }));
    }

    #[test]
    fn test_file_name() {
        assert_eq!(
            Uri::new("https://h/x/model.gguf?download=true").file_name().as_deref(),
            Some("model.gguf")
        );
        assert_eq!(
            Uri::new("huggingface://a/b/c.gguf@dev").file_name().as_deref(),
            Some("c.gguf")
        );
    }

    #[test]
    fn test_trusted_file_path() {
        let trusted = tempfile::TempDir::new().unwrap();
        let other = tempfile::TempDir::new().unwrap();
        std::fs::write(trusted.path().join("a.yaml"), "x").unwrap();
        std::fs::write(other.path().join("b.yaml"), "x").unwrap();
        let endpoints = Endpoints::default().with_trusted_base(trusted.path());

        let ok = Uri::new(format!("file://{}", trusted.path().join("a.yaml").display()));
        assert!(ok.trusted_file_path(&endpoints).is_ok());

        let outside = Uri::new(format!("file://{}", other.path().join("b.yaml").display()));
        assert!(matches!(
            outside.trusted_file_path(&endpoints),
            Err(LocalAiError::PathEscape { .. })
        ));
    }

    #[test]
    fn test_file_uri_rejected_without_trusted_base() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("secret.txt"), "top-secret").unwrap();
        let uri = Uri::new(format!("file://{}", dir.path().join("secret.txt").display()));

        assert!(matches!(
            uri.trusted_file_path(&Endpoints::default()),
            Err(LocalAiError::PathEscape { .. })
        ));
    }

    #[test]
    fn test_symlink_out_of_trusted_base_rejected() {
        let trusted = tempfile::TempDir::new().unwrap();
        let other = tempfile::TempDir::new().unwrap();
        std::fs::write(other.path().join("b.yaml"), "x").unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(other.path().join("b.yaml"), trusted.path().join("link.yaml"))
                .unwrap();
            let endpoints = Endpoints::default().with_trusted_base(trusted.path());
            let uri = Uri::new(format!("file://{}", trusted.path().join("link.yaml").display()));
            assert!(matches!(
                uri.trusted_file_path(&endpoints),
                Err(LocalAiError::PathEscape { .. })
            ));
        }
    }

    #[test]
    fn test_registry_scheme() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.registry_scheme("127.0.0.1:5000"), "http");
        assert_eq!(endpoints.registry_scheme("quay.io"), "https");
    }
}
