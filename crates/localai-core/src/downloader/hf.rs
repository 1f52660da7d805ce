//! HuggingFace Hub metadata: repository listings, file checksums, safety scan.

use crate::error::{LocalAiError, Result};
use crate::network::HttpClient;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// LFS pointer metadata of a repository file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LfsInfo {
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// One entry of a repository tree listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HfFile {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub lfs: Option<LfsInfo>,
}

impl HfFile {
    pub fn is_directory(&self) -> bool {
        self.kind == "directory"
    }

    /// SHA-256 of the content, tolerating the several places the Hub reports it.
    pub fn sha256(&self) -> Option<&str> {
        let lfs = self.lfs.as_ref();
        lfs.and_then(|l| l.sha256.as_deref())
            .or_else(|| lfs.and_then(|l| l.oid.as_deref()))
            .or(self.oid.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Result of the Hub's repository scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    #[serde(default)]
    pub has_unsafe_file: bool,
    #[serde(default, rename = "clamAVInfectedFiles")]
    pub clam_av_infected_files: Vec<String>,
    #[serde(default)]
    pub dangerous_pickles: Vec<String>,
}

/// Client for the Hub's `/api/models` endpoints.
#[derive(Debug, Clone)]
pub struct HfApi {
    http: HttpClient,
    endpoint: String,
}

impl HfApi {
    pub fn new(http: HttpClient, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn api_base(&self) -> String {
        format!("{}/api/models", self.endpoint)
    }

    /// Direct download URL of a repository file.
    pub fn file_url(&self, repository: &str, path: &str, reference: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint, repository, reference, path
        )
    }

    /// Every file of `repository` at `main`, directories expanded.
    pub async fn list_files(&self, repository: &str) -> Result<Vec<HfFile>> {
        self.list_dir(repository.to_string(), String::new()).await
    }

    fn list_dir(&self, repository: String, dir: String) -> BoxFuture<'_, Result<Vec<HfFile>>> {
        async move {
            let mut url = format!("{}/{}/tree/main", self.api_base(), repository);
            if !dir.is_empty() {
                url.push('/');
                url.push_str(&dir);
            }
            debug!("Listing {}", url);

            let body = self.http.get_bytes(&url).await?;
            let entries: Vec<HfFile> = serde_json::from_slice(&body)?;

            let mut files = Vec::new();
            for entry in entries {
                if entry.is_directory() {
                    files.extend(self.list_dir(repository.clone(), entry.path.clone()).await?);
                } else {
                    files.push(entry);
                }
            }
            Ok(files)
        }
        .boxed()
    }

    /// SHA-256 of one file, if the Hub reports one.
    pub async fn file_sha(&self, repository: &str, file: &str) -> Result<Option<String>> {
        let files = self.list_files(repository).await?;
        let entry = files
            .iter()
            .find(|f| f.path == file)
            .ok_or_else(|| LocalAiError::ModelNotFound {
                name: format!("{}/{}", repository, file),
            })?;
        Ok(entry.sha256().map(str::to_string))
    }

    /// Fetch the scan report of `repository`.
    pub async fn scan(&self, repository: &str) -> Result<ScanResult> {
        let url = format!("{}/{}/scan", self.api_base(), repository);
        let body = self.http.get_bytes(&url).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fail with [`LocalAiError::UnsafeFilesFound`] if the Hub flags `repository`.
    pub async fn safety_check(&self, repository: &str) -> Result<()> {
        let result = self.scan(repository).await?;
        if !result.has_unsafe_file {
            return Ok(());
        }

        let mut files = result.clam_av_infected_files;
        files.extend(result.dangerous_pickles);
        warn!("Repository {} flagged as unsafe: {:?}", repository, files);
        Err(LocalAiError::UnsafeFilesFound {
            repository: repository.to_string(),
            files,
        })
    }
}
