//! Error types for the LocalAI core.
//!
//! Every variant maps onto one of a small set of [`ErrorKind`]s so that callers
//! (the gallery worker, the HTTP surface, the P2P sync loop) can decide how to
//! react without matching on individual variants.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Gallery entry, installed model, backend or peer missing.
    NotFound,
    /// No online peer, backend absent, or a transient network failure.
    Unavailable,
    /// Checksum mismatch, malformed document, unsafe files.
    Corrupt,
    /// A destination path would leave its trusted base directory.
    PathEscape,
    /// The caller cancelled or a deadline expired.
    Cancelled,
    /// A backend subprocess exited unexpectedly.
    BackendDied,
    /// Everything else.
    Internal,
}

/// Main error type for the LocalAI core.
#[derive(Debug, Error)]
pub enum LocalAiError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Unsupported URI: {uri}")]
    UnsupportedUri { uri: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Path {path} escapes base directory {base}")]
    PathEscape { path: PathBuf, base: PathBuf },

    // Integrity errors
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Unsafe files found in {repository}: {files:?}")]
    UnsafeFilesFound {
        repository: String,
        files: Vec<String>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("YAML error: {message}")]
    Yaml {
        message: String,
        #[source]
        source: Option<serde_yaml::Error>,
    },

    // Gallery errors
    #[error("Gallery entry not found: {name}")]
    GalleryEntryNotFound { name: String },

    #[error("Model not found: {name}")]
    ModelNotFound { name: String },

    #[error("Backend not found: {name}")]
    BackendNotFound { name: String },

    #[error("No backend variant for capability {capability} in meta backend {name}")]
    UnresolvableMetaBackend { name: String, capability: String },

    #[error("Cannot delete system backend {name}")]
    SystemBackend { name: String },

    #[error("Operation {id} not found or already completed")]
    OperationNotFound { id: String },

    // Runtime errors
    #[error("Backend launch failed for {model}: {message}")]
    LaunchFailed { model: String, message: String },

    #[error("Backend for {model} died: {message}")]
    BackendDied { model: String, message: String },

    #[error("Backend for {model} is not running")]
    BackendUnavailable { model: String },

    // P2P errors
    #[error("No peers online for service {service_id}")]
    NoPeersOnline { service_id: String },

    #[error("Peer not found: {id}")]
    PeerNotFound { id: String },

    #[error("Invalid P2P token: {message}")]
    InvalidToken { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for LocalAI operations.
pub type Result<T> = std::result::Result<T, LocalAiError>;

impl From<std::io::Error> for LocalAiError {
    fn from(err: std::io::Error) -> Self {
        LocalAiError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LocalAiError {
    fn from(err: serde_json::Error) -> Self {
        LocalAiError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_yaml::Error> for LocalAiError {
    fn from(err: serde_yaml::Error) -> Self {
        LocalAiError::Yaml {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for LocalAiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LocalAiError::Timeout(std::time::Duration::from_secs(0))
        } else {
            LocalAiError::Network {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

impl LocalAiError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        LocalAiError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create an IO error with a message and path context.
    pub fn io(message: impl Into<String>, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        LocalAiError::Io {
            message: message.into(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LocalAiError::GalleryEntryNotFound { .. }
            | LocalAiError::ModelNotFound { .. }
            | LocalAiError::BackendNotFound { .. }
            | LocalAiError::OperationNotFound { .. }
            | LocalAiError::PeerNotFound { .. } => ErrorKind::NotFound,

            LocalAiError::Network { .. }
            | LocalAiError::Timeout(_)
            | LocalAiError::DownloadFailed { .. }
            | LocalAiError::NoPeersOnline { .. }
            | LocalAiError::BackendUnavailable { .. } => ErrorKind::Unavailable,

            LocalAiError::HashMismatch { .. }
            | LocalAiError::UnsafeFilesFound { .. }
            | LocalAiError::Json { .. }
            | LocalAiError::Yaml { .. } => ErrorKind::Corrupt,

            LocalAiError::PathEscape { .. } => ErrorKind::PathEscape,
            LocalAiError::Cancelled => ErrorKind::Cancelled,
            LocalAiError::BackendDied { .. } => ErrorKind::BackendDied,

            LocalAiError::Io { source, .. } => match source.as_ref().map(|e| e.kind()) {
                Some(std::io::ErrorKind::NotFound) => ErrorKind::NotFound,
                _ => ErrorKind::Internal,
            },

            _ => ErrorKind::Internal,
        }
    }

    /// HTTP status code used when this error crosses the server boundary.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Unavailable => 503,
            ErrorKind::Corrupt => 422,
            ErrorKind::PathEscape => 400,
            ErrorKind::Cancelled => 499,
            ErrorKind::BackendDied => 502,
            ErrorKind::Internal => match self {
                LocalAiError::Validation { .. }
                | LocalAiError::UnsupportedUri { .. }
                | LocalAiError::InvalidToken { .. } => 400,
                LocalAiError::SystemBackend { .. } => 403,
                _ => 500,
            },
        }
    }

    /// Check if this error should trigger a retry at a higher level.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    /// Check if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LocalAiError::ModelNotFound {
            name: "phi-2".into(),
        };
        assert_eq!(err.to_string(), "Model not found: phi-2");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            LocalAiError::HashMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .kind(),
            ErrorKind::Corrupt
        );
        assert_eq!(
            LocalAiError::PathEscape {
                path: "../x".into(),
                base: "/models".into()
            }
            .kind(),
            ErrorKind::PathEscape
        );
        assert_eq!(LocalAiError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            LocalAiError::NoPeersOnline {
                service_id: "worker".into()
            }
            .kind(),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn test_io_not_found_kind() {
        let err = LocalAiError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            LocalAiError::GalleryEntryNotFound { name: "x".into() }.http_status(),
            404
        );
        assert_eq!(
            LocalAiError::SystemBackend { name: "x".into() }.http_status(),
            403
        );
        assert_eq!(LocalAiError::Other("boom".into()).http_status(), 500);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(LocalAiError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(!LocalAiError::ModelNotFound { name: "x".into() }.is_retryable());
    }
}
