//! SHA-256 helpers for verifying downloaded artifacts.

use crate::error::{LocalAiError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Chunk size for reading files (8MB).
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Feed the contents of `path` into `hasher`, returning the number of bytes read.
pub fn update_from_file(hasher: &mut Sha256, path: &Path) -> Result<u64> {
    let mut file = std::fs::File::open(path).map_err(|e| LocalAiError::io_with_path(e, path))?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| LocalAiError::io_with_path(e, path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok(total)
}

/// Compute the SHA-256 of a file as lowercase hex.
pub fn sha256_file_blocking(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    update_from_file(&mut hasher, path)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 of a file on the blocking pool.
pub async fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file_blocking(&path))
        .await
        .map_err(|e| LocalAiError::Other(format!("Hashing task failed: {}", e)))?
}

/// Compare hex digests ignoring case and an optional `sha256:` prefix.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    let strip = |s: &str| s.trim().trim_start_matches("sha256:").to_lowercase();
    strip(expected) == strip(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sha256_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let digest = sha256_file(&path).await.unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = sha256_file_blocking(Path::new("/nonexistent/file")).unwrap_err();
        assert!(matches!(err, LocalAiError::Io { path: Some(_), .. }));
    }

    #[test]
    fn test_digests_match() {
        assert!(digests_match("sha256:ABCDEF", "abcdef"));
        assert!(!digests_match("abc", "abd"));
    }
}
