//! Path confinement helpers.
//!
//! Names coming from catalogs and API requests end up as file names under the
//! models directory. Every such name goes through [`verify_path`] first.

use crate::error::{LocalAiError, Result};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path, resolving `.` and `..` without touching the disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Join `relative` onto `base` and fail unless the result stays inside `base`.
///
/// Absolute `relative` paths are rejected as well.
pub fn verify_path(relative: impl AsRef<Path>, base: impl AsRef<Path>) -> Result<PathBuf> {
    let relative = relative.as_ref();
    let base = normalize(base.as_ref());

    if relative.is_absolute() {
        return Err(LocalAiError::PathEscape {
            path: relative.to_path_buf(),
            base,
        });
    }

    let joined = normalize(&base.join(relative));
    if joined == base || !joined.starts_with(&base) {
        return Err(LocalAiError::PathEscape {
            path: relative.to_path_buf(),
            base,
        });
    }
    Ok(joined)
}

/// Model names may contain `/` (e.g. `owner/model`); they are stored flat.
pub fn sanitize_model_name(name: &str) -> String {
    name.replace(['/', '\\'], "__")
}

/// Write `contents` to `path` through a synced temp file in the same directory
/// and an atomic rename, so readers never observe a torn file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| LocalAiError::io("Failed to create directory", parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| LocalAiError::io("Failed to create temp file", parent, e))?;
    temp.write_all(contents)
        .map_err(|e| LocalAiError::io("Failed to write temp file", temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| LocalAiError::io("Failed to sync temp file", temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| LocalAiError::io("Failed to move file into place", path, e.error))?;
    Ok(())
}
