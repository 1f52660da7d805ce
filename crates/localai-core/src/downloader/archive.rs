//! Archive detection and extraction.
//!
//! Extraction is blocking; callers run it through `spawn_blocking`.

use crate::error::{LocalAiError, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Archive formats recognised by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarZstd,
    Zip,
}

impl ArchiveFormat {
    /// Detect the format from a file name, case-insensitively.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tar.zstd") {
            Some(ArchiveFormat::TarZstd)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }
}

/// Extract `archive` into `dest`, refusing entries that would escape it.
pub fn extract(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| LocalAiError::io_with_path(e, dest))?;
    let file = File::open(archive).map_err(|e| LocalAiError::io_with_path(e, archive))?;
    debug!("Extracting {} into {}", archive.display(), dest.display());

    match format {
        ArchiveFormat::Tar => unpack_tar(file, dest),
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(file), dest),
        ArchiveFormat::TarZstd => {
            let decoder = zstd::stream::read::Decoder::new(file)
                .map_err(|e| LocalAiError::io("Failed to open zstd stream", archive, e))?;
            unpack_tar(decoder, dest)
        }
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(file).map_err(|e| LocalAiError::Other(format!(
                "Invalid zip archive {}: {}",
                archive.display(),
                e
            )))?;
            zip.extract(dest).map_err(|e| {
                LocalAiError::Other(format!("Failed to extract {}: {}", archive.display(), e))
            })
        }
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| LocalAiError::io("Failed to read tar entries", dest, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| LocalAiError::io("Corrupt tar entry", dest, e))?;
        let entry_path = entry
            .path()
            .map(|p| p.into_owned())
            .map_err(|e| LocalAiError::io("Invalid tar entry path", dest, e))?;

        // unpack_in returns false for entries outside dest
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| LocalAiError::io("Failed to unpack tar entry", dest.join(&entry_path), e))?;
        if !unpacked {
            return Err(LocalAiError::PathEscape {
                path: entry_path,
                base: dest.to_path_buf(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_tar_gz(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_detect() {
        assert_eq!(ArchiveFormat::detect(Path::new("a.TAR.GZ")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("a.tgz")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("a.tar.zst")), Some(ArchiveFormat::TarZstd));
        assert_eq!(ArchiveFormat::detect(Path::new("a.zip")), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect(Path::new("model.gguf")), None);
    }

    #[test]
    fn test_extract_tar_gz() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("backend.tar.gz");
        write_tar_gz(&archive, &[("run.sh", b"#!/bin/sh\n"), ("lib/libfoo.so", b"elf")]);

        let dest = dir.path().join("out");
        extract(&archive, ArchiveFormat::TarGz, &dest).unwrap();

        assert!(dest.join("run.sh").exists());
        assert_eq!(std::fs::read(dest.join("lib/libfoo.so")).unwrap(), b"elf");
    }

    #[test]
    fn test_extract_zip() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("weights.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file("tokenizer.json", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"{}").unwrap();
            zip.finish().unwrap();
        }

        extract(&archive, ArchiveFormat::Zip, dir.path()).unwrap();
        assert_eq!(std::fs::read(dir.path().join("tokenizer.json")).unwrap(), b"{}");
    }
}
