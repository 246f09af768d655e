//! Tar and gzip utilities for backup archives.
//!
//! Archives are written straight to disk and read back entry by entry, so a
//! truncated or corrupted file surfaces as an integrity error instead of a
//! silently short listing.

use std::fs;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tokio::task::spawn_blocking;
use tracing::debug;

use crate::errors::DeployError;
use crate::filesys::file::PRIVATE_FILE_MODE;

/// Summary of a written archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub file_count: usize,
    pub size: u64,
}

/// A regular file stored in an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
}

/// Write every file under `src` into a gzip tar at `dest`, owner-only
pub async fn create_archive(src: &Path, dest: &Path) -> Result<ArchiveSummary, DeployError> {
    let src = src.to_owned();
    let dest = dest.to_owned();
    spawn_blocking(move || create_archive_sync(&src, &dest)).await?
}

/// List the regular files of an archive, reading every entry to its end
pub async fn list_archive(path: &Path) -> Result<Vec<ArchiveEntry>, DeployError> {
    let path = path.to_owned();
    spawn_blocking(move || {
        list_archive_sync(&path)
            .map_err(|e| DeployError::Integrity(format!("{}: {}", path.display(), e)))
    })
    .await?
}

/// Unpack an archive into `dest`, returning the relative paths of its files
pub async fn extract_archive(path: &Path, dest: &Path) -> Result<Vec<String>, DeployError> {
    let path = path.to_owned();
    let dest = dest.to_owned();
    spawn_blocking(move || {
        extract_archive_sync(&path, &dest)
            .map_err(|e| DeployError::Integrity(format!("{}: {}", path.display(), e)))
    })
    .await?
}

fn create_archive_sync(src: &Path, dest: &Path) -> Result<ArchiveSummary, DeployError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = fs::File::create(dest)?;
    set_private(dest)?;

    let mut file_count = 0;
    {
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        for path in walk_files(src)? {
            let relative = path
                .strip_prefix(src)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            builder.append_path_with_name(&path, relative)?;
            file_count += 1;
        }

        let encoder = builder.into_inner()?;
        let writer = encoder.finish()?;
        writer
            .into_inner()
            .map_err(|e| io::Error::other(e.to_string()))?
            .sync_all()?;
    }

    let size = fs::metadata(dest)?.len();
    debug!("Archived {} files from {} into {} ({} bytes)", file_count, src.display(), dest.display(), size);
    Ok(ArchiveSummary { file_count, size })
}

fn open_archive(path: &Path) -> io::Result<tar::Archive<GzDecoder<BufReader<fs::File>>>> {
    let file = fs::File::open(path)?;
    Ok(tar::Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn list_archive_sync(path: &Path) -> io::Result<Vec<ArchiveEntry>> {
    let mut archive = open_archive(path)?;
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let expected = entry.header().size()?;
        let read = io::copy(&mut entry, &mut io::sink())?;
        let entry_path = entry.path()?.to_string_lossy().into_owned();
        if read != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entry {} truncated: {} of {} bytes", entry_path, read, expected),
            ));
        }
        if entry.header().entry_type().is_file() {
            entries.push(ArchiveEntry {
                path: entry_path,
                size: expected,
            });
        }
    }

    // tar stops at its end marker; draining the decoder verifies the gzip trailer
    let mut decoder = archive.into_inner();
    io::copy(&mut decoder, &mut io::sink())?;

    Ok(entries)
}

fn extract_archive_sync(path: &Path, dest: &Path) -> io::Result<Vec<String>> {
    fs::create_dir_all(dest)?;
    let mut archive = open_archive(path)?;
    let mut files = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.to_string_lossy().into_owned();
        // `unpack_in` refuses paths escaping `dest`
        if entry.unpack_in(dest)? && entry.header().entry_type().is_file() {
            files.push(relative);
        }
    }

    let mut decoder = archive.into_inner();
    io::copy(&mut decoder, &mut io::sink())?;

    files.sort();
    debug!("Extracted {} files from {} into {}", files.len(), path.display(), dest.display());
    Ok(files)
}

/// Regular files under `root`, sorted, symlinks skipped
pub fn walk_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

fn set_private(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(PRIVATE_FILE_MODE))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Read a file inside an extracted tree as UTF-8
pub fn read_text(root: &Path, relative: &str) -> io::Result<String> {
    let mut content = String::new();
    fs::File::open(root.join(relative))?.read_to_string(&mut content)?;
    Ok(content)
}
