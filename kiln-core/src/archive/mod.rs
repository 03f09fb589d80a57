//! Archive engine: format detection and safe extraction.
//!
//! Formats are detected by magic bytes: `1F 8B` is a gzip-wrapped tar,
//! `50 4B 03 04` is a zip, anything else is treated as a plain tar. Every
//! entry path is sanitized before any write so that a crafted archive can
//! never place files outside the extraction root.

use crate::error::{KilnError, Result};
use flate2::read::GzDecoder;
use std::io::{Cursor, Read, Seek};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Detected archive format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

/// Detect the archive format from the first bytes of the payload.
pub fn detect_format(header: &[u8]) -> ArchiveFormat {
    if header.starts_with(&[0x1F, 0x8B]) {
        ArchiveFormat::TarGz
    } else if header.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
        ArchiveFormat::Zip
    } else {
        ArchiveFormat::Tar
    }
}

/// Extract an archive file into `dest_dir`, which must already exist.
pub fn extract_path(source: &Path, dest_dir: &Path) -> Result<()> {
    let data = std::fs::read(source).map_err(|e| KilnError::io(source, e))?;
    debug!(source = %source.display(), bytes = data.len(), "Extracting archive");
    extract_buffer(&data, dest_dir)
}

/// Extract an in-memory archive into `dest_dir`, which must already exist.
pub fn extract_buffer(data: &[u8], dest_dir: &Path) -> Result<()> {
    match detect_format(data) {
        ArchiveFormat::TarGz => extract_tar(GzDecoder::new(Cursor::new(data)), dest_dir),
        ArchiveFormat::Zip => extract_zip(Cursor::new(data), dest_dir),
        ArchiveFormat::Tar => extract_tar(Cursor::new(data), dest_dir),
    }
}

/// Resolve an archive entry path against the extraction root, rejecting any
/// path that would escape it. The check is lexical: absolute paths, prefix
/// components, and `..` segments that pop above the root are all refused.
pub fn sanitize_entry_path(root: &Path, entry: &Path) -> Result<PathBuf> {
    let mut depth: i32 = 0;
    let mut resolved = root.to_path_buf();

    for component in entry.components() {
        match component {
            Component::Normal(part) => {
                depth += 1;
                resolved.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(KilnError::PathTraversal {
                        entry: entry.to_string_lossy().to_string(),
                    });
                }
                resolved.pop();
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(KilnError::PathTraversal {
                    entry: entry.to_string_lossy().to_string(),
                });
            }
        }
    }

    Ok(resolved)
}

fn extract_tar<R: Read>(reader: R, dest_dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| KilnError::ExtractionFailed {
        reason: format!("cannot read tar entries: {}", e),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| KilnError::ExtractionFailed {
            reason: format!("error reading tar entry: {}", e),
        })?;

        let entry_path = entry
            .path()
            .map_err(|e| KilnError::ExtractionFailed {
                reason: format!("invalid tar entry path: {}", e),
            })?
            .into_owned();
        let target = sanitize_entry_path(dest_dir, &entry_path)?;
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target).map_err(|e| KilnError::io(&target, e))?;
                set_mode(&target, mode);
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| KilnError::io(parent, e))?;
                }
                let mut file =
                    std::fs::File::create(&target).map_err(|e| KilnError::io(&target, e))?;
                std::io::copy(&mut entry, &mut file).map_err(|e| {
                    KilnError::ExtractionFailed {
                        reason: format!("error writing '{}': {}", target.display(), e),
                    }
                })?;
                set_mode(&target, mode);
            }
            tar::EntryType::Symlink => {
                let link_target = entry
                    .link_name()
                    .map_err(|e| KilnError::ExtractionFailed {
                        reason: format!("invalid symlink entry: {}", e),
                    })?
                    .ok_or_else(|| KilnError::ExtractionFailed {
                        reason: format!("symlink entry '{}' has no target", entry_path.display()),
                    })?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| KilnError::io(parent, e))?;
                }
                // Recreate the link verbatim. Never dereference.
                make_symlink(&link_target, &target)?;
            }
            other => {
                // Hard links, devices and fifos are not materialized.
                warn!(
                    entry = %entry_path.display(),
                    kind = ?other,
                    "Skipping unsupported tar entry type"
                );
            }
        }
    }
    Ok(())
}

fn extract_zip<R: Read + Seek>(reader: R, dest_dir: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| KilnError::ExtractionFailed {
        reason: format!("cannot open zip: {}", e),
    })?;

    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(|e| KilnError::ExtractionFailed {
            reason: format!("cannot read zip entry {}: {}", index, e),
        })?;

        let entry_name = file.name().to_string();
        let target = sanitize_entry_path(dest_dir, Path::new(&entry_name))?;

        if file.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| KilnError::io(&target, e))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KilnError::io(parent, e))?;
        }
        let mut out = std::fs::File::create(&target).map_err(|e| KilnError::io(&target, e))?;
        std::io::copy(&mut file, &mut out).map_err(|e| KilnError::ExtractionFailed {
            reason: format!("error writing '{}': {}", target.display(), e),
        })?;
        if let Some(mode) = file.unix_mode() {
            set_mode(&target, mode);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| KilnError::io(link, e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> Result<()> {
    Err(KilnError::ExtractionFailed {
        reason: format!("symlinks unsupported on this platform: {}", link.display()),
    })
}
