//! Recursive local directory copy.
//!
//! Preserves file modes and recreates symbolic links instead of following
//! them, so a codebase copied from disk builds the same way it would in
//! place.

use crate::error::{KilnError, Result};
use std::path::Path;

/// Copy the contents of `source` into `dest`. `dest` must already exist.
pub fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    let metadata = std::fs::metadata(source).map_err(|e| KilnError::io(source, e))?;
    if !metadata.is_dir() {
        return Err(KilnError::FetchFailed {
            codebase: source.to_string_lossy().to_string(),
            kind: crate::error::FetchErrorKind::NotFound,
            reason: format!("source '{}' is not a directory", source.display()),
        });
    }

    for entry in std::fs::read_dir(source).map_err(|e| KilnError::io(source, e))? {
        let entry = entry.map_err(|e| KilnError::io(source, e))?;
        let source_path = entry.path();
        let dest_path = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| KilnError::io(&source_path, e))?;

        if file_type.is_symlink() {
            let target = std::fs::read_link(&source_path)
                .map_err(|e| KilnError::io(&source_path, e))?;
            make_symlink(&target, &dest_path)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&dest_path).map_err(|e| KilnError::io(&dest_path, e))?;
            copy_mode(&source_path, &dest_path);
            copy_dir(&source_path, &dest_path)?;
        } else {
            // fs::copy preserves permission bits.
            std::fs::copy(&source_path, &dest_path)
                .map_err(|e| KilnError::io(&dest_path, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_mode(source: &Path, dest: &Path) {
    if let Ok(metadata) = std::fs::metadata(source) {
        let _ = std::fs::set_permissions(dest, metadata.permissions());
    }
}

#[cfg(not(unix))]
fn copy_mode(_source: &Path, _dest: &Path) {}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| KilnError::io(link, e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> Result<()> {
    Err(KilnError::io(
        link,
        std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks unsupported"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_preserves_structure() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("a/b/file.txt"), "content").unwrap();
        std::fs::write(src.path().join("top.txt"), "top").unwrap();

        let dst = tempfile::tempdir().unwrap();
        copy_dir(src.path(), dst.path()).unwrap();

        assert_eq!(std::fs::read_to_string(dst.path().join("a/b/file.txt")).unwrap(), "content");
        assert_eq!(std::fs::read_to_string(dst.path().join("top.txt")).unwrap(), "top");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_preserves_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempfile::tempdir().unwrap();
        let script = src.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dst = tempfile::tempdir().unwrap();
        copy_dir(src.path(), dst.path()).unwrap();

        let mode = std::fs::metadata(dst.path().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_recreates_symlink() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("real.txt"), "real").unwrap();
        std::os::unix::fs::symlink("real.txt", src.path().join("link.txt")).unwrap();

        let dst = tempfile::tempdir().unwrap();
        copy_dir(src.path(), dst.path()).unwrap();

        let link = dst.path().join("link.txt");
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_link(&link).unwrap().to_str(), Some("real.txt"));
    }

    #[test]
    fn test_copy_missing_source() {
        let dst = tempfile::tempdir().unwrap();
        assert!(copy_dir(Path::new("/nonexistent-kiln-src"), dst.path()).is_err());
    }
}
