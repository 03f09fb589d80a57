//! Source fetchers: materialize a codebase into the build root.
//!
//! Dispatch is a closed match over the four source kinds. Destination
//! directories are created as siblings under the build root; for git the
//! destination must not pre-exist and is removed first.

mod git;
mod local;

pub use git::fetch_git;
pub use local::copy_dir;

use crate::archive;
use crate::error::{KilnError, Result};
use crate::notify::BuildLogger;
use crate::spec::{Codebase, SourceKind};
use std::path::Path;
use tracing::instrument;

/// Fetch one codebase into `dest_dir`.
#[instrument(skip(codebase, logger), fields(name = %codebase.name, kind = ?codebase.source_kind))]
pub async fn fetch_codebase(
    codebase: &Codebase,
    dest_dir: &Path,
    logger: &BuildLogger,
) -> Result<()> {
    if let Some(parent) = dest_dir.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KilnError::io(parent, e))?;
    }

    match codebase.source_kind {
        SourceKind::Git => {
            // git clones into a fresh directory.
            if dest_dir.exists() {
                std::fs::remove_dir_all(dest_dir).map_err(|e| KilnError::io(dest_dir, e))?;
            }
            fetch_git(codebase, dest_dir, logger).await
        }
        SourceKind::Local => {
            std::fs::create_dir_all(dest_dir).map_err(|e| KilnError::io(dest_dir, e))?;
            let source = Path::new(&codebase.source);
            copy_dir(source, dest_dir).map_err(|e| match e {
                KilnError::IoError { path, source } => KilnError::FetchFailed {
                    codebase: codebase.name.clone(),
                    kind: crate::error::FetchErrorKind::Transport,
                    reason: format!("local copy failed at '{}': {}", path.display(), source),
                },
                other => other,
            })
        }
        SourceKind::Archive => {
            std::fs::create_dir_all(dest_dir).map_err(|e| KilnError::io(dest_dir, e))?;
            archive::extract_path(Path::new(&codebase.source), dest_dir)
        }
        SourceKind::Buffer => {
            if codebase.content.is_empty() {
                return Err(KilnError::InvalidSpec {
                    reason: format!("buffer codebase '{}' has empty content", codebase.name),
                });
            }
            std::fs::create_dir_all(dest_dir).map_err(|e| KilnError::io(dest_dir, e))?;
            archive::extract_buffer(&codebase.content, dest_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{BuildLogger, NullNotifier};
    use crate::spec::Codebase;
    use std::sync::Arc;

    fn logger() -> BuildLogger {
        BuildLogger::new("test", Arc::new(NullNotifier))
    }

    #[tokio::test]
    async fn test_buffer_fetch_extracts_tar() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "f.txt", &b"five!"[..]).unwrap();
        let content = builder.into_inner().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("app");
        let codebase = Codebase {
            name: "app".into(),
            source_kind: SourceKind::Buffer,
            content,
            ..Default::default()
        };
        fetch_codebase(&codebase, &dest, &logger()).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("f.txt")).unwrap(), "five!");
    }

    #[tokio::test]
    async fn test_empty_buffer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let codebase =
            Codebase { name: "app".into(), source_kind: SourceKind::Buffer, ..Default::default() };
        let err = fetch_codebase(&codebase, &dir.path().join("app"), &logger()).await.unwrap_err();
        assert!(matches!(err, KilnError::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn test_local_fetch_copies_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/x.txt"), "x").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("app");
        let codebase = Codebase {
            name: "app".into(),
            source_kind: SourceKind::Local,
            source: src.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        fetch_codebase(&codebase, &dest, &logger()).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("sub/x.txt")).unwrap(), "x");
    }
}
