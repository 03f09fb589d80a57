//! Resource acquisition: HTTP downloads into the build root, with optional
//! in-place extraction.
//!
//! Non-2xx responses and transport errors are fatal to the build. Target
//! paths are sanitized against the build root before anything is written.

use crate::archive;
use crate::error::{KilnError, Result};
use crate::notify::BuildLogger;
use crate::spec::Resource;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

/// Download a resource into the build root. If `extract` is set, the
/// downloaded archive is expanded next to itself and then removed.
#[instrument(skip(http, resource, logger), fields(url = %resource.url))]
pub async fn acquire(
    http: &reqwest::Client,
    resource: &Resource,
    build_dir: &Path,
    timeout: Duration,
    logger: &BuildLogger,
) -> Result<()> {
    let target =
        archive::sanitize_entry_path(build_dir, Path::new(&resource.target_path))?;
    let target_dir = target.parent().unwrap_or(build_dir).to_path_buf();
    tokio::fs::create_dir_all(&target_dir)
        .await
        .map_err(|e| KilnError::io(&target_dir, e))?;

    logger.system(&format!("Downloading {} to {}", resource.url, resource.target_path));
    download(http, &resource.url, &target, timeout).await?;

    if resource.extract {
        logger.system(&format!("Extracting {}", resource.target_path));
        archive::extract_path(&target, &target_dir)?;
        tokio::fs::remove_file(&target).await.map_err(|e| KilnError::io(&target, e))?;
        logger.system(&format!("Extracted {} successfully", resource.target_path));
    }

    Ok(())
}

async fn download(
    http: &reqwest::Client,
    url: &str,
    target: &Path,
    timeout: Duration,
) -> Result<()> {
    let response = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| KilnError::ResourceFailed {
            url: url.to_string(),
            reason: format!("request failed: {}", e),
        })?;

    if !response.status().is_success() {
        return Err(KilnError::ResourceFailed {
            url: url.to_string(),
            reason: format!("download failed with status {}", response.status()),
        });
    }

    let mut file = tokio::fs::File::create(target)
        .await
        .map_err(|e| KilnError::io(target, e))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| KilnError::ResourceFailed {
            url: url.to_string(),
            reason: format!("stream error: {}", e),
        })?;
        file.write_all(&chunk).await.map_err(|e| KilnError::io(target, e))?;
    }
    file.flush().await.map_err(|e| KilnError::io(target, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{BuildLogger, NullNotifier};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_traversal_target_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let resource = Resource {
            url: "http://127.0.0.1:1/never-contacted".into(),
            target_path: "../outside.bin".into(),
            extract: false,
        };
        let logger = BuildLogger::new("b", Arc::new(NullNotifier));
        let err = acquire(
            &reqwest::Client::new(),
            &resource,
            dir.path(),
            Duration::from_secs(1),
            &logger,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KilnError::PathTraversal { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_resource_failure() {
        let dir = tempfile::tempdir().unwrap();
        let resource = Resource {
            url: "http://127.0.0.1:1/refused".into(),
            target_path: "file.bin".into(),
            extract: false,
        };
        let logger = BuildLogger::new("b", Arc::new(NullNotifier));
        let err = acquire(
            &reqwest::Client::new(),
            &resource,
            dir.path(),
            Duration::from_secs(1),
            &logger,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KilnError::ResourceFailed { .. }));
    }
}
