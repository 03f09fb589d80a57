//! Centralized path configuration for KILN.
//!
//! All data paths go through this module so the daemon and any tooling agree
//! on directory layout regardless of how the process was launched.

use std::path::PathBuf;

/// Get the KILN data directory.
///
/// Resolution order:
/// 1. `KILN_DATA_DIR` environment variable
/// 2. `/var/lib/kiln` if it exists (system install)
/// 3. `~/.kiln` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KILN_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/kiln");
    if system_dir.exists() {
        return system_dir;
    }

    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(".kiln"))
        .unwrap_or(system_dir)
}

/// Get the per-build workspace root. Each accepted job owns a unique
/// subdirectory keyed by its build id.
pub fn workspace_dir() -> PathBuf {
    data_dir().join("builds")
}

/// Get the default root for the filesystem-backed object store.
pub fn object_store_dir() -> PathBuf {
    data_dir().join("objects")
}

/// Get the configuration directory.
pub fn config_dir() -> PathBuf {
    data_dir()
}
