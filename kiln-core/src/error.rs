//! Error types for KILN.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for KILN operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// How a codebase fetch failed. The distinction matters to callers: auth
/// failures are actionable by the user, transport failures usually are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Network or protocol failure talking to the remote.
    Transport,
    /// The remote rejected our credentials (or we had none).
    Auth,
    /// The ref, commit, or path does not exist.
    NotFound,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchErrorKind::Transport => write!(f, "transport"),
            FetchErrorKind::Auth => write!(f, "auth"),
            FetchErrorKind::NotFound => write!(f, "not-found"),
        }
    }
}

/// Main error type for KILN.
#[derive(Error, Debug)]
pub enum KilnError {
    // Spec errors
    #[error("Invalid build spec: {reason}")]
    InvalidSpec { reason: String },

    // Source fetching errors
    #[error("Failed to fetch codebase '{codebase}' ({kind}): {reason}")]
    FetchFailed { codebase: String, kind: FetchErrorKind, reason: String },

    // Resource download errors
    #[error("Failed to acquire resource '{url}': {reason}")]
    ResourceFailed { url: String, reason: String },

    // Archive errors
    #[error("Archive extraction failed: {reason}")]
    ExtractionFailed { reason: String },

    #[error("Archive entry '{entry}' escapes the extraction root")]
    PathTraversal { entry: String },

    // Engine errors
    #[error("Container engine failure: {reason}")]
    EngineFailed { reason: String },

    #[error("Build failed: {reason}")]
    BuildFailed { reason: String },

    // Secret errors
    #[error("Failed to fetch secret '{secret_source}': {reason}")]
    SecretFailed { secret_source: String, reason: String },

    // Output errors
    #[error("Failed to store build output: {reason}")]
    OutputFailed { reason: String },

    // Lifecycle errors
    #[error("Build was cancelled")]
    Cancelled,

    #[error("Operation timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Create an IoError with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }

    /// Short machine-readable kind, used in terminal status messages.
    pub fn kind(&self) -> &'static str {
        match self {
            KilnError::InvalidSpec { .. } => "invalid_spec",
            KilnError::FetchFailed { .. } => "fetch_failure",
            KilnError::ResourceFailed { .. } => "resource_failure",
            KilnError::ExtractionFailed { .. } | KilnError::PathTraversal { .. } => {
                "extraction_failure"
            }
            KilnError::EngineFailed { .. } | KilnError::BuildFailed { .. } => "engine_failure",
            KilnError::SecretFailed { .. } => "secret_failure",
            KilnError::OutputFailed { .. } => "output_failure",
            KilnError::Cancelled => "cancelled",
            KilnError::Timeout { .. } => "timeout",
            KilnError::IoError { .. } | KilnError::Internal(_) | KilnError::Other(_) => "internal",
        }
    }

    /// True for the terminal states a client should not retry verbatim.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, KilnError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = KilnError::InvalidSpec { reason: "missing name".into() };
        assert_eq!(err.kind(), "invalid_spec");

        let err = KilnError::PathTraversal { entry: "../etc/passwd".into() };
        assert_eq!(err.kind(), "extraction_failure");

        let err = KilnError::Cancelled;
        assert_eq!(err.kind(), "cancelled");
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_fetch_kind_display() {
        assert_eq!(FetchErrorKind::Auth.to_string(), "auth");
        let err = KilnError::FetchFailed {
            codebase: "app".into(),
            kind: FetchErrorKind::NotFound,
            reason: "no such ref".into(),
        };
        assert!(err.to_string().contains("not-found"));
    }
}
