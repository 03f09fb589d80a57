//! Ecosystem detection and builtin Dockerfile templates.
//!
//! When a single-image build configures no Dockerfile and none is found in
//! the context, the executor detects the codebase ecosystem from marker
//! files at the project root and synthesizes a Dockerfile from a builtin
//! template.

use crate::error::{KilnError, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;

/// A detected project ecosystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ecosystem {
    pub language: &'static str,
    /// Key into the template table.
    pub template: &'static str,
    /// The marker file that decided the detection.
    pub marker: String,
}

/// marker file -> (language, template key, priority)
static MARKERS: Lazy<Vec<(&'static str, &'static str, &'static str, u8)>> = Lazy::new(|| {
    vec![
        ("go.mod", "Go", "go", 9),
        ("Cargo.toml", "Rust", "rust", 9),
        ("package.json", "JavaScript", "node", 8),
        ("requirements.txt", "Python", "python", 8),
        ("pyproject.toml", "Python", "python", 9),
    ]
});

/// Builtin multi-stage Dockerfile templates, keyed by template name.
pub static DOCKERFILE_TEMPLATES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (
            "go",
            r#"FROM golang:1.22-alpine AS builder
WORKDIR /app
COPY go.* ./
RUN go mod download
COPY . .
RUN CGO_ENABLED=0 go build -ldflags="-w -s" -o /app/main .

FROM alpine:latest
WORKDIR /app
COPY --from=builder /app/main .
CMD ["./main"]
"#,
        ),
        (
            "rust",
            r#"FROM rust:1-slim AS builder
WORKDIR /app
COPY . .
RUN cargo build --release

FROM debian:bookworm-slim
WORKDIR /app
COPY --from=builder /app/target/release/ /app/bin/
CMD ["sh", "-c", "exec /app/bin/$(ls /app/bin | head -n1)"]
"#,
        ),
        (
            "node",
            r#"FROM node:20-alpine
WORKDIR /app
COPY package*.json ./
RUN npm ci --omit=dev || npm install --omit=dev
COPY . .
EXPOSE 3000
CMD ["npm", "start"]
"#,
        ),
        (
            "python",
            r#"FROM python:3.12-slim
WORKDIR /app
COPY requirements.txt* pyproject.toml* ./
RUN pip install --no-cache-dir -r requirements.txt 2>/dev/null || pip install --no-cache-dir .
COPY . .
CMD ["python", "main.py"]
"#,
        ),
    ])
});

/// Detect the dominant ecosystem at a project root.
///
/// Two different languages at the same root is an error; the caller should
/// be told to configure a Dockerfile explicitly rather than have us guess.
pub fn detect_ecosystem(root: &Path) -> Result<Ecosystem> {
    let entries = std::fs::read_dir(root).map_err(|e| KilnError::io(root, e))?;
    let names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();

    let mut best: Option<(&'static str, &'static str, String, u8)> = None;
    for &(marker, language, template, priority) in MARKERS.iter() {
        if !names.iter().any(|n| n.as_str() == marker) {
            continue;
        }
        if let Some((found_language, _, found_marker, found_priority)) = &best {
            if *found_language != language {
                return Err(KilnError::InvalidSpec {
                    reason: format!(
                        "ambiguous ecosystem: found both '{}' ({}) and '{}' ({}); \
                         configure a dockerfile explicitly",
                        found_marker, found_language, marker, language
                    ),
                });
            }
            if priority <= *found_priority {
                continue;
            }
        }
        best = Some((language, template, marker.to_string(), priority));
    }

    let (language, template, marker, _) = best.ok_or_else(|| KilnError::InvalidSpec {
        reason: format!(
            "no Dockerfile found and no supported ecosystem marker in '{}'",
            root.display()
        ),
    })?;
    Ok(Ecosystem { language, template, marker })
}

/// The Dockerfile template for a detected ecosystem.
pub fn template_for(ecosystem: &Ecosystem) -> Result<&'static str> {
    DOCKERFILE_TEMPLATES.get(ecosystem.template).copied().ok_or_else(|| {
        KilnError::InvalidSpec {
            reason: format!("no Dockerfile template for ecosystem '{}'", ecosystem.language),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_rust() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        let eco = detect_ecosystem(dir.path()).unwrap();
        assert_eq!(eco.language, "Rust");
        assert!(template_for(&eco).unwrap().contains("cargo build"));
    }

    #[test]
    fn test_detect_prefers_pyproject_over_requirements() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "").unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "").unwrap();
        let eco = detect_ecosystem(dir.path()).unwrap();
        assert_eq!(eco.marker, "pyproject.toml");
    }

    #[test]
    fn test_detect_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let err = detect_ecosystem(dir.path()).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_detect_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_ecosystem(dir.path()).is_err());
    }
}
