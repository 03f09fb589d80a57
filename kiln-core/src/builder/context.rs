//! Build context packing.
//!
//! The engine consumes the context as a tar archive. Packing honors the
//! `.dockerignore` conventions: one pattern per line, `#` comments, `*` and
//! `?` wildcards within a path segment, `**` across segments, and `!`
//! negation with last-match-wins semantics.

use crate::error::{KilnError, Result};
use bytes::Bytes;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Tar a build context directory, honoring its `.dockerignore`.
pub fn pack_context(context_dir: &Path) -> Result<Bytes> {
    let ignore = DockerIgnore::load(context_dir);

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for entry in WalkDir::new(context_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| KilnError::ExtractionFailed {
            reason: format!("error walking context '{}': {}", context_dir.display(), e),
        })?;
        let rel = entry
            .path()
            .strip_prefix(context_dir)
            .map_err(|e| KilnError::internal(e))?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        if ignore.is_excluded(&rel_str, entry.file_type().is_dir()) {
            continue;
        }

        if entry.file_type().is_dir() {
            builder
                .append_dir(rel, entry.path())
                .map_err(|e| KilnError::io(entry.path(), e))?;
        } else {
            // append_path_with_name preserves modes and symlinks.
            builder
                .append_path_with_name(entry.path(), rel)
                .map_err(|e| KilnError::io(entry.path(), e))?;
        }
    }

    let data = builder.into_inner().map_err(|e| KilnError::ExtractionFailed {
        reason: format!("failed to finalize context tar: {}", e),
    })?;
    debug!(context = %context_dir.display(), bytes = data.len(), "Packed build context");
    Ok(Bytes::from(data))
}

/// Parsed `.dockerignore` patterns.
struct DockerIgnore {
    /// (pattern, negated) in file order.
    patterns: Vec<(String, bool)>,
}

impl DockerIgnore {
    fn load(context_dir: &Path) -> Self {
        let mut patterns = Vec::new();
        if let Ok(content) = std::fs::read_to_string(context_dir.join(".dockerignore")) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let (pattern, negated) = match line.strip_prefix('!') {
                    Some(rest) => (rest, true),
                    None => (line, false),
                };
                let pattern = pattern.trim_matches('/').to_string();
                if !pattern.is_empty() {
                    patterns.push((pattern, negated));
                }
            }
        }
        Self { patterns }
    }

    /// Whether a context-relative path is excluded. Matches the path itself
    /// and every directory prefix; the last matching pattern wins.
    fn is_excluded(&self, rel: &str, _is_dir: bool) -> bool {
        let mut excluded = false;
        for (pattern, negated) in &self.patterns {
            if Self::matches_path(pattern, rel) {
                excluded = !negated;
            }
        }
        excluded
    }

    fn matches_path(pattern: &str, path: &str) -> bool {
        if glob_match(pattern, path) {
            return true;
        }
        // A pattern matching a directory excludes everything under it.
        let mut prefix = String::new();
        for segment in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            if prefix.len() < path.len() && glob_match(pattern, &prefix) {
                return true;
            }
        }
        false
    }
}

/// Minimal glob over '/'-separated paths: `*` within a segment, `?` single
/// char, `**` across segments.
fn glob_match(pattern: &str, path: &str) -> bool {
    fn segments(s: &str) -> Vec<&str> {
        s.split('/').collect()
    }

    fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
        match (pattern.first(), path.first()) {
            (None, None) => true,
            (Some(&"**"), _) => {
                // '**' swallows zero or more whole segments.
                match_segments(&pattern[1..], path)
                    || (!path.is_empty() && match_segments(pattern, &path[1..]))
            }
            (Some(p), Some(s)) => {
                match_segment(p, s) && match_segments(&pattern[1..], &path[1..])
            }
            _ => false,
        }
    }

    fn match_segment(pattern: &str, segment: &str) -> bool {
        let p: Vec<char> = pattern.chars().collect();
        let s: Vec<char> = segment.chars().collect();
        match_chars(&p, &s)
    }

    fn match_chars(pattern: &[char], text: &[char]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some('*') => {
                match_chars(&pattern[1..], text)
                    || (!text.is_empty() && match_chars(pattern, &text[1..]))
            }
            Some('?') => !text.is_empty() && match_chars(&pattern[1..], &text[1..]),
            Some(c) => text.first() == Some(c) && match_chars(&pattern[1..], &text[1..]),
        }
    }

    match_segments(&segments(pattern), &segments(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn entry_names(data: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(std::io::Cursor::new(data));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_pack_simple_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();

        let data = pack_context(dir.path()).unwrap();
        let names = entry_names(&data);
        assert!(names.contains(&"Dockerfile".to_string()));
        assert!(names.contains(&"src/main.rs".to_string()));
    }

    #[test]
    fn test_dockerignore_excludes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".dockerignore"), "target\n*.log\n!keep.log\n").unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target/out.bin"), "x").unwrap();
        std::fs::write(dir.path().join("debug.log"), "x").unwrap();
        std::fs::write(dir.path().join("keep.log"), "x").unwrap();

        let data = pack_context(dir.path()).unwrap();
        let names = entry_names(&data);
        assert!(names.contains(&"Dockerfile".to_string()));
        assert!(names.contains(&"keep.log".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("target")));
        assert!(!names.contains(&"debug.log".to_string()));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.log", "debug.log"));
        assert!(!glob_match("*.log", "sub/debug.log"));
        assert!(glob_match("**/*.log", "sub/deep/debug.log"));
        assert!(glob_match("sub/**", "sub/deep/file"));
        assert!(glob_match("fo?", "foo"));
        assert!(!glob_match("fo?", "fooo"));
    }

    #[test]
    fn test_context_roundtrips_through_extraction() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/one.txt"), "1").unwrap();
        std::fs::write(dir.path().join("two.txt"), "2").unwrap();

        let data = pack_context(dir.path()).unwrap();

        let out = tempfile::tempdir().unwrap();
        crate::archive::extract_buffer(&data, out.path()).unwrap();

        let mut content = String::new();
        std::fs::File::open(out.path().join("a/one.txt"))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "1");
        assert!(out.path().join("two.txt").exists());
    }
}
