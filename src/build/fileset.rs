//! Source file sets and the records that flow through the pipeline.
//!
//! A [`FileSet`] is a glob pattern anchored at a base directory. Resolving it
//! yields [`FileRecord`]s whose path relative to the base is preserved through
//! every transform, so later stages can rebuild the same tree shape under a
//! different root.

use glob::{MatchOptions, Pattern};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Error during file set resolution.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FileSetError {
    /// Invalid glob pattern
    #[error("Invalid glob pattern '{0}': {1}")]
    InvalidPattern(String, #[source] glob::PatternError),
    /// IO error while reading a matched file
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Match options shared by resolution and watcher path matching.
///
/// `*` never crosses a directory separator; `**` does.
pub(crate) const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A glob pattern anchored at a base directory.
#[derive(Debug, Clone)]
pub struct FileSet {
    base: PathBuf,
    pattern: String,
    compiled: Pattern,
}

impl FileSet {
    /// Create a file set. The pattern is validated eagerly.
    pub fn new(base: impl Into<PathBuf>, pattern: impl Into<String>) -> Result<Self, FileSetError> {
        let pattern = pattern.into();
        let compiled = Pattern::new(&file_pattern(&pattern))
            .map_err(|e| FileSetError::InvalidPattern(pattern.clone(), e))?;
        Ok(Self { base: base.into(), pattern, compiled })
    }

    /// Base directory the pattern is relative to.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The glob pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Resolve the pattern to relative paths of matching files, sorted.
    ///
    /// Re-globs the filesystem on every call. No matches (including a
    /// missing base directory) is an empty result.
    pub fn resolve_paths(&self) -> Result<Vec<PathBuf>, FileSetError> {
        let escaped_base = Pattern::escape(&self.base.to_string_lossy());
        let full_pattern =
            format!("{}/{}", escaped_base.trim_end_matches('/'), file_pattern(&self.pattern));

        let entries = glob::glob_with(&full_pattern, MATCH_OPTIONS)
            .map_err(|e| FileSetError::InvalidPattern(self.pattern.clone(), e))?;

        let mut files = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => {
                    if !path.is_file() {
                        continue;
                    }
                    if let Ok(relative) = path.strip_prefix(&self.base) {
                        files.push(relative.to_path_buf());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable path during glob");
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Resolve the pattern and read every matching file.
    pub fn resolve(&self) -> Result<Vec<FileRecord>, FileSetError> {
        self.resolve_paths()?
            .into_iter()
            .map(|relative| FileRecord::read(&self.base, relative))
            .collect()
    }

    /// Check whether an absolute (or base-prefixed) path belongs to this set.
    pub fn matches(&self, path: &Path) -> bool {
        match path.strip_prefix(&self.base) {
            Ok(relative) => self.compiled.matches_path_with(relative, MATCH_OPTIONS),
            Err(_) => false,
        }
    }
}

/// Rewrite a trailing `**` so it selects files.
///
/// The glob walker only yields directories for a bare trailing `**`; `**/*`
/// matches every file at any depth, including the top level.
fn file_pattern(pattern: &str) -> String {
    if pattern == "**" || pattern.ends_with("/**") {
        format!("{}/*", pattern)
    } else {
        pattern.to_string()
    }
}

/// A file moving through the pipeline.
///
/// Owned by exactly one stage at a time; transforms consume a record and
/// return a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Root the relative path is anchored to
    pub base: PathBuf,
    /// Path relative to `base`; preserved across transforms
    pub relative: PathBuf,
    /// The original source file this record derives from
    pub source: PathBuf,
    contents: Vec<u8>,
    hash: String,
    warnings: Vec<String>,
}

impl FileRecord {
    /// Create a record from in-memory contents.
    pub fn new(base: impl Into<PathBuf>, relative: impl Into<PathBuf>, contents: Vec<u8>) -> Self {
        let base = base.into();
        let relative = relative.into();
        let source = base.join(&relative);
        let hash = content_hash(&contents);
        Self { base, relative, source, contents, hash, warnings: vec![] }
    }

    /// Read a record from `base/relative`.
    pub fn read(base: &Path, relative: PathBuf) -> Result<Self, FileSetError> {
        let path = base.join(&relative);
        let contents =
            std::fs::read(&path).map_err(|source| FileSetError::Io { path: path.clone(), source })?;
        Ok(Self::new(base, relative, contents))
    }

    /// Full path of the record under its base.
    pub fn path(&self) -> PathBuf {
        self.base.join(&self.relative)
    }

    /// Raw contents.
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Contents as UTF-8 text.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.contents)
    }

    /// Hex SHA-256 of the contents.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Lowercased extension of the relative path.
    pub fn extension(&self) -> Option<String> {
        self.relative.extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
    }

    /// Replace the contents, keeping provenance.
    pub fn with_contents(mut self, contents: Vec<u8>) -> Self {
        self.hash = content_hash(&contents);
        self.contents = contents;
        self
    }

    /// Replace the relative path (e.g. a changed extension), keeping provenance.
    pub fn with_relative(mut self, relative: impl Into<PathBuf>) -> Self {
        self.relative = relative.into();
        self
    }

    /// Move the record under a new root, keeping relative path and provenance.
    pub fn rebase(mut self, base: impl Into<PathBuf>) -> Self {
        self.base = base.into();
        self
    }

    /// Build a new record derived from this one (same source, new path and contents).
    pub fn derive(&self, relative: impl Into<PathBuf>, contents: Vec<u8>) -> Self {
        let hash = content_hash(&contents);
        Self {
            base: self.base.clone(),
            relative: relative.into(),
            source: self.source.clone(),
            contents,
            hash,
            warnings: vec![],
        }
    }

    /// Attach a non-fatal diagnostic (e.g. minifier fallback).
    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Diagnostics collected by transforms.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// SHA-256 hex digest of a byte slice.
pub fn content_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hash a file on disk, `None` when it cannot be read.
pub fn hash_file(path: &Path) -> Option<String> {
    std::fs::read(path).ok().map(|data| content_hash(&data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        File::create(&path).unwrap().write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_resolve_simple() {
        let temp = TempDir::new().unwrap();
        create_test_file(temp.path(), "assets/scripts/a.js", "a");
        create_test_file(temp.path(), "assets/scripts/b.txt", "b");

        let set = FileSet::new(temp.path(), "assets/scripts/*.js").unwrap();
        let records = set.resolve().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].relative, PathBuf::from("assets/scripts/a.js"));
        assert_eq!(records[0].contents(), b"a");
    }

    #[test]
    fn test_resolve_preserves_relative_path() {
        let temp = TempDir::new().unwrap();
        create_test_file(temp.path(), "assets/x.js", "x");

        let set = FileSet::new(temp.path(), "assets/*.js").unwrap();
        let records = set.resolve().unwrap();
        assert_eq!(records[0].relative, PathBuf::from("assets/x.js"));
        assert_eq!(records[0].base, temp.path());
        assert_eq!(records[0].source, temp.path().join("assets/x.js"));
    }

    #[test]
    fn test_resolve_recursive_skips_directories() {
        let temp = TempDir::new().unwrap();
        create_test_file(temp.path(), "assets/images/logo.png", "png");
        create_test_file(temp.path(), "assets/images/icons/a.svg", "svg");

        let set = FileSet::new(temp.path(), "assets/images/**").unwrap();
        let paths = set.resolve_paths().unwrap();
        assert_eq!(
            paths,
            vec![PathBuf::from("assets/images/icons/a.svg"), PathBuf::from("assets/images/logo.png")]
        );
    }

    #[test]
    fn test_trailing_double_star_selects_files_at_every_depth() {
        let temp = TempDir::new().unwrap();
        create_test_file(temp.path(), "fonts/x.woff2", "font");
        create_test_file(temp.path(), "fonts/sub/y.woff", "font");
        create_test_file(temp.path(), "favicon.ico", "ico");

        let fonts = FileSet::new(temp.path(), "fonts/**").unwrap();
        assert_eq!(
            fonts.resolve_paths().unwrap(),
            vec![PathBuf::from("fonts/sub/y.woff"), PathBuf::from("fonts/x.woff2")]
        );
        assert_eq!(fonts.pattern(), "fonts/**");

        let everything = FileSet::new(temp.path(), "**").unwrap();
        assert_eq!(everything.resolve_paths().unwrap().len(), 3);
        assert!(everything.matches(&temp.path().join("favicon.ico")));
        assert!(fonts.matches(&temp.path().join("fonts/sub/y.woff")));
        assert!(!fonts.matches(&temp.path().join("favicon.ico")));
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        let temp = TempDir::new().unwrap();
        create_test_file(temp.path(), "index.html", "");
        create_test_file(temp.path(), "nested/about.html", "");

        let set = FileSet::new(temp.path(), "*.html").unwrap();
        assert_eq!(set.resolve_paths().unwrap(), vec![PathBuf::from("index.html")]);
    }

    #[test]
    fn test_resolve_no_match_is_empty() {
        let temp = TempDir::new().unwrap();
        create_test_file(temp.path(), "a.css", "");

        let set = FileSet::new(temp.path(), "assets/styles/*.scss").unwrap();
        assert!(set.resolve().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_missing_base_is_empty() {
        let set = FileSet::new("/nonexistent/pagewright/base", "**").unwrap();
        assert!(set.resolve().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_is_not_cached() {
        let temp = TempDir::new().unwrap();
        let set = FileSet::new(temp.path(), "*.html").unwrap();
        assert!(set.resolve().unwrap().is_empty());

        create_test_file(temp.path(), "index.html", "<p>");
        assert_eq!(set.resolve().unwrap().len(), 1);

        fs::remove_file(temp.path().join("index.html")).unwrap();
        assert!(set.resolve().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let result = FileSet::new("/tmp", "a[b");
        assert!(matches!(result, Err(FileSetError::InvalidPattern(_, _))));
    }

    #[test]
    fn test_matches() {
        let set = FileSet::new("/project/src", "assets/styles/*.scss").unwrap();
        assert!(set.matches(Path::new("/project/src/assets/styles/main.scss")));
        assert!(!set.matches(Path::new("/project/src/assets/styles/deep/main.scss")));
        assert!(!set.matches(Path::new("/project/src/assets/scripts/main.js")));
        assert!(!set.matches(Path::new("/elsewhere/assets/styles/main.scss")));
    }

    #[test]
    fn test_matches_double_star() {
        let set = FileSet::new("/project/public", "**").unwrap();
        assert!(set.matches(Path::new("/project/public/favicon.ico")));
        assert!(set.matches(Path::new("/project/public/a/b/c.txt")));
    }

    #[test]
    fn test_record_hash_changes_with_contents() {
        let record = FileRecord::new("/base", "a.css", b"a{}".to_vec());
        let original = record.hash().to_string();
        let updated = record.clone().with_contents(b"b{}".to_vec());
        assert_ne!(original, updated.hash());
        assert_eq!(updated.source, PathBuf::from("/base/a.css"));
    }

    #[test]
    fn test_record_derive_keeps_source() {
        let record = FileRecord::new("/base", "index.html", b"<html>".to_vec());
        let derived = record.derive("assets/vendor.js", b"var a;".to_vec());
        assert_eq!(derived.source, PathBuf::from("/base/index.html"));
        assert_eq!(derived.relative, PathBuf::from("assets/vendor.js"));
    }

    #[test]
    fn test_content_hash_known_value() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
