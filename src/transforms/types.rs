//! Core transform trait and error definitions
//!
//! A transform is a pure conversion from one [`FileRecord`] to another. It
//! never touches the output directories; writing is the runner's job.

use std::path::{Path, PathBuf};

use crate::build::FileRecord;

/// Errors a transform can report for a single file.
///
/// These are recoverable: the runner records them against the file and moves
/// on to the next one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransformError {
    /// Stylesheet syntax error
    #[error("line {line}: {message}")]
    Compile { line: usize, message: String },

    /// Script uses syntax the transpiler cannot lower
    #[error("line {line}: {message}")]
    Transpile { line: usize, message: String },

    /// Template references something the context does not provide
    #[error("{message}")]
    Render { message: String },

    /// Build-comment markers are malformed
    #[error("line {line}: {message}")]
    BundleSyntax { line: usize, message: String },

    /// Text transform given non-UTF-8 input
    #[error("input is not valid UTF-8: {0}")]
    InvalidUtf8(String),
}

impl TransformError {
    /// Short category label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TransformError::Compile { .. } => "CompileError",
            TransformError::Transpile { .. } => "TranspileError",
            TransformError::Render { .. } => "RenderError",
            TransformError::BundleSyntax { .. } => "BundleSyntaxError",
            TransformError::InvalidUtf8(_) => "EncodingError",
        }
    }

    pub fn compile(line: usize, message: impl Into<String>) -> Self {
        TransformError::Compile { line, message: message.into() }
    }

    pub fn transpile(line: usize, message: impl Into<String>) -> Self {
        TransformError::Transpile { line, message: message.into() }
    }

    pub fn render(message: impl Into<String>) -> Self {
        TransformError::Render { message: message.into() }
    }

    pub fn bundle(line: usize, message: impl Into<String>) -> Self {
        TransformError::BundleSyntax { line, message: message.into() }
    }
}

impl From<std::str::Utf8Error> for TransformError {
    fn from(e: std::str::Utf8Error) -> Self {
        TransformError::InvalidUtf8(e.to_string())
    }
}

/// A file-content conversion stage.
///
/// Implementations must be pure: the result depends only on the input record
/// and the transform's own configuration.
pub trait Transform: Send + Sync {
    /// Stage name for logs and reports.
    fn name(&self) -> &'static str;

    /// Convert one record.
    fn apply(&self, record: FileRecord) -> Result<FileRecord, TransformError>;

    /// Convert one record into one or more records.
    ///
    /// Stages that emit companion files (bundles) override this; the runner
    /// always calls it.
    fn apply_many(&self, record: FileRecord) -> Result<Vec<FileRecord>, TransformError> {
        Ok(vec![self.apply(record)?])
    }

    /// Relative output path for an input path (e.g. `.scss` to `.css`).
    fn output_path(&self, relative: &Path) -> PathBuf {
        relative.to_path_buf()
    }
}

/// Borrow a record's contents as text, mapping the encoding error.
pub(crate) fn record_text(record: &FileRecord) -> Result<&str, TransformError> {
    Ok(record.text()?)
}
