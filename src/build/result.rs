//! Pipeline run result types.
//!
//! Contains types for representing the outcome of a pipeline run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::fileset::FileRecord;

/// Status of a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Every file succeeded
    Success,
    /// Some files failed, at least one succeeded
    PartialFailure,
    /// No file succeeded and at least one failed, or the task itself errored
    Failed(String),
    /// Not run because an upstream task failed
    Skipped(String),
    /// Not run because the run was cancelled
    Cancelled,
}

impl TaskStatus {
    /// Check if the status indicates success.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success)
    }

    /// A hard failure; blocks dependents.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed(_))
    }

    /// Whether dependents may run after this task.
    pub fn allows_dependents(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::PartialFailure)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::PartialFailure => write!(f, "partial failure"),
            TaskStatus::Failed(err) => write!(f, "failed: {}", err),
            TaskStatus::Skipped(reason) => write!(f, "skipped: {}", reason),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One file that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    /// Source file the failure is attributed to
    pub path: PathBuf,
    /// Error category (`CompileError`, `IoError`, ...)
    pub kind: String,
    pub message: String,
}

impl FileFailure {
    pub fn new(path: impl Into<PathBuf>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), kind: kind.into(), message: message.into() }
    }
}

impl std::fmt::Display for FileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.path.display(), self.kind, self.message)
    }
}

/// Result of running a single task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Task ID that ran
    pub id: String,
    pub status: TaskStatus,
    /// Records produced, in input order; consumed by upstream-input tasks
    pub produced: Vec<FileRecord>,
    /// Output files written
    pub written: Vec<PathBuf>,
    pub failures: Vec<FileFailure>,
    /// Warning messages (if any)
    pub warnings: Vec<String>,
    pub duration: Duration,
}

impl TaskOutcome {
    fn with_status(id: &str, status: TaskStatus) -> Self {
        Self {
            id: id.to_string(),
            status,
            produced: vec![],
            written: vec![],
            failures: vec![],
            warnings: vec![],
            duration: Duration::ZERO,
        }
    }

    /// A task that ran to completion (possibly with per-file failures).
    ///
    /// Zero outputs with at least one failure is a hard failure.
    pub fn completed(
        id: &str,
        produced: Vec<FileRecord>,
        written: Vec<PathBuf>,
        failures: Vec<FileFailure>,
        duration: Duration,
    ) -> Self {
        let status = match (produced.is_empty(), failures.len()) {
            (_, 0) => TaskStatus::Success,
            (true, n) => TaskStatus::Failed(format!("all {} file(s) failed", n)),
            (false, _) => TaskStatus::PartialFailure,
        };
        Self { id: id.to_string(), status, produced, written, failures, warnings: vec![], duration }
    }

    /// A task that errored before processing any file.
    pub fn failed(id: &str, error: impl Into<String>, duration: Duration) -> Self {
        let mut outcome = Self::with_status(id, TaskStatus::Failed(error.into()));
        outcome.duration = duration;
        outcome
    }

    pub fn skipped(id: &str, reason: impl Into<String>) -> Self {
        Self::with_status(id, TaskStatus::Skipped(reason.into()))
    }

    pub fn cancelled(id: &str) -> Self {
        Self::with_status(id, TaskStatus::Cancelled)
    }

    /// Add warnings to the outcome.
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Check if this outcome is successful.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Aggregate status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Per-file failures, skipped or cancelled tasks, but no hard task failure
    PartialFailure,
    /// At least one task hard-failed
    Fatal,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::PartialFailure => write!(f, "partial failure"),
            RunStatus::Fatal => write!(f, "failed"),
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineRun {
    /// Outcomes in execution order
    pub tasks: Vec<TaskOutcome>,
    /// Total run duration
    pub total_duration: Duration,
}

impl PipelineRun {
    /// Create a new empty run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task outcome.
    pub fn add_outcome(&mut self, outcome: TaskOutcome) {
        self.tasks.push(outcome);
    }

    /// Set the total duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.total_duration = duration;
        self
    }

    pub fn outcome(&self, id: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn status(&self) -> RunStatus {
        if self.has_hard_failure() {
            RunStatus::Fatal
        } else if self.tasks.iter().all(|t| t.status.is_success() && t.failures.is_empty()) {
            RunStatus::Success
        } else {
            RunStatus::PartialFailure
        }
    }

    /// Get the number of successful tasks.
    pub fn success_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_success()).count()
    }

    /// Get the number of hard-failed tasks.
    pub fn failed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_failure()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.tasks.iter().filter(|t| matches!(t.status, TaskStatus::Skipped(_))).count()
    }

    pub fn has_hard_failure(&self) -> bool {
        self.failed_count() > 0
    }

    /// No task failed, none was skipped or cancelled, and no file failed.
    pub fn is_success(&self) -> bool {
        self.status() == RunStatus::Success
    }

    /// Every per-file failure across tasks.
    pub fn all_failures(&self) -> Vec<&FileFailure> {
        self.tasks.iter().flat_map(|t| t.failures.iter()).collect()
    }

    /// Get all output files written.
    pub fn written_paths(&self) -> Vec<&Path> {
        self.tasks.iter().flat_map(|t| t.written.iter().map(PathBuf::as_path)).collect()
    }

    /// Get all warnings.
    pub fn all_warnings(&self) -> Vec<&String> {
        self.tasks.iter().flat_map(|t| t.warnings.iter()).collect()
    }

    /// Format a summary of the run, including every per-file error.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();

        let success = self.success_count();
        let failed = self.failed_count();
        let skipped = self.skipped_count();
        let total = self.tasks.len();
        let failures = self.all_failures();

        match self.status() {
            RunStatus::Success => lines.push(format!(
                "Build succeeded: {} tasks, {} files written in {:?}",
                total,
                self.written_paths().len(),
                self.total_duration
            )),
            status => lines.push(format!(
                "Build {}: {} succeeded, {} failed, {} skipped ({} total), {} file error(s)",
                status,
                success,
                failed,
                skipped,
                total,
                failures.len()
            )),
        }

        for task in self.tasks.iter().filter(|t| !t.status.allows_dependents()) {
            lines.push(format!("  - {}: {}", task.id, task.status));
        }

        if !failures.is_empty() {
            lines.push("Errors:".to_string());
            for failure in failures {
                lines.push(format!("  {}", failure));
            }
        }

        let warnings = self.all_warnings();
        if !warnings.is_empty() {
            lines.push(format!("Warnings ({}): ", warnings.len()));
            for warning in warnings.iter().take(5) {
                lines.push(format!("  - {}", warning));
            }
            if warnings.len() > 5 {
                lines.push(format!("  ... and {} more", warnings.len() - 5));
            }
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> FileRecord {
        FileRecord::new("/out", name, b"x".to_vec())
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Success.to_string(), "success");
        assert_eq!(TaskStatus::Failed("boom".to_string()).to_string(), "failed: boom");
        assert_eq!(TaskStatus::Skipped("style failed".to_string()).to_string(), "skipped: style failed");
    }

    #[test]
    fn test_completed_status_rules() {
        let ok = TaskOutcome::completed("a", vec![record("a.css")], vec![], vec![], Duration::ZERO);
        assert_eq!(ok.status, TaskStatus::Success);

        let partial = TaskOutcome::completed(
            "b",
            vec![record("a.css")],
            vec![],
            vec![FileFailure::new("b.scss", "CompileError", "line 1: x")],
            Duration::ZERO,
        );
        assert_eq!(partial.status, TaskStatus::PartialFailure);
        assert!(partial.status.allows_dependents());

        let hard = TaskOutcome::completed(
            "c",
            vec![],
            vec![],
            vec![FileFailure::new("b.scss", "CompileError", "line 1: x")],
            Duration::ZERO,
        );
        assert!(hard.status.is_failure());
        assert!(!hard.status.allows_dependents());

        let empty = TaskOutcome::completed("d", vec![], vec![], vec![], Duration::ZERO);
        assert_eq!(empty.status, TaskStatus::Success);
    }

    #[test]
    fn test_run_status() {
        let mut run = PipelineRun::new();
        let written = vec![PathBuf::from("a")];
        run.add_outcome(TaskOutcome::completed("a", vec![], written, vec![], Duration::ZERO));
        assert_eq!(run.status(), RunStatus::Success);
        assert!(run.is_success());

        run.add_outcome(TaskOutcome::completed(
            "b",
            vec![record("x")],
            vec![],
            vec![FileFailure::new("y", "IoError", "denied")],
            Duration::ZERO,
        ));
        assert_eq!(run.status(), RunStatus::PartialFailure);
        assert!(!run.has_hard_failure());

        run.add_outcome(TaskOutcome::failed("c", "bad glob", Duration::ZERO));
        run.add_outcome(TaskOutcome::skipped("d", "c failed"));
        assert_eq!(run.status(), RunStatus::Fatal);
        assert_eq!(run.failed_count(), 1);
        assert_eq!(run.skipped_count(), 1);
        assert_eq!(run.all_failures().len(), 1);
        assert_eq!(run.written_paths(), vec![Path::new("a")]);
    }

    #[test]
    fn test_summary_lists_file_errors() {
        let mut run = PipelineRun::new();
        run.add_outcome(TaskOutcome::completed(
            "style",
            vec![record("a.css")],
            vec![PathBuf::from("/t/a.css")],
            vec![FileFailure::new("src/b.scss", "CompileError", "line 2: missing ':'")],
            Duration::ZERO,
        ));

        let summary = run.summary();
        assert!(summary.contains("Build partial failure"));
        assert!(summary.contains("src/b.scss: CompileError: line 2: missing ':'"));
    }

    #[test]
    fn test_summary_success() {
        let mut run = PipelineRun::new();
        run.add_outcome(
            TaskOutcome::completed("page", vec![], vec![PathBuf::from("/t/index.html")], vec![], Duration::ZERO)
                .with_warnings(vec!["minify failed".to_string()]),
        );
        let summary = run.with_duration(Duration::from_millis(5)).summary();
        assert!(summary.contains("Build succeeded: 1 tasks, 1 files written"));
        assert!(summary.contains("Warnings (1)"));
    }
}
