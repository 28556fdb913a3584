//! Pipeline progress reporting.
//!
//! The runner emits [`ProgressEvent`]s to a [`ProgressReporter`]. Console and
//! JSON reporters print them; the dev server implements the trait to learn
//! when a rebuild finished and which files it wrote.
//!
//! # Example
//!
//! ```ignore
//! use pagewright::build::progress::{ConsoleProgress, ProgressEvent, ProgressReporter};
//!
//! let reporter = ConsoleProgress::new();
//! reporter.report(ProgressEvent::RunStarted { total_tasks: 8 });
//! reporter.report(ProgressEvent::TaskStarted { task_id: "style".to_string() });
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::result::{FileFailure, RunStatus, TaskStatus};

/// Events that can be reported during a run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Run started
    RunStarted {
        /// Number of tasks with work (barriers excluded)
        total_tasks: usize,
    },
    TaskStarted { task_id: String },
    TaskCompleted {
        task_id: String,
        status: TaskStatus,
        /// Duration in milliseconds
        duration_ms: u64,
        /// Number of files written
        written: usize,
        failures: Vec<FileFailure>,
    },
    /// Run completed; the dev server's rebuild notification
    RunCompleted {
        status: RunStatus,
        duration_ms: u64,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        /// Every path written during the run
        written: Vec<PathBuf>,
    },
    /// A warning was generated
    Warning {
        /// Task that generated the warning (if applicable)
        task_id: Option<String>,
        message: String,
    },
}

/// Trait for progress reporters.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event.
    fn report(&self, event: ProgressEvent);

    /// Check if this reporter wants verbose output.
    fn is_verbose(&self) -> bool {
        false
    }
}

/// A progress reporter that discards all events.
#[derive(Debug, Default)]
pub struct NullProgress;

impl NullProgress {
    /// Create a new null progress reporter.
    pub fn new() -> Self {
        Self
    }
}

impl ProgressReporter for NullProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards every event to several reporters.
#[derive(Default, Clone)]
pub struct Reporters {
    inner: Vec<Arc<dyn ProgressReporter>>,
}

impl std::fmt::Debug for Reporters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporters").field("count", &self.inner.len()).finish()
    }
}

impl Reporters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.inner.push(reporter);
        self
    }
}

impl ProgressReporter for Reporters {
    fn report(&self, event: ProgressEvent) {
        for reporter in &self.inner {
            reporter.report(event.clone());
        }
    }

    fn is_verbose(&self) -> bool {
        self.inner.iter().any(|r| r.is_verbose())
    }
}

/// Console progress reporter with optional colors.
pub struct ConsoleProgress {
    /// Whether to use colors
    use_colors: bool,
    /// Whether to show verbose output
    verbose: bool,
    /// Completed task count
    current: AtomicUsize,
    /// Total task count
    total: AtomicUsize,
    /// Output writer (for testing)
    output: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for ConsoleProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleProgress")
            .field("use_colors", &self.use_colors)
            .field("verbose", &self.verbose)
            .field("current", &self.current)
            .field("total", &self.total)
            .finish()
    }
}

impl ConsoleProgress {
    /// Create a new console progress reporter.
    pub fn new() -> Self {
        Self {
            use_colors: true,
            verbose: false,
            current: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            output: Mutex::new(Box::new(std::io::stderr())),
        }
    }

    /// Create a console progress reporter that writes to a custom output.
    pub fn with_output<W: Write + Send + 'static>(output: W) -> Self {
        Self {
            use_colors: false,
            verbose: false,
            current: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            output: Mutex::new(Box::new(output)),
        }
    }

    /// Set whether to use colors.
    pub fn with_colors(mut self, use_colors: bool) -> Self {
        self.use_colors = use_colors;
        self
    }

    /// Set verbose mode.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn color(&self, text: &str, color: &str) -> String {
        if self.use_colors {
            format!("{}{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }

    fn green(&self, text: &str) -> String {
        self.color(text, "\x1b[32m")
    }

    fn yellow(&self, text: &str) -> String {
        self.color(text, "\x1b[33m")
    }

    fn red(&self, text: &str) -> String {
        self.color(text, "\x1b[31m")
    }

    fn cyan(&self, text: &str) -> String {
        self.color(text, "\x1b[36m")
    }

    fn bold(&self, text: &str) -> String {
        self.color(text, "\x1b[1m")
    }

    /// Write a line to output.
    fn writeln(&self, line: &str) {
        if let Ok(mut output) = self.output.lock() {
            let _ = writeln!(output, "{}", line);
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ConsoleProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { total_tasks } => {
                self.total.store(total_tasks, Ordering::SeqCst);
                self.current.store(0, Ordering::SeqCst);
                if total_tasks > 0 {
                    self.writeln(&format!(
                        "{} Running {} task{}...",
                        self.cyan("[build]"),
                        total_tasks,
                        if total_tasks == 1 { "" } else { "s" }
                    ));
                }
            }
            ProgressEvent::TaskStarted { task_id } => {
                if self.verbose {
                    let current = self.current.load(Ordering::SeqCst) + 1;
                    let total = self.total.load(Ordering::SeqCst);
                    let prefix = self.cyan("[build]");
                    self.writeln(&format!("{} [{}/{}] Starting {}...", prefix, current, total, task_id));
                }
            }
            ProgressEvent::TaskCompleted { task_id, status, duration_ms, written, failures } => {
                let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                let total = self.total.load(Ordering::SeqCst);

                let status_str = match &status {
                    TaskStatus::Success => self.green("ok"),
                    TaskStatus::PartialFailure => self.yellow("partial"),
                    TaskStatus::Failed(_) => self.red("FAILED"),
                    TaskStatus::Skipped(_) => self.yellow("skipped"),
                    TaskStatus::Cancelled => self.yellow("cancelled"),
                };

                self.writeln(&format!(
                    "{} [{}/{}] {} {} ({} file{}, {})",
                    self.cyan("[build]"),
                    current,
                    total,
                    status_str,
                    task_id,
                    written,
                    if written == 1 { "" } else { "s" },
                    format_duration(duration_ms)
                ));

                match &status {
                    TaskStatus::Failed(err) | TaskStatus::Skipped(err) => {
                        self.writeln(&format!("        {}", self.red(err)));
                    }
                    _ => {}
                }
                for failure in &failures {
                    self.writeln(&format!("        {}", self.red(&failure.to_string())));
                }
            }
            ProgressEvent::RunCompleted { status, duration_ms, succeeded, failed, skipped, written } => {
                let duration_str = format_duration(duration_ms);
                match status {
                    RunStatus::Success => self.writeln(&format!(
                        "{} {} task{} done, {} file{} written in {}",
                        self.green("[done]"),
                        self.bold(&succeeded.to_string()),
                        if succeeded == 1 { "" } else { "s" },
                        written.len(),
                        if written.len() == 1 { "" } else { "s" },
                        duration_str
                    )),
                    _ => self.writeln(&format!(
                        "{} Build {}: {} succeeded, {} failed, {} skipped in {}",
                        self.red("[error]"),
                        status,
                        succeeded,
                        failed,
                        skipped,
                        duration_str
                    )),
                }
            }
            ProgressEvent::Warning { task_id, message } => {
                let prefix = match task_id {
                    Some(id) => format!("{}: ", id),
                    None => String::new(),
                };
                self.writeln(&format!("{} {}{}", self.yellow("[warn]"), prefix, message));
            }
        }
    }

    fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// JSON-lines progress reporter for machine-readable output.
pub struct JsonProgress {
    output: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for JsonProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonProgress").finish()
    }
}

impl JsonProgress {
    /// Create a new JSON progress reporter writing to stdout.
    pub fn new() -> Self {
        Self { output: Mutex::new(Box::new(std::io::stdout())) }
    }

    /// Create a JSON progress reporter that writes to a custom output.
    pub fn with_output<W: Write + Send + 'static>(output: W) -> Self {
        Self { output: Mutex::new(Box::new(output)) }
    }

    fn write_json(&self, value: serde_json::Value) {
        if let Ok(mut output) = self.output.lock() {
            let _ = writeln!(output, "{}", value);
        }
    }
}

impl Default for JsonProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn status_label(status: &TaskStatus) -> &'static str {
    match status {
        TaskStatus::Success => "success",
        TaskStatus::PartialFailure => "partial_failure",
        TaskStatus::Failed(_) => "failed",
        TaskStatus::Skipped(_) => "skipped",
        TaskStatus::Cancelled => "cancelled",
    }
}

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        use serde_json::json;

        let value = match event {
            ProgressEvent::RunStarted { total_tasks } => {
                json!({ "event": "run_started", "total_tasks": total_tasks })
            }
            ProgressEvent::TaskStarted { task_id } => json!({ "event": "task_started", "task_id": task_id }),
            ProgressEvent::TaskCompleted { task_id, status, duration_ms, written, failures } => {
                let failures: Vec<_> = failures
                    .iter()
                    .map(|f| {
                        json!({ "path": f.path.display().to_string(), "kind": f.kind, "message": f.message })
                    })
                    .collect();
                let mut value = json!({
                    "event": "task_completed",
                    "task_id": task_id,
                    "status": status_label(&status),
                    "duration_ms": duration_ms,
                    "written": written,
                    "failures": failures,
                });
                if let TaskStatus::Failed(reason) | TaskStatus::Skipped(reason) = &status {
                    value["reason"] = json!(reason);
                }
                value
            }
            ProgressEvent::RunCompleted { status, duration_ms, succeeded, failed, skipped, written } => {
                json!({
                    "event": "run_completed",
                    "status": status.to_string(),
                    "duration_ms": duration_ms,
                    "succeeded": succeeded,
                    "failed": failed,
                    "skipped": skipped,
                    "written": written.len(),
                })
            }
            ProgressEvent::Warning { task_id, message } => {
                json!({ "event": "warning", "task_id": task_id, "message": message })
            }
        };
        self.write_json(value);
    }
}

/// Format a duration in milliseconds to a human-readable string.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.2}s", ms as f64 / 1000.0)
    } else {
        let mins = ms / 60_000;
        let secs = (ms % 60_000) / 1000;
        format!("{}m {}s", mins, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(50), "50ms");
        assert_eq!(format_duration(1500), "1.50s");
        assert_eq!(format_duration(125_000), "2m 5s");
    }

    #[test]
    fn test_console_task_lines() {
        let buf = SharedBuf::default();
        let reporter = ConsoleProgress::with_output(buf.clone());

        reporter.report(ProgressEvent::RunStarted { total_tasks: 2 });
        reporter.report(ProgressEvent::TaskCompleted {
            task_id: "style".to_string(),
            status: TaskStatus::PartialFailure,
            duration_ms: 12,
            written: 1,
            failures: vec![FileFailure::new("src/b.scss", "CompileError", "line 1: oops")],
        });
        reporter.report(ProgressEvent::TaskCompleted {
            task_id: "useref".to_string(),
            status: TaskStatus::Skipped("page failed".to_string()),
            duration_ms: 0,
            written: 0,
            failures: vec![],
        });

        let text = buf.text();
        assert!(text.contains("Running 2 tasks..."));
        assert!(text.contains("[1/2] partial style (1 file, 12ms)"));
        assert!(text.contains("src/b.scss: CompileError: line 1: oops"));
        assert!(text.contains("[2/2] skipped useref"));
        assert!(text.contains("page failed"));
    }

    #[test]
    fn test_console_run_completed() {
        let buf = SharedBuf::default();
        let reporter = ConsoleProgress::with_output(buf.clone());
        reporter.report(ProgressEvent::RunCompleted {
            status: RunStatus::Fatal,
            duration_ms: 40,
            succeeded: 3,
            failed: 1,
            skipped: 2,
            written: vec![],
        });
        assert!(buf.text().contains("Build failed: 3 succeeded, 1 failed, 2 skipped in 40ms"));
    }

    #[test]
    fn test_json_lines() {
        let buf = SharedBuf::default();
        let reporter = JsonProgress::with_output(buf.clone());
        reporter.report(ProgressEvent::TaskCompleted {
            task_id: "style\"x".to_string(),
            status: TaskStatus::Failed("all 1 file(s) failed".to_string()),
            duration_ms: 3,
            written: 0,
            failures: vec![FileFailure::new("b.scss", "CompileError", "bad")],
        });

        let value: serde_json::Value = serde_json::from_str(buf.text().trim()).unwrap();
        assert_eq!(value["event"], "task_completed");
        assert_eq!(value["task_id"], "style\"x");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["failures"][0]["kind"], "CompileError");
        assert_eq!(value["reason"], "all 1 file(s) failed");
    }

    #[test]
    fn test_fan_out() {
        let a = SharedBuf::default();
        let b = SharedBuf::default();
        let reporters = Reporters::new()
            .with(Arc::new(ConsoleProgress::with_output(a.clone())))
            .with(Arc::new(ConsoleProgress::with_output(b.clone()).with_verbose(true)));

        assert!(reporters.is_verbose());
        reporters.report(ProgressEvent::Warning { task_id: None, message: "careful".to_string() });
        assert!(a.text().contains("[warn] careful"));
        assert!(b.text().contains("[warn] careful"));
    }
}
