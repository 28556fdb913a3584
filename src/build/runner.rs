//! Pipeline execution.
//!
//! Executes a [`TaskGraph`] batch by batch, with a barrier between batches.
//!
//! # How It Works
//!
//! 1. Resolve the graph into batches of mutually independent tasks
//! 2. Skip tasks whose dependencies hard-failed (or were skipped themselves)
//! 3. Run the remaining tasks of a batch on a fixed pool of scoped workers
//! 4. Inside a task, process files in parallel; a failing file is recorded
//!    and its siblings continue
//! 5. Wait for the whole batch before starting the next
//!
//! Outputs are written atomically through a temp file in the destination
//! directory, so an interrupted run never leaves a partial file behind.

use rayon::prelude::*;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use super::context::BuildContext;
use super::fileset::FileRecord;
use super::graph::{GraphCycleError, Task, TaskAction, TaskGraph, TaskInput};
use super::progress::{NullProgress, ProgressEvent, ProgressReporter};
use super::result::{FileFailure, PipelineRun, TaskOutcome, TaskStatus};
use crate::transforms::Transform;

/// Shared flag for aborting a run between files.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Written paths of one run, with the source and hash that produced them.
#[derive(Debug, Default)]
struct OutputRegistry {
    written: Mutex<HashMap<PathBuf, (PathBuf, String)>>,
}

enum Claim {
    Write,
    /// Byte-identical to what is already there
    Duplicate,
    Conflict(PathBuf),
}

impl OutputRegistry {
    fn claim(&self, path: &Path, record: &FileRecord) -> Claim {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        match written.get(path) {
            Some((_, hash)) if hash == record.hash() => Claim::Duplicate,
            Some((source, _)) => Claim::Conflict(source.clone()),
            None => {
                written.insert(path.to_path_buf(), (record.source.clone(), record.hash().to_string()));
                Claim::Write
            }
        }
    }
}

/// Write a file via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.flush()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// What one source file produced.
///
/// `failures` covers outputs that could not be written; the ones that were
/// stay in `written` so the run still accounts for them.
enum FileResult {
    Done {
        records: Vec<FileRecord>,
        written: Vec<PathBuf>,
        warnings: Vec<String>,
        failures: Vec<FileFailure>,
    },
    Failed(FileFailure),
    Cancelled,
}

/// Pipeline executor.
pub struct PipelineRunner {
    /// Number of parallel task workers
    jobs: usize,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancelToken,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner").field("jobs", &self.jobs).field("cancel", &self.cancel).finish()
    }
}

impl PipelineRunner {
    /// Create a runner using the context's job count.
    pub fn new(ctx: &BuildContext) -> Self {
        Self { jobs: ctx.jobs().max(1), reporter: Arc::new(NullProgress), cancel: CancelToken::new() }
    }

    /// Set the number of parallel jobs.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get the number of parallel jobs.
    pub fn jobs(&self) -> usize {
        self.jobs
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run every task of the graph.
    ///
    /// Only a cycle can fail the call itself, and a built graph never has
    /// one; everything else is reported in the returned [`PipelineRun`].
    pub fn run(&self, graph: &TaskGraph) -> Result<PipelineRun, GraphCycleError> {
        let start = Instant::now();
        let batches = graph.resolve_order()?;

        let total_tasks = graph.tasks().iter().filter(|t| !t.is_barrier()).count();
        tracing::debug!(tasks = total_tasks, batches = batches.len(), jobs = self.jobs, "starting run");
        self.reporter.report(ProgressEvent::RunStarted { total_tasks });

        let registry = OutputRegistry::default();
        let mut run = PipelineRun::new();
        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();

        for batch in &batches {
            let mut runnable: Vec<&Task> = Vec::new();

            for id in batch {
                let Some(task) = graph.task(id) else { continue };
                let blocked = task
                    .dependencies()
                    .iter()
                    .find_map(|dep| {
                        statuses.get(dep).filter(|s| !s.allows_dependents()).map(|s| (dep.clone(), s.clone()))
                    });

                let held = if self.cancel.is_cancelled() {
                    Some(TaskOutcome::cancelled(id))
                } else if let Some((dep, status)) = blocked {
                    let reason = match status {
                        TaskStatus::Cancelled => format!("dependency '{}' was cancelled", dep),
                        TaskStatus::Skipped(_) => format!("dependency '{}' was skipped", dep),
                        _ => format!("dependency '{}' failed", dep),
                    };
                    Some(TaskOutcome::skipped(id, reason))
                } else if task.is_barrier() {
                    statuses.insert(id.clone(), TaskStatus::Success);
                    None
                } else {
                    runnable.push(task);
                    None
                };

                if let Some(outcome) = held {
                    statuses.insert(id.clone(), outcome.status.clone());
                    if !task.is_barrier() {
                        self.report_completed(&outcome);
                        run.add_outcome(outcome);
                    }
                }
            }

            for outcome in self.execute_batch(&runnable, &run, &registry) {
                statuses.insert(outcome.id.clone(), outcome.status.clone());
                self.report_completed(&outcome);
                run.add_outcome(outcome);
            }
        }

        let run = run.with_duration(start.elapsed());
        self.reporter.report(ProgressEvent::RunCompleted {
            status: run.status(),
            duration_ms: run.total_duration.as_millis() as u64,
            succeeded: run.success_count(),
            failed: run.failed_count(),
            skipped: run.skipped_count(),
            written: run.written_paths().into_iter().map(Path::to_path_buf).collect(),
        });
        Ok(run)
    }

    fn report_completed(&self, outcome: &TaskOutcome) {
        for warning in &outcome.warnings {
            self.reporter.report(ProgressEvent::Warning {
                task_id: Some(outcome.id.clone()),
                message: warning.clone(),
            });
        }
        self.reporter.report(ProgressEvent::TaskCompleted {
            task_id: outcome.id.clone(),
            status: outcome.status.clone(),
            duration_ms: outcome.duration.as_millis() as u64,
            written: outcome.written.len(),
            failures: outcome.failures.clone(),
        });
    }

    /// Execute one batch on up to `jobs` scoped workers.
    fn execute_batch(
        &self,
        tasks: &[&Task],
        run: &PipelineRun,
        registry: &OutputRegistry,
    ) -> Vec<TaskOutcome> {
        if tasks.is_empty() {
            return vec![];
        }

        if self.jobs == 1 || tasks.len() == 1 {
            return tasks.iter().map(|t| self.execute_task(t, run, registry)).collect();
        }

        let results = Mutex::new(Vec::new());
        let next_idx = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..self.jobs.min(tasks.len()) {
                s.spawn(|| loop {
                    let idx = next_idx.fetch_add(1, Ordering::SeqCst);
                    if idx >= tasks.len() {
                        break;
                    }
                    let outcome = self.execute_task(tasks[idx], run, registry);
                    if let Ok(mut results) = results.lock() {
                        results.push((idx, outcome));
                    }
                });
            }
        });

        // Sort results by original index to keep declaration order
        let mut results = results.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, outcome)| outcome).collect()
    }

    fn execute_task(&self, task: &Task, run: &PipelineRun, registry: &OutputRegistry) -> TaskOutcome {
        let start = Instant::now();
        self.reporter.report(ProgressEvent::TaskStarted { task_id: task.id().to_string() });
        tracing::debug!(task = %task.id(), "task started");

        match task.action() {
            TaskAction::Barrier => TaskOutcome::completed(task.id(), vec![], vec![], vec![], start.elapsed()),
            TaskAction::Clean(dirs) => match clean_dirs(dirs) {
                Ok(()) => TaskOutcome::completed(task.id(), vec![], vec![], vec![], start.elapsed()),
                Err(e) => TaskOutcome::failed(task.id(), e, start.elapsed()),
            },
            TaskAction::Transform { input, transforms, dest } => {
                self.execute_transform(task.id(), input, transforms, dest, run, registry, start)
            }
        }
    }

    fn execute_transform(
        &self,
        id: &str,
        input: &TaskInput,
        transforms: &[Arc<dyn Transform>],
        dest: &Path,
        run: &PipelineRun,
        registry: &OutputRegistry,
        start: Instant,
    ) -> TaskOutcome {
        let results: Vec<FileResult> = match input {
            TaskInput::Files(set) => {
                let paths = match set.resolve_paths() {
                    Ok(paths) => paths,
                    Err(e) => return TaskOutcome::failed(id, e.to_string(), start.elapsed()),
                };
                paths
                    .into_par_iter()
                    .map(|relative| {
                        if self.cancel.is_cancelled() {
                            return FileResult::Cancelled;
                        }
                        match FileRecord::read(set.base(), relative.clone()) {
                            Ok(record) => self.process_file(record, transforms, dest, registry),
                            Err(e) => FileResult::Failed(FileFailure::new(
                                set.base().join(&relative),
                                "IoError",
                                e.to_string(),
                            )),
                        }
                    })
                    .collect()
            }
            TaskInput::Upstream { tasks, pattern } => {
                let records: Vec<FileRecord> = tasks
                    .iter()
                    .filter_map(|t| run.outcome(t))
                    .flat_map(|outcome| outcome.produced.iter())
                    .filter(|r| {
                        pattern.as_ref().map_or(true, |p| {
                            p.matches_path_with(&r.relative, super::fileset::MATCH_OPTIONS)
                        })
                    })
                    .cloned()
                    .collect();
                records
                    .into_par_iter()
                    .map(|record| {
                        if self.cancel.is_cancelled() {
                            return FileResult::Cancelled;
                        }
                        self.process_file(record, transforms, dest, registry)
                    })
                    .collect()
            }
        };

        let mut produced = Vec::new();
        let mut written = Vec::new();
        let mut failures = Vec::new();
        let mut warnings = Vec::new();
        let mut cancelled = false;

        for result in results {
            match result {
                FileResult::Done { records, written: paths, warnings: w, failures: f } => {
                    produced.extend(records);
                    written.extend(paths);
                    warnings.extend(w);
                    failures.extend(f);
                }
                FileResult::Failed(f) => failures.push(f),
                FileResult::Cancelled => cancelled = true,
            }
        }

        for failure in &failures {
            tracing::warn!(
                task = %id,
                path = %failure.path.display(),
                kind = %failure.kind,
                "{}",
                failure.message
            );
        }

        let mut outcome =
            TaskOutcome::completed(id, produced, written, failures, start.elapsed()).with_warnings(warnings);
        if cancelled {
            outcome.status = TaskStatus::Cancelled;
        }
        tracing::debug!(
            task = %id,
            status = %outcome.status,
            written = outcome.written.len(),
            "task finished"
        );
        outcome
    }

    /// Apply the transform chain to one record and write every result.
    fn process_file(
        &self,
        record: FileRecord,
        transforms: &[Arc<dyn Transform>],
        dest: &Path,
        registry: &OutputRegistry,
    ) -> FileResult {
        let source = record.source.clone();
        let mut records = vec![record];

        for transform in transforms {
            let mut next = Vec::with_capacity(records.len());
            for record in records {
                match transform.apply_many(record) {
                    Ok(out) => next.extend(out),
                    Err(e) => {
                        return FileResult::Failed(FileFailure::new(&source, e.kind(), e.to_string()));
                    }
                }
            }
            records = next;
        }
        if self.cancel.is_cancelled() {
            return FileResult::Cancelled;
        }

        let mut written = Vec::new();
        let mut warnings = Vec::new();
        let mut failures = Vec::new();
        let mut kept = Vec::with_capacity(records.len());

        for record in records {
            let record = record.rebase(dest);
            let path = record.path();
            let relative = record.relative.display();
            warnings.extend(record.warnings().iter().map(|w| format!("{}: {}", relative, w)));

            match registry.claim(&path, &record) {
                Claim::Write => match write_atomic(&path, record.contents()) {
                    Ok(()) => {
                        written.push(path);
                        kept.push(record);
                    }
                    Err(e) => failures.push(FileFailure::new(&record.source, "IoError", e.to_string())),
                },
                Claim::Duplicate => {
                    tracing::debug!(path = %path.display(), "identical output already written");
                    kept.push(record);
                }
                Claim::Conflict(other) => failures.push(FileFailure::new(
                    &record.source,
                    "OutputConflict",
                    format!("{} is also produced from {}", path.display(), other.display()),
                )),
            }
        }

        FileResult::Done { records: kept, written, warnings, failures }
    }
}

fn clean_dirs(dirs: &[PathBuf]) -> Result<(), String> {
    for dir in dirs {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => tracing::debug!(dir = %dir.display(), "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(format!("failed to remove {}: {}", dir.display(), e)),
        }
    }
    Ok(())
}
