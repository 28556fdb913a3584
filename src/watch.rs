//! Watch mode for automatic rebuilds on file changes
//!
//! Provides file system watching with debouncing for the `pagewright dev`
//! command. A change is mapped to the tasks whose file set contains it, and
//! only those tasks plus everything downstream of them are re-run.
//!
//! Phases: `Idle -> Detecting -> Debouncing -> Rebuilding -> Idle`. A change
//! that arrives while a pass is rebuilding waits in the queue and triggers
//! the next pass; passes never overlap.

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::build::fileset::hash_file;
use crate::build::{BuildContext, FileSet, FileSetError, PipelineRun, PipelineRunner, TaskGraph};

/// Raw notify events are batched at this interval before entering the queue.
const RAW_EVENT_TICK: Duration = Duration::from_millis(25);

/// How long the loop sleeps when nothing is pending.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Error during watch mode
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WatchError {
    /// Failed to initialize file watcher
    #[error("Failed to initialize file watcher: {0}")]
    WatcherInit(#[source] notify::Error),
    /// Failed to add watch path
    #[error("Failed to watch {}: {source}", .path.display())]
    WatchPath {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    /// Channel receive error
    #[error("Watch channel error: {0}")]
    Channel(String),
    /// Source directory not found
    #[error("Source directory not found: {}", .0.display())]
    SourceNotFound(PathBuf),
    #[error(transparent)]
    FileSet(#[from] FileSetError),
}

/// Where the watcher is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    /// Classifying a raw event
    Detecting,
    /// Waiting for the debounce window of queued paths to pass
    Debouncing,
    Rebuilding,
}

/// Receives paths that need a browser reload but no rebuild.
pub trait ReloadNotifier: Send + Sync {
    fn reload(&self, paths: &[PathBuf]);
}

/// Coalesces change events per path.
///
/// Each event moves the path's deadline to `now + debounce`; a path is ready
/// once its deadline has passed with no further events.
#[derive(Debug)]
pub struct ChangeQueue {
    debounce: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl ChangeQueue {
    pub fn new(debounce: Duration) -> Self {
        Self { debounce, pending: HashMap::new() }
    }

    pub fn push(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now + self.debounce);
    }

    /// Remove and return the paths whose window has passed, sorted.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut ready: Vec<PathBuf> =
            self.pending.iter().filter(|(_, deadline)| **deadline <= now).map(|(p, _)| p.clone()).collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready.sort();
        ready
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Watched file sets and the tasks they trigger. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct WatchState {
    triggers: Vec<(FileSet, String)>,
    reload_only: Vec<FileSet>,
}

impl WatchState {
    /// Register every task file set of `graph`, plus the sets that only need
    /// a reload (images, fonts and the public directory).
    pub fn from_graph(graph: &TaskGraph, ctx: &BuildContext) -> Result<Self, FileSetError> {
        let triggers = graph
            .tasks()
            .iter()
            .filter_map(|task| task.file_set().map(|set| (set.clone(), task.id().to_string())))
            .collect();

        let paths = &ctx.config().build.paths;
        let reload_only = vec![
            FileSet::new(ctx.src_dir(), paths.images.as_str())?,
            FileSet::new(ctx.src_dir(), paths.fonts.as_str())?,
            FileSet::new(ctx.public_dir(), "**")?,
        ];
        Ok(Self { triggers, reload_only })
    }

    /// Task ids whose input contains `path`, in declaration order.
    pub fn tasks_for(&self, path: &Path) -> Vec<&str> {
        self.triggers.iter().filter(|(set, _)| set.matches(path)).map(|(_, id)| id.as_str()).collect()
    }

    pub fn is_reload_only(&self, path: &Path) -> bool {
        self.reload_only.iter().any(|set| set.matches(path))
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        !self.tasks_for(path).is_empty() || self.is_reload_only(path)
    }

    /// Every file currently matched by a watched set.
    fn files(&self) -> Vec<PathBuf> {
        let sets = self.triggers.iter().map(|(set, _)| set).chain(self.reload_only.iter());
        sets.flat_map(|set| {
            set.resolve_paths().unwrap_or_default().into_iter().map(move |rel| set.base().join(rel))
        })
        .collect()
    }
}

/// Tracks files with errors across passes for recovery detection
#[derive(Debug, Default)]
pub struct ErrorTracker {
    /// Failing files per task, from the last pass that ran the task
    files_with_errors: HashMap<String, HashSet<PathBuf>>,
}

impl ErrorTracker {
    /// Create a new error tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Update with the tasks of a run; returns files that no longer fail.
    pub fn update(&mut self, run: &PipelineRun) -> Vec<PathBuf> {
        let mut fixed = Vec::new();
        for outcome in &run.tasks {
            let current: HashSet<PathBuf> = outcome.failures.iter().map(|f| f.path.clone()).collect();
            if let Some(previous) = self.files_with_errors.get(&outcome.id) {
                fixed.extend(previous.difference(&current).cloned());
            }
            self.files_with_errors.insert(outcome.id.clone(), current);
        }
        fixed.sort();
        fixed
    }

    /// Check if there are any tracked errors
    pub fn has_errors(&self) -> bool {
        self.files_with_errors.values().any(|files| !files.is_empty())
    }

    /// Get the number of files with errors
    pub fn error_count(&self) -> usize {
        self.files_with_errors.values().map(HashSet::len).sum()
    }
}

/// What one rebuild pass did.
#[derive(Debug)]
pub struct PassOutcome {
    /// Paths whose contents changed
    pub changed: Vec<PathBuf>,
    /// Root tasks of the rebuilt subgraph
    pub tasks: Vec<String>,
    pub run: Option<PipelineRun>,
    /// Paths forwarded to the reload notifier
    pub reloaded: Vec<PathBuf>,
    /// Files that failed in an earlier pass and succeed now
    pub fixed: Vec<PathBuf>,
}

/// Clear the terminal screen
fn clear_screen() {
    print!("\x1B[2J\x1B[1;1H");
}

/// Current local time for log lines.
fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// Incremental rebuild driver.
pub struct Watcher {
    graph: TaskGraph,
    state: WatchState,
    runner: PipelineRunner,
    queue: ChangeQueue,
    hashes: HashMap<PathBuf, Option<String>>,
    phase: WatchPhase,
    tracker: ErrorTracker,
    notifier: Option<Arc<dyn ReloadNotifier>>,
    roots: Vec<PathBuf>,
    clear_screen: bool,
    passes: usize,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("phase", &self.phase)
            .field("pending", &self.queue.len())
            .field("passes", &self.passes)
            .finish()
    }
}

impl Watcher {
    /// Create a watcher over `graph`; the current contents of every watched
    /// file are recorded so that touching a file without editing it is ignored.
    pub fn new(ctx: &BuildContext, graph: TaskGraph, runner: PipelineRunner) -> Result<Self, WatchError> {
        let state = WatchState::from_graph(&graph, ctx)?;
        let watch = &ctx.config().watch;
        let mut watcher = Self {
            graph,
            state,
            runner,
            queue: ChangeQueue::new(Duration::from_millis(u64::from(watch.debounce_ms))),
            hashes: HashMap::new(),
            phase: WatchPhase::Idle,
            tracker: ErrorTracker::new(),
            notifier: None,
            roots: vec![ctx.src_dir(), ctx.public_dir()],
            clear_screen: watch.clear_screen,
            passes: 0,
        };
        watcher.snapshot();
        Ok(watcher)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ReloadNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn phase(&self) -> WatchPhase {
        self.phase
    }

    /// Number of rebuild passes run so far.
    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    /// Record the hash of every watched file.
    pub fn snapshot(&mut self) {
        for path in self.state.files() {
            let hash = hash_file(&path);
            self.hashes.insert(path, hash);
        }
    }

    /// Run the whole graph once and seed the error tracker.
    pub fn initial_build(&mut self) -> Option<PipelineRun> {
        println!("[{}] Building...", timestamp());
        let run = match self.runner.run(&self.graph) {
            Ok(run) => run,
            Err(e) => {
                eprintln!("[{}] Error: {}", timestamp(), e);
                return None;
            }
        };
        self.tracker.update(&run);
        print_run(&run, &[]);
        self.snapshot();
        Some(run)
    }

    /// Queue a raw change event; irrelevant paths are dropped.
    pub fn record_event(&mut self, path: PathBuf, now: Instant) {
        self.phase = WatchPhase::Detecting;
        if self.state.is_watched(&path) {
            tracing::debug!(path = %path.display(), "change queued");
            self.queue.push(path, now);
        }
        self.phase = if self.queue.is_empty() { WatchPhase::Idle } else { WatchPhase::Debouncing };
    }

    /// Whether the file differs from the last recorded contents; records the new hash.
    fn content_changed(&mut self, path: &Path) -> bool {
        let current = hash_file(path);
        let previous = self.hashes.insert(path.to_path_buf(), current.clone());
        previous.flatten() != current
    }

    /// Run one pass for every path whose window has passed by `now`.
    pub fn tick(&mut self, now: Instant) -> Option<PassOutcome> {
        let ready = self.queue.drain_ready(now);
        let changed: Vec<PathBuf> = ready.into_iter().filter(|p| self.content_changed(p)).collect();
        if changed.is_empty() {
            self.settle();
            return None;
        }

        self.phase = WatchPhase::Rebuilding;
        if self.clear_screen {
            clear_screen();
        }
        for path in &changed {
            if let Some(name) = path.file_name() {
                println!("[{}] Changed: {}", timestamp(), name.to_string_lossy());
            }
        }

        let mut tasks: Vec<String> = Vec::new();
        for path in &changed {
            for id in self.state.tasks_for(path) {
                if !tasks.iter().any(|t| t == id) {
                    tasks.push(id.to_string());
                }
            }
        }
        let reloaded: Vec<PathBuf> =
            changed.iter().filter(|p| self.state.is_reload_only(p)).cloned().collect();

        let run = if tasks.is_empty() {
            None
        } else {
            println!("[{}] Building...", timestamp());
            let roots: Vec<&str> = tasks.iter().map(String::as_str).collect();
            let subgraph = self.graph.subgraph(&roots);
            match self.runner.run(&subgraph) {
                Ok(run) => Some(run),
                Err(e) => {
                    eprintln!("[{}] Error: {}", timestamp(), e);
                    None
                }
            }
        };

        let fixed = match &run {
            Some(run) => {
                let fixed = self.tracker.update(run);
                print_run(run, &fixed);
                fixed
            }
            None => vec![],
        };

        if !reloaded.is_empty() {
            if let Some(notifier) = &self.notifier {
                notifier.reload(&reloaded);
            }
        }

        self.passes += 1;
        self.settle();
        Some(PassOutcome { changed, tasks, run, reloaded, fixed })
    }

    fn settle(&mut self) {
        self.phase = if self.queue.is_empty() { WatchPhase::Idle } else { WatchPhase::Debouncing };
    }

    /// Watch the source and public trees and rebuild until the channel closes.
    ///
    /// This function blocks and runs until interrupted (Ctrl+C).
    pub fn run(mut self) -> Result<(), WatchError> {
        let Some(src) = self.roots.first().cloned() else {
            return Ok(());
        };
        if !src.exists() {
            return Err(WatchError::SourceNotFound(src));
        }

        let (tx, rx) = channel();
        let mut debouncer = new_debouncer(RAW_EVENT_TICK, tx).map_err(WatchError::WatcherInit)?;
        for root in self.roots.iter().filter(|r| r.exists()) {
            debouncer
                .watcher()
                .watch(root, RecursiveMode::Recursive)
                .map_err(|source| WatchError::WatchPath { path: root.clone(), source })?;
        }

        println!("[{}] Watching {} for changes...", timestamp(), src.display());

        loop {
            let timeout = self
                .queue
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_POLL);

            match rx.recv_timeout(timeout) {
                Ok(Ok(events)) => {
                    let now = Instant::now();
                    for event in events {
                        if matches!(event.kind, DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous) {
                            self.record_event(event.path, now);
                        }
                    }
                }
                Ok(Err(error)) => {
                    // Watch error (non-fatal) - log but continue watching
                    eprintln!("[{}] Watch error: {:?}", timestamp(), error);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(WatchError::Channel("event channel closed".to_string()));
                }
            }

            if self.tick(Instant::now()).is_some() {
                println!("[{}] Watching {} for changes...", timestamp(), src.display());
            }
        }
    }
}

/// Print a pass result with fixed file notifications
fn print_run(run: &PipelineRun, fixed: &[PathBuf]) {
    for path in fixed {
        if let Some(name) = path.file_name() {
            println!("[{}] Fixed: {}", timestamp(), name.to_string_lossy());
        }
    }

    let summary = run.summary();
    if run.is_success() {
        println!("[{}] {}", timestamp(), summary);
    } else {
        eprintln!("[{}] {}", timestamp(), summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{standard_graph, FileFailure, GraphKind, TaskOutcome};
    use crate::config::default_config;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[derive(Default)]
    struct Recorded(Mutex<Vec<PathBuf>>);

    impl ReloadNotifier for Recorded {
        fn reload(&self, paths: &[PathBuf]) {
            self.0.lock().unwrap().extend_from_slice(paths);
        }
    }

    fn dev_watcher(root: &Path) -> (BuildContext, Watcher) {
        let ctx = BuildContext::new(default_config(), root.to_path_buf()).with_jobs(1);
        let graph = standard_graph(&ctx, GraphKind::Dev).unwrap();
        let runner = PipelineRunner::new(&ctx);
        let watcher = Watcher::new(&ctx, graph, runner).unwrap();
        (ctx, watcher)
    }

    #[test]
    fn test_change_queue_coalesces() {
        let mut queue = ChangeQueue::new(Duration::from_millis(100));
        let start = Instant::now();
        let path = PathBuf::from("/p/a.scss");

        for i in 0..5 {
            queue.push(path.clone(), start + Duration::from_millis(i * 10));
        }
        assert_eq!(queue.len(), 1);
        assert!(queue.drain_ready(start + Duration::from_millis(100)).is_empty());
        assert_eq!(queue.drain_ready(start + Duration::from_millis(140)), vec![path]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_change_queue_next_deadline() {
        let mut queue = ChangeQueue::new(Duration::from_millis(50));
        assert!(queue.next_deadline().is_none());
        let now = Instant::now();
        queue.push(PathBuf::from("b"), now + Duration::from_millis(20));
        queue.push(PathBuf::from("a"), now);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(50)));
    }

    #[test]
    fn test_watch_state_mapping() {
        let temp = TempDir::new().unwrap();
        let (_, watcher) = dev_watcher(temp.path());
        let state = watcher.state();
        let src = temp.path().join("src");

        assert_eq!(state.tasks_for(&src.join("assets/styles/a.scss")), vec!["style"]);
        assert_eq!(state.tasks_for(&src.join("assets/scripts/a.js")), vec!["script"]);
        assert_eq!(state.tasks_for(&src.join("index.html")), vec!["page"]);
        assert!(state.tasks_for(&src.join("assets/images/a.png")).is_empty());
        assert!(state.is_reload_only(&src.join("assets/images/a.png")));
        assert!(state.is_reload_only(&temp.path().join("public/favicon.ico")));
        assert!(!state.is_watched(&temp.path().join("README.md")));
    }

    #[test]
    fn test_five_events_one_pass() {
        let temp = TempDir::new().unwrap();
        let style = create_test_file(temp.path(), "src/assets/styles/a.scss", "a { color: red; }");
        create_test_file(temp.path(), "src/index.html", "<p>hi</p>");
        let (_, mut watcher) = dev_watcher(temp.path());

        fs::write(&style, "a { color: blue; }").unwrap();
        let start = Instant::now();
        for i in 0..5 {
            watcher.record_event(style.clone(), start + Duration::from_millis(i * 10));
        }
        assert_eq!(watcher.phase(), WatchPhase::Debouncing);
        assert!(watcher.tick(start + Duration::from_millis(50)).is_none());

        let pass = watcher.tick(start + Duration::from_millis(500)).unwrap();
        assert_eq!(watcher.passes(), 1);
        assert_eq!(watcher.phase(), WatchPhase::Idle);
        assert_eq!(pass.tasks, vec!["style"]);

        let run = pass.run.unwrap();
        let ids: Vec<&str> = run.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["style"]);
        let css = fs::read_to_string(temp.path().join("templates/assets/styles/a.css")).unwrap();
        assert!(css.contains("blue"));
        assert!(!temp.path().join("templates/index.html").exists());

        assert!(watcher.tick(start + Duration::from_millis(900)).is_none());
        assert_eq!(watcher.passes(), 1);
    }

    #[test]
    fn test_touch_without_edit_is_ignored() {
        let temp = TempDir::new().unwrap();
        let page = create_test_file(temp.path(), "src/index.html", "<p>hi</p>");
        let (_, mut watcher) = dev_watcher(temp.path());

        fs::write(&page, "<p>hi</p>").unwrap();
        let now = Instant::now();
        watcher.record_event(page, now);
        assert!(watcher.tick(now + Duration::from_secs(1)).is_none());
        assert_eq!(watcher.passes(), 0);
        assert_eq!(watcher.phase(), WatchPhase::Idle);
    }

    #[test]
    fn test_irrelevant_event_dropped() {
        let temp = TempDir::new().unwrap();
        let (_, mut watcher) = dev_watcher(temp.path());
        watcher.record_event(temp.path().join("notes.md"), Instant::now());
        assert_eq!(watcher.phase(), WatchPhase::Idle);
    }

    #[test]
    fn test_image_change_only_reloads() {
        let temp = TempDir::new().unwrap();
        let (_, watcher) = dev_watcher(temp.path());
        let recorded = Arc::new(Recorded::default());
        let mut watcher = watcher.with_notifier(recorded.clone());

        let image = create_test_file(temp.path(), "src/assets/images/logo.svg", "<svg/>");
        let now = Instant::now();
        watcher.record_event(image.clone(), now);
        let pass = watcher.tick(now + Duration::from_secs(1)).unwrap();

        assert!(pass.run.is_none());
        assert_eq!(pass.reloaded, vec![image.clone()]);
        assert_eq!(*recorded.0.lock().unwrap(), vec![image]);
    }

    #[test]
    fn test_failing_pass_keeps_watching_and_reports_fix() {
        let temp = TempDir::new().unwrap();
        let style = create_test_file(temp.path(), "src/assets/styles/a.scss", "a { color: red; }");
        let (_, mut watcher) = dev_watcher(temp.path());

        fs::write(&style, "a { color: red;").unwrap();
        let now = Instant::now();
        watcher.record_event(style.clone(), now);
        let broken = watcher.tick(now + Duration::from_secs(1)).unwrap();
        assert!(broken.run.unwrap().has_hard_failure());

        fs::write(&style, "a { color: green; }").unwrap();
        watcher.record_event(style.clone(), now + Duration::from_secs(2));
        let fixed = watcher.tick(now + Duration::from_secs(3)).unwrap();
        assert!(fixed.run.unwrap().is_success());
        assert_eq!(fixed.fixed, vec![style]);
        assert_eq!(watcher.passes(), 2);
    }

    #[test]
    fn test_error_tracker_only_updates_tasks_that_ran() {
        let mut tracker = ErrorTracker::new();
        let mut first = PipelineRun::new();
        first.add_outcome(TaskOutcome::completed(
            "style",
            vec![],
            vec![],
            vec![FileFailure::new("b.scss", "CompileError", "x")],
            Duration::ZERO,
        ));
        first.add_outcome(TaskOutcome::completed(
            "page",
            vec![],
            vec![],
            vec![FileFailure::new("index.html", "RenderError", "y")],
            Duration::ZERO,
        ));
        assert!(tracker.update(&first).is_empty());
        assert_eq!(tracker.error_count(), 2);

        let mut second = PipelineRun::new();
        second.add_outcome(TaskOutcome::completed("style", vec![], vec![], vec![], Duration::ZERO));
        assert_eq!(tracker.update(&second), vec![PathBuf::from("b.scss")]);
        assert!(tracker.has_errors());
        assert_eq!(tracker.error_count(), 1);
    }
}
