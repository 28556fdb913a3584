//! Task graph construction and batch ordering.
//!
//! Tasks are declared once through [`TaskGraphBuilder`], validated when the
//! graph is built, and immutable afterwards. Validation is where every
//! structural problem surfaces (cycles, unknown ids, overlapping outputs of
//! unordered tasks), so nothing about the graph can fail once a run starts.
//!
//! # Example
//!
//! ```ignore
//! let graph = TaskGraphBuilder::new()
//!     .task(Task::clean("clean", vec![dist]))
//!     .task(style_task)
//!     .task(script_task)
//!     .parallel("compile", &["style", "script"])
//!     .series("build", &["clean", "compile"])
//!     .build()?;
//!
//! for batch in graph.resolve_order()? {
//!     println!("{:?}", batch);
//! }
//! ```

use glob::Pattern;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::fileset::{FileSet, FileSetError, MATCH_OPTIONS};
use crate::transforms::Transform;

/// Task ids with no dependency among them.
pub type Batch = Vec<String>;

/// A dependency cycle, listed in edge order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dependency cycle: {}", cycle_display(.ids))]
pub struct GraphCycleError {
    pub ids: Vec<String>,
}

fn cycle_display(ids: &[String]) -> String {
    let mut parts: Vec<&str> = ids.iter().map(String::as_str).collect();
    if let Some(first) = ids.first() {
        parts.push(first);
    }
    parts.join(" -> ")
}

/// Graph construction failure.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GraphError {
    #[error(transparent)]
    Cycle(#[from] GraphCycleError),

    #[error("task '{0}' is declared more than once")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("tasks '{first}' and '{second}' may both write {path} but are not ordered")]
    OutputConflict { first: String, second: String, path: String },

    #[error(transparent)]
    FileSet(#[from] FileSetError),
}

/// Where a transform task reads its records from.
#[derive(Debug, Clone)]
pub enum TaskInput {
    /// Files on disk, re-resolved on every run
    Files(FileSet),
    /// Records produced earlier in the same run by other tasks
    Upstream { tasks: Vec<String>, pattern: Option<Pattern> },
}

impl TaskInput {
    pub fn upstream(tasks: &[&str]) -> Self {
        TaskInput::Upstream { tasks: tasks.iter().map(|t| t.to_string()).collect(), pattern: None }
    }

    pub fn upstream_matching(tasks: &[&str], pattern: &str) -> Result<Self, FileSetError> {
        let compiled =
            Pattern::new(pattern).map_err(|e| FileSetError::InvalidPattern(pattern.to_string(), e))?;
        Ok(TaskInput::Upstream {
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
            pattern: Some(compiled),
        })
    }
}

/// What running a task does.
#[derive(Clone)]
pub enum TaskAction {
    /// Remove directories
    Clean(Vec<PathBuf>),
    /// Read input, apply transforms in order, write under `dest`
    Transform { input: TaskInput, transforms: Vec<Arc<dyn Transform>>, dest: PathBuf },
    /// Composite node; completes when its dependencies do
    Barrier,
}

impl std::fmt::Debug for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskAction::Clean(dirs) => f.debug_tuple("Clean").field(dirs).finish(),
            TaskAction::Transform { input, transforms, dest } => {
                let names: Vec<&str> = transforms.iter().map(|t| t.name()).collect();
                f.debug_struct("Transform")
                    .field("input", input)
                    .field("transforms", &names)
                    .field("dest", dest)
                    .finish()
            }
            TaskAction::Barrier => f.write_str("Barrier"),
        }
    }
}

/// An output location a task may write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputClaim {
    /// Everything under a directory (clean)
    Tree(PathBuf),
    /// One file
    Path { root: PathBuf, relative: PathBuf },
    /// Files matching a glob relative to `root`
    Pattern { root: PathBuf, pattern: String },
}

impl OutputClaim {
    fn root(&self) -> &Path {
        match self {
            OutputClaim::Tree(root) => root,
            OutputClaim::Path { root, .. } | OutputClaim::Pattern { root, .. } => root,
        }
    }

    fn describe(&self) -> String {
        match self {
            OutputClaim::Tree(root) => root.display().to_string(),
            OutputClaim::Path { root, relative } => root.join(relative).display().to_string(),
            OutputClaim::Pattern { root, pattern } => root.join(pattern).display().to_string(),
        }
    }

    /// Whether two claims could name the same file.
    pub fn overlaps(&self, other: &OutputClaim) -> bool {
        match (self, other) {
            (OutputClaim::Tree(a), b) | (b, OutputClaim::Tree(a)) => {
                let b = b.root();
                b.starts_with(a) || a.starts_with(b)
            }
            _ if self.root() != other.root() => false,
            (OutputClaim::Path { relative: a, .. }, OutputClaim::Path { relative: b, .. }) => a == b,
            (OutputClaim::Path { relative, .. }, OutputClaim::Pattern { pattern, .. })
            | (OutputClaim::Pattern { pattern, .. }, OutputClaim::Path { relative, .. }) => {
                Pattern::new(pattern)
                    .map(|p| p.matches_path_with(relative, MATCH_OPTIONS))
                    .unwrap_or(true)
            }
            (OutputClaim::Pattern { pattern: a, .. }, OutputClaim::Pattern { pattern: b, .. }) => {
                patterns_overlap(a, b)
            }
        }
    }
}

/// Conservative component-wise comparison; `**` overlaps anything after it.
fn patterns_overlap(a: &str, b: &str) -> bool {
    let a: Vec<&str> = a.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    let b: Vec<&str> = b.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    components_overlap(&a, &b)
}

fn components_overlap(a: &[&str], b: &[&str]) -> bool {
    match (a.first(), b.first()) {
        (None, None) => true,
        (Some(&"**"), _) | (_, Some(&"**")) => true,
        (None, _) | (_, None) => false,
        (Some(x), Some(y)) => component_overlap(x, y) && components_overlap(&a[1..], &b[1..]),
    }
}

fn component_overlap(x: &str, y: &str) -> bool {
    let meta = |s: &str| s.contains(['*', '?', '[']);
    match (meta(x), meta(y)) {
        (false, false) => x == y,
        (true, false) => Pattern::new(x).map(|p| p.matches(y)).unwrap_or(true),
        (false, true) => Pattern::new(y).map(|p| p.matches(x)).unwrap_or(true),
        (true, true) => true,
    }
}

/// A declared unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    id: String,
    action: TaskAction,
    dependencies: Vec<String>,
    claims: Vec<OutputClaim>,
}

impl Task {
    /// A task that removes directories.
    pub fn clean(id: impl Into<String>, dirs: Vec<PathBuf>) -> Self {
        let claims = dirs.iter().cloned().map(OutputClaim::Tree).collect();
        Self { id: id.into(), action: TaskAction::Clean(dirs), dependencies: vec![], claims }
    }

    /// A task that transforms input records into `dest`.
    ///
    /// Output claims are computed now: file inputs are resolved and mapped
    /// through each stage's output path; upstream inputs claim everything
    /// under `dest` unless narrowed with [`Task::with_claims`]. Upstream
    /// tasks become dependencies.
    pub fn transform(
        id: impl Into<String>,
        input: TaskInput,
        transforms: Vec<Arc<dyn Transform>>,
        dest: impl Into<PathBuf>,
    ) -> Result<Self, FileSetError> {
        let dest = dest.into();
        let (claims, dependencies) = match &input {
            TaskInput::Files(set) => {
                let claims = set
                    .resolve_paths()?
                    .into_iter()
                    .map(|relative| OutputClaim::Path {
                        root: dest.clone(),
                        relative: transforms.iter().fold(relative, |path, t| t.output_path(&path)),
                    })
                    .collect();
                (claims, vec![])
            }
            TaskInput::Upstream { tasks, .. } => {
                (vec![OutputClaim::Pattern { root: dest.clone(), pattern: "**".to_string() }], tasks.clone())
            }
        };
        Ok(Self {
            id: id.into(),
            action: TaskAction::Transform { input, transforms, dest },
            dependencies,
            claims,
        })
    }

    /// A composite node with no work of its own.
    pub fn barrier(id: impl Into<String>) -> Self {
        Self { id: id.into(), action: TaskAction::Barrier, dependencies: vec![], claims: vec![] }
    }

    /// Add explicit dependencies.
    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        for id in ids {
            self.add_dependency(id);
        }
        self
    }

    /// Replace the computed output claims.
    pub fn with_claims(mut self, claims: Vec<OutputClaim>) -> Self {
        self.claims = claims;
        self
    }

    fn add_dependency(&mut self, id: &str) {
        if !self.dependencies.iter().any(|d| d == id) {
            self.dependencies.push(id.to_string());
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn action(&self) -> &TaskAction {
        &self.action
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn claims(&self) -> &[OutputClaim] {
        &self.claims
    }

    /// The on-disk file set this task reads, if any.
    pub fn file_set(&self) -> Option<&FileSet> {
        match &self.action {
            TaskAction::Transform { input: TaskInput::Files(set), .. } => Some(set),
            _ => None,
        }
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self.action, TaskAction::Barrier)
    }
}

#[derive(Debug, Clone)]
enum Composite {
    Series(Vec<String>),
    Parallel(Vec<String>),
}

/// Declares tasks and composites; errors are reported by [`build`](Self::build).
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    composites: HashMap<String, Composite>,
    errors: Vec<GraphError>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a task.
    pub fn task(mut self, task: Task) -> Self {
        self.insert(task);
        self
    }

    /// Declare a task with additional dependencies.
    pub fn declare(self, task: Task, depends_on: &[&str]) -> Self {
        self.task(task.depends_on(depends_on))
    }

    /// Run `steps` strictly one after another.
    ///
    /// Every entry node of step N+1 waits for step N; the composite `name`
    /// completes when the last step does.
    pub fn series(mut self, name: &str, steps: &[&str]) -> Self {
        for pair in steps.windows(2) {
            let (previous, next) = (pair[0], pair[1]);
            for entry in self.entries(next) {
                match self.index.get(&entry) {
                    Some(&i) => self.tasks[i].add_dependency(previous),
                    None => self.errors.push(GraphError::UnknownDependency {
                        task: name.to_string(),
                        dependency: entry,
                    }),
                }
            }
        }
        let barrier = Task::barrier(name).depends_on(steps.last().map(std::slice::from_ref).unwrap_or(&[]));
        if self.insert(barrier) {
            self.composites.insert(name.to_string(), Composite::Series(to_owned(steps)));
        }
        self
    }

    /// Run `members` independently; the composite `name` completes when all do.
    pub fn parallel(mut self, name: &str, members: &[&str]) -> Self {
        let barrier = Task::barrier(name).depends_on(members);
        if self.insert(barrier) {
            self.composites.insert(name.to_string(), Composite::Parallel(to_owned(members)));
        }
        self
    }

    fn insert(&mut self, task: Task) -> bool {
        if self.index.contains_key(task.id()) {
            self.errors.push(GraphError::DuplicateTask(task.id().to_string()));
            return false;
        }
        self.index.insert(task.id().to_string(), self.tasks.len());
        self.tasks.push(task);
        true
    }

    /// Leaf tasks that start a step.
    fn entries(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.collect_entries(id, &mut out, &mut seen);
        out
    }

    fn collect_entries(&self, id: &str, out: &mut Vec<String>, seen: &mut HashSet<String>) {
        if !seen.insert(id.to_string()) {
            return;
        }
        match self.composites.get(id) {
            Some(Composite::Series(steps)) => match steps.first() {
                Some(first) => self.collect_entries(first, out, seen),
                None => out.push(id.to_string()),
            },
            Some(Composite::Parallel(members)) if !members.is_empty() => {
                for member in members {
                    self.collect_entries(member, out, seen);
                }
            }
            _ => out.push(id.to_string()),
        }
    }

    /// Validate and freeze the graph.
    pub fn build(mut self) -> Result<TaskGraph, GraphError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }

        for task in &self.tasks {
            for dep in &task.dependencies {
                if !self.index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let graph = TaskGraph { tasks: self.tasks, index: self.index };
        if let Some(cycle) = graph.find_cycle() {
            return Err(GraphCycleError { ids: cycle }.into());
        }
        graph.check_output_conflicts()?;
        Ok(graph)
    }
}

fn to_owned(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

/// A validated, immutable task graph.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Dependencies of `id` that are part of this graph.
    fn local_dependencies<'a>(&'a self, task: &'a Task) -> impl Iterator<Item = &'a str> {
        task.dependencies.iter().map(String::as_str).filter(|d| self.contains(d))
    }

    /// Tasks that list `id` as a direct dependency.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.dependencies.iter().any(|d| d == id))
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Every task that runs after `id` because of it, in declaration order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<&str> {
        let mut found: HashSet<&str> = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(current) {
                if found.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        self.tasks.iter().map(|t| t.id.as_str()).filter(|t| found.contains(t)).collect()
    }

    /// Whether `later` transitively depends on `earlier`.
    pub fn reaches(&self, earlier: &str, later: &str) -> bool {
        let Some(task) = self.task(later) else { return false };
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = self.local_dependencies(task).collect();
        while let Some(current) = stack.pop() {
            if current == earlier {
                return true;
            }
            if seen.insert(current) {
                if let Some(t) = self.task(current) {
                    stack.extend(self.local_dependencies(t));
                }
            }
        }
        false
    }

    /// The graph restricted to `roots` and everything downstream of them.
    ///
    /// Dependencies outside the result are treated as already satisfied.
    pub fn subgraph(&self, roots: &[&str]) -> TaskGraph {
        let mut keep: HashSet<&str> = HashSet::new();
        for root in roots {
            if self.contains(root) {
                keep.insert(root);
                keep.extend(self.transitive_dependents(root));
            }
        }

        let tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| keep.contains(t.id.as_str()))
            .map(|t| {
                let mut task = t.clone();
                task.dependencies.retain(|d| keep.contains(d.as_str()));
                task
            })
            .collect();
        let index = tasks.iter().enumerate().map(|(i, t)| (t.id.clone(), i)).collect();
        TaskGraph { tasks, index }
    }

    /// Group tasks into batches by longest dependency path.
    ///
    /// Every task's dependencies are in earlier batches; tasks keep their
    /// declaration order within a batch.
    pub fn resolve_order(&self) -> Result<Vec<Batch>, GraphCycleError> {
        let mut levels: HashMap<&str, usize> = HashMap::new();
        let mut remaining: Vec<&Task> = self.tasks.iter().collect();
        let mut batches: Vec<Batch> = Vec::new();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<&Task>, Vec<&Task>) = remaining
                .into_iter()
                .partition(|t| self.local_dependencies(t).all(|d| levels.contains_key(d)));

            if ready.is_empty() {
                let ids = self.find_cycle().unwrap_or_else(|| blocked.iter().map(|t| t.id.clone()).collect());
                return Err(GraphCycleError { ids });
            }

            let level = batches.len();
            for task in &ready {
                levels.insert(task.id.as_str(), level);
            }
            batches.push(ready.iter().map(|t| t.id.clone()).collect());
            remaining = blocked;
        }

        Ok(batches)
    }

    /// One dependency cycle, if any.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Visiting,
            Done,
        }

        fn visit(
            graph: &TaskGraph,
            i: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[i] = Mark::Visiting;
            stack.push(i);
            let task = &graph.tasks[i];
            for dep in graph.local_dependencies(task) {
                let Some(&j) = graph.index.get(dep) else { continue };
                match marks[j] {
                    Mark::Visiting => {
                        let start = stack.iter().position(|&k| k == j).unwrap_or(0);
                        let mut ids: Vec<String> =
                            stack[start..].iter().map(|&k| graph.tasks[k].id.clone()).collect();
                        // Stack runs dependent -> dependency; report in execution order.
                        ids.reverse();
                        return Some(ids);
                    }
                    Mark::New => {
                        if let Some(cycle) = visit(graph, j, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks[i] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; self.tasks.len()];
        let mut stack = Vec::new();
        for i in 0..self.tasks.len() {
            if marks[i] == Mark::New {
                if let Some(cycle) = visit(self, i, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn check_output_conflicts(&self) -> Result<(), GraphError> {
        for (i, a) in self.tasks.iter().enumerate() {
            for b in &self.tasks[i + 1..] {
                if a.claims.is_empty() || b.claims.is_empty() {
                    continue;
                }
                if self.reaches(&a.id, &b.id) || self.reaches(&b.id, &a.id) {
                    continue;
                }
                for claim in &a.claims {
                    if let Some(other) = b.claims.iter().find(|c| claim.overlaps(c)) {
                        let path = match claim {
                            OutputClaim::Path { .. } => claim.describe(),
                            _ => other.describe(),
                        };
                        return Err(GraphError::OutputConflict {
                            first: a.id.clone(),
                            second: b.id.clone(),
                            path,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::ScriptTranspile;
    use std::fs;
    use tempfile::TempDir;

    fn leaf(id: &str) -> Task {
        Task::barrier(id)
    }

    fn claiming(id: &str, root: &str, pattern: &str) -> Task {
        Task::barrier(id).with_claims(vec![OutputClaim::Pattern {
            root: PathBuf::from(root),
            pattern: pattern.to_string(),
        }])
    }

    #[test]
    fn test_resolve_order_levels() {
        let graph = TaskGraphBuilder::new()
            .task(leaf("a"))
            .task(leaf("b"))
            .declare(leaf("c"), &["a"])
            .declare(leaf("d"), &["a", "c"])
            .build()
            .unwrap();

        let batches = graph.resolve_order().unwrap();
        assert_eq!(batches, vec![vec!["a", "b"], vec!["c"], vec!["d"]]);
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraphBuilder::new().build().unwrap();
        assert!(graph.is_empty());
        assert!(graph.resolve_order().unwrap().is_empty());
    }

    #[test]
    fn test_cycle_detected_at_build() {
        let err = TaskGraphBuilder::new()
            .declare(leaf("a"), &["c"])
            .declare(leaf("b"), &["a"])
            .declare(leaf("c"), &["b"])
            .task(leaf("free"))
            .build()
            .unwrap_err();

        let GraphError::Cycle(cycle) = err else { panic!("expected a cycle error") };
        let mut ids = cycle.ids.clone();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(cycle.to_string().starts_with("dependency cycle: "));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = TaskGraphBuilder::new().declare(leaf("a"), &["a"]).build().unwrap_err();
        assert!(matches!(err, GraphError::Cycle(ref c) if c.ids == vec!["a".to_string()]));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = TaskGraphBuilder::new().declare(leaf("a"), &["ghost"]).build().unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { ref dependency, .. } if dependency == "ghost"));
    }

    #[test]
    fn test_duplicate_task() {
        let err = TaskGraphBuilder::new().task(leaf("a")).task(leaf("a")).build().unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTask(ref id) if id == "a"));
    }

    #[test]
    fn test_series_chains_steps() {
        let graph = TaskGraphBuilder::new()
            .task(leaf("clean"))
            .task(leaf("style"))
            .task(leaf("script"))
            .task(leaf("useref"))
            .parallel("compile", &["style", "script"])
            .series("build", &["clean", "compile", "useref"])
            .build()
            .unwrap();

        let batches = graph.resolve_order().unwrap();
        assert_eq!(
            batches,
            vec![vec!["clean"], vec!["style", "script"], vec!["compile"], vec!["useref"], vec!["build"]]
        );
        assert!(graph.reaches("clean", "useref"));
        assert!(!graph.reaches("style", "script"));
    }

    #[test]
    fn test_nested_composites() {
        let graph = TaskGraphBuilder::new()
            .task(leaf("clean"))
            .task(leaf("style"))
            .task(leaf("useref"))
            .task(leaf("image"))
            .parallel("compile", &["style"])
            .series("pages", &["compile", "useref"])
            .parallel("assets", &["pages", "image"])
            .series("build", &["clean", "assets"])
            .build()
            .unwrap();

        assert!(graph.reaches("clean", "style"));
        assert!(graph.reaches("clean", "image"));
        assert!(graph.reaches("style", "useref"));
        assert!(!graph.reaches("image", "useref"));
        assert_eq!(graph.dependents("clean"), vec!["style", "image"]);
    }

    #[test]
    fn test_subgraph_includes_dependents() {
        let graph = TaskGraphBuilder::new()
            .task(leaf("style"))
            .task(leaf("script"))
            .task(leaf("page"))
            .parallel("compile", &["style", "script", "page"])
            .declare(leaf("useref"), &["compile"])
            .build()
            .unwrap();

        let sub = graph.subgraph(&["style"]);
        let ids: Vec<&str> = sub.tasks().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec!["style", "compile", "useref"]);
        assert_eq!(sub.task("compile").unwrap().dependencies(), &["style".to_string()]);
        assert_eq!(sub.resolve_order().unwrap(), vec![vec!["style"], vec!["compile"], vec!["useref"]]);
    }

    #[test]
    fn test_subgraph_unknown_root_is_empty() {
        let graph = TaskGraphBuilder::new().task(leaf("a")).build().unwrap();
        assert!(graph.subgraph(&["nope"]).is_empty());
    }

    #[test]
    fn test_output_conflict_between_unordered_tasks() {
        let err = TaskGraphBuilder::new()
            .task(claiming("pages", "/dist", "*.html"))
            .task(claiming("extra", "/dist", "index.html"))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::OutputConflict { .. }));
    }

    #[test]
    fn test_ordered_tasks_may_share_outputs() {
        let graph = TaskGraphBuilder::new()
            .task(claiming("first", "/dist", "**"))
            .declare(claiming("second", "/dist", "**"), &["first"])
            .build();
        assert!(graph.is_ok());
    }

    #[test]
    fn test_disjoint_claims() {
        let graph = TaskGraphBuilder::new()
            .task(claiming("images", "/dist", "assets/images/**"))
            .task(claiming("styles", "/dist", "assets/styles/**"))
            .task(claiming("pages", "/dist", "*.html"))
            .task(claiming("other-root", "/tpl", "*.html"))
            .build();
        assert!(graph.is_ok());
    }

    #[test]
    fn test_claim_overlap_rules() {
        let tree = OutputClaim::Tree(PathBuf::from("/dist"));
        let file = OutputClaim::Path { root: PathBuf::from("/dist"), relative: PathBuf::from("a/b.css") };
        let star = OutputClaim::Pattern { root: PathBuf::from("/dist"), pattern: "a/*.css".into() };
        let top = OutputClaim::Pattern { root: PathBuf::from("/dist"), pattern: "*.css".into() };

        assert!(tree.overlaps(&file));
        assert!(file.overlaps(&star));
        assert!(!file.overlaps(&top));
        assert!(!star.overlaps(&top));
        assert!(patterns_overlap("assets/**", "assets/styles/x.css"));
        assert!(!patterns_overlap("assets/images/**", "assets/fonts/**"));
    }

    #[test]
    fn test_transform_task_claims_mapped_outputs() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("assets/scripts")).unwrap();
        fs::write(temp.path().join("assets/scripts/a.js"), "var a;").unwrap();

        let set = FileSet::new(temp.path(), "assets/scripts/*.js").unwrap();
        let stages: Vec<Arc<dyn Transform>> = vec![Arc::new(ScriptTranspile)];
        let task = Task::transform("script", TaskInput::Files(set), stages, "/out").unwrap();

        assert_eq!(
            task.claims(),
            &[OutputClaim::Path {
                root: PathBuf::from("/out"),
                relative: PathBuf::from("assets/scripts/a.js"),
            }]
        );
        assert!(task.file_set().is_some());
    }

    #[test]
    fn test_upstream_input_adds_dependencies() {
        let task = Task::transform("useref", TaskInput::upstream(&["page"]), vec![], "/dist").unwrap();
        assert_eq!(task.dependencies(), &["page".to_string()]);
        assert!(task.file_set().is_none());
    }
}
