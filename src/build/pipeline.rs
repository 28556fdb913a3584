//! Standard pipeline wiring.
//!
//! Declares the fixed task graph for a project:
//!
//! ```text
//! build = series(clean, parallel(series(compile, useref), image, font, extra))
//! compile = parallel(style, script, page)
//! ```
//!
//! `style`, `script` and `page` compile `src/` into the intermediate
//! directory; `useref` bundles and minifies the compiled pages into `dist/`;
//! `image` and `font` optimize straight into `dist/`; `extra` copies the
//! public directory.

use std::path::Path;
use std::sync::Arc;

use super::context::BuildContext;
use super::fileset::FileSet;
use super::graph::{GraphCycleError, GraphError, OutputClaim, Task, TaskGraph, TaskGraphBuilder, TaskInput};
use super::progress::{NullProgress, ProgressReporter};
use super::result::PipelineRun;
use super::runner::{CancelToken, PipelineRunner};
use crate::transforms::{MinifyKind, Transform, TransformKind};

pub const CLEAN: &str = "clean";
pub const STYLE: &str = "style";
pub const SCRIPT: &str = "script";
pub const PAGE: &str = "page";
pub const USEREF: &str = "useref";
pub const IMAGE: &str = "image";
pub const FONT: &str = "font";
pub const EXTRA: &str = "extra";
pub const COMPILE: &str = "compile";
pub const BUILD: &str = "build";

/// Error during pipeline setup.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BuildError {
    #[error("invalid task graph: {0}")]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Cycle(#[from] GraphCycleError),
}

/// Which standard graph to declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    /// Full production build
    Build,
    /// Compile into the intermediate directory only
    Dev,
    /// Remove output directories
    Clean,
}

fn stages(ctx: &BuildContext, kinds: &[TransformKind]) -> Vec<Arc<dyn Transform>> {
    kinds.iter().map(|k| k.build(ctx)).collect()
}

fn src_task(
    ctx: &BuildContext,
    id: &str,
    pattern: &str,
    kinds: &[TransformKind],
    dest: &Path,
) -> Result<Task, GraphError> {
    let set = FileSet::new(ctx.src_dir(), pattern)?;
    Ok(Task::transform(id, TaskInput::Files(set), stages(ctx, kinds), dest)?)
}

/// Directory part of a glob, as a recursive pattern (`assets/styles/*.scss` to `assets/styles/**`).
fn dir_pattern(glob: &str) -> String {
    let literal: Vec<&str> = glob
        .split('/')
        .take_while(|c| !c.contains(['*', '?', '[']))
        .collect();
    // The last literal component of a non-glob path is the file itself.
    let dirs = if literal.len() == glob.split('/').count() {
        &literal[..literal.len().saturating_sub(1)]
    } else {
        &literal[..]
    };
    if dirs.is_empty() {
        "**".to_string()
    } else {
        format!("{}/**", dirs.join("/"))
    }
}

fn compile_tasks(ctx: &BuildContext) -> Result<Vec<Task>, GraphError> {
    let paths = &ctx.config().build.paths;
    let intermediate = ctx.intermediate_dir();
    Ok(vec![
        src_task(ctx, STYLE, &paths.styles, &[TransformKind::Style], &intermediate)?,
        src_task(ctx, SCRIPT, &paths.scripts, &[TransformKind::Script], &intermediate)?,
        src_task(ctx, PAGE, &paths.pages, &[TransformKind::Template], &intermediate)?,
    ])
}

/// Declare one of the standard graphs.
pub fn standard_graph(ctx: &BuildContext, kind: GraphKind) -> Result<TaskGraph, GraphError> {
    let paths = &ctx.config().build.paths;
    let dist = ctx.dist_dir();

    let clean = Task::clean(CLEAN, vec![dist.clone(), ctx.intermediate_dir()]);
    match kind {
        GraphKind::Clean => return TaskGraphBuilder::new().task(clean).build(),
        GraphKind::Dev => {
            let mut builder = TaskGraphBuilder::new();
            for task in compile_tasks(ctx)? {
                builder = builder.task(task);
            }
            return builder.parallel(COMPILE, &[STYLE, SCRIPT, PAGE]).build();
        }
        GraphKind::Build => {}
    }

    let useref = Task::transform(
        USEREF,
        TaskInput::upstream_matching(&[PAGE], &paths.pages)?,
        stages(ctx, &[TransformKind::Bundle, TransformKind::Minify(MinifyKind::ByExtension)]),
        &dist,
    )?
    .with_claims(
        [paths.pages.clone(), dir_pattern(&paths.styles), dir_pattern(&paths.scripts)]
            .into_iter()
            .map(|pattern| OutputClaim::Pattern { root: dist.clone(), pattern })
            .collect(),
    );

    let extra = Task::transform(
        EXTRA,
        TaskInput::Files(FileSet::new(ctx.public_dir(), "**")?),
        vec![],
        &dist,
    )?;

    let mut builder = TaskGraphBuilder::new().task(clean);
    for task in compile_tasks(ctx)? {
        builder = builder.task(task);
    }
    builder
        .task(useref)
        .task(src_task(ctx, IMAGE, &paths.images, &[TransformKind::Image], &dist)?)
        .task(src_task(ctx, FONT, &paths.fonts, &[TransformKind::Image], &dist)?)
        .task(extra)
        .parallel(COMPILE, &[STYLE, SCRIPT, PAGE])
        .series("pages", &[COMPILE, USEREF])
        .parallel("assets", &["pages", IMAGE, FONT, EXTRA])
        .series(BUILD, &[CLEAN, "assets"])
        .build()
}

/// Declares and runs a standard graph.
pub struct BuildPipeline {
    /// Build context
    context: BuildContext,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancelToken,
}

impl BuildPipeline {
    /// Create a new build pipeline.
    pub fn new(context: BuildContext) -> Self {
        Self { context, reporter: Arc::new(NullProgress), cancel: CancelToken::new() }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn context(&self) -> &BuildContext {
        &self.context
    }

    pub fn graph(&self, kind: GraphKind) -> Result<TaskGraph, BuildError> {
        Ok(standard_graph(&self.context, kind)?)
    }

    pub fn runner(&self) -> PipelineRunner {
        PipelineRunner::new(&self.context)
            .with_reporter(Arc::clone(&self.reporter))
            .with_cancel(self.cancel.clone())
    }

    /// Declare the graph, then run it. Graph errors surface before any task runs.
    pub fn run(&self, kind: GraphKind) -> Result<PipelineRun, BuildError> {
        let graph = self.graph(kind)?;
        if self.context.is_verbose() {
            for (i, batch) in graph.resolve_order()?.iter().enumerate() {
                tracing::info!(level = i, tasks = ?batch, "batch");
            }
        }
        Ok(self.runner().run(&graph)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::TaskStatus;
    use crate::config::default_config;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    const PAGE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>{{ title }}</title>
  <!-- build:css assets/styles/main.css -->
  <link rel="stylesheet" href="assets/styles/main.css">
  <!-- endbuild -->
</head>
<body>
  <h1>{{ title | upper }}</h1>
  <!-- build:js assets/scripts/vendor.js -->
  <script src="/node_modules/lib/lib.js"></script>
  <!-- endbuild -->
  <!-- build:js assets/scripts/main.js -->
  <script src="assets/scripts/main.js"></script>
  <!-- endbuild -->
</body>
</html>
"#;

    fn project() -> (TempDir, BuildContext) {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        create_test_file(root, "src/index.html", PAGE_HTML.as_bytes());
        create_test_file(root, "src/assets/styles/main.scss", b"$c: #333;\nbody { h1 { color: $c; } }\n");
        create_test_file(root, "src/assets/scripts/main.js", b"const greet = (name) => `hi ${name}`;\n");
        create_test_file(root, "src/assets/fonts/a.woff", b"wOFFdata");
        create_test_file(root, "node_modules/lib/lib.js", b"var lib = 1;\n");
        create_test_file(root, "public/robots.txt", b"User-agent: *\n");

        let mut config = default_config();
        config.data = serde_json::json!({ "title": "Home" });
        let ctx = BuildContext::new(config, root.to_path_buf()).with_jobs(2);
        (temp, ctx)
    }

    #[test]
    fn test_dir_pattern() {
        assert_eq!(dir_pattern("assets/styles/*.scss"), "assets/styles/**");
        assert_eq!(dir_pattern("*.html"), "**");
        assert_eq!(dir_pattern("assets/app.js"), "assets/**");
    }

    #[test]
    fn test_build_graph_shape() {
        let (_temp, ctx) = project();
        let graph = standard_graph(&ctx, GraphKind::Build).unwrap();
        let batches = graph.resolve_order().unwrap();

        assert_eq!(batches[0], vec![CLEAN]);
        assert!(batches[1].contains(&STYLE.to_string()));
        assert!(batches[1].contains(&IMAGE.to_string()));
        assert!(batches[1].contains(&EXTRA.to_string()));
        assert!(graph.reaches(COMPILE, USEREF));
        assert!(graph.reaches(PAGE, USEREF));
        assert!(!graph.reaches(IMAGE, USEREF));
    }

    #[test]
    fn test_dev_graph_has_no_dist_tasks() {
        let (_temp, ctx) = project();
        let graph = standard_graph(&ctx, GraphKind::Dev).unwrap();
        assert!(graph.contains(STYLE));
        assert!(!graph.contains(CLEAN));
        assert!(!graph.contains(USEREF));
    }

    #[test]
    fn test_full_build() {
        let (temp, ctx) = project();
        let root = temp.path().to_path_buf();
        let run = BuildPipeline::new(ctx).run(GraphKind::Build).unwrap();

        assert!(run.is_success(), "{}", run.summary());
        assert!(root.join("templates/assets/styles/main.css").exists());
        assert!(root.join("templates/index.html").exists());

        let html = fs::read_to_string(root.join("dist/index.html")).unwrap();
        assert!(html.contains("<title>Home</title>"));
        assert!(html.contains("<h1>HOME</h1>"));
        assert!(html.contains(r#"<link rel="stylesheet" href="assets/styles/main.css">"#));
        assert!(html.contains(r#"<script src="assets/scripts/vendor.js"></script>"#));
        assert!(!html.contains("build:"));

        let vendor = fs::read_to_string(root.join("dist/assets/scripts/vendor.js")).unwrap();
        assert!(vendor.contains("lib=1"));
        let main = fs::read_to_string(root.join("dist/assets/scripts/main.js")).unwrap();
        assert!(main.contains("function"));
        assert!(!main.contains("=>"));
        let css = fs::read_to_string(root.join("dist/assets/styles/main.css")).unwrap();
        assert!(css.contains("body h1{color:#333}"), "{}", css);

        assert_eq!(fs::read(root.join("dist/assets/fonts/a.woff")).unwrap(), b"wOFFdata");
        assert!(root.join("dist/robots.txt").exists());
    }

    #[test]
    fn test_build_is_idempotent() {
        let (temp, ctx) = project();
        let pipeline = BuildPipeline::new(ctx);
        pipeline.run(GraphKind::Build).unwrap();
        let first = fs::read(temp.path().join("dist/index.html")).unwrap();
        pipeline.run(GraphKind::Build).unwrap();
        assert_eq!(fs::read(temp.path().join("dist/index.html")).unwrap(), first);
    }

    #[test]
    fn test_page_failure_skips_useref_only() {
        let (temp, ctx) = project();
        create_test_file(temp.path(), "src/index.html", b"{{ missing }}");
        let run = BuildPipeline::new(ctx).run(GraphKind::Build).unwrap();

        assert!(run.outcome(PAGE).unwrap().status.is_failure());
        assert!(matches!(run.outcome(USEREF).unwrap().status, TaskStatus::Skipped(_)));
        assert!(run.outcome(STYLE).unwrap().is_success());
        assert!(run.outcome(EXTRA).unwrap().is_success());
        assert!(temp.path().join("dist/robots.txt").exists());
    }

    #[test]
    fn test_clean_graph() {
        let (temp, ctx) = project();
        create_test_file(temp.path(), "dist/stale.html", b"x");
        create_test_file(temp.path(), "templates/stale.css", b"x");
        let run = BuildPipeline::new(ctx).run(GraphKind::Clean).unwrap();
        assert!(run.is_success());
        assert!(!temp.path().join("dist").exists());
        assert!(!temp.path().join("templates").exists());
    }
}
