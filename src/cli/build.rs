//! Build command implementations (build, clean)

use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use super::{load_context, require_src, ProjectArgs, EXIT_ERROR, EXIT_INVALID_ARGS, EXIT_SUCCESS};
use crate::build::{
    BuildPipeline, CancelToken, ConsoleProgress, GraphKind, JsonProgress, PipelineRun, ProgressReporter,
};

/// Run the build command
pub fn run_build(project: &ProjectArgs, json: bool, verbose: u8) -> ExitCode {
    let ctx = match load_context(project, None, verbose) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };
    if let Err(code) = require_src(&ctx) {
        return code;
    }

    let reporter: Arc<dyn ProgressReporter> = if json {
        Arc::new(JsonProgress::new())
    } else {
        Arc::new(
            ConsoleProgress::new().with_colors(std::io::stderr().is_terminal()).with_verbose(verbose > 0),
        )
    };

    let pipeline = BuildPipeline::new(ctx).with_reporter(reporter).with_cancel(interrupt_token());
    match pipeline.run(GraphKind::Build) {
        Ok(run) => finish(&run, json),
        Err(e) => {
            eprintln!("Build error: {}", e);
            ExitCode::from(EXIT_INVALID_ARGS)
        }
    }
}

/// A token cancelled by Ctrl+C.
///
/// In-flight files finish or are dropped before their temp file is
/// persisted; nothing new starts once it is set.
fn interrupt_token() -> CancelToken {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("Interrupted, stopping build");
        handler.cancel();
    }) {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }
    cancel
}

/// Run the clean command
pub fn run_clean(project: &ProjectArgs, verbose: u8) -> ExitCode {
    let ctx = match load_context(project, None, verbose) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };

    let (dist, intermediate) = (ctx.dist_dir(), ctx.intermediate_dir());
    match BuildPipeline::new(ctx).run(GraphKind::Clean) {
        Ok(run) if run.is_success() => {
            println!("Removed {} and {}", dist.display(), intermediate.display());
            ExitCode::from(EXIT_SUCCESS)
        }
        Ok(run) => finish(&run, false),
        Err(e) => {
            eprintln!("Clean error: {}", e);
            ExitCode::from(EXIT_INVALID_ARGS)
        }
    }
}

/// Print the summary and pick the exit code.
///
/// Any per-file failure makes the build fail, even when the task produced
/// other outputs.
fn finish(run: &PipelineRun, json: bool) -> ExitCode {
    if run.is_success() {
        if !json {
            println!("{}", run.summary());
        }
        ExitCode::from(EXIT_SUCCESS)
    } else {
        if !json {
            eprintln!("{}", run.summary());
        }
        ExitCode::from(EXIT_ERROR)
    }
}
