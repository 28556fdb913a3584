//! Dev command: compile once, then serve and watch

use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use super::{load_context, require_src, ProjectArgs, EXIT_ERROR, EXIT_INVALID_ARGS, EXIT_SUCCESS};
use crate::build::{
    standard_graph, ConsoleProgress, GraphKind, PipelineRunner, ProgressReporter, Reporters,
};
use crate::serve::DevServer;
use crate::watch::{ReloadNotifier, Watcher};

/// Run the dev command
///
/// Blocks until interrupted. Build failures are reported and the watcher
/// keeps running.
pub fn run_dev(project: &ProjectArgs, port: Option<u16>, verbose: u8) -> ExitCode {
    let ctx = match load_context(project, port, verbose) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };
    if let Err(code) = require_src(&ctx) {
        return code;
    }

    let graph = match standard_graph(&ctx, GraphKind::Dev) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("Build error: {}", e);
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };

    let server = Arc::new(DevServer::new(&ctx));
    let console =
        ConsoleProgress::new().with_colors(std::io::stderr().is_terminal()).with_verbose(verbose > 0);
    let reporters = Reporters::new()
        .with(Arc::new(console))
        .with(Arc::clone(&server) as Arc<dyn ProgressReporter>);
    let runner = PipelineRunner::new(&ctx).with_reporter(Arc::new(reporters));

    let mut watcher = match Watcher::new(&ctx, graph, runner) {
        Ok(watcher) => watcher.with_notifier(Arc::clone(&server) as Arc<dyn ReloadNotifier>),
        Err(e) => {
            eprintln!("Watch error: {}", e);
            return ExitCode::from(EXIT_ERROR);
        }
    };
    watcher.initial_build();

    let addr = format!("127.0.0.1:{}", ctx.config().server.port);
    match server.spawn(&addr) {
        Ok(local) => println!("Serving at http://{}", local),
        Err(e) => {
            eprintln!("Server error: {}", e);
            return ExitCode::from(EXIT_ERROR);
        }
    }

    println!("Press Ctrl+C to stop");
    println!();

    match watcher.run() {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("Watch error: {}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}
