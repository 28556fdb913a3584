//! Command-line interface implementation
//!
//! This module provides the CLI entry point and dispatches to submodules
//! for specific command implementations.

mod build;
mod dev;

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::build::BuildContext;
use crate::config::loader::{load_project_config_from, merge_cli_overrides, CliOverrides, CONFIG_FILENAME};
use crate::config::ConfigError;

/// Exit codes
pub(crate) const EXIT_SUCCESS: u8 = 0;
pub(crate) const EXIT_ERROR: u8 = 1;
/// Configuration or task graph error
pub(crate) const EXIT_INVALID_ARGS: u8 = 2;

/// Pagewright - static site asset pipeline
#[derive(Parser)]
#[command(name = "pagewright")]
#[command(about = "Pagewright - compile, bundle and serve a static site")]
#[command(version)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that loads a project.
#[derive(Args, Debug, Clone, Default)]
pub struct ProjectArgs {
    /// Path to pages.toml (default: search upward from the working directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the source directory
    #[arg(long)]
    pub src: Option<PathBuf>,

    /// Override the output directory
    #[arg(long)]
    pub dist: Option<PathBuf>,

    /// Worker threads per batch (0 = one per core)
    #[arg(short, long, default_value_t = 0)]
    pub jobs: usize,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline: clean, compile, bundle, optimize, copy
    Build {
        #[command(flatten)]
        project: ProjectArgs,

        /// Emit progress as JSON lines instead of console output
        #[arg(long)]
        json: bool,
    },

    /// Compile once, then serve and rebuild on change
    Dev {
        #[command(flatten)]
        project: ProjectArgs,

        /// Dev server port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Remove the output and intermediate directories
    Clean {
        #[command(flatten)]
        project: ProjectArgs,
    },
}

/// Main entry point for the CLI
pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Build { project, json } => build::run_build(&project, json, cli.verbose),
        Commands::Dev { project, port } => dev::run_dev(&project, port, cli.verbose),
        Commands::Clean { project } => build::run_clean(&project, cli.verbose),
    }
}

/// Install the tracing subscriber; `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = fmt().with_env_filter(env_filter).with_target(false).with_writer(std::io::stderr).try_init();
}

/// Load the project configuration and build the context for a command.
pub(crate) fn load_context(
    project: &ProjectArgs,
    port: Option<u16>,
    verbose: u8,
) -> Result<BuildContext, ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let loaded = load_project_config_from(project.config.as_deref(), cwd.clone())?;
    if verbose > 0 {
        match &loaded.path {
            Some(path) => println!("Using config: {}", path.display()),
            None => println!("No {} found, using defaults", CONFIG_FILENAME),
        }
    }
    let root = loaded.root().map(Path::to_path_buf).unwrap_or(cwd);
    let mut config = loaded.config;

    let overrides = CliOverrides { src: project.src.clone(), dist: project.dist.clone(), port };
    merge_cli_overrides(&mut config, &overrides);
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(ConfigError::Validation(errors.into_iter().map(|e| e.to_string()).collect()));
    }

    let root = std::fs::canonicalize(&root).unwrap_or(root);
    Ok(BuildContext::new(config, root).with_jobs(project.jobs).with_verbose(verbose > 0))
}

/// Check the source directory before running a pipeline that reads it.
pub(crate) fn require_src(ctx: &BuildContext) -> Result<(), ExitCode> {
    let src = ctx.src_dir();
    if src.is_dir() {
        return Ok(());
    }
    eprintln!("Error: Source directory not found: {}", src.display());
    eprintln!("Create the directory or specify a different path with --src");
    Err(ExitCode::from(EXIT_INVALID_ARGS))
}
