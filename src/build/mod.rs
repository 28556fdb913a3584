//! Build pipeline module for pagewright
//!
//! Provides the task graph, the runner that executes it, and the standard
//! graph wiring for a static-site project.
//!
//! # Overview
//!
//! The build pipeline consists of:
//! - **FileSets**: glob patterns resolved lazily against a base directory
//! - **TaskGraph**: declared tasks, dependency edges and output claims,
//!   validated once and resolved into batches
//! - **Execution**: batches run in order, tasks within a batch in parallel,
//!   per-file failures collected instead of aborting
//!
//! # Example
//!
//! ```ignore
//! use pagewright::build::{BuildContext, BuildPipeline, GraphKind};
//! use pagewright::config::load_config;
//!
//! let config = load_config(None)?;
//! let context = BuildContext::new(config, project_root);
//! let run = BuildPipeline::new(context).run(GraphKind::Build)?;
//! println!("{}", run.summary());
//! ```

pub mod context;
pub mod fileset;
pub mod graph;
pub mod pipeline;
pub mod progress;
pub mod result;
pub mod runner;

pub use context::*;
pub use fileset::{content_hash, FileRecord, FileSet, FileSetError};
pub use graph::*;
pub use pipeline::{standard_graph, BuildError, BuildPipeline, GraphKind};
pub use progress::{ConsoleProgress, JsonProgress, NullProgress, ProgressEvent, ProgressReporter, Reporters};
pub use result::*;
pub use runner::{CancelToken, PipelineRunner};
