//! pagewright - static site asset pipeline
//!
//! This library provides:
//! - A task graph with cycle and output-conflict checks at construction
//! - Per-file transforms (stylesheets, scripts, templates, images, bundling, minification)
//! - A batch runner that collects per-file failures instead of aborting
//! - Watch mode that rebuilds only the affected subgraph, and a static dev server

pub mod build;
pub mod cli;
pub mod config;
pub mod serve;
pub mod transforms;
pub mod watch;
