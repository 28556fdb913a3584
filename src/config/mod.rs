//! Configuration module for pagewright
//!
//! Provides types and parsing for `pages.toml` project configuration.

pub mod loader;
pub mod schema;

pub use loader::{default_config, load_config, load_project_config, ConfigError, LoadedConfig};
pub use schema::*;
