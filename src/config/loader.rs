//! Configuration loading and discovery for `pages.toml`
//!
//! Provides functions to find, load, and merge configuration.

use super::schema::PagesConfig;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the project configuration file.
pub const CONFIG_FILENAME: &str = "pages.toml";

/// Configuration loading error
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// File I/O error
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// TOML parsing error
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// Validation error
    #[error("Config validation failed:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Validation(Vec<String>),
}

/// CLI arguments that can override config values
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    /// Override source directory
    pub src: Option<PathBuf>,
    /// Override output directory
    pub dist: Option<PathBuf>,
    /// Override dev server port
    pub port: Option<u16>,
}

/// Find pages.toml by walking up from the current working directory.
pub fn find_config() -> Option<PathBuf> {
    env::current_dir().ok().and_then(find_config_from)
}

/// Find pages.toml by walking up from a specific directory.
pub fn find_config_from(start: PathBuf) -> Option<PathBuf> {
    let mut current = start;

    loop {
        let config_path = current.join(CONFIG_FILENAME);
        if config_path.is_file() {
            return Some(config_path);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// A loaded configuration and the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: PagesConfig,
    /// `None` when no pages.toml was found and defaults are in use
    pub path: Option<PathBuf>,
}

impl LoadedConfig {
    /// Directory holding the config file, if any.
    pub fn root(&self) -> Option<&Path> {
        self.path.as_deref().and_then(project_root).filter(|p| !p.as_os_str().is_empty())
    }
}

/// Load configuration from a pages.toml file.
///
/// If a path is provided it must exist. Otherwise `find_config()` is used,
/// and a missing file falls back to the defaults. A file that exists but
/// fails to parse or validate is always an error.
pub fn load_config(path: Option<&Path>) -> Result<PagesConfig, ConfigError> {
    load_project_config(path).map(|loaded| loaded.config)
}

/// Like [`load_config`], also reporting which file was used.
pub fn load_project_config(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    load_project_config_from(path, cwd)
}

/// Load configuration, searching upward from `start` when no path is given.
pub fn load_project_config_from(
    path: Option<&Path>,
    start: PathBuf,
) -> Result<LoadedConfig, ConfigError> {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => find_config_from(start),
    };

    match config_path {
        Some(p) => Ok(LoadedConfig { config: load_config_file(&p)?, path: Some(p) }),
        None => {
            tracing::info!("no {} found, using defaults", CONFIG_FILENAME);
            Ok(LoadedConfig { config: default_config(), path: None })
        }
    }
}

/// Load configuration from a specific file path.
pub fn load_config_file(path: &Path) -> Result<PagesConfig, ConfigError> {
    let contents = fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    parse_config(&contents).map_err(|e| match e {
        ParseOrValidate::Parse(source) => ConfigError::Parse { path: path.to_path_buf(), source },
        ParseOrValidate::Validate(errors) => ConfigError::Validation(errors),
    })
}

enum ParseOrValidate {
    Parse(toml::de::Error),
    Validate(Vec<String>),
}

fn parse_config(contents: &str) -> Result<PagesConfig, ParseOrValidate> {
    let config: PagesConfig = toml::from_str(contents).map_err(ParseOrValidate::Parse)?;

    let errors = config.validate();
    if !errors.is_empty() {
        return Err(ParseOrValidate::Validate(errors.into_iter().map(|e| e.to_string()).collect()));
    }

    Ok(config)
}

/// The configuration used when no pages.toml is found.
pub fn default_config() -> PagesConfig {
    PagesConfig::default()
}

/// Merge CLI overrides into a configuration.
///
/// CLI arguments take precedence over config file values.
pub fn merge_cli_overrides(config: &mut PagesConfig, overrides: &CliOverrides) {
    if let Some(ref src) = overrides.src {
        config.build.src = src.clone();
    }

    if let Some(ref dist) = overrides.dist {
        config.build.dist = dist.clone();
    }

    if let Some(port) = overrides.port {
        config.server.port = port;
    }
}

/// Get the project root directory from a config file path.
pub fn project_root(config_path: &Path) -> Option<&Path> {
    config_path.parent()
}

/// Resolve a path relative to the project root.
pub fn resolve_path(project_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let config_path = dir.join(CONFIG_FILENAME);
        File::create(&config_path)
            .expect("should create config file")
            .write_all(contents.as_bytes())
            .expect("should write config content");
        config_path
    }

    #[test]
    fn test_find_config_in_current_dir() {
        let temp = TempDir::new().expect("should create temp dir");
        let config_path = write_config(temp.path(), "[build]\nsrc = \"src\"");

        let found = find_config_from(temp.path().to_path_buf());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_in_parent_dir() {
        let temp = TempDir::new().expect("should create temp dir");
        let config_path = write_config(temp.path(), "");

        let subdir = temp.path().join("src").join("assets");
        fs::create_dir_all(&subdir).expect("should create subdirectories");

        let found = find_config_from(subdir);
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_not_found() {
        let temp = TempDir::new().expect("should create temp dir");
        let found = find_config_from(temp.path().to_path_buf());
        assert_eq!(found, None);
    }

    #[test]
    fn test_load_config_from_file() {
        let temp = TempDir::new().expect("should create temp dir");
        let config_path = write_config(
            temp.path(),
            r#"
[build]
dist = "public_html"

[data]
title = "Docs"
"#,
        );

        let config = load_config(Some(&config_path)).expect("should load valid config");
        assert_eq!(config.build.dist, PathBuf::from("public_html"));
        assert_eq!(config.build.src, PathBuf::from("src"));
        assert_eq!(config.data["title"], "Docs");
    }

    #[test]
    fn test_absent_config_falls_back_to_valid_defaults() {
        let temp = TempDir::new().expect("should create temp dir");
        let loaded = load_project_config_from(None, temp.path().to_path_buf()).expect("defaults");
        assert!(loaded.path.is_none());
        assert!(loaded.root().is_none());
        assert!(loaded.config.is_valid(), "{:?}", loaded.config.validate());
        assert_eq!(loaded.config.build.src, PathBuf::from("src"));
    }

    #[test]
    fn test_discovered_config_reports_root() {
        let temp = TempDir::new().expect("should create temp dir");
        let config_path = write_config(temp.path(), "[server]\nport = 3000");
        let nested = temp.path().join("src/assets");
        fs::create_dir_all(&nested).expect("should create nested dir");

        let loaded = load_project_config_from(None, nested).expect("should load");
        assert_eq!(loaded.path.as_deref(), Some(config_path.as_path()));
        assert_eq!(loaded.root(), Some(temp.path()));
        assert_eq!(loaded.config.server.port, 3000);
    }

    #[test]
    fn test_load_config_explicit_missing_file_errors() {
        let temp = TempDir::new().expect("should create temp dir");
        let config_path = temp.path().join("nonexistent.toml");

        let result = load_config(Some(&config_path));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let temp = TempDir::new().expect("should create temp dir");
        let config_path = write_config(temp.path(), "this is not valid toml {{{");

        let result = load_config(Some(&config_path));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_config_wrong_type_is_parse_error() {
        let temp = TempDir::new().expect("should create temp dir");
        let config_path = write_config(temp.path(), "[server]\nport = \"eighty\"");

        let result = load_config(Some(&config_path));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_config_validation_error() {
        let temp = TempDir::new().expect("should create temp dir");
        let config_path = write_config(
            temp.path(),
            r#"
[build]
intermediate = "dist"
"#,
        );

        let result = load_config(Some(&config_path));
        match result {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors[0].contains("build.intermediate"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_cli_overrides() {
        let mut config = default_config();
        let overrides = CliOverrides {
            src: Some(PathBuf::from("site")),
            dist: Some(PathBuf::from("out")),
            port: Some(9000),
        };

        merge_cli_overrides(&mut config, &overrides);
        assert_eq!(config.build.src, PathBuf::from("site"));
        assert_eq!(config.build.dist, PathBuf::from("out"));
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_merge_cli_overrides_empty_keeps_values() {
        let mut config = default_config();
        merge_cli_overrides(&mut config, &CliOverrides::default());
        assert_eq!(config.build.dist, PathBuf::from("dist"));
        assert_eq!(config.server.port, 8888);
    }

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/project");
        assert_eq!(resolve_path(root, Path::new("/other/path")), PathBuf::from("/other/path"));
        assert_eq!(resolve_path(root, Path::new("src")), PathBuf::from("/project/src"));
    }

    #[test]
    fn test_project_root() {
        let config_path = Path::new("/project/pages.toml");
        assert_eq!(project_root(config_path), Some(Path::new("/project")));
    }
}
