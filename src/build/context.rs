//! Build context containing configuration and state for a build.

use crate::config::PagesConfig;
use std::path::{Path, PathBuf};

/// Build context containing configuration and paths for a build operation.
///
/// The context provides access to all information needed to execute a build,
/// including the configuration, project root, and the resolved directories.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// The loaded configuration
    config: PagesConfig,
    /// Project root directory (where pages.toml is located)
    project_root: PathBuf,
    /// Worker threads per batch
    jobs: usize,
    /// Whether to run in verbose mode
    verbose: bool,
}

impl BuildContext {
    /// Create a new build context.
    ///
    /// # Arguments
    /// - `config` - The loaded configuration
    /// - `project_root` - The project root directory
    pub fn new(config: PagesConfig, project_root: PathBuf) -> Self {
        Self { config, project_root, jobs: default_jobs(), verbose: false }
    }

    /// Get the configuration.
    pub fn config(&self) -> &PagesConfig {
        &self.config
    }

    /// Get the project root directory.
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Source tree (`src/`).
    pub fn src_dir(&self) -> PathBuf {
        self.resolve_path(&self.config.build.src)
    }

    /// Final output directory (`dist/`).
    pub fn dist_dir(&self) -> PathBuf {
        self.resolve_path(&self.config.build.dist)
    }

    /// Compiled-but-unbundled directory (`templates/`).
    pub fn intermediate_dir(&self) -> PathBuf {
        self.resolve_path(&self.config.build.intermediate)
    }

    /// Files copied verbatim into dist (`public/`).
    pub fn public_dir(&self) -> PathBuf {
        self.resolve_path(&self.config.build.public)
    }

    pub fn node_modules_dir(&self) -> PathBuf {
        self.resolve_path(&self.config.server.node_modules)
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Whether verbose mode is enabled.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Set the worker count; zero means one per available core.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = if jobs == 0 { default_jobs() } else { jobs };
        self
    }

    /// Set verbose mode.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Resolve a path relative to the project root.
    ///
    /// If the path is absolute, returns it unchanged.
    /// If relative, joins it with the project root.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        crate::config::loader::resolve_path(&self.project_root, path)
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;

    #[test]
    fn test_build_context_new() {
        let config = default_config();
        let root = PathBuf::from("/project");
        let ctx = BuildContext::new(config, root.clone());

        assert_eq!(ctx.project_root(), &root);
        assert!(!ctx.is_verbose());
        assert!(ctx.jobs() >= 1);
    }

    #[test]
    fn test_build_context_with_jobs() {
        let ctx = BuildContext::new(default_config(), PathBuf::from("/project")).with_jobs(3);
        assert_eq!(ctx.jobs(), 3);

        let auto = BuildContext::new(default_config(), PathBuf::from("/project")).with_jobs(0);
        assert!(auto.jobs() >= 1);
    }

    #[test]
    fn test_build_context_resolve_path_absolute() {
        let ctx = BuildContext::new(default_config(), PathBuf::from("/project"));
        assert_eq!(ctx.resolve_path(Path::new("/other/path")), PathBuf::from("/other/path"));
    }

    #[test]
    fn test_build_context_directories() {
        let ctx = BuildContext::new(default_config(), PathBuf::from("/project"));

        assert_eq!(ctx.src_dir(), PathBuf::from("/project/src"));
        assert_eq!(ctx.dist_dir(), PathBuf::from("/project/dist"));
        assert_eq!(ctx.intermediate_dir(), PathBuf::from("/project/templates"));
        assert_eq!(ctx.public_dir(), PathBuf::from("/project/public"));
        assert_eq!(ctx.node_modules_dir(), PathBuf::from("/project/node_modules"));
    }
}
