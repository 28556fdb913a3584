//! Configuration schema types for `pages.toml`
//!
//! Defines the structure and validation rules for a pagewright project.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Directory layout and source globs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    /// Source tree root
    #[serde(default = "default_src")]
    pub src: PathBuf,
    /// Final output directory
    #[serde(default = "default_dist")]
    pub dist: PathBuf,
    /// Staging directory written by the per-file compile stage
    #[serde(default = "default_intermediate", alias = "templates")]
    pub intermediate: PathBuf,
    /// Static files copied verbatim into `dist`
    #[serde(default = "default_public")]
    pub public: PathBuf,
    /// Glob patterns, relative to `src`
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            src: default_src(),
            dist: default_dist(),
            intermediate: default_intermediate(),
            public: default_public(),
            paths: PathsConfig::default(),
        }
    }
}

fn default_src() -> PathBuf {
    PathBuf::from("src")
}

fn default_dist() -> PathBuf {
    PathBuf::from("dist")
}

fn default_intermediate() -> PathBuf {
    PathBuf::from("templates")
}

fn default_public() -> PathBuf {
    PathBuf::from("public")
}

/// Source globs per asset kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_styles")]
    pub styles: String,
    #[serde(default = "default_scripts")]
    pub scripts: String,
    #[serde(default = "default_pages")]
    pub pages: String,
    #[serde(default = "default_images")]
    pub images: String,
    #[serde(default = "default_fonts")]
    pub fonts: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            styles: default_styles(),
            scripts: default_scripts(),
            pages: default_pages(),
            images: default_images(),
            fonts: default_fonts(),
        }
    }
}

fn default_styles() -> String {
    "assets/styles/*.scss".to_string()
}

fn default_scripts() -> String {
    "assets/scripts/*.js".to_string()
}

fn default_pages() -> String {
    "*.html".to_string()
}

fn default_images() -> String {
    "assets/images/**".to_string()
}

fn default_fonts() -> String {
    "assets/fonts/**".to_string()
}

/// Template rendering options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateConfig {
    /// Cache compiled templates between renders
    #[serde(default)]
    pub cache: bool,
}

/// Dev server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory served under `/node_modules`
    #[serde(default = "default_node_modules")]
    pub node_modules: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port(), node_modules: default_node_modules() }
    }
}

fn default_port() -> u16 {
    8888
}

fn default_node_modules() -> PathBuf {
    PathBuf::from("node_modules")
}

/// Watch mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Debounce delay in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u32,
    /// Clear terminal between rebuilds
    #[serde(default)]
    pub clear_screen: bool,
}

fn default_debounce_ms() -> u32 {
    100
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: default_debounce_ms(), clear_screen: false }
    }
}

/// Markup minification options applied after bundling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinifyConfig {
    #[serde(default = "default_true")]
    pub collapse_whitespace: bool,
    /// Minify inline `<style>` bodies
    #[serde(default = "default_true")]
    pub minify_css: bool,
    /// Minify inline `<script>` bodies
    #[serde(default = "default_true")]
    pub minify_js: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MinifyConfig {
    fn default() -> Self {
        Self { collapse_whitespace: true, minify_css: true, minify_js: true }
    }
}

/// Complete pages.toml configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagesConfig {
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub template: TemplateConfig,
    /// Template context, exposed to every page
    #[serde(default = "empty_data")]
    pub data: serde_json::Value,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub minify: MinifyConfig,
}

fn empty_data() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            build: BuildSection::default(),
            template: TemplateConfig::default(),
            data: empty_data(),
            server: ServerConfig::default(),
            watch: WatchConfig::default(),
            minify: MinifyConfig::default(),
        }
    }
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    /// Path to the invalid field (e.g., "build.paths.styles")
    pub field: String,
    /// Error message
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pages.toml: '{}' {}", self.field, self.message)
    }
}

impl PagesConfig {
    /// Validate the configuration and return any errors
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: &str| {
            errors.push(ConfigValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        };

        let dirs = [
            ("build.src", &self.build.src),
            ("build.dist", &self.build.dist),
            ("build.intermediate", &self.build.intermediate),
            ("build.public", &self.build.public),
        ];
        for (field, dir) in dirs {
            if dir.as_os_str().is_empty() {
                push(field, "must be a non-empty path");
            }
        }

        // Output directories get wiped by `clean`; they must not alias the sources
        if self.build.dist == self.build.src {
            push("build.dist", "must differ from build.src");
        }
        if self.build.intermediate == self.build.src {
            push("build.intermediate", "must differ from build.src");
        }
        if self.build.intermediate == self.build.dist {
            push("build.intermediate", "must differ from build.dist");
        }

        let globs = [
            ("build.paths.styles", &self.build.paths.styles),
            ("build.paths.scripts", &self.build.paths.scripts),
            ("build.paths.pages", &self.build.paths.pages),
            ("build.paths.images", &self.build.paths.images),
            ("build.paths.fonts", &self.build.paths.fonts),
        ];
        for (field, pattern) in globs {
            if pattern.is_empty() {
                push(field, "must be a non-empty glob pattern");
            } else if let Err(e) = glob::Pattern::new(pattern) {
                push(field, &format!("is not a valid glob pattern: {}", e));
            }
        }

        if self.server.port == 0 {
            push("server.port", "must be a positive port number");
        }

        if self.watch.debounce_ms == 0 || self.watch.debounce_ms > 10_000 {
            push("watch.debounce_ms", "must be between 1 and 10000");
        }

        if !self.data.is_object() {
            push("data", "must be a table");
        }

        errors
    }

    /// Check if validation passed
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}
