//! File transforms for the asset pipeline
//!
//! Each stage converts [`FileRecord`](crate::build::FileRecord)s and reports
//! per-file [`TransformError`]s. The set of stages is closed; tasks pick
//! them through [`TransformKind`].
//!
//! # Module Structure
//!
//! - [`types`] - Core transform trait and error definitions
//! - [`style`] - SCSS subset to CSS
//! - [`script`] - ES2015 subset to ES5
//! - [`template`] - swig-style page templates
//! - [`image`] - Lossless-first image re-encoding
//! - [`minify`] - Script, stylesheet and markup minification
//! - [`bundle`] - Build-comment bundling

pub mod bundle;
pub mod image;
pub mod minify;
pub mod script;
pub mod style;
pub mod template;
pub mod types;

use std::sync::Arc;

use crate::build::BuildContext;

// Re-export main types at the module level for convenience
pub use self::image::ImageOptimize;
pub use bundle::{AssetSource, BundleRewrite, MemoryAssets, SearchPaths};
pub use minify::{Minify, MinifyKind};
pub use script::ScriptTranspile;
pub use style::StyleCompile;
pub use template::TemplateRender;
pub use types::{Transform, TransformError};

/// Result type alias for transform operations.
pub type Result<T> = std::result::Result<T, TransformError>;

/// The fixed set of pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Style,
    Script,
    Template,
    Image,
    Minify(MinifyKind),
    Bundle,
}

impl TransformKind {
    /// Instantiate the stage with its settings from the build context.
    pub fn build(&self, ctx: &BuildContext) -> Arc<dyn Transform> {
        let config = ctx.config();
        match self {
            TransformKind::Style => Arc::new(StyleCompile::new().with_load_paths(vec![ctx.src_dir()])),
            TransformKind::Script => Arc::new(ScriptTranspile),
            TransformKind::Template => {
                Arc::new(TemplateRender::new(config.data.clone()).with_cache(config.template.cache))
            }
            TransformKind::Image => Arc::new(ImageOptimize::new()),
            TransformKind::Minify(kind) => Arc::new(Minify::new(*kind, config.minify.clone())),
            TransformKind::Bundle => Arc::new(BundleRewrite::with_search_paths(vec![
                ctx.intermediate_dir(),
                ctx.project_root().to_path_buf(),
            ])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use std::path::PathBuf;

    #[test]
    fn test_kind_builds_named_stage() {
        let ctx = BuildContext::new(default_config(), PathBuf::from("/project"));
        let cases = [
            (TransformKind::Style, "style"),
            (TransformKind::Script, "script"),
            (TransformKind::Template, "template"),
            (TransformKind::Image, "image"),
            (TransformKind::Minify(MinifyKind::Markup), "minify"),
            (TransformKind::Bundle, "useref"),
        ];
        for (kind, name) in cases {
            assert_eq!(kind.build(&ctx).name(), name);
        }
    }
}
