//! Build-comment bundling.
//!
//! ```html
//! <!-- build:css assets/styles/vendor.css -->
//! <link rel="stylesheet" href="/node_modules/bootstrap/dist/css/bootstrap.css">
//! <!-- endbuild -->
//! ```
//!
//! Every `build:js` / `build:css` group is replaced by a single reference to
//! the bundle, and the concatenated bundle is emitted as an extra record next
//! to the page. `build:remove` groups are deleted. Bundle paths are relative
//! to the page's directory unless they start with `/`.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};

use super::types::{record_text, Transform, TransformError};
use crate::build::FileRecord;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*(?:build:([A-Za-z]+)(?:\(([^)]*)\))?(?:\s+([^\s]+?))?|(endbuild))\s*-->")
        .expect("valid regex")
});

static SCRIPT_SRC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<script\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).expect("valid regex")
});

static LINK_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<link\b[^>]*?\bhref\s*=\s*["']([^"']+)["']"#).expect("valid regex")
});

/// Where referenced assets are read from.
pub trait AssetSource: Send + Sync {
    /// Contents of a referenced asset, `None` when it cannot be found.
    fn read(&self, reference: &str) -> Option<Vec<u8>>;
}

/// Filesystem lookup across ordered search roots; first hit wins.
#[derive(Debug, Clone)]
pub struct SearchPaths {
    roots: Vec<PathBuf>,
}

impl SearchPaths {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

impl AssetSource for SearchPaths {
    fn read(&self, reference: &str) -> Option<Vec<u8>> {
        let relative = clean_reference(reference);
        self.roots
            .iter()
            .map(|root| root.join(&relative))
            .find(|candidate| candidate.is_file())
            .and_then(|path| std::fs::read(path).ok())
    }
}

/// In-memory assets keyed by cleaned reference path.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssets {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(clean_reference(path), contents.into());
        self
    }
}

impl AssetSource for MemoryAssets {
    fn read(&self, reference: &str) -> Option<Vec<u8>> {
        self.files.get(&clean_reference(reference)).cloned()
    }
}

/// Strip a leading `/`, a query string and a fragment.
fn clean_reference(reference: &str) -> String {
    let end = reference.find(['?', '#']).unwrap_or(reference.len());
    reference[..end].trim_start_matches('/').to_string()
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundleType {
    Js,
    Css,
    Remove,
}

/// Bundle rewrite stage.
#[derive(Clone)]
pub struct BundleRewrite {
    source: Arc<dyn AssetSource>,
}

impl std::fmt::Debug for BundleRewrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleRewrite").finish_non_exhaustive()
    }
}

impl BundleRewrite {
    pub fn new(source: impl AssetSource + 'static) -> Self {
        Self { source: Arc::new(source) }
    }

    /// Resolve references against directories, in order.
    pub fn with_search_paths(roots: Vec<PathBuf>) -> Self {
        Self::new(SearchPaths::new(roots))
    }

    /// Rewrite a page; returns the new page text and `(bundle path, contents)` pairs.
    pub fn rewrite(&self, html: &str) -> Result<(String, Vec<(String, Vec<u8>)>), TransformError> {
        let mut out = String::with_capacity(html.len());
        let mut bundles = Vec::new();
        let mut cursor = 0;
        let mut open: Option<(BundleType, Option<String>, usize, usize)> = None;

        for marker in MARKER.captures_iter(html) {
            let Some(whole) = marker.get(0) else { continue };
            let line = html[..whole.start()].matches('\n').count() + 1;

            if marker.get(4).is_some() {
                let Some((kind, target, start_line, body_start)) = open.take() else {
                    return Err(TransformError::bundle(line, "endbuild without a matching build marker"));
                };
                let body = &html[body_start..whole.start()];
                out.push_str(&self.replace_group(kind, target, body, start_line, &mut bundles)?);
                cursor = whole.end();
                continue;
            }

            if let Some((_, _, start_line, _)) = open {
                return Err(TransformError::bundle(
                    line,
                    format!("nested build marker (block opened on line {})", start_line),
                ));
            }

            let type_name = marker.get(1).map(|m| m.as_str()).unwrap_or_default();
            let kind = match type_name {
                "js" => BundleType::Js,
                "css" => BundleType::Css,
                "remove" => BundleType::Remove,
                other => {
                    return Err(TransformError::bundle(line, format!("unknown build type '{}'", other)));
                }
            };
            let target = marker.get(3).map(|m| m.as_str().to_string());
            if kind != BundleType::Remove && target.is_none() {
                let message = format!("build:{} requires an output path", type_name);
                return Err(TransformError::bundle(line, message));
            }

            out.push_str(&html[cursor..whole.start()]);
            open = Some((kind, target, line, whole.end()));
        }

        if let Some((_, _, start_line, _)) = open {
            return Err(TransformError::bundle(start_line, "build block is never closed with endbuild"));
        }
        out.push_str(&html[cursor..]);
        Ok((out, bundles))
    }

    fn replace_group(
        &self,
        kind: BundleType,
        target: Option<String>,
        body: &str,
        line: usize,
        bundles: &mut Vec<(String, Vec<u8>)>,
    ) -> Result<String, TransformError> {
        let pattern = match kind {
            BundleType::Remove => return Ok(String::new()),
            BundleType::Js => &*SCRIPT_SRC,
            BundleType::Css => &*LINK_HREF,
        };
        let target = target.unwrap_or_default();

        let mut contents: Vec<u8> = Vec::new();
        for (i, reference) in pattern.captures_iter(body).filter_map(|c| c.get(1)).enumerate() {
            let reference = reference.as_str();
            let Some(data) = self.source.read(reference) else {
                let message = format!("referenced asset not found: {}", reference);
                return Err(TransformError::bundle(line, message));
            };
            if i > 0 {
                contents.push(b'\n');
            }
            contents.extend_from_slice(&data);
        }

        bundles.push((target.clone(), contents));
        Ok(match kind {
            BundleType::Js => format!("<script src=\"{}\"></script>", target),
            _ => format!("<link rel=\"stylesheet\" href=\"{}\">", target),
        })
    }
}

impl Transform for BundleRewrite {
    fn name(&self) -> &'static str {
        "useref"
    }

    fn apply(&self, record: FileRecord) -> Result<FileRecord, TransformError> {
        let mut records = self.apply_many(record)?;
        Ok(records.remove(0))
    }

    fn apply_many(&self, record: FileRecord) -> Result<Vec<FileRecord>, TransformError> {
        let (html, bundles) = self.rewrite(record_text(&record)?)?;
        let page_dir = record.relative.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut records = Vec::with_capacity(bundles.len() + 1);
        for (target, contents) in bundles {
            let relative = if target.starts_with('/') {
                normalize(Path::new(&target))
            } else {
                normalize(&page_dir.join(&target))
            };
            records.push(record.derive(relative, contents));
        }
        records.insert(0, record.with_contents(html.into_bytes()));
        Ok(records)
    }
}
