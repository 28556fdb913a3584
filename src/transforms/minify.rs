//! Output minification for scripts, stylesheets and markup.
//!
//! Minification never fails a file: input the minifier cannot handle is
//! passed through unchanged and a warning is attached to the record.

use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};

use super::script::{scan, Kind, Token};
use super::types::{Transform, TransformError};
use crate::build::FileRecord;
use crate::config::MinifyConfig;

/// Which minifier to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinifyKind {
    Script,
    Stylesheet,
    Markup,
    /// Pick by file extension (`.js`, `.css`, `.html`); other files pass through
    ByExtension,
}

/// Minify stage.
#[derive(Debug, Clone)]
pub struct Minify {
    kind: MinifyKind,
    options: MinifyConfig,
}

impl Minify {
    pub fn new(kind: MinifyKind, options: MinifyConfig) -> Self {
        Self { kind, options }
    }

    pub fn kind(&self) -> MinifyKind {
        self.kind
    }

    fn resolve_kind(&self, record: &FileRecord) -> Option<MinifyKind> {
        match self.kind {
            MinifyKind::ByExtension => match record.extension().as_deref() {
                Some("js") => Some(MinifyKind::Script),
                Some("css") => Some(MinifyKind::Stylesheet),
                Some("html") | Some("htm") => Some(MinifyKind::Markup),
                _ => None,
            },
            kind => Some(kind),
        }
    }
}

impl Transform for Minify {
    fn name(&self) -> &'static str {
        "minify"
    }

    fn apply(&self, mut record: FileRecord) -> Result<FileRecord, TransformError> {
        let Some(kind) = self.resolve_kind(&record) else {
            return Ok(record);
        };
        let result = match record.text() {
            Err(e) => Err(e.to_string()),
            Ok(text) => match kind {
                MinifyKind::Script => minify_script(text).map_err(|e| e.to_string()),
                MinifyKind::Stylesheet => minify_css(text),
                MinifyKind::Markup => minify_html(text, &self.options),
                MinifyKind::ByExtension => Ok(text.to_string()),
            },
        };

        match result {
            Ok(minified) => Ok(record.with_contents(minified.into_bytes())),
            Err(reason) => {
                let warning = format!("minify failed ({}), passed through unchanged", reason);
                tracing::warn!(path = %record.relative.display(), "{}", warning);
                record.push_warning(warning);
                Ok(record)
            }
        }
    }
}

// ============================================================================
// Stylesheets
// ============================================================================

/// Minify CSS with lightningcss.
pub fn minify_css(source: &str) -> Result<String, String> {
    let mut sheet = StyleSheet::parse(source, ParserOptions::default()).map_err(|e| e.to_string())?;
    sheet.minify(MinifyOptions::default()).map_err(|e| e.to_string())?;
    let printed = sheet
        .to_css(PrinterOptions { minify: true, ..PrinterOptions::default() })
        .map_err(|e| e.to_string())?;
    Ok(printed.code)
}

// ============================================================================
// Scripts
// ============================================================================

/// Strip comments and collapse whitespace, keeping newlines where automatic
/// semicolon insertion could depend on them.
pub fn minify_script(source: &str) -> Result<String, TransformError> {
    let tokens = scan(source)?;
    let mut out = String::with_capacity(source.len());
    let mut prev: Option<&Token> = None;
    let mut space = false;
    let mut newline = false;

    for token in &tokens {
        match token.kind {
            Kind::Space => {
                if token.text.contains('\n') {
                    newline = true;
                } else {
                    space = true;
                }
            }
            Kind::Comment => {
                if token.text.contains('\n') {
                    newline = true;
                } else {
                    space = true;
                }
            }
            _ => {
                if let Some(p) = prev {
                    if newline && asi_sensitive(p, token) {
                        out.push('\n');
                    } else if (space || newline) && would_merge(p, token) {
                        out.push(' ');
                    }
                }
                out.push_str(&token.text);
                prev = Some(token);
                space = false;
                newline = false;
            }
        }
    }

    Ok(out)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn would_merge(prev: &Token, next: &Token) -> bool {
    let (Some(last), Some(first)) = (prev.text.chars().last(), next.text.chars().next()) else {
        return false;
    };
    (is_word_char(last) && is_word_char(first))
        || (prev.kind == Kind::Regex && is_word_char(first))
        || (prev.kind == Kind::Number && first == '.')
        || (last == '+' && first == '+')
        || (last == '-' && first == '-')
        || (last == '/' && (first == '/' || first == '*'))
}

fn is_value_end(token: &Token) -> bool {
    matches!(token.kind, Kind::Ident | Kind::Number | Kind::Str | Kind::Regex | Kind::Raw)
        || [")", "]", "}", "++", "--"].iter().any(|p| token.is_punct(p))
}

fn is_statement_start(token: &Token) -> bool {
    matches!(token.kind, Kind::Ident | Kind::Number | Kind::Str | Kind::Regex | Kind::Raw)
        || ["(", "[", "{", "+", "-", "++", "--", "!", "~", "/"].iter().any(|p| token.is_punct(p))
}

fn asi_sensitive(prev: &Token, next: &Token) -> bool {
    is_value_end(prev) && is_statement_start(next)
}

// ============================================================================
// Markup
// ============================================================================

/// Elements whose surrounding whitespace is not rendered.
const BLOCK_ELEMENTS: &[&str] = &[
    "html", "head", "body", "title", "meta", "link", "script", "style", "base", "div", "p",
    "section", "article", "aside", "header", "footer", "nav", "main", "ul", "ol", "li", "dl",
    "dt", "dd", "table", "thead", "tbody", "tfoot", "tr", "td", "th", "form", "fieldset",
    "h1", "h2", "h3", "h4", "h5", "h6", "hr", "br", "blockquote", "figure", "figcaption",
    "noscript", "option", "select", "video", "audio", "source", "iframe", "pre", "!doctype",
];

/// Elements whose contents are copied verbatim (or minified as code).
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "pre", "textarea"];

#[derive(Debug)]
enum Part {
    Tag { name: String, text: String },
    Text(String),
    Raw(String),
}

/// Minify an HTML document.
pub fn minify_html(source: &str, options: &MinifyConfig) -> Result<String, String> {
    let parts = parse_markup(source, options)?;
    let mut out = String::with_capacity(source.len());

    for (i, part) in parts.iter().enumerate() {
        match part {
            Part::Tag { text, .. } | Part::Raw(text) => out.push_str(text),
            Part::Text(text) if !options.collapse_whitespace => out.push_str(text),
            Part::Text(text) => {
                let mut collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                let leading = text.starts_with(char::is_whitespace);
                let trailing = text.ends_with(char::is_whitespace);
                let block_before = i == 0 || is_block_boundary(&parts[i - 1]);
                let block_after = parts.get(i + 1).map(is_block_boundary).unwrap_or(true);

                if collapsed.is_empty() {
                    if !(block_before || block_after) {
                        out.push(' ');
                    }
                    continue;
                }
                if leading && !block_before {
                    collapsed.insert(0, ' ');
                }
                if trailing && !block_after {
                    collapsed.push(' ');
                }
                out.push_str(&collapsed);
            }
        }
    }

    Ok(out)
}

fn is_block_boundary(part: &Part) -> bool {
    match part {
        Part::Tag { name, .. } => BLOCK_ELEMENTS.contains(&name.as_str()),
        Part::Raw(_) => true,
        Part::Text(_) => false,
    }
}

fn parse_markup(source: &str, options: &MinifyConfig) -> Result<Vec<Part>, String> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut pos = 0;

    while pos < source.len() {
        let rest = &source[pos..];
        let Some(offset) = rest.find('<') else {
            text.push_str(rest);
            break;
        };
        text.push_str(&rest[..offset]);
        pos += offset;
        let rest = &source[pos..];

        if rest.starts_with("<!--") {
            let Some(end) = rest.find("-->") else {
                return Err("unterminated comment".to_string());
            };
            let comment = &rest[..end + 3];
            // conditional comments carry meaning for old browsers
            if comment.starts_with("<!--[if") || comment.starts_with("<!--<![endif]") {
                flush_text(&mut parts, &mut text);
                parts.push(Part::Raw(comment.to_string()));
            }
            pos += end + 3;
            continue;
        }

        let starts_tag = rest[1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '/' || c == '!');
        if !starts_tag {
            text.push('<');
            pos += 1;
            continue;
        }

        let Some(tag_len) = tag_end(rest) else {
            return Err("unterminated tag".to_string());
        };
        let raw_tag = &rest[..tag_len];
        let name = tag_name(raw_tag);
        flush_text(&mut parts, &mut text);
        parts.push(Part::Tag { name: name.clone(), text: normalize_tag(raw_tag) });
        pos += tag_len;

        let opens_raw_body = !raw_tag.starts_with("</") && !raw_tag.ends_with("/>");
        if opens_raw_body && RAW_TEXT_ELEMENTS.contains(&name.as_str()) {
            let body_rest = &source[pos..];
            let Some(close) = find_ignore_case(body_rest, &format!("</{}", name)) else {
                return Err(format!("unclosed <{}>", name));
            };
            let body = &body_rest[..close];
            parts.push(Part::Raw(minify_embedded(&name, raw_tag, body, options)));
            pos += close;
        }
    }

    flush_text(&mut parts, &mut text);
    Ok(parts)
}

fn flush_text(parts: &mut Vec<Part>, text: &mut String) {
    if !text.is_empty() {
        parts.push(Part::Text(std::mem::take(text)));
    }
}

/// Length of the tag starting at `<`, honoring quoted attribute values.
fn tag_end(rest: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in rest.char_indices().skip(1) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '>' => return Some(i + 1),
            None => {}
        }
    }
    None
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('<')
        .trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | ':' | '!'))
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Collapse whitespace between attributes; quoted values are kept.
fn normalize_tag(tag: &str) -> String {
    let mut out = String::with_capacity(tag.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in tag.chars() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && c != '>' && !(c == '/' && tag.ends_with("/>")) {
            out.push(' ');
        }
        pending_space = false;
        if c == '"' || c == '\'' {
            quote = Some(c);
        }
        out.push(c);
    }
    out
}

fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.to_ascii_lowercase();
    haystack
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| {
            haystack
                .get(i..i + needle.len())
                .is_some_and(|window| window.eq_ignore_ascii_case(&needle))
        })
}

fn minify_embedded(name: &str, open_tag: &str, body: &str, options: &MinifyConfig) -> String {
    let lowered = open_tag.to_ascii_lowercase();
    let result = match name {
        "style" if options.minify_css => minify_css(body),
        "script" if options.minify_js && is_javascript(&lowered) => {
            minify_script(body).map_err(|e| e.to_string())
        }
        _ => return body.to_string(),
    };

    result.unwrap_or_else(|reason| {
        tracing::warn!(element = name, %reason, "inline {} left unminified", name);
        body.to_string()
    })
}

fn is_javascript(open_tag: &str) -> bool {
    match open_tag.find("type=") {
        None => true,
        Some(i) => {
            let value = open_tag[i + 5..].trim_start_matches(['"', '\'']);
            value.starts_with("text/javascript")
                || value.starts_with("application/javascript")
                || value.starts_with("module")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> MinifyConfig {
        MinifyConfig::default()
    }

    #[test]
    fn test_script_strips_comments_and_whitespace() {
        let out = minify_script("// header\nvar a = 1 ;  /* note */ var b = a + 2;\n").unwrap();
        assert_eq!(out, "var a=1;var b=a+2;");
    }

    #[test]
    fn test_script_keeps_newline_for_asi() {
        let out = minify_script("var a = 1\nvar b = 2\n").unwrap();
        assert_eq!(out, "var a=1\nvar b=2");
    }

    #[test]
    fn test_script_keeps_required_spaces() {
        assert_eq!(minify_script("return typeof x;").unwrap(), "return typeof x;");
        assert_eq!(minify_script("a + +b; c - -d;").unwrap(), "a+ +b;c- -d;");
    }

    #[test]
    fn test_script_strings_untouched() {
        let out = minify_script("var s = 'a  // b';  var t = `x  ${ y }`;").unwrap();
        assert_eq!(out, "var s='a  // b';var t=`x  ${ y }`;");
    }

    #[test]
    fn test_script_regex_untouched() {
        let out = minify_script("var re = /a  b/g ;").unwrap();
        assert_eq!(out, "var re=/a  b/g;");
    }

    #[test]
    fn test_css_minified() {
        let out = minify_css("a {\n  color: #ff0000;\n  margin: 0px;\n}\n").unwrap();
        assert_eq!(out, "a{color:red;margin:0}");
    }

    #[test]
    fn test_css_error() {
        assert!(minify_css("$$$ { color: red }").is_err());
    }

    #[test]
    fn test_html_collapses_whitespace() {
        let html = "<!DOCTYPE html>\n<html>\n  <body>\n    <p>Hello   <b>big</b>  world</p>\n  </body>\n</html>\n";
        let out = minify_html(html, &options()).unwrap();
        assert_eq!(out, "<!DOCTYPE html><html><body><p>Hello <b>big</b> world</p></body></html>");
    }

    #[test]
    fn test_html_drops_comments_keeps_conditional() {
        let html = "<div><!-- gone --><!--[if IE]><p>ie</p><![endif]--></div>";
        let out = minify_html(html, &options()).unwrap();
        assert_eq!(out, "<div><!--[if IE]><p>ie</p><![endif]--></div>");
    }

    #[test]
    fn test_html_preserves_pre() {
        let html = "<div>\n<pre>  a\n   b </pre>\n</div>";
        let out = minify_html(html, &options()).unwrap();
        assert_eq!(out, "<div><pre>  a\n   b </pre></div>");
    }

    #[test]
    fn test_html_minifies_inline_style_and_script() {
        let html = "<style>\n  a { color: #ff0000; }\n</style>\n<script>\n  var a = 1 ;\n</script>";
        let out = minify_html(html, &options()).unwrap();
        assert_eq!(out, "<style>a{color:red}</style><script>var a=1;</script>");
    }

    #[test]
    fn test_html_respects_options() {
        let opts = MinifyConfig { collapse_whitespace: false, minify_css: false, minify_js: false };
        let html = "<p>a   b</p>\n<script> var a = 1 ; </script>";
        assert_eq!(minify_html(html, &opts).unwrap(), html);
    }

    #[test]
    fn test_html_skips_non_js_scripts() {
        let html = "<script type=\"text/template\">  <p> {{ x }} </p>  </script>";
        let out = minify_html(html, &options()).unwrap();
        assert_eq!(out, html);
    }

    #[test]
    fn test_page_with_scripts_minifies_without_warning() {
        let minify = Minify::new(MinifyKind::ByExtension, options());
        let html = "<html>\n<head>\n  <script src=\"a.js\"></script>\n</head>\n<body>\n  <p>Hi   there</p>\n  \
                    <script>\n    var a = 1 ;\n  </script>\n</body>\n</html>\n";
        let out = minify.apply(FileRecord::new("/t", "index.html", html.as_bytes().to_vec())).unwrap();
        assert!(out.warnings().is_empty(), "{:?}", out.warnings());
        assert_eq!(
            out.text().unwrap(),
            "<html><head><script src=\"a.js\"></script></head><body><p>Hi there</p>\
             <script>var a=1;</script></body></html>"
        );
    }

    #[test]
    fn test_closing_raw_tags_do_not_open_a_body() {
        let out = minify_html("<textarea> a </textarea><pre> b </pre><p>c</p>", &options()).unwrap();
        assert_eq!(out, "<textarea> a </textarea><pre> b </pre><p>c</p>");
    }

    #[test]
    fn test_html_normalizes_tag_whitespace() {
        let out = minify_html("<a   href=\"x  y\"\n   class='c'  >t</a>", &options()).unwrap();
        assert_eq!(out, "<a href=\"x  y\" class='c'>t</a>");
    }

    #[test]
    fn test_malformed_markup_passes_through_with_warning() {
        let minify = Minify::new(MinifyKind::Markup, options());
        let record = FileRecord::new("/t", "index.html", b"<div><!-- open".to_vec());
        let out = minify.apply(record).unwrap();
        assert_eq!(out.contents(), b"<div><!-- open");
        assert_eq!(out.warnings().len(), 1);
    }

    #[test]
    fn test_by_extension() {
        let minify = Minify::new(MinifyKind::ByExtension, options());
        let js = minify.apply(FileRecord::new("/t", "a.js", b"var a = 1 ;".to_vec())).unwrap();
        assert_eq!(js.contents(), b"var a=1;");
        let png = minify.apply(FileRecord::new("/t", "a.png", b"  x  ".to_vec())).unwrap();
        assert_eq!(png.contents(), b"  x  ");
    }
}
