//! Stylesheet compilation (SCSS subset to expanded CSS).
//!
//! Supported: `$variables` (`!default`, `!global`), `#{}` interpolation,
//! nested rules with `&` parent references, nested properties (`font: {}`),
//! `@media`/`@supports` bubbling, `@font-face`/`@keyframes` blocks, `@import`
//! of local partials, `//` line comments (dropped) and `/* */` comments (kept).
//!
//! Mixins, control flow and functions are rejected with a compile error
//! rather than silently emitted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::types::{record_text, Transform, TransformError};
use crate::build::FileRecord;

/// Directives that need a real Sass implementation.
const UNSUPPORTED_DIRECTIVES: &[&str] = &[
    "mixin", "include", "extend", "function", "return", "if", "else", "each", "for", "while",
    "use", "forward", "content", "at-root", "debug", "warn", "error",
];

/// Blocks whose body is a declaration list rather than nested rules.
const DECLARATION_BLOCKS: &[&str] = &["font-face", "page", "viewport", "counter-style"];

/// Nested-import guard.
const MAX_IMPORT_DEPTH: usize = 16;

/// Stylesheet compile stage.
#[derive(Debug, Clone, Default)]
pub struct StyleCompile {
    load_paths: Vec<PathBuf>,
}

impl StyleCompile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra directories searched by `@import` after the importing file's directory.
    pub fn with_load_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.load_paths = paths;
        self
    }
}

impl Transform for StyleCompile {
    fn name(&self) -> &'static str {
        "style"
    }

    fn apply(&self, record: FileRecord) -> Result<FileRecord, TransformError> {
        let origin_dir = record.source.parent().map(Path::to_path_buf);
        let mut search = Vec::new();
        search.extend(origin_dir);
        search.extend(self.load_paths.iter().cloned());

        let css = Compiler::new(search).compile(record_text(&record)?)?;
        let relative = self.output_path(&record.relative);
        Ok(record.with_relative(relative).with_contents(css.into_bytes()))
    }

    /// Partials (`_name.scss`) only exist to be imported and produce no output.
    fn apply_many(&self, record: FileRecord) -> Result<Vec<FileRecord>, TransformError> {
        let is_partial = record
            .relative
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('_'))
            .unwrap_or(false);
        if is_partial {
            return Ok(vec![]);
        }
        Ok(vec![self.apply(record)?])
    }

    fn output_path(&self, relative: &Path) -> PathBuf {
        match relative.extension().and_then(|e| e.to_str()) {
            Some("scss") | Some("sass") => relative.with_extension("css"),
            _ => relative.to_path_buf(),
        }
    }
}

/// Compile SCSS source without import support.
pub fn compile_scss(source: &str) -> Result<String, TransformError> {
    Compiler::new(vec![]).compile(source)
}

// ============================================================================
// Parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Comment(String),
    Variable { name: String, value: String, default: bool, global: bool, line: usize },
    Declaration { property: String, value: String, line: usize },
    Rule { selector: String, children: Vec<Node>, line: usize },
    AtBlock { name: String, prelude: String, children: Vec<Node>, line: usize },
    AtStatement { text: String },
    Import { target: String, line: usize },
}

#[derive(Debug, PartialEq, Eq)]
enum Terminator {
    Open,
    Semicolon,
    Close,
    Eof,
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self { chars: source.chars().collect(), pos: 0, line: 1 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    /// Read a `/* */` comment starting at the current position.
    fn read_block_comment(&mut self) -> Result<String, TransformError> {
        let start_line = self.line;
        let mut text = String::new();
        text.push(self.bump().unwrap_or('/'));
        text.push(self.bump().unwrap_or('*'));
        loop {
            match self.bump() {
                Some('*') if self.peek() == Some('/') => {
                    self.bump();
                    text.push_str("*/");
                    return Ok(text);
                }
                Some(c) => text.push(c),
                None => {
                    return Err(TransformError::compile(start_line, "unterminated comment"));
                }
            }
        }
    }

    fn read_string(&mut self, quote: char, out: &mut String) -> Result<(), TransformError> {
        let start_line = self.line;
        out.push(quote);
        self.bump();
        loop {
            match self.bump() {
                Some('\\') => {
                    out.push('\\');
                    if let Some(c) = self.bump() {
                        out.push(c);
                    }
                }
                Some(c) if c == quote => {
                    out.push(c);
                    return Ok(());
                }
                Some('\n') | None => {
                    return Err(TransformError::compile(start_line, "unterminated string"));
                }
                Some(c) => out.push(c),
            }
        }
    }

    /// Read `#{...}` verbatim, including nested braces.
    fn read_interpolation(&mut self, out: &mut String) -> Result<(), TransformError> {
        let start_line = self.line;
        let mut depth = 0usize;
        loop {
            match self.bump() {
                Some('{') => {
                    depth += 1;
                    out.push('{');
                }
                Some('}') => {
                    out.push('}');
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Some(c) => out.push(c),
                None => {
                    return Err(TransformError::compile(start_line, "unterminated interpolation"));
                }
            }
        }
    }

    /// Read up to the next top-level `{`, `;` or `}`.
    fn read_chunk(&mut self) -> Result<(String, Terminator), TransformError> {
        let mut text = String::new();
        let mut parens = 0usize;

        loop {
            let Some(c) = self.peek() else {
                return Ok((text, Terminator::Eof));
            };
            match c {
                '"' | '\'' => self.read_string(c, &mut text)?,
                '#' if self.peek_at(1) == Some('{') => self.read_interpolation(&mut text)?,
                '/' if self.peek_at(1) == Some('*') => {
                    self.read_block_comment()?;
                }
                '/' if self.peek_at(1) == Some('/') && parens == 0 => self.skip_line_comment(),
                '(' => {
                    parens += 1;
                    text.push(c);
                    self.bump();
                }
                ')' => {
                    parens = parens.saturating_sub(1);
                    text.push(c);
                    self.bump();
                }
                '{' if parens == 0 => {
                    self.bump();
                    return Ok((text, Terminator::Open));
                }
                ';' if parens == 0 => {
                    self.bump();
                    return Ok((text, Terminator::Semicolon));
                }
                '}' if parens == 0 => return Ok((text, Terminator::Close)),
                _ => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    fn parse_block(&mut self, nested: bool, open_line: usize) -> Result<Vec<Node>, TransformError> {
        let mut nodes = Vec::new();

        loop {
            self.skip_whitespace();
            let Some(c) = self.peek() else {
                if nested {
                    return Err(TransformError::compile(
                        open_line,
                        "expected '}' to close block",
                    ));
                }
                return Ok(nodes);
            };

            if c == '/' && self.peek_at(1) == Some('/') {
                self.skip_line_comment();
                continue;
            }
            if c == '/' && self.peek_at(1) == Some('*') {
                nodes.push(Node::Comment(self.read_block_comment()?));
                continue;
            }
            if c == '}' {
                if nested {
                    self.bump();
                    return Ok(nodes);
                }
                return Err(TransformError::compile(self.line, "unexpected '}'"));
            }
            if c == ';' {
                self.bump();
                continue;
            }

            let line = self.line;
            let (chunk, terminator) = self.read_chunk()?;
            let text = collapse_whitespace(&chunk);

            if terminator == Terminator::Open {
                let children = self.parse_block(true, line)?;
                nodes.push(classify_block(&text, children, line)?);
                continue;
            }

            if text.is_empty() {
                continue;
            }
            if terminator == Terminator::Eof {
                return Err(TransformError::compile(line, format!("expected ';' after '{}'", text)));
            }
            nodes.extend(classify_statement(&text, nested, line)?);
        }
    }
}

fn classify_block(text: &str, children: Vec<Node>, line: usize) -> Result<Node, TransformError> {
    if let Some(rest) = text.strip_prefix('@') {
        let (name, prelude) = split_directive(rest);
        if UNSUPPORTED_DIRECTIVES.contains(&name.as_str()) {
            return Err(TransformError::compile(line, format!("unsupported directive '@{}'", name)));
        }
        return Ok(Node::AtBlock { name, prelude, children, line });
    }
    if text.is_empty() {
        return Err(TransformError::compile(line, "expected selector before '{'"));
    }
    Ok(Node::Rule { selector: text.to_string(), children, line })
}

fn classify_statement(text: &str, nested: bool, line: usize) -> Result<Vec<Node>, TransformError> {
    if let Some(rest) = text.strip_prefix('$') {
        let Some((name, value)) = rest.split_once(':') else {
            return Err(TransformError::compile(line, "expected ':' after variable name"));
        };
        let name = name.trim();
        if name.is_empty() || !name.chars().all(is_ident_char) {
            return Err(TransformError::compile(line, format!("invalid variable name '${}'", name)));
        }
        let mut value = value.trim().to_string();
        let mut default = false;
        let mut global = false;
        loop {
            if let Some(v) = value.strip_suffix("!default") {
                default = true;
                value = v.trim_end().to_string();
            } else if let Some(v) = value.strip_suffix("!global") {
                global = true;
                value = v.trim_end().to_string();
            } else {
                break;
            }
        }
        if value.is_empty() {
            return Err(TransformError::compile(line, format!("missing value for ${}", name)));
        }
        return Ok(vec![Node::Variable { name: name.to_string(), value, default, global, line }]);
    }

    if let Some(rest) = text.strip_prefix('@') {
        let (name, prelude) = split_directive(rest);
        if UNSUPPORTED_DIRECTIVES.contains(&name.as_str()) {
            return Err(TransformError::compile(line, format!("unsupported directive '@{}'", name)));
        }
        if name == "import" {
            return Ok(split_imports(&prelude, line));
        }
        return Ok(vec![Node::AtStatement { text: text.to_string() }]);
    }

    let Some((property, value)) = text.split_once(':') else {
        return Err(TransformError::compile(line, format!("expected ':' in declaration '{}'", text)));
    };
    if !nested {
        return Err(TransformError::compile(line, "properties are only allowed within rules"));
    }
    let property = property.trim();
    let value = value.trim();
    if property.is_empty() {
        return Err(TransformError::compile(line, "missing property name"));
    }
    if value.is_empty() {
        return Err(TransformError::compile(line, format!("missing value for '{}'", property)));
    }
    Ok(vec![Node::Declaration { property: property.to_string(), value: value.to_string(), line }])
}

/// Sass imports local partials; plain CSS imports are passed through.
fn split_imports(prelude: &str, line: usize) -> Vec<Node> {
    split_top_level(prelude, ',')
        .into_iter()
        .map(|target| {
            let unquoted = target.trim_matches(|c| c == '"' || c == '\'');
            let is_css = target.starts_with("url(")
                || unquoted.ends_with(".css")
                || unquoted.starts_with("http://")
                || unquoted.starts_with("https://")
                || unquoted.starts_with("//");
            if is_css || unquoted == target {
                Node::AtStatement { text: format!("@import {}", target) }
            } else {
                Node::Import { target: unquoted.to_string(), line }
            }
        })
        .collect()
}

fn split_directive(rest: &str) -> (String, String) {
    let end = rest.find(|c: char| c.is_whitespace() || c == '(').unwrap_or(rest.len());
    (rest[..end].to_string(), rest[end..].trim().to_string())
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split on `sep` outside parentheses, brackets and quotes.
fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' | '[' => {
                    depth += 1;
                    current.push(c);
                }
                ')' | ']' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                c if c == sep && depth == 0 => {
                    parts.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

// ============================================================================
// Evaluation
// ============================================================================

#[derive(Debug)]
enum Block {
    Comment(String),
    Raw(String),
    Rule { selector: String, body: Vec<String> },
    At { header: String, inner: Vec<Block> },
}

struct Compiler {
    search: Vec<PathBuf>,
    scopes: Vec<HashMap<String, String>>,
    import_stack: Vec<PathBuf>,
}

impl Compiler {
    fn new(search: Vec<PathBuf>) -> Self {
        Self { search, scopes: vec![HashMap::new()], import_stack: vec![] }
    }

    fn compile(mut self, source: &str) -> Result<String, TransformError> {
        let nodes = Parser::new(source).parse_block(false, 1)?;
        let blocks = self.compile_nodes(&nodes, &[])?;
        Ok(render(&blocks))
    }

    fn compile_nodes(&mut self, nodes: &[Node], parents: &[String]) -> Result<Vec<Block>, TransformError> {
        let mut body = Vec::new();
        let mut blocks = Vec::new();

        self.scopes.push(HashMap::new());
        let result = self.compile_into(nodes, parents, &mut body, &mut blocks);
        self.scopes.pop();
        result?;

        let mut out = Vec::new();
        if !parents.is_empty() && !body.is_empty() {
            out.push(Block::Rule { selector: parents.join(", "), body });
        }
        out.extend(blocks);
        Ok(out)
    }

    fn compile_into(
        &mut self,
        nodes: &[Node],
        parents: &[String],
        body: &mut Vec<String>,
        blocks: &mut Vec<Block>,
    ) -> Result<(), TransformError> {
        for node in nodes {
            match node {
                Node::Comment(text) => {
                    if parents.is_empty() {
                        blocks.push(Block::Comment(text.clone()));
                    } else {
                        body.push(text.clone());
                    }
                }
                Node::Variable { name, value, default, global, line } => {
                    if *default && self.lookup(name).is_some() {
                        continue;
                    }
                    let value = self.substitute(value, *line)?;
                    let scope = if *global { self.scopes.first_mut() } else { self.scopes.last_mut() };
                    if let Some(scope) = scope {
                        scope.insert(name.clone(), value);
                    }
                }
                Node::Declaration { property, value, line } => {
                    if parents.is_empty() {
                        return Err(TransformError::compile(
                            *line,
                            "properties are only allowed within rules",
                        ));
                    }
                    let property = self.substitute(property, *line)?;
                    let value = self.substitute(value, *line)?;
                    body.push(format!("{}: {};", property, value));
                }
                Node::Rule { selector, children, line } => {
                    let selector = self.substitute(selector, *line)?;
                    if let Some(prefix) = selector.strip_suffix(':') {
                        if !parents.is_empty() {
                            self.nested_properties(prefix.trim(), children, body)?;
                            continue;
                        }
                    }
                    let selectors = combine_selectors(parents, &split_top_level(&selector, ','));
                    blocks.extend(self.compile_nodes(children, &selectors)?);
                }
                Node::AtBlock { name, prelude, children, line } => {
                    let prelude = self.substitute(prelude, *line)?;
                    let header = if prelude.is_empty() {
                        format!("@{}", name)
                    } else {
                        format!("@{} {}", name, prelude)
                    };

                    if DECLARATION_BLOCKS.contains(&name.as_str()) {
                        let inner = self.compile_nodes(children, &[header])?;
                        blocks.extend(inner);
                    } else if name.ends_with("keyframes") {
                        let inner = self.compile_nodes(children, &[])?;
                        blocks.push(Block::At { header, inner });
                    } else {
                        // @media and friends bubble up, keeping the enclosing selector
                        let inner = self.compile_nodes(children, parents)?;
                        if !inner.is_empty() {
                            blocks.push(Block::At { header, inner });
                        }
                    }
                }
                Node::AtStatement { text } => blocks.push(Block::Raw(format!("{};", text))),
                Node::Import { target, line } => {
                    let (path, source) = self.load_import(target, *line)?;
                    let nodes = Parser::new(&source)
                        .parse_block(false, 1)
                        .map_err(|e| in_file(e, &path))?;
                    self.import_stack.push(path.clone());
                    let result = self.compile_into(&nodes, parents, body, blocks);
                    self.import_stack.pop();
                    result.map_err(|e| in_file(e, &path))?;
                }
            }
        }
        Ok(())
    }

    fn nested_properties(
        &mut self,
        prefix: &str,
        children: &[Node],
        body: &mut Vec<String>,
    ) -> Result<(), TransformError> {
        for child in children {
            match child {
                Node::Declaration { property, value, line } => {
                    let value = self.substitute(value, *line)?;
                    body.push(format!("{}-{}: {};", prefix, property, value));
                }
                Node::Comment(text) => body.push(text.clone()),
                Node::Rule { line, .. }
                | Node::AtBlock { line, .. }
                | Node::Import { line, .. }
                | Node::Variable { line, .. } => {
                    return Err(TransformError::compile(
                        *line,
                        format!("only declarations are allowed in nested property '{}'", prefix),
                    ));
                }
                Node::AtStatement { .. } => {}
            }
        }
        Ok(())
    }

    fn load_import(&self, target: &str, line: usize) -> Result<(PathBuf, String), TransformError> {
        if self.import_stack.len() >= MAX_IMPORT_DEPTH {
            return Err(TransformError::compile(line, format!("import nesting too deep at '{}'", target)));
        }

        let target_path = Path::new(target);
        let file_name = target_path.file_name().map(|n| n.to_string_lossy().into_owned());
        let parent = target_path.parent().unwrap_or_else(|| Path::new(""));
        let Some(file_name) = file_name else {
            return Err(TransformError::compile(line, format!("invalid import '{}'", target)));
        };

        let stem = file_name.strip_suffix(".scss").unwrap_or(&file_name);
        let candidates = [format!("{}.scss", stem), format!("_{}.scss", stem)];

        let importer_dir = self.import_stack.last().and_then(|p| p.parent()).map(Path::to_path_buf);
        for dir in importer_dir.iter().chain(self.search.iter()) {
            for candidate in &candidates {
                let path = dir.join(parent).join(candidate);
                if self.import_stack.contains(&path) {
                    return Err(TransformError::compile(
                        line,
                        format!("circular import of '{}'", target),
                    ));
                }
                if let Ok(source) = std::fs::read_to_string(&path) {
                    return Ok((path, source));
                }
            }
        }

        Err(TransformError::compile(line, format!("cannot find stylesheet to import: '{}'", target)))
    }

    fn lookup(&self, name: &str) -> Option<&String> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    /// Replace `$var` references and `#{}` interpolations.
    fn substitute(&self, text: &str, line: usize) -> Result<String, TransformError> {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut quote: Option<char> = None;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if c == '#' && chars.get(i + 1) == Some(&'{') {
                let start = i + 2;
                let mut depth = 1usize;
                let mut j = start;
                while j < chars.len() && depth > 0 {
                    match chars[j] {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                if depth > 0 {
                    return Err(TransformError::compile(line, "unterminated interpolation"));
                }
                let inner: String = chars[start..j - 1].iter().collect();
                let value = self.substitute(inner.trim(), line)?;
                out.push_str(value.trim_matches(|c| c == '"' || c == '\''));
                i = j;
                continue;
            }

            match quote {
                Some(q) => {
                    if c == q {
                        quote = None;
                    }
                    out.push(c);
                }
                None if c == '"' || c == '\'' => {
                    quote = Some(c);
                    out.push(c);
                }
                None if c == '$' && chars.get(i + 1).is_some_and(|n| is_ident_char(*n)) => {
                    let mut j = i + 1;
                    while j < chars.len() && is_ident_char(chars[j]) {
                        j += 1;
                    }
                    let name: String = chars[i + 1..j].iter().collect();
                    match self.lookup(&name) {
                        Some(value) => out.push_str(value),
                        None => {
                            return Err(TransformError::compile(
                                line,
                                format!("undefined variable: ${}", name),
                            ));
                        }
                    }
                    i = j;
                    continue;
                }
                None => out.push(c),
            }
            i += 1;
        }

        Ok(out)
    }
}

fn in_file(err: TransformError, path: &Path) -> TransformError {
    match err {
        TransformError::Compile { line, message } if !message.contains(" (in ") => {
            TransformError::Compile { line, message: format!("{} (in {})", message, path.display()) }
        }
        other => other,
    }
}

fn combine_selectors(parents: &[String], children: &[String]) -> Vec<String> {
    if parents.is_empty() {
        return children.to_vec();
    }
    let mut combined = Vec::with_capacity(parents.len() * children.len());
    for parent in parents {
        for child in children {
            if child.contains('&') {
                combined.push(child.replace('&', parent));
            } else {
                combined.push(format!("{} {}", parent, child));
            }
        }
    }
    combined
}

fn render(blocks: &[Block]) -> String {
    let rendered: Vec<String> = blocks.iter().map(|b| render_block(b, 0)).collect();
    if rendered.is_empty() {
        return String::new();
    }
    rendered.join("\n")
}

fn render_block(block: &Block, depth: usize) -> String {
    let indent = "  ".repeat(depth);
    match block {
        Block::Comment(text) | Block::Raw(text) => format!("{}{}\n", indent, text),
        Block::Rule { selector, body } => {
            let mut out = format!("{}{} {{\n", indent, selector);
            for line in body {
                out.push_str(&format!("{}  {}\n", indent, line));
            }
            out.push_str(&format!("{}}}\n", indent));
            out
        }
        Block::At { header, inner } => {
            let mut out = format!("{}{} {{\n", indent, header);
            for b in inner {
                out.push_str(&render_block(b, depth + 1));
            }
            out.push_str(&format!("{}}}\n", indent));
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plain_rule() {
        let css = compile_scss("a { color: red; }").unwrap();
        assert_eq!(css, "a {\n  color: red;\n}\n");
    }

    #[test]
    fn test_variables() {
        let css = compile_scss("$primary: #333;\nbody { color: $primary; }").unwrap();
        assert_eq!(css, "body {\n  color: #333;\n}\n");
    }

    #[test]
    fn test_variable_default_keeps_existing() {
        let css = compile_scss("$a: 1px;\n$a: 2px !default;\np { margin: $a; }").unwrap();
        assert!(css.contains("margin: 1px;"));
    }

    #[test]
    fn test_local_variable_scope() {
        let err = compile_scss("a { $w: 1px; }\nb { width: $w; }").unwrap_err();
        assert!(matches!(err, TransformError::Compile { line: 2, .. }));
    }

    #[test]
    fn test_global_flag() {
        let css = compile_scss("a { $w: 1px !global; }\nb { width: $w; }").unwrap();
        assert!(css.contains("width: 1px;"));
    }

    #[test]
    fn test_nesting_and_parent_reference() {
        let source = r#"
.nav {
  margin: 0;
  a {
    color: blue;
    &:hover { color: red; }
  }
  &-item { padding: 0; }
}
"#;
        let css = compile_scss(source).unwrap();
        let expected = ".nav {\n  margin: 0;\n}\n\n.nav a {\n  color: blue;\n}\n\n.nav a:hover {\n  color: red;\n}\n\n.nav-item {\n  padding: 0;\n}\n";
        assert_eq!(css, expected);
    }

    #[test]
    fn test_selector_lists_combine() {
        let css = compile_scss("h1, h2 { a, b { x: y; } }").unwrap();
        assert!(css.starts_with("h1 a, h1 b, h2 a, h2 b {"));
    }

    #[test]
    fn test_declarations_hoisted_before_nested_rules() {
        let css = compile_scss("a { color: red; b { x: y; } margin: 0; }").unwrap();
        assert_eq!(css, "a {\n  color: red;\n  margin: 0;\n}\n\na b {\n  x: y;\n}\n");
    }

    #[test]
    fn test_media_bubbles() {
        let css = compile_scss(".box { width: 100%; @media (min-width: 600px) { width: 50%; } }")
            .unwrap();
        assert!(css.contains("@media (min-width: 600px) {\n  .box {\n    width: 50%;\n  }\n}\n"));
    }

    #[test]
    fn test_nested_properties() {
        let css = compile_scss("p { font: { family: serif; size: 12px; } }").unwrap();
        assert!(css.contains("font-family: serif;"));
        assert!(css.contains("font-size: 12px;"));
    }

    #[test]
    fn test_interpolation() {
        let css = compile_scss("$side: left;\n.m-#{$side} { margin-#{$side}: 0; }").unwrap();
        assert!(css.contains(".m-left {\n  margin-left: 0;\n}"));
    }

    #[test]
    fn test_comments() {
        let css = compile_scss("// dropped\n/* kept */\na { b: c; // trailing\n}").unwrap();
        assert!(css.contains("/* kept */"));
        assert!(!css.contains("dropped"));
        assert!(!css.contains("trailing"));
    }

    #[test]
    fn test_url_with_double_slash_is_not_a_comment() {
        let css = compile_scss("a { background: url(http://x.test/a.png); }").unwrap();
        assert!(css.contains("url(http://x.test/a.png)"));
    }

    #[test]
    fn test_keyframes_and_font_face() {
        let css = compile_scss(
            "@font-face { font-family: X; src: url(x.woff); }\n@keyframes spin { from { opacity: 0; } to { opacity: 1; } }",
        )
        .unwrap();
        assert!(css.contains("@font-face {\n  font-family: X;"));
        assert!(css.contains("@keyframes spin {\n  from {\n    opacity: 0;\n  }\n"));
    }

    #[test]
    fn test_css_import_passthrough() {
        let css = compile_scss("@import url(reset.css);\na { b: c; }").unwrap();
        assert!(css.starts_with("@import url(reset.css);\n"));
    }

    #[test]
    fn test_error_unclosed_block() {
        let err = compile_scss("a {\n  color: red;\n").unwrap_err();
        assert_eq!(err, TransformError::compile(1, "expected '}' to close block"));
    }

    #[test]
    fn test_error_unexpected_close() {
        let err = compile_scss("a { b: c; }\n}").unwrap_err();
        assert!(matches!(err, TransformError::Compile { line: 2, .. }));
    }

    #[test]
    fn test_error_missing_colon() {
        let err = compile_scss("a {\n  color red;\n}").unwrap_err();
        assert!(matches!(err, TransformError::Compile { line: 2, .. }));
    }

    #[test]
    fn test_error_undefined_variable() {
        let err = compile_scss("a {\n\n  color: $nope;\n}").unwrap_err();
        match err {
            TransformError::Compile { line, message } => {
                assert_eq!(line, 3);
                assert!(message.contains("$nope"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_error_unsupported_mixin() {
        let err = compile_scss("@mixin x { a: b; }").unwrap_err();
        assert!(err.to_string().contains("@mixin"));
    }

    #[test]
    fn test_error_unterminated_string() {
        let err = compile_scss("a { content: \"abc; }").unwrap_err();
        assert!(err.to_string().contains("unterminated string"));
    }

    #[test]
    fn test_partial_import() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("_vars.scss"), "$brand: #f00;").unwrap();
        std::fs::write(temp.path().join("main.scss"), "@import 'vars';\na { color: $brand; }")
            .unwrap();

        let record = FileRecord::read(temp.path(), PathBuf::from("main.scss")).unwrap();
        let out = StyleCompile::new().apply(record).unwrap();
        assert_eq!(out.relative, PathBuf::from("main.css"));
        assert_eq!(out.text().unwrap(), "a {\n  color: #f00;\n}\n");
    }

    #[test]
    fn test_missing_import() {
        let err = compile_scss("@import 'nowhere';").unwrap_err();
        assert!(err.to_string().contains("cannot find stylesheet"));
    }

    #[test]
    fn test_partials_produce_no_output() {
        let record = FileRecord::new("/src", "assets/styles/_vars.scss", b"$a: 1;".to_vec());
        assert!(StyleCompile::new().apply_many(record).unwrap().is_empty());
    }

    #[test]
    fn test_output_path() {
        let stage = StyleCompile::new();
        assert_eq!(stage.output_path(Path::new("a/b.scss")), PathBuf::from("a/b.css"));
        assert_eq!(stage.output_path(Path::new("a/b.css")), PathBuf::from("a/b.css"));
    }
}
