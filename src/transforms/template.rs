//! Page template rendering (swig-compatible subset).
//!
//! Syntax:
//!
//! - `{{ expr }}` output, HTML-escaped unless the last filter is `safe`
//! - `{% if %}` / `{% elif %}` / `{% else %}` / `{% endif %}`
//! - `{% for item in list %}` and `{% for key, value in object %}` with
//!   `loop.index`, `loop.index0`, `loop.first`, `loop.last`, `loop.length`
//! - `{% set name = expr %}`
//! - `{% include "file" %}`, `{% extends "file" %}` with `{% block name %}`
//! - `{% raw %}...{% endraw %}` and `{# comments #}`
//!
//! Expressions: literals, dotted paths (`site.menus.0.name`, `.length`),
//! `==`, `!=`, `<`, `>`, `<=`, `>=`, `in`, `and`/`or`/`not` (or `&&`/`||`/`!`),
//! and filters (`| upper`, `| default("x")`, `| date("Y")`, ...).
//!
//! Truthiness follows swig, i.e. JavaScript: empty arrays and objects are
//! truthy. Paths are resolved relative to the including file's directory.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use super::types::{record_text, Transform, TransformError};
use crate::build::fileset::content_hash;
use crate::build::FileRecord;

/// Guards `include`/`extends` recursion.
const MAX_TEMPLATE_DEPTH: usize = 32;

/// Template render stage.
#[derive(Debug, Default)]
pub struct TemplateRender {
    data: Value,
    loader: Loader,
}

impl TemplateRender {
    /// Create a renderer over the given context (an object).
    pub fn new(data: Value) -> Self {
        Self { data, loader: Loader::default() }
    }

    /// Keep parsed templates between renders, keyed by content hash.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.loader.cache = enabled.then(|| Mutex::new(HashMap::new()));
        self
    }

    /// Render template source that lives in `dir` (for includes).
    pub fn render_str(&self, source: &str, dir: &Path) -> Result<String, TransformError> {
        let template = self.loader.parse(source, &content_hash(source.as_bytes()))?;
        let mut renderer = Renderer::new(&self.loader, &self.data);
        let mut out = String::with_capacity(source.len());
        renderer.render_template(&template, dir, &mut out)?;
        Ok(out)
    }

    /// Number of cached templates (0 when caching is off).
    pub fn cached_templates(&self) -> usize {
        self.loader.cache.as_ref().map(|c| lock(c).len()).unwrap_or(0)
    }
}

impl Transform for TemplateRender {
    fn name(&self) -> &'static str {
        "template"
    }

    fn apply(&self, record: FileRecord) -> Result<FileRecord, TransformError> {
        let dir = record.source.parent().map(Path::to_path_buf).unwrap_or_default();
        let template = self.loader.parse(record_text(&record)?, record.hash())?;

        let mut renderer = Renderer::new(&self.loader, &self.data);
        let mut out = String::with_capacity(record.contents().len());
        renderer.render_template(&template, &dir, &mut out)?;
        Ok(record.with_contents(out.into_bytes()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn render_error(line: usize, message: impl std::fmt::Display) -> TransformError {
    TransformError::render(format!("line {}: {}", line, message))
}

// ============================================================================
// Template lexing
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Text(String),
    Output(String, usize),
    Tag(String, usize),
}

static ENDRAW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{%-?\s*endraw\s*-?%\}").expect("valid regex"));

fn lex(source: &str) -> Result<Vec<Piece>, TransformError> {
    let mut pieces = Vec::new();
    let mut rest = source;
    let mut line = 1;

    loop {
        let open = rest
            .match_indices('{')
            .map(|(i, _)| i)
            .find(|&i| matches!(rest.as_bytes().get(i + 1), Some(b'{') | Some(b'%') | Some(b'#')));

        let Some(pos) = open else {
            if !rest.is_empty() {
                pieces.push(Piece::Text(rest.to_string()));
            }
            return Ok(pieces);
        };

        if pos > 0 {
            pieces.push(Piece::Text(rest[..pos].to_string()));
            line += rest[..pos].matches('\n').count();
        }

        let kind = rest.as_bytes()[pos + 1];
        let close = match kind {
            b'{' => "}}",
            b'%' => "%}",
            _ => "#}",
        };
        let body_start = pos + 2;
        let Some(len) = rest[body_start..].find(close) else {
            return Err(render_error(line, format!("unclosed '{}'", &rest[pos..pos + 2])));
        };
        let inner = rest[body_start..body_start + len].trim_matches('-').trim();
        let tag_line = line;
        line += rest[pos..body_start + len + 2].matches('\n').count();
        rest = &rest[body_start + len + 2..];

        match kind {
            b'{' => pieces.push(Piece::Output(inner.to_string(), tag_line)),
            b'%' if inner == "raw" => {
                let Some(end) = ENDRAW.find(rest) else {
                    return Err(render_error(tag_line, "missing {% endraw %}"));
                };
                pieces.push(Piece::Text(rest[..end.start()].to_string()));
                line += rest[..end.end()].matches('\n').count();
                rest = &rest[end.end()..];
            }
            b'%' => pieces.push(Piece::Tag(inner.to_string(), tag_line)),
            _ => {}
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Str(String),
    Num(f64),
    Name(String),
    Op(&'static str),
}

const EXPR_OPS: &[(&str, &str)] = &[
    ("===", "=="),
    ("!==", "!="),
    ("==", "=="),
    ("!=", "!="),
    ("<=", "<="),
    (">=", ">="),
    ("&&", "and"),
    ("||", "or"),
    ("<", "<"),
    (">", ">"),
    ("|", "|"),
    ("(", "("),
    (")", ")"),
    (",", ","),
    ("!", "not"),
];

fn tokenize_expr(text: &str, line: usize) -> Result<Vec<Tok>, TransformError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    'outer: while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '"' || c == '\'' {
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(render_error(line, format!("unterminated string in '{}'", text))),
                    Some('\\') => {
                        if let Some(next) = chars.get(i + 1) {
                            value.push(*next);
                        }
                        i += 2;
                    }
                    Some(q) if *q == c => {
                        i += 1;
                        break;
                    }
                    Some(other) => {
                        value.push(*other);
                        i += 1;
                    }
                }
            }
            tokens.push(Tok::Str(value));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let number = literal
                .parse::<f64>()
                .map_err(|_| render_error(line, format!("invalid number '{}'", literal)))?;
            tokens.push(Tok::Num(number));
            continue;
        }
        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
            {
                i += 1;
            }
            tokens.push(Tok::Name(chars[start..i].iter().collect()));
            continue;
        }
        for (op, canonical) in EXPR_OPS {
            let matches = op.chars().enumerate().all(|(k, oc)| chars.get(i + k) == Some(&oc));
            if matches {
                tokens.push(Tok::Op(*canonical));
                i += op.len();
                continue 'outer;
            }
        }
        return Err(render_error(line, format!("unexpected '{}' in '{}'", c, text)));
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Filter { input: Box<Expr>, name: String, args: Vec<Expr> },
}

impl Expr {
    /// Name used in "is undefined" messages.
    fn describe(&self) -> String {
        match self {
            Expr::Path(segments) => segments.join("."),
            Expr::Filter { input, .. } => input.describe(),
            _ => "expression".to_string(),
        }
    }
}

struct ExprParser {
    tokens: Vec<Tok>,
    pos: usize,
    line: usize,
}

fn parse_expr(text: &str, line: usize) -> Result<Expr, TransformError> {
    let tokens = tokenize_expr(text, line)?;
    if tokens.is_empty() {
        return Err(render_error(line, "empty expression"));
    }
    let mut parser = ExprParser { tokens, pos: 0, line };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(render_error(line, format!("unexpected trailing input in '{}'", text)));
    }
    Ok(expr)
}

impl ExprParser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Tok::Op(o)) if *o == op)
    }

    fn at_name(&self, name: &str) -> bool {
        matches!(self.peek(), Some(Tok::Name(n)) if n == name)
    }

    fn parse_or(&mut self) -> Result<Expr, TransformError> {
        let mut left = self.parse_and()?;
        while self.at_name("or") || self.at_op("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, TransformError> {
        let mut left = self.parse_not()?;
        while self.at_name("and") || self.at_op("and") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, TransformError> {
        if self.at_name("not") || self.at_op("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, TransformError> {
        let left = self.parse_filtered()?;
        let op = match self.peek() {
            Some(Tok::Op("==")) => CmpOp::Eq,
            Some(Tok::Op("!=")) => CmpOp::Ne,
            Some(Tok::Op("<")) => CmpOp::Lt,
            Some(Tok::Op(">")) => CmpOp::Gt,
            Some(Tok::Op("<=")) => CmpOp::Le,
            Some(Tok::Op(">=")) => CmpOp::Ge,
            Some(Tok::Name(n)) if n == "in" => CmpOp::In,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_filtered()?;
        Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
    }

    fn parse_filtered(&mut self) -> Result<Expr, TransformError> {
        let mut expr = self.parse_primary()?;
        while self.at_op("|") {
            self.pos += 1;
            let name = match self.tokens.get(self.pos) {
                Some(Tok::Name(n)) => n.clone(),
                _ => return Err(render_error(self.line, "expected filter name after '|'")),
            };
            self.pos += 1;

            let mut args = Vec::new();
            if self.at_op("(") {
                self.pos += 1;
                if !self.at_op(")") {
                    loop {
                        args.push(self.parse_or()?);
                        if self.at_op(",") {
                            self.pos += 1;
                            continue;
                        }
                        break;
                    }
                }
                if !self.at_op(")") {
                    let message = format!("expected ')' after arguments to '{}'", name);
                    return Err(render_error(self.line, message));
                }
                self.pos += 1;
            }
            expr = Expr::Filter { input: Box::new(expr), name, args };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, TransformError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| render_error(self.line, "unexpected end of expression"))?;
        self.pos += 1;

        match token {
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::Num(n) => Ok(Expr::Literal(number_value(n))),
            Tok::Name(name) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" | "none" => Expr::Literal(Value::Null),
                _ => Expr::Path(name.split('.').map(String::from).collect()),
            }),
            Tok::Op("(") => {
                let inner = self.parse_or()?;
                if !self.at_op(")") {
                    return Err(render_error(self.line, "expected ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Tok::Op(op) => Err(render_error(self.line, format!("unexpected '{}'", op))),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Template structure
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Output { expr: Expr, line: usize },
    If { branches: Vec<(Expr, Vec<Node>)>, otherwise: Vec<Node> },
    For { key: Option<String>, value: String, iterable: Expr, body: Vec<Node>, line: usize },
    Set { name: String, expr: Expr, line: usize },
    Include { path: String, line: usize },
    Extends { path: String, line: usize },
    Block { name: String, body: Vec<Node> },
}

#[derive(Debug)]
struct Template {
    nodes: Vec<Node>,
    extends: Option<(String, usize)>,
}

impl Template {
    fn parse(source: &str) -> Result<Self, TransformError> {
        let mut parser = NodeParser { pieces: lex(source)?, pos: 0 };
        let (nodes, end) = parser.parse_until(&[])?;
        if let Some((word, _, line)) = end {
            return Err(render_error(line, format!("unexpected '{{% {} %}}'", word)));
        }

        let extends = nodes.iter().find_map(|n| match n {
            Node::Extends { path, line } => Some((path.clone(), *line)),
            _ => None,
        });
        Ok(Self { nodes, extends })
    }
}

type EndTag = (String, String, usize);

struct NodeParser {
    pieces: Vec<Piece>,
    pos: usize,
}

impl NodeParser {
    fn parse_until(&mut self, ends: &[&str]) -> Result<(Vec<Node>, Option<EndTag>), TransformError> {
        let mut nodes = Vec::new();

        while let Some(piece) = self.pieces.get(self.pos).cloned() {
            self.pos += 1;
            match piece {
                Piece::Text(text) => nodes.push(Node::Text(text)),
                Piece::Output(expr, line) => {
                    nodes.push(Node::Output { expr: parse_expr(&expr, line)?, line });
                }
                Piece::Tag(content, line) => {
                    let (word, rest) = match content.split_once(char::is_whitespace) {
                        Some((w, r)) => (w.to_string(), r.trim().to_string()),
                        None => (content.clone(), String::new()),
                    };
                    if ends.contains(&word.as_str()) {
                        return Ok((nodes, Some((word, rest, line))));
                    }
                    nodes.push(self.parse_tag(&word, &rest, line)?);
                }
            }
        }

        Ok((nodes, None))
    }

    fn parse_tag(&mut self, word: &str, rest: &str, line: usize) -> Result<Node, TransformError> {
        match word {
            "if" => self.parse_if(rest, line),
            "for" => {
                let Some((vars, iterable)) = rest.split_once(" in ") else {
                    return Err(render_error(line, "expected 'for <name> in <expr>'"));
                };
                let (key, value) = match vars.split_once(',') {
                    Some((k, v)) => (Some(k.trim().to_string()), v.trim().to_string()),
                    None => (None, vars.trim().to_string()),
                };
                let iterable = parse_expr(iterable, line)?;
                let (body, end) = self.parse_until(&["endfor"])?;
                if end.is_none() {
                    return Err(render_error(line, "missing {% endfor %}"));
                }
                Ok(Node::For { key, value, iterable, body, line })
            }
            "set" => {
                let Some((name, expr)) = rest.split_once('=') else {
                    return Err(render_error(line, "expected 'set <name> = <expr>'"));
                };
                let name = name.trim();
                if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    return Err(render_error(line, format!("invalid variable name '{}'", name)));
                }
                Ok(Node::Set { name: name.to_string(), expr: parse_expr(expr, line)?, line })
            }
            "include" => Ok(Node::Include { path: string_argument(rest, word, line)?, line }),
            "extends" => Ok(Node::Extends { path: string_argument(rest, word, line)?, line }),
            "block" => {
                let name = rest.trim().to_string();
                if name.is_empty() {
                    return Err(render_error(line, "block requires a name"));
                }
                let (body, end) = self.parse_until(&["endblock"])?;
                if end.is_none() {
                    return Err(render_error(line, format!("missing {{% endblock %}} for '{}'", name)));
                }
                Ok(Node::Block { name, body })
            }
            "endif" | "endfor" | "endblock" | "else" | "elif" | "elseif" | "endraw" => {
                Err(render_error(line, format!("unexpected '{{% {} %}}'", word)))
            }
            other => Err(render_error(line, format!("unknown tag '{}'", other))),
        }
    }

    fn parse_if(&mut self, condition: &str, line: usize) -> Result<Node, TransformError> {
        let mut branches = Vec::new();
        let mut condition = parse_expr(condition, line)?;

        loop {
            let (body, end) = self.parse_until(&["elif", "elseif", "else", "endif"])?;
            let Some((word, rest, end_line)) = end else {
                return Err(render_error(line, "missing {% endif %}"));
            };
            branches.push((condition, body));

            match word.as_str() {
                "endif" => return Ok(Node::If { branches, otherwise: vec![] }),
                "else" if rest.starts_with("if ") => {
                    condition = parse_expr(&rest[3..], end_line)?;
                }
                "else" => {
                    let (otherwise, end) = self.parse_until(&["endif"])?;
                    if end.is_none() {
                        return Err(render_error(line, "missing {% endif %}"));
                    }
                    return Ok(Node::If { branches, otherwise });
                }
                _ => condition = parse_expr(&rest, end_line)?,
            }
        }
    }
}

fn string_argument(rest: &str, tag: &str, line: usize) -> Result<String, TransformError> {
    match tokenize_expr(rest, line)?.into_iter().next() {
        Some(Tok::Str(s)) => Ok(s),
        _ => Err(render_error(line, format!("'{}' expects a quoted path", tag))),
    }
}

// ============================================================================
// Loading
// ============================================================================

#[derive(Debug, Default)]
struct Loader {
    cache: Option<Mutex<HashMap<String, Arc<Template>>>>,
}

impl Loader {
    fn parse(&self, source: &str, hash: &str) -> Result<Arc<Template>, TransformError> {
        let Some(cache) = &self.cache else {
            return Ok(Arc::new(Template::parse(source)?));
        };
        if let Some(hit) = lock(cache).get(hash) {
            return Ok(Arc::clone(hit));
        }
        let template = Arc::new(Template::parse(source)?);
        lock(cache).insert(hash.to_string(), Arc::clone(&template));
        Ok(template)
    }

    fn load(&self, path: &Path, line: usize) -> Result<Arc<Template>, TransformError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            render_error(line, format!("cannot load template '{}': {}", path.display(), e))
        })?;
        self.parse(&source, &content_hash(source.as_bytes())).map_err(|e| match e {
            TransformError::Render { message } => {
                TransformError::render(format!("{} (in {})", message, path.display()))
            }
            other => other,
        })
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// An evaluated expression; `None` is an undefined reference.
struct Evaluated {
    value: Option<Value>,
    safe: bool,
}

impl Evaluated {
    fn plain(value: Option<Value>) -> Self {
        Self { value, safe: false }
    }
}

struct Renderer<'a> {
    loader: &'a Loader,
    data: &'a Value,
    scopes: Vec<Map<String, Value>>,
    blocks: HashMap<String, (Vec<Node>, PathBuf)>,
    depth: usize,
}

impl<'a> Renderer<'a> {
    fn new(loader: &'a Loader, data: &'a Value) -> Self {
        Self { loader, data, scopes: vec![Map::new()], blocks: HashMap::new(), depth: 0 }
    }

    fn render_template(
        &mut self,
        template: &Template,
        dir: &Path,
        out: &mut String,
    ) -> Result<(), TransformError> {
        let Some((parent, line)) = &template.extends else {
            return self.render_nodes(&template.nodes, dir, out);
        };

        for node in &template.nodes {
            match node {
                // the most-derived definition wins
                Node::Block { name, body } => {
                    self.blocks.entry(name.clone()).or_insert_with(|| (body.clone(), dir.to_path_buf()));
                }
                Node::Set { .. } => self.render_node(node, dir, out)?,
                _ => {}
            }
        }

        let path = dir.join(parent);
        let parent_template = self.enter(&path, *line)?;
        let parent_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let result = self.render_template(&parent_template, &parent_dir, out);
        self.depth -= 1;
        result
    }

    fn enter(&mut self, path: &Path, line: usize) -> Result<Arc<Template>, TransformError> {
        if self.depth >= MAX_TEMPLATE_DEPTH {
            return Err(render_error(line, format!("templates nested too deeply at '{}'", path.display())));
        }
        let template = self.loader.load(path, line)?;
        self.depth += 1;
        Ok(template)
    }

    fn render_nodes(&mut self, nodes: &[Node], dir: &Path, out: &mut String) -> Result<(), TransformError> {
        for node in nodes {
            self.render_node(node, dir, out)?;
        }
        Ok(())
    }

    fn render_node(&mut self, node: &Node, dir: &Path, out: &mut String) -> Result<(), TransformError> {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output { expr, line } => {
                let evaluated = self.eval(expr, *line)?;
                let Some(value) = evaluated.value else {
                    return Err(render_error(*line, format!("'{}' is undefined", expr.describe())));
                };
                let text = display(&value);
                if evaluated.safe {
                    out.push_str(&text);
                } else {
                    out.push_str(&escape_html(&text));
                }
            }
            Node::If { branches, otherwise } => {
                for (condition, body) in branches {
                    if truthy(&self.eval(condition, 0)?.value) {
                        return self.render_nodes(body, dir, out);
                    }
                }
                self.render_nodes(otherwise, dir, out)?;
            }
            Node::For { key, value, iterable, body, line } => {
                let items: Vec<(Value, Value)> = match self.eval(iterable, *line)?.value {
                    None => {
                        return Err(render_error(*line, format!("'{}' is undefined", iterable.describe())));
                    }
                    Some(Value::Null) => vec![],
                    Some(Value::Array(items)) => items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| (Value::from(i), v))
                        .collect(),
                    Some(Value::Object(map)) => {
                        map.into_iter().map(|(k, v)| (Value::String(k), v)).collect()
                    }
                    Some(other) => {
                        return Err(render_error(*line, format!("cannot iterate over {}", type_name(&other))));
                    }
                };

                let length = items.len();
                for (index, (k, v)) in items.into_iter().enumerate() {
                    let mut scope = Map::new();
                    scope.insert(
                        "loop".to_string(),
                        serde_json::json!({
                            "index": index + 1,
                            "index0": index,
                            "first": index == 0,
                            "last": index + 1 == length,
                            "length": length,
                        }),
                    );
                    if let Some(key) = key {
                        scope.insert(key.clone(), k);
                    }
                    scope.insert(value.clone(), v);

                    self.scopes.push(scope);
                    let result = self.render_nodes(body, dir, out);
                    self.scopes.pop();
                    result?;
                }
            }
            Node::Set { name, expr, line } => {
                let value = self.eval(expr, *line)?.value.unwrap_or(Value::Null);
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(name.clone(), value);
                }
            }
            Node::Include { path, line } => {
                let path = dir.join(path);
                let template = self.enter(&path, *line)?;
                let include_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
                let result = self.render_template(&template, &include_dir, out);
                self.depth -= 1;
                result?;
            }
            Node::Extends { .. } => {}
            Node::Block { name, body } => match self.blocks.get(name).cloned() {
                Some((override_body, override_dir)) => self.render_nodes(&override_body, &override_dir, out)?,
                None => self.render_nodes(body, dir, out)?,
            },
        }
        Ok(())
    }

    fn lookup(&self, segments: &[String]) -> Option<Value> {
        let (first, rest) = segments.split_first()?;

        let root = self
            .scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(first))
            .or_else(|| self.data.get(first))
            .cloned()
            .or_else(|| (first == "now").then(|| Value::String(chrono::Local::now().to_rfc3339())))?;

        rest.iter().try_fold(root, |value, segment| match value {
            Value::Object(mut map) => map.remove(segment),
            Value::Array(items) if segment == "length" => Some(Value::from(items.len())),
            Value::Array(mut items) => {
                let index = segment.parse::<usize>().ok()?;
                (index < items.len()).then(|| items.swap_remove(index))
            }
            Value::String(s) if segment == "length" => Some(Value::from(s.chars().count())),
            _ => None,
        })
    }

    fn eval(&self, expr: &Expr, line: usize) -> Result<Evaluated, TransformError> {
        Ok(match expr {
            Expr::Literal(value) => Evaluated::plain(Some(value.clone())),
            Expr::Path(segments) => Evaluated::plain(self.lookup(segments)),
            Expr::Not(inner) => {
                Evaluated::plain(Some(Value::Bool(!truthy(&self.eval(inner, line)?.value))))
            }
            Expr::And(left, right) => {
                let l = self.eval(left, line)?;
                if truthy(&l.value) {
                    self.eval(right, line)?
                } else {
                    l
                }
            }
            Expr::Or(left, right) => {
                let l = self.eval(left, line)?;
                if truthy(&l.value) {
                    l
                } else {
                    self.eval(right, line)?
                }
            }
            Expr::Compare(left, op, right) => {
                let l = self.eval(left, line)?.value.unwrap_or(Value::Null);
                let r = self.eval(right, line)?.value.unwrap_or(Value::Null);
                Evaluated::plain(Some(Value::Bool(compare(&l, *op, &r))))
            }
            Expr::Filter { input, name, args } => {
                let evaluated = self.eval(input, line)?;
                let args = args
                    .iter()
                    .map(|a| Ok(self.eval(a, line)?.value.unwrap_or(Value::Null)))
                    .collect::<Result<Vec<_>, TransformError>>()?;
                apply_filter(name, evaluated, &args, input, line)?
            }
        })
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        CmpOp::Eq => ordering.map(|o| o == Ordering::Equal).unwrap_or(left == right),
        CmpOp::Ne => !ordering.map(|o| o == Ordering::Equal).unwrap_or(left == right),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::In => match right {
            Value::Array(items) => items.iter().any(|item| compare(left, CmpOp::Eq, item)),
            Value::String(haystack) => haystack.contains(&display(left)),
            Value::Object(map) => map.contains_key(&display(left)),
            _ => false,
        },
    }
}

fn apply_filter(
    name: &str,
    input: Evaluated,
    args: &[Value],
    source: &Expr,
    line: usize,
) -> Result<Evaluated, TransformError> {
    if name == "default" {
        let fallback = args.first().cloned().unwrap_or(Value::String(String::new()));
        return Ok(match input.value {
            None | Some(Value::Null) | Some(Value::Bool(false)) => Evaluated::plain(Some(fallback)),
            Some(_) => input,
        });
    }

    let Some(value) = input.value else {
        return Err(render_error(line, format!("'{}' is undefined", source.describe())));
    };
    let text = || display(&value);
    let string_arg = |i: usize| -> Result<String, TransformError> {
        args.get(i)
            .map(display)
            .ok_or_else(|| render_error(line, format!("filter '{}' expects an argument", name)))
    };

    let result = match name {
        "safe" => return Ok(Evaluated { value: Some(value), safe: true }),
        "escape" | "e" => {
            return Ok(Evaluated { value: Some(Value::String(escape_html(&text()))), safe: true });
        }
        "upper" => Value::String(text().to_uppercase()),
        "lower" => Value::String(text().to_lowercase()),
        "trim" => Value::String(text().trim().to_string()),
        "capitalize" => Value::String(capitalize(&text())),
        "title" => Value::String(text().split(' ').map(capitalize).collect::<Vec<_>>().join(" ")),
        "length" => Value::from(match &value {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            other => display(other).chars().count(),
        }),
        "join" => {
            let separator = string_arg(0)?;
            match &value {
                Value::Array(items) => {
                    Value::String(items.iter().map(display).collect::<Vec<_>>().join(&separator))
                }
                other => Value::String(display(other)),
            }
        }
        "first" | "last" => match &value {
            Value::Array(items) => {
                let item = if name == "first" { items.first() } else { items.last() };
                item.cloned().unwrap_or(Value::Null)
            }
            other => {
                let s = display(other);
                let c = if name == "first" { s.chars().next() } else { s.chars().last() };
                c.map(|c| Value::String(c.to_string())).unwrap_or(Value::Null)
            }
        },
        "replace" => Value::String(text().replace(&string_arg(0)?, &string_arg(1)?)),
        "json" => Value::String(value.to_string()),
        "date" => Value::String(format_date(&value, &string_arg(0)?, line)?),
        other => return Err(render_error(line, format!("unknown filter '{}'", other))),
    };

    Ok(Evaluated::plain(Some(result)))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Format a date with swig's PHP-style letters (`Y`, `m`, `d`, `H`, `i`, `s`, ...).
fn format_date(value: &Value, format: &str, line: usize) -> Result<String, TransformError> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime};

    // TOML datetimes arrive through serde as a single-key table
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map.values().next().map(display).unwrap_or_default(),
        other => display(other),
    };

    let parsed = DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.naive_local())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S").ok())
        .or_else(|| NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S").ok())
        .or_else(|| NaiveDate::parse_from_str(&text, "%Y-%m-%d").ok().and_then(|d| d.and_hms_opt(0, 0, 0)));
    let Some(datetime) = parsed else {
        return Err(render_error(line, format!("date filter cannot parse '{}'", text)));
    };

    let mut strftime = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        let item = match c {
            'Y' => "%Y",
            'y' => "%y",
            'm' => "%m",
            'n' => "%-m",
            'd' => "%d",
            'j' => "%-d",
            'D' => "%a",
            'l' => "%A",
            'M' => "%b",
            'F' => "%B",
            'H' => "%H",
            'G' => "%-H",
            'h' => "%I",
            'g' => "%-I",
            'i' => "%M",
            's' => "%S",
            'A' => "%p",
            'a' => "%P",
            '%' => "%%",
            '\\' => {
                if let Some(escaped) = chars.next() {
                    if escaped == '%' {
                        strftime.push_str("%%");
                    } else {
                        strftime.push(escaped);
                    }
                }
                continue;
            }
            other => {
                strftime.push(other);
                continue;
            }
        };
        strftime.push_str(item);
    }

    Ok(datetime.format(&strftime).to_string())
}

fn truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// String form of a value, as JavaScript would print it.
fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(","),
        Value::Object(_) => value.to_string(),
    }
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn render(source: &str, data: Value) -> Result<String, TransformError> {
        TemplateRender::new(data).render_str(source, Path::new("."))
    }

    #[test]
    fn test_output_and_escape() {
        let out = render("<h1>{{ title }}</h1>", json!({"title": "Tom & <Jerry>"})).unwrap();
        assert_eq!(out, "<h1>Tom &amp; &lt;Jerry&gt;</h1>");
    }

    #[test]
    fn test_safe_filter() {
        let out = render("{{ html | safe }}", json!({"html": "<b>x</b>"})).unwrap();
        assert_eq!(out, "<b>x</b>");
    }

    #[test]
    fn test_dotted_paths_and_indices() {
        let data = json!({"pkg": {"name": "site", "authors": ["ann", "bo"]}});
        let out = render("{{ pkg.name }} {{ pkg.authors.1 }} {{ pkg.authors.length }}", data).unwrap();
        assert_eq!(out, "site bo 2");
    }

    #[test]
    fn test_undefined_is_render_error() {
        let err = render("line one\n{{ missing.value }}", json!({})).unwrap_err();
        assert_eq!(err, TransformError::render("line 2: 'missing.value' is undefined"));
        assert_eq!(err.kind(), "RenderError");
    }

    #[test]
    fn test_default_filter() {
        let out = render("{{ subtitle | default(\"none\") }}", json!({})).unwrap();
        assert_eq!(out, "none");
    }

    #[test]
    fn test_case_filters() {
        let out = render("{{ a | upper }} {{ a | lower }} {{ a | title }}", json!({"a": "hello World"})).unwrap();
        assert_eq!(out, "HELLO WORLD hello world Hello World");
    }

    #[test]
    fn test_if_elif_else() {
        let source = "{% if n == 1 %}one{% elif n == 2 %}two{% else %}many{% endif %}";
        assert_eq!(render(source, json!({"n": 1})).unwrap(), "one");
        assert_eq!(render(source, json!({"n": 2})).unwrap(), "two");
        assert_eq!(render(source, json!({"n": 7})).unwrap(), "many");
    }

    #[test]
    fn test_if_undefined_is_falsy() {
        let out = render("{% if page.subtitle %}x{% endif %}ok", json!({})).unwrap();
        assert_eq!(out, "ok");
    }

    #[test]
    fn test_not_and_or() {
        let data = json!({"a": true, "b": false});
        assert_eq!(render("{% if a and not b %}y{% endif %}", data.clone()).unwrap(), "y");
        assert_eq!(render("{% if b || a %}y{% endif %}", data).unwrap(), "y");
    }

    #[test]
    fn test_for_loop_with_loop_vars() {
        let data = json!({"menus": [{"name": "Home"}, {"name": "About"}, {"name": "Blog"}]});
        let source = "{% for m in menus %}{{ loop.index }}:{{ m.name }}{% if not loop.last %},{% endif %}{% endfor %}";
        assert_eq!(render(source, data).unwrap(), "1:Home,2:About,3:Blog");
    }

    #[test]
    fn test_for_over_object() {
        let data = json!({"links": {"github": "gh", "twitter": "tw"}});
        let out = render("{% for k, v in links %}{{ k }}={{ v }};{% endfor %}", data).unwrap();
        assert_eq!(out, "github=gh;twitter=tw;");
    }

    #[test]
    fn test_in_operator() {
        let data = json!({"tags": ["rust", "web"]});
        assert_eq!(render("{% if \"web\" in tags %}yes{% endif %}", data).unwrap(), "yes");
    }

    #[test]
    fn test_set() {
        let out = render("{% set greeting = \"hi\" %}{{ greeting | upper }}", json!({})).unwrap();
        assert_eq!(out, "HI");
    }

    #[test]
    fn test_raw_and_comments() {
        let out = render("{# hidden #}{% raw %}{{ literal }}{% endraw %}", json!({})).unwrap();
        assert_eq!(out, "{{ literal }}");
    }

    #[test]
    fn test_date_filter() {
        let data = json!({"published": "2021-03-04T05:06:07Z"});
        assert_eq!(render("{{ published | date(\"Y-m-d H:i\") }}", data).unwrap(), "2021-03-04 05:06");
    }

    #[test]
    fn test_date_filter_now() {
        let out = render("{{ now | date(\"Y\") }}", json!({})).unwrap();
        assert_eq!(out.len(), 4);
        assert!(out.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_unknown_filter() {
        let err = render("{{ a | shout }}", json!({"a": 1})).unwrap_err();
        assert!(err.to_string().contains("unknown filter 'shout'"));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(render("{% if a %}never closed", json!({"a": 1})).is_err());
        assert!(render("{{ a ", json!({"a": 1})).is_err());
        assert!(render("{% endfor %}", json!({})).is_err());
        assert!(render("{% frobnicate %}", json!({})).is_err());
    }

    #[test]
    fn test_include_and_extends() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("layouts")).unwrap();
        std::fs::create_dir_all(root.join("partials")).unwrap();
        std::fs::write(
            root.join("layouts/basic.html"),
            "<title>{% block title %}Site{% endblock %}</title>{% include \"../partials/header.html\" %}<main>{% block body %}{% endblock %}</main>",
        )
        .unwrap();
        std::fs::write(root.join("partials/header.html"), "<header>{{ name }}</header>").unwrap();
        std::fs::write(
            root.join("index.html"),
            "{% extends \"layouts/basic.html\" %}{% block body %}<p>Hello</p>{% endblock %}",
        )
        .unwrap();

        let record = FileRecord::read(root, PathBuf::from("index.html")).unwrap();
        let out = TemplateRender::new(json!({"name": "Docs"})).apply(record).unwrap();
        assert_eq!(
            out.text().unwrap(),
            "<title>Site</title><header>Docs</header><main><p>Hello</p></main>"
        );
    }

    #[test]
    fn test_missing_include_is_render_error() {
        let temp = TempDir::new().unwrap();
        let out = TemplateRender::new(json!({})).render_str("{% include \"nope.html\" %}", temp.path());
        assert!(matches!(out, Err(TransformError::Render { .. })));
    }

    #[test]
    fn test_cache_by_content_hash() {
        let renderer = TemplateRender::new(json!({"a": 1})).with_cache(true);
        renderer.render_str("{{ a }}", Path::new(".")).unwrap();
        renderer.render_str("{{ a }}", Path::new(".")).unwrap();
        assert_eq!(renderer.cached_templates(), 1);
        renderer.render_str("{{ a }}!", Path::new(".")).unwrap();
        assert_eq!(renderer.cached_templates(), 2);

        let uncached = TemplateRender::new(json!({"a": 1}));
        uncached.render_str("{{ a }}", Path::new(".")).unwrap();
        assert_eq!(uncached.cached_templates(), 0);
    }
}
