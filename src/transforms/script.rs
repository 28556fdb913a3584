//! Script transpilation (ES2015 subset to ES5).
//!
//! The source is tokenized (strings, template literals, regular expressions
//! and comments are recognized so their contents are never rewritten), then
//! lowered:
//!
//! - `let` / `const` declarations become `var`
//! - arrow functions become `function` expressions
//! - template literals become parenthesized string concatenation
//!
//! Whitespace and comments are preserved. Syntax that cannot be lowered
//! token-by-token is a [`TransformError::Transpile`] with the line number.

use super::types::{record_text, Transform, TransformError};
use crate::build::FileRecord;

/// Keywords that need a real compiler.
const UNSUPPORTED_KEYWORDS: &[&str] = &["class", "async", "await", "import", "export", "yield"];

/// Keywords after which a `/` starts a regular expression.
const REGEX_PREFIX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else",
];

/// Punctuators, longest first.
const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "=>", "==", "!=", "<=", ">=", "&&",
    "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "<<", ">>",
    "**",
];

/// Script transpile stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptTranspile;

impl Transform for ScriptTranspile {
    fn name(&self) -> &'static str {
        "script"
    }

    fn apply(&self, record: FileRecord) -> Result<FileRecord, TransformError> {
        let output = transpile(record_text(&record)?)?;
        Ok(record.with_contents(output.into_bytes()))
    }
}

/// Lower ES2015 source to ES5.
pub fn transpile(source: &str) -> Result<String, TransformError> {
    let tokens = Lexer::new(source, true).tokenize(false)?;
    lower(tokens)
}

/// Tokenize without rewriting anything; template literals stay verbatim.
pub(crate) fn scan(source: &str) -> Result<Vec<Token>, TransformError> {
    Lexer::new(source, false).tokenize(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Space,
    Comment,
    Ident,
    Number,
    Str,
    Regex,
    Punct,
    /// Already-lowered text (template literals, rewritten arrows)
    Raw,
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub(crate) kind: Kind,
    pub(crate) text: String,
    line: usize,
}

impl Token {
    pub(crate) fn is_punct(&self, p: &str) -> bool {
        self.kind == Kind::Punct && self.text == p
    }

    fn is_ident(&self, s: &str) -> bool {
        self.kind == Kind::Ident && self.text == s
    }

    pub(crate) fn significant(&self) -> bool {
        !matches!(self.kind, Kind::Space | Kind::Comment)
    }

    fn is_member_access(&self) -> bool {
        self.is_punct(".") || self.is_punct("?.")
    }
}

// ============================================================================
// Lexer
// ============================================================================

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    lower_templates: bool,
}

impl Lexer {
    fn new(source: &str, lower_templates: bool) -> Self {
        Self { chars: source.chars().collect(), pos: 0, line: 1, lower_templates }
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

    /// Tokenize to end of input, or (inside `${}`) to the matching `}`.
    fn tokenize(&mut self, in_substitution: bool) -> Result<Vec<Token>, TransformError> {
        let mut tokens: Vec<Token> = Vec::new();
        let mut braces = 0usize;

        loop {
            let Some(c) = self.peek() else {
                if in_substitution {
                    return Err(TransformError::transpile(self.line, "unterminated template literal"));
                }
                return Ok(tokens);
            };
            let line = self.line;

            if in_substitution && c == '}' && braces == 0 {
                self.bump();
                return Ok(tokens);
            }

            let (kind, text) = if c.is_whitespace() {
                (Kind::Space, self.take_while(char::is_whitespace))
            } else if c == '/' && self.peek_at(1) == Some('/') {
                (Kind::Comment, self.take_while(|c| c != '\n'))
            } else if c == '/' && self.peek_at(1) == Some('*') {
                (Kind::Comment, self.read_block_comment()?)
            } else if is_ident_start(c) {
                (Kind::Ident, self.take_while(is_ident_part))
            } else if c.is_ascii_digit()
                || (c == '.' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit()))
            {
                (Kind::Number, self.read_number())
            } else if c == '"' || c == '\'' {
                (Kind::Str, self.read_string(c)?)
            } else if c == '`' && !self.lower_templates {
                (Kind::Str, self.read_template_verbatim()?)
            } else if c == '`' {
                let prev = last_significant(&tokens);
                if prev.is_some_and(|t| {
                    (t.kind == Kind::Ident && !REGEX_PREFIX_KEYWORDS.contains(&t.text.as_str()))
                        || t.is_punct(")")
                        || t.is_punct("]")
                }) {
                    return Err(TransformError::transpile(line, "tagged template literals are not supported"));
                }
                (Kind::Raw, self.read_template()?)
            } else if c == '/' && regex_allowed(last_significant(&tokens)) {
                (Kind::Regex, self.read_regex()?)
            } else {
                let punct = self.read_punct();
                match punct.as_str() {
                    "{" => braces += 1,
                    "}" => braces = braces.saturating_sub(1),
                    _ => {}
                }
                (Kind::Punct, punct)
            };

            tokens.push(Token { kind, text, line });
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            text.push(c);
            self.bump();
        }
        text
    }

    fn read_block_comment(&mut self) -> Result<String, TransformError> {
        let line = self.line;
        let mut text = String::from("/*");
        self.pos += 2;
        loop {
            match self.bump() {
                Some('*') if self.peek() == Some('/') => {
                    self.bump();
                    text.push_str("*/");
                    return Ok(text);
                }
                Some(c) => text.push(c),
                None => return Err(TransformError::transpile(line, "unterminated comment")),
            }
        }
    }

    fn read_number(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                text.push(c);
                self.bump();
                if (c == 'e' || c == 'E')
                    && !text.starts_with("0x")
                    && !text.starts_with("0X")
                    && matches!(self.peek(), Some('+') | Some('-'))
                {
                    text.push(self.bump().unwrap_or('+'));
                }
            } else {
                break;
            }
        }
        text
    }

    fn read_string(&mut self, quote: char) -> Result<String, TransformError> {
        let line = self.line;
        let mut text = String::new();
        text.push(quote);
        self.bump();
        loop {
            match self.bump() {
                Some('\\') => {
                    text.push('\\');
                    match self.bump() {
                        Some(c) => text.push(c),
                        None => break,
                    }
                }
                Some(c) if c == quote => {
                    text.push(c);
                    return Ok(text);
                }
                Some('\n') | None => break,
                Some(c) => text.push(c),
            }
        }
        Err(TransformError::transpile(line, "unterminated string literal"))
    }

    fn read_regex(&mut self) -> Result<String, TransformError> {
        let line = self.line;
        let mut text = String::from("/");
        self.bump();
        let mut in_class = false;
        loop {
            match self.bump() {
                Some('\\') => {
                    text.push('\\');
                    match self.bump() {
                        Some('\n') | None => break,
                        Some(c) => text.push(c),
                    }
                }
                Some('[') => {
                    in_class = true;
                    text.push('[');
                }
                Some(']') => {
                    in_class = false;
                    text.push(']');
                }
                Some('/') if !in_class => {
                    text.push('/');
                    text.push_str(&self.take_while(is_ident_part));
                    return Ok(text);
                }
                Some('\n') | None => break,
                Some(c) => text.push(c),
            }
        }
        Err(TransformError::transpile(line, "unterminated regular expression"))
    }

    fn read_template_verbatim(&mut self) -> Result<String, TransformError> {
        let line = self.line;
        let mut text = String::from("`");
        self.bump();
        loop {
            match self.bump() {
                None => return Err(TransformError::transpile(line, "unterminated template literal")),
                Some('`') => {
                    text.push('`');
                    return Ok(text);
                }
                Some('\\') => {
                    text.push('\\');
                    if let Some(c) = self.bump() {
                        text.push(c);
                    }
                }
                Some('$') if self.peek() == Some('{') => {
                    self.bump();
                    text.push_str("${");
                    text.push_str(&concat(&self.tokenize(true)?));
                    text.push('}');
                }
                Some(c) => text.push(c),
            }
        }
    }

    /// Read a template literal and lower it to string concatenation.
    fn read_template(&mut self) -> Result<String, TransformError> {
        let line = self.line;
        self.bump();

        let mut pieces: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut first_is_expr = false;

        loop {
            match self.bump() {
                None => return Err(TransformError::transpile(line, "unterminated template literal")),
                Some('`') => break,
                Some('\\') => match self.bump() {
                    Some('`') => current.push('`'),
                    Some('$') => current.push('$'),
                    Some('\n') => {}
                    Some(c) => {
                        current.push('\\');
                        current.push(c);
                    }
                    None => {
                        return Err(TransformError::transpile(line, "unterminated template literal"));
                    }
                },
                Some('$') if self.peek() == Some('{') => {
                    self.bump();
                    if !current.is_empty() {
                        pieces.push(quote_string(&current));
                        current.clear();
                    } else if pieces.is_empty() {
                        first_is_expr = true;
                    }
                    let tokens = self.tokenize(true)?;
                    let expr = lower(tokens)?;
                    pieces.push(format!("({})", expr.trim()));
                }
                Some('"') => current.push_str("\\\""),
                Some('\n') => current.push_str("\\n"),
                Some('\r') => {}
                Some(c) => current.push(c),
            }
        }

        if !current.is_empty() || pieces.is_empty() {
            pieces.push(quote_string(&current));
        }
        if first_is_expr {
            pieces.insert(0, "\"\"".to_string());
        }

        if pieces.len() == 1 {
            Ok(pieces.remove(0))
        } else {
            Ok(format!("({})", pieces.join(" + ")))
        }
    }

    fn read_punct(&mut self) -> String {
        for p in PUNCTUATORS {
            let matches = p.chars().enumerate().all(|(i, c)| self.peek_at(i) == Some(c));
            if matches {
                for _ in 0..p.chars().count() {
                    self.bump();
                }
                return (*p).to_string();
            }
        }
        self.bump().map(String::from).unwrap_or_default()
    }
}

/// Wrap already-escaped template text in double quotes.
fn quote_string(escaped: &str) -> String {
    format!("\"{}\"", escaped)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn last_significant(tokens: &[Token]) -> Option<&Token> {
    tokens.iter().rev().find(|t| t.significant())
}

fn regex_allowed(prev: Option<&Token>) -> bool {
    match prev {
        None => true,
        Some(t) => match t.kind {
            Kind::Punct => !matches!(t.text.as_str(), ")" | "]" | "}"),
            Kind::Ident => REGEX_PREFIX_KEYWORDS.contains(&t.text.as_str()),
            _ => false,
        },
    }
}

// ============================================================================
// Lowering
// ============================================================================

fn lower(mut tokens: Vec<Token>) -> Result<String, TransformError> {
    check_unsupported(&tokens)?;
    rename_declarations(&mut tokens);
    while let Some(arrow) = tokens.iter().position(|t| t.is_punct("=>")) {
        lower_arrow(&mut tokens, arrow)?;
    }
    Ok(tokens.into_iter().map(|t| t.text).collect())
}

fn prev_sig(tokens: &[Token], i: usize) -> Option<usize> {
    (0..i).rev().find(|&j| tokens[j].significant())
}

fn next_sig(tokens: &[Token], i: usize) -> Option<usize> {
    (i + 1..tokens.len()).find(|&j| tokens[j].significant())
}

fn after_member_access(tokens: &[Token], i: usize) -> bool {
    prev_sig(tokens, i).is_some_and(|p| tokens[p].is_member_access())
}

fn check_unsupported(tokens: &[Token]) -> Result<(), TransformError> {
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            Kind::Punct if token.text == "..." => {
                return Err(TransformError::transpile(
                    token.line,
                    "spread and rest syntax ('...') is not supported",
                ));
            }
            Kind::Ident => {
                if after_member_access(tokens, i) {
                    continue;
                }
                let next = next_sig(tokens, i).map(|n| &tokens[n]);
                if UNSUPPORTED_KEYWORDS.contains(&token.text.as_str()) {
                    // object keys such as `{ async: true }`
                    if next.is_some_and(|n| n.is_punct(":")) {
                        continue;
                    }
                    return Err(TransformError::transpile(
                        token.line,
                        format!("'{}' is not supported", token.text),
                    ));
                }
                if token.text == "function" && next.is_some_and(|n| n.is_punct("*")) {
                    return Err(TransformError::transpile(
                        token.line,
                        "generator functions are not supported",
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn rename_declarations(tokens: &mut [Token]) {
    for i in 0..tokens.len() {
        if !(tokens[i].is_ident("let") || tokens[i].is_ident("const")) {
            continue;
        }
        if after_member_access(tokens, i) {
            continue;
        }
        let declares = next_sig(tokens, i).is_some_and(|n| {
            tokens[n].kind == Kind::Ident || tokens[n].is_punct("{") || tokens[n].is_punct("[")
        });
        if declares {
            tokens[i].text = "var".to_string();
        }
    }
}

fn lower_arrow(tokens: &mut Vec<Token>, arrow: usize) -> Result<(), TransformError> {
    let line = tokens[arrow].line;
    let before = prev_sig(tokens, arrow)
        .ok_or_else(|| TransformError::transpile(line, "arrow function without parameters"))?;

    let (start, params) = if tokens[before].is_punct(")") {
        let open = match_backward(tokens, before)
            .ok_or_else(|| TransformError::transpile(line, "unbalanced parentheses before '=>'"))?;
        (open, concat(&tokens[open + 1..before]))
    } else if tokens[before].kind == Kind::Ident {
        (before, tokens[before].text.clone())
    } else {
        return Err(TransformError::transpile(line, "unsupported arrow function parameters"));
    };

    let body_start = next_sig(tokens, arrow)
        .ok_or_else(|| TransformError::transpile(line, "missing arrow function body"))?;

    let (end, replacement) = if tokens[body_start].is_punct("{") {
        let close = match_forward(tokens, body_start)
            .ok_or_else(|| TransformError::transpile(line, "unterminated arrow function body"))?;
        let inner = tokens[body_start + 1..close].to_vec();
        check_lexical_bindings(&inner)?;
        (close, format!("function ({}) {{{}}}", params.trim(), lower(inner)?))
    } else {
        let end = expression_end(tokens, body_start);
        let inner = tokens[body_start..=end].to_vec();
        check_lexical_bindings(&inner)?;
        let body = lower(inner)?;
        (end, format!("function ({}) {{ return {}; }}", params.trim(), body.trim()))
    };

    tokens.splice(start..=end, [Token { kind: Kind::Raw, text: replacement, line }]);
    Ok(())
}

/// Arrow functions bind `this` and `arguments` lexically; a plain
/// `function` would rebind them.
fn check_lexical_bindings(body: &[Token]) -> Result<(), TransformError> {
    let mut i = 0;
    while i < body.len() {
        let token = &body[i];
        if token.kind == Kind::Ident && !after_member_access(body, i) {
            if token.text == "function" {
                // nested functions have their own bindings
                if let Some(open) = (i + 1..body.len()).find(|&j| body[j].is_punct("{")) {
                    if let Some(close) = match_forward(body, open) {
                        i = close + 1;
                        continue;
                    }
                }
            } else if token.text == "this" || token.text == "arguments" {
                return Err(TransformError::transpile(
                    token.line,
                    format!("arrow function using '{}' cannot be lowered", token.text),
                ));
            }
        }
        i += 1;
    }
    Ok(())
}

/// Index of the last token of an arrow's expression body.
fn expression_end(tokens: &[Token], start: usize) -> usize {
    let mut depth = 0usize;
    let mut last = start;

    for i in start..tokens.len() {
        let token = &tokens[i];
        match token.kind {
            Kind::Punct => match token.text.as_str() {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                "," | ";" if depth == 0 => break,
                _ => {}
            },
            Kind::Space if depth == 0 && token.text.contains('\n') => {
                if !continues_after_newline(tokens, last, i) {
                    break;
                }
            }
            _ => {}
        }
        if token.significant() {
            last = i;
        }
    }
    last
}

fn continues_after_newline(tokens: &[Token], last: usize, newline: usize) -> bool {
    let pending = &tokens[last];
    if pending.kind == Kind::Punct && !matches!(pending.text.as_str(), ")" | "]" | "}" | "++" | "--") {
        return true;
    }
    match next_sig(tokens, newline).map(|n| &tokens[n]) {
        Some(next) if next.kind == Kind::Punct => {
            !matches!(next.text.as_str(), "{" | "!" | "~" | "++" | "--")
        }
        _ => false,
    }
}

fn match_backward(tokens: &[Token], close: usize) -> Option<usize> {
    let mut depth = 0usize;
    for i in (0..=close).rev() {
        if tokens[i].is_punct(")") {
            depth += 1;
        } else if tokens[i].is_punct("(") {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

fn match_forward(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        if token.is_punct("{") {
            depth += 1;
        } else if token.is_punct("}") {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

fn concat(tokens: &[Token]) -> String {
    tokens.iter().map(|t| t.text.as_str()).collect()
}
