//! Template resolution for flow configuration.
//!
//! Flow definitions embed `{{ expression }}` placeholders in message bodies,
//! action parameters, and whole configuration blocks. Expressions use a
//! deliberately small grammar:
//!
//! ```text
//! expr     := or_expr [ "if" or_expr [ "else" expr ] ]
//! or_expr  := and_expr ( "or" and_expr )*
//! and_expr := not_expr ( "and" not_expr )*
//! not_expr := "not" not_expr | cmp_expr
//! cmp_expr := filtered [ ("==" | "!=") filtered ]
//! filtered := primary ( "|" name [ "(" args ")" ] )*
//! primary  := string | number | true | false | none | path | "(" expr ")"
//! path     := name ( "." (name | integer) | "[" (integer | string) "]" )*
//! ```
//!
//! Filters: `default(x)`, `lower`, `upper`, `trim`, `length`, `join(sep)`,
//! `first`, `string`, `int`, and `as_list_rows(id_field, title_field[,
//! description_field])`, which turns a list of records into interactive list
//! rows.
//!
//! Resolution never fails. Undefined names render as `""` in text and resolve
//! to `null` in data; malformed expressions degrade the same way.

use crate::flows::context::{display, is_blank, is_truthy, loosely_equal, step_into, Scope};
use serde_json::{Map, Value};
use tracing::debug;

/// WhatsApp list row title limit.
const LIST_ROW_TITLE_MAX: usize = 24;

/// WhatsApp list row description limit.
const LIST_ROW_DESCRIPTION_MAX: usize = 72;

/// Template errors. Internal only: callers always get a degraded value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("unexpected character '{0}' in expression")]
    UnexpectedChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),
}

/// How string leaves are resolved inside structured values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// A string consisting of a single `{{ expr }}` yields the raw value.
    Data,
    /// Like `Data`, but scalar results are rendered to text so message
    /// fields stay strings. Lists and maps are still substituted whole.
    Message,
}

/// Render a template string to text.
pub fn render_text(template: &str, scope: &Scope<'_>) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match closing_braces(after) {
            Some(end) => {
                let source = &after[..end];
                out.push_str(&display(&evaluate_or_null(source, scope)));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolve a template string in data position.
///
/// A string that is exactly one placeholder resolves to the expression's
/// value (so lists and numbers keep their type); anything else is rendered
/// as text.
pub fn resolve_str(template: &str, scope: &Scope<'_>) -> Value {
    match single_expression(template) {
        Some(source) => evaluate_or_null(source, scope),
        None => Value::String(render_text(template, scope)),
    }
}

/// Resolve every template string inside a structured value.
pub fn resolve_value(value: &Value, scope: &Scope<'_>) -> Value {
    resolve_with_mode(value, scope, ResolveMode::Data)
}

/// Resolve a message configuration block.
pub fn resolve_message(value: &Value, scope: &Scope<'_>) -> Value {
    resolve_with_mode(value, scope, ResolveMode::Message)
}

/// Resolve a map of templates, e.g. `fields_to_update` or `params_template`.
pub fn resolve_map(map: &Map<String, Value>, scope: &Scope<'_>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, scope)))
        .collect()
}

fn resolve_with_mode(value: &Value, scope: &Scope<'_>, mode: ResolveMode) -> Value {
    match value {
        Value::String(s) => {
            let resolved = resolve_str(s, scope);
            match (mode, resolved) {
                (ResolveMode::Message, Value::Null) => Value::String(String::new()),
                (ResolveMode::Message, v @ (Value::Bool(_) | Value::Number(_))) => {
                    Value::String(display(&v))
                }
                (_, v) => v,
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_with_mode(item, scope, mode))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_with_mode(v, scope, mode)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Return the inner source when `template` is exactly `{{ expr }}`.
fn single_expression(template: &str) -> Option<&str> {
    let after = template.trim().strip_prefix("{{")?;
    let end = closing_braces(after)?;
    after[end + 2..].is_empty().then(|| &after[..end])
}

/// Byte offset of the `}}` closing an expression, skipping quoted literals.
/// An unterminated quote falls back to the first `}}`.
fn closing_braces(source: &str) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        match (quote, bytes[i]) {
            (Some(_), b'\\') => i += 1,
            (Some(q), b) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'\'' | b'"') => quote = Some(bytes[i]),
            (None, b'}') if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            (None, _) => {}
        }
        i += 1;
    }
    source.find("}}")
}

fn evaluate_or_null(source: &str, scope: &Scope<'_>) -> Value {
    match evaluate(source, scope) {
        Ok(value) => value,
        Err(e) => {
            debug!(expression = source.trim(), error = %e, "template expression degraded to empty");
            Value::Null
        }
    }
}

/// Parse and evaluate a single expression (without the braces).
pub fn evaluate(source: &str, scope: &Scope<'_>) -> Result<Value, TemplateError> {
    let expr = parse(source)?;
    expr.eval(scope)
}

/// Parse an expression into its syntax tree.
pub fn parse(source: &str) -> Result<Expr, TemplateError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(TemplateError::UnexpectedToken(format!("{:?}", tok))),
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Pipe,
    EqEq,
    NotEq,
}

fn tokenize(source: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(TemplateError::UnterminatedString),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => literal.push('\n'),
                                Some('t') => literal.push('\t'),
                                Some(&other) => literal.push(other),
                                None => return Err(TemplateError::UnterminatedString),
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() || (c == '-' && next_is_digit(&chars, i)) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                // After a '.', only integers are allowed so `items.0.name`
                // stays a path.
                let after_dot = matches!(tokens.last(), Some(Token::Dot));
                let is_float = !after_dot
                    && chars.get(i) == Some(&'.')
                    && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit());
                if is_float {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    let value = text
                        .parse()
                        .map_err(|_| TemplateError::UnexpectedToken(text.clone()))?;
                    tokens.push(Token::Float(value));
                } else {
                    let text: String = chars[start..i].iter().collect();
                    let value = text
                        .parse()
                        .map_err(|_| TemplateError::UnexpectedToken(text.clone()))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => return Err(TemplateError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

fn next_is_digit(chars: &[char], i: usize) -> bool {
    chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())
}

// ---------------------------------------------------------------------------
// Syntax tree
// ---------------------------------------------------------------------------

/// Parsed template expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Filter {
        input: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        negate: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Conditional {
        then: Box<Expr>,
        condition: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == keyword)
    }

    fn expect(&mut self, expected: Token) -> Result<(), TemplateError> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(TemplateError::UnexpectedToken(format!("{:?}", tok))),
            None => Err(TemplateError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<Expr, TemplateError> {
        let then = self.or_expr()?;
        if !self.peek_keyword("if") {
            return Ok(then);
        }
        self.next();
        let condition = self.or_expr()?;
        let otherwise = if self.peek_keyword("else") {
            self.next();
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        Ok(Expr::Conditional {
            then: Box::new(then),
            condition: Box::new(condition),
            otherwise,
        })
    }

    fn or_expr(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.and_expr()?;
        while self.peek_keyword("or") {
            self.next();
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.not_expr()?;
        while self.peek_keyword("and") {
            self.next();
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, TemplateError> {
        if self.peek_keyword("not") {
            self.next();
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.cmp_expr()
    }

    fn cmp_expr(&mut self) -> Result<Expr, TemplateError> {
        let lhs = self.filtered()?;
        let negate = match self.peek() {
            Some(Token::EqEq) => false,
            Some(Token::NotEq) => true,
            _ => return Ok(lhs),
        };
        self.next();
        let rhs = self.filtered()?;
        Ok(Expr::Compare {
            negate,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn filtered(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.primary()?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.next();
            let name = match self.next() {
                Some(Token::Name(n)) => n,
                Some(tok) => return Err(TemplateError::UnexpectedToken(format!("{:?}", tok))),
                None => return Err(TemplateError::UnexpectedEnd),
            };
            let mut args = Vec::new();
            if matches!(self.peek(), Some(Token::LParen)) {
                self.next();
                if !matches!(self.peek(), Some(Token::RParen)) {
                    loop {
                        args.push(self.expr()?);
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.next();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
            }
            expr = Expr::Filter {
                input: Box::new(expr),
                name,
                args,
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, TemplateError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::from(f))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Name(name)) => match name.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "none" | "None" | "null" => Ok(Expr::Literal(Value::Null)),
                _ => self.path(name),
            },
            Some(tok) => Err(TemplateError::UnexpectedToken(format!("{:?}", tok))),
            None => Err(TemplateError::UnexpectedEnd),
        }
    }

    fn path(&mut self, head: String) -> Result<Expr, TemplateError> {
        let mut segments = vec![head];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Name(n)) => segments.push(n),
                        Some(Token::Int(i)) => segments.push(i.to_string()),
                        Some(tok) => {
                            return Err(TemplateError::UnexpectedToken(format!("{:?}", tok)))
                        }
                        None => return Err(TemplateError::UnexpectedEnd),
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    match self.next() {
                        Some(Token::Str(s)) => segments.push(s),
                        Some(Token::Int(i)) => segments.push(i.to_string()),
                        Some(tok) => {
                            return Err(TemplateError::UnexpectedToken(format!("{:?}", tok)))
                        }
                        None => return Err(TemplateError::UnexpectedEnd),
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Expr {
    /// Evaluate against a scope. Undefined paths yield `null`.
    pub fn eval(&self, scope: &Scope<'_>) -> Result<Value, TemplateError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(segments) => Ok(lookup_segments(scope, segments)),
            Expr::Filter { input, name, args } => {
                let value = input.eval(scope)?;
                let args = args
                    .iter()
                    .map(|a| a.eval(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                apply_filter(name, value, &args)
            }
            Expr::Or(lhs, rhs) => {
                let left = lhs.eval(scope)?;
                if is_truthy(&left) {
                    Ok(left)
                } else {
                    rhs.eval(scope)
                }
            }
            Expr::And(lhs, rhs) => {
                let left = lhs.eval(scope)?;
                if is_truthy(&left) {
                    rhs.eval(scope)
                } else {
                    Ok(left)
                }
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.eval(scope)?))),
            Expr::Compare { negate, lhs, rhs } => {
                let equal = loosely_equal(&lhs.eval(scope)?, &rhs.eval(scope)?);
                Ok(Value::Bool(equal != *negate))
            }
            Expr::Conditional {
                then,
                condition,
                otherwise,
            } => {
                if is_truthy(&condition.eval(scope)?) {
                    then.eval(scope)
                } else {
                    match otherwise {
                        Some(e) => e.eval(scope),
                        None => Ok(Value::Null),
                    }
                }
            }
        }
    }
}

fn lookup_segments(scope: &Scope<'_>, segments: &[String]) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return Value::Null;
    };
    let mut current = match scope.get(head) {
        Some(v) => v,
        None => return Value::Null,
    };
    for segment in rest {
        current = match step_into(current, segment) {
            Some(v) => v,
            None => return Value::Null,
        };
    }
    current.clone()
}

fn apply_filter(name: &str, value: Value, args: &[Value]) -> Result<Value, TemplateError> {
    let arg_str = |i: usize| args.get(i).map(display);

    let result = match name {
        "default" | "d" => {
            if is_blank(&value) {
                args.first().cloned().unwrap_or(Value::String(String::new()))
            } else {
                value
            }
        }
        "lower" => Value::String(display(&value).to_lowercase()),
        "upper" => Value::String(display(&value).to_uppercase()),
        "trim" => Value::String(display(&value).trim().to_string()),
        "string" => Value::String(display(&value)),
        "length" | "count" => Value::from(match &value {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            Value::Null => 0,
            other => display(other).chars().count(),
        }),
        "first" => match value {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            Value::String(s) => s.chars().next().map(|c| Value::String(c.to_string())).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "join" => {
            let sep = arg_str(0).unwrap_or_default();
            match value {
                Value::Array(items) => Value::String(
                    items.iter().map(display).collect::<Vec<_>>().join(&sep),
                ),
                other => Value::String(display(&other)),
            }
        }
        "int" => {
            let parsed = match &value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
                Value::Bool(b) => Some(*b as i64),
                _ => None,
            };
            Value::from(parsed.unwrap_or(0))
        }
        "as_list_rows" => {
            let id_field = arg_str(0).unwrap_or_else(|| "id".to_string());
            let title_field = arg_str(1).unwrap_or_else(|| "name".to_string());
            let description_field = arg_str(2);
            as_list_rows(&value, &id_field, &title_field, description_field.as_deref())
        }
        other => return Err(TemplateError::UnknownFilter(other.to_string())),
    };
    Ok(result)
}

/// Convert a list of records into interactive list row descriptors.
fn as_list_rows(
    value: &Value,
    id_field: &str,
    title_field: &str,
    description_field: Option<&str>,
) -> Value {
    let Value::Array(items) = value else {
        return Value::Array(Vec::new());
    };

    let rows = items
        .iter()
        .filter_map(|item| {
            let id = item.get(id_field).map(display).filter(|s| !s.is_empty())?;
            let title = item
                .get(title_field)
                .map(display)
                .unwrap_or_else(|| id.clone());
            let mut row = Map::new();
            row.insert("id".to_string(), Value::String(id));
            row.insert(
                "title".to_string(),
                Value::String(clip(&title, LIST_ROW_TITLE_MAX)),
            );
            if let Some(field) = description_field {
                let description = item.get(field).map(display).unwrap_or_default();
                if !description.is_empty() {
                    row.insert(
                        "description".to_string(),
                        Value::String(clip(&description, LIST_ROW_DESCRIPTION_MAX)),
                    );
                }
            }
            Some(Value::Object(row))
        })
        .collect();
    Value::Array(rows)
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}
