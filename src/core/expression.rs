//! Mapping and condition expressions.
//!
//! Grammar:
//!
//! ```text
//! expr     := or
//! or       := and (("||" | "or") and)*
//! and      := eq  (("&&" | "and") eq)*
//! eq       := unary (("==" | "!=") unary)?
//! unary    := ("!" | "not") unary | primary
//! primary  := "(" expr ")" | literal | reference
//! reference:= "${" path "}" | path
//! path     := root ("." ident | "[" int "]")*
//! root     := "args" | "env" | "pipeline" "[" int "]" | "outcome" | ident
//! literal  := 'str' | "str" | number | true | false | null
//! ```
//!
//! Mapping sources may also be templates mixing text with `${...}`
//! references; those always evaluate to a string.
//!
//! `pipeline[i]` counts a pipeline's own steps only. Global hooks are
//! reachable by name but never shift positions.
//!
//! Evaluation is pure: the same expression against the same context always
//! yields the same value.

use std::fmt;

use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::context::{ExecutionContext, OutcomeView};

/// Raised when an expression addresses something that does not exist
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Unresolved reference '{reference}': {reason}")]
pub struct UnresolvedReferenceError {
    pub reference: String,
    pub reason: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("Malformed expression '{expression}' at offset {offset}: {message}")]
    Syntax {
        expression: String,
        offset: usize,
        message: String,
    },

    #[error(transparent)]
    Unresolved(#[from] UnresolvedReferenceError),
}

/// Where a reference starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Root {
    Args,
    Env,
    /// Output of the i-th executed step
    Pipeline(usize),
    Outcome,
    /// A named prior step, or a field of the current outcome
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => write!(f, ".{}", name),
            PathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub raw: String,
    pub root: Root,
    pub path: Vec<PathSegment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Ref(Reference),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ref(Reference),
    Template(Vec<Segment>),
    Not(Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// Parse a boolean condition (a response rule's `when`)
pub fn parse_condition(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(source, tokens).parse()
}

/// Parse a mapping source.
///
/// Anything the expression grammar accepts is used as is; otherwise a source
/// containing `${...}` is read as a string template.
pub fn parse_mapping(source: &str) -> Result<Expr, ExpressionError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(syntax(source, 0, "empty expression"));
    }

    match parse_condition(trimmed) {
        Ok(expr) => Ok(expr),
        Err(err) if trimmed.contains("${") => parse_template(source).map_err(|_| err),
        Err(err) => Err(err),
    }
}

fn parse_template(source: &str) -> Result<Expr, ExpressionError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut offset = 0;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| syntax(source, offset + start, "unterminated '${'"))?;
        let reference = parse_path(source, &after[..end], offset + start + 2)?;
        segments.push(Segment::Ref(reference));

        let consumed = start + 2 + end + 1;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }

    Ok(Expr::Template(segments))
}

impl Expr {
    /// Evaluate against a context
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<Value, UnresolvedReferenceError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ref(reference) => reference.resolve(ctx),
            Expr::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Ref(reference) => match reference.resolve(ctx)? {
                            Value::String(s) => out.push_str(&s),
                            Value::Null => {}
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Ok(Value::String(out))
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.evaluate(ctx)?))),
            Expr::Eq(left, right) => Ok(Value::Bool(values_equal(
                &left.evaluate(ctx)?,
                &right.evaluate(ctx)?,
            ))),
            Expr::Ne(left, right) => Ok(Value::Bool(!values_equal(
                &left.evaluate(ctx)?,
                &right.evaluate(ctx)?,
            ))),
            Expr::And(left, right) => {
                if !is_truthy(&left.evaluate(ctx)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(ctx)?)))
            }
            Expr::Or(left, right) => {
                if is_truthy(&left.evaluate(ctx)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(ctx)?)))
            }
        }
    }

    /// Evaluate and reduce to a boolean
    pub fn test(&self, ctx: &ExecutionContext) -> Result<bool, UnresolvedReferenceError> {
        self.evaluate(ctx).map(|v| is_truthy(&v))
    }

    /// Every reference in the expression, in source order
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(reference) => out.push(reference),
            Expr::Template(segments) => {
                for segment in segments {
                    if let Segment::Ref(reference) = segment {
                        out.push(reference);
                    }
                }
            }
            Expr::Not(inner) => inner.collect_references(out),
            Expr::Eq(l, r) | Expr::Ne(l, r) | Expr::And(l, r) | Expr::Or(l, r) => {
                l.collect_references(out);
                r.collect_references(out);
            }
        }
    }
}

impl Reference {
    pub fn resolve(&self, ctx: &ExecutionContext) -> Result<Value, UnresolvedReferenceError> {
        match &self.root {
            Root::Args => self.walk(ctx.args().clone(), &self.path),
            Root::Env => match self.path.split_first() {
                None => Ok(Value::Object(
                    ctx.env()
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                )),
                Some((PathSegment::Field(name), rest)) => {
                    let value = ctx
                        .env_var(name)
                        .ok_or_else(|| self.unresolved(format!("no env var named '{}'", name)))?;
                    self.walk(Value::String(value.to_string()), rest)
                }
                Some((PathSegment::Index(_), _)) => {
                    Err(self.unresolved("env vars are addressed by name"))
                }
            },
            Root::Pipeline(index) => {
                let output = ctx.step_at(*index).ok_or_else(|| {
                    self.unresolved(format!("no step has run at position {}", index))
                })?;
                self.walk(output.as_value(), &self.path)
            }
            Root::Outcome => {
                let outcome = ctx
                    .outcome()
                    .ok_or_else(|| self.unresolved("no outcome in this context"))?;
                self.walk_outcome(outcome, &self.path)
            }
            Root::Named(name) => {
                if let Some(output) = ctx.step(name) {
                    return self.walk(output.as_value(), &self.path);
                }
                if let Some(outcome) = ctx.outcome() {
                    let mut path = Vec::with_capacity(self.path.len() + 1);
                    path.push(PathSegment::Field(name.clone()));
                    path.extend(self.path.iter().cloned());
                    return self.walk_outcome(outcome, &path);
                }
                Err(self.unresolved(format!("no prior step named '{}'", name)))
            }
        }
    }

    /// Name of the step this reference depends on, if it addresses one by name
    pub fn step_name(&self) -> Option<&str> {
        match &self.root {
            Root::Named(name) => Some(name),
            _ => None,
        }
    }

    fn walk_outcome(
        &self,
        outcome: &OutcomeView,
        path: &[PathSegment],
    ) -> Result<Value, UnresolvedReferenceError> {
        if let Some((PathSegment::Field(first), rest)) = path.split_first() {
            let has_field = outcome
                .body
                .as_object()
                .map_or(false, |m| m.contains_key(first));
            if first == "success" && !has_field {
                return self.walk(Value::Bool(outcome.success), rest);
            }
        }
        self.walk(outcome.body.clone(), path)
    }

    fn walk(&self, mut value: Value, path: &[PathSegment]) -> Result<Value, UnresolvedReferenceError> {
        for segment in path {
            value = match (segment, value) {
                (PathSegment::Field(name), Value::Object(mut map)) => map
                    .remove(name)
                    .ok_or_else(|| self.unresolved(format!("field '{}' not found", name)))?,
                (PathSegment::Index(i), Value::Array(mut items)) => {
                    if *i >= items.len() {
                        return Err(self.unresolved(format!(
                            "index {} out of bounds (length {})",
                            i,
                            items.len()
                        )));
                    }
                    items.swap_remove(*i)
                }
                (segment, other) => {
                    return Err(self.unresolved(format!(
                        "cannot apply '{}' to {}",
                        segment,
                        type_name(&other)
                    )))
                }
            };
        }
        Ok(value)
    }

    fn unresolved(&self, reason: impl Into<String>) -> UnresolvedReferenceError {
        UnresolvedReferenceError {
            reference: self.raw.clone(),
            reason: reason.into(),
        }
    }
}

/// null, false, 0 and "" are false; everything else is true
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// JSON equality, except numbers compare by value (`1 == 1.0`).
/// Two integers compare exactly, so 64-bit ids never collapse through f64.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) if !a.is_f64() && !b.is_f64() => {
            a.as_i64() == b.as_i64() && a.as_u64() == b.as_u64()
        }
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => left == right,
    }
}

/// Write `value` at a dotted path, creating intermediate objects
pub fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').filter(|p| !p.is_empty()).peekable();
    let mut current = target;

    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => return,
        };
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

fn syntax(source: &str, offset: usize, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Syntax {
        expression: source.to_string(),
        offset,
        message: message.into(),
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn read_ident(bytes: &[u8], i: &mut usize) -> String {
    let start = *i;
    while *i < bytes.len() && is_ident_byte(bytes[*i]) {
        *i += 1;
    }
    String::from_utf8_lossy(&bytes[start..*i]).into_owned()
}

fn read_index(source: &str, bytes: &[u8], i: &mut usize, base: usize) -> Result<usize, ExpressionError> {
    // Caller has checked bytes[*i] == b'['
    *i += 1;
    let start = *i;
    while *i < bytes.len() && bytes[*i].is_ascii_digit() {
        *i += 1;
    }
    if start == *i {
        return Err(syntax(source, base + start, "expected an index"));
    }
    if *i >= bytes.len() || bytes[*i] != b']' {
        return Err(syntax(source, base + *i, "expected ']'"));
    }
    let index = std::str::from_utf8(&bytes[start..*i])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| syntax(source, base + start, "index out of range"))?;
    *i += 1;
    Ok(index)
}

/// Parse a reference path; `base` is its offset within `source`
fn parse_path(source: &str, text: &str, base: usize) -> Result<Reference, ExpressionError> {
    let leading = text.len() - text.trim_start().len();
    let text = text.trim();
    let base = base + leading;
    let bytes = text.as_bytes();
    let mut i = 0;

    let first = read_ident(bytes, &mut i);
    if first.is_empty() {
        return Err(syntax(source, base, "expected a reference"));
    }

    let root = match first.as_str() {
        "args" => Root::Args,
        "env" => Root::Env,
        "outcome" => Root::Outcome,
        "pipeline" => {
            if i >= bytes.len() || bytes[i] != b'[' {
                return Err(syntax(source, base + i, "pipeline references need an index"));
            }
            Root::Pipeline(read_index(source, bytes, &mut i, base)?)
        }
        _ => Root::Named(first),
    };

    let mut path = Vec::new();
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                i += 1;
                let field = read_ident(bytes, &mut i);
                if field.is_empty() {
                    return Err(syntax(source, base + i, "expected a field name"));
                }
                path.push(PathSegment::Field(field));
            }
            b'[' => path.push(PathSegment::Index(read_index(source, bytes, &mut i, base)?)),
            _ => return Err(syntax(source, base + i, "unexpected character in reference")),
        }
    }

    Ok(Reference {
        raw: text.to_string(),
        root,
        path,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Ref(Reference),
    Literal(Value),
    EqEq,
    NotEq,
    And,
    Or,
    Not,
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, ExpressionError> {
        let mut tokens = Vec::new();

        while let Some(b) = self.peek_at(0) {
            let start = self.pos;
            let token = match b {
                b' ' | b'\t' | b'\n' | b'\r' => {
                    self.pos += 1;
                    continue;
                }
                b'(' => {
                    self.pos += 1;
                    Token::LParen
                }
                b')' => {
                    self.pos += 1;
                    Token::RParen
                }
                b'=' if self.peek_at(1) == Some(b'=') => {
                    self.pos += 2;
                    Token::EqEq
                }
                b'!' if self.peek_at(1) == Some(b'=') => {
                    self.pos += 2;
                    Token::NotEq
                }
                b'!' => {
                    self.pos += 1;
                    Token::Not
                }
                b'&' if self.peek_at(1) == Some(b'&') => {
                    self.pos += 2;
                    Token::And
                }
                b'|' if self.peek_at(1) == Some(b'|') => {
                    self.pos += 2;
                    Token::Or
                }
                b'$' if self.peek_at(1) == Some(b'{') => {
                    let inner_start = self.pos + 2;
                    let end = self.source[inner_start..]
                        .find('}')
                        .ok_or_else(|| syntax(self.source, start, "unterminated '${'"))?;
                    let inner = &self.source[inner_start..inner_start + end];
                    self.pos = inner_start + end + 1;
                    Token::Ref(parse_path(self.source, inner, inner_start)?)
                }
                b'\'' | b'"' => Token::Literal(Value::String(self.string(b)?)),
                b'-' if self.peek_at(1).map_or(false, |c| c.is_ascii_digit()) => {
                    Token::Literal(self.number()?)
                }
                b'0'..=b'9' => Token::Literal(self.number()?),
                b if b.is_ascii_alphabetic() || b == b'_' => self.word()?,
                _ => return Err(syntax(self.source, start, "unexpected character")),
            };
            tokens.push((token, start));
        }

        Ok(tokens)
    }

    fn string(&mut self, quote: u8) -> Result<String, ExpressionError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = Vec::new();

        loop {
            match self.peek_at(0) {
                None => return Err(syntax(self.source, start, "unterminated string")),
                Some(b'\\') => {
                    match self.peek_at(1) {
                        Some(escaped) => out.push(escaped),
                        None => return Err(syntax(self.source, start, "unterminated string")),
                    }
                    self.pos += 2;
                }
                Some(b) if b == quote => {
                    self.pos += 1;
                    break;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }

        String::from_utf8(out).map_err(|_| syntax(self.source, start, "invalid utf-8 in string"))
    }

    fn number(&mut self) -> Result<Value, ExpressionError> {
        let start = self.pos;
        if self.peek_at(0) == Some(b'-') {
            self.pos += 1;
        }
        while self
            .peek_at(0)
            .map_or(false, |c| c.is_ascii_digit() || c == b'.')
        {
            self.pos += 1;
        }

        let text = &self.source[start..self.pos];
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Value::from(int));
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| syntax(self.source, start, format!("invalid number '{}'", text)))
    }

    fn word(&mut self) -> Result<Token, ExpressionError> {
        let start = self.pos;
        while self
            .peek_at(0)
            .map_or(false, |c| is_ident_byte(c) || c == b'.' || c == b'[' || c == b']')
        {
            self.pos += 1;
        }

        let text = &self.source[start..self.pos];
        Ok(match text {
            "true" => Token::Literal(Value::Bool(true)),
            "false" => Token::Literal(Value::Bool(false)),
            "null" => Token::Literal(Value::Null),
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            _ => Token::Ref(parse_path(self.source, text, start)?),
        })
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, tokens: Vec<(Token, usize)>) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, ExpressionError> {
        if self.tokens.is_empty() {
            return Err(syntax(self.source, 0, "empty expression"));
        }
        let expr = self.or()?;
        if let Some((_, offset)) = self.tokens.get(self.pos) {
            return Err(syntax(self.source, *offset, "unexpected token"));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, o)| *o)
            .unwrap_or(self.source.len())
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.equality()?;
        while self.eat(&Token::And) {
            let right = self.equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.unary()?;
        if self.eat(&Token::EqEq) {
            return Ok(Expr::Eq(Box::new(left), Box::new(self.unary()?)));
        }
        if self.eat(&Token::NotEq) {
            return Ok(Expr::Ne(Box::new(left), Box::new(self.unary()?)));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        let Some((token, _)) = self.tokens.get(self.pos).cloned() else {
            return Err(syntax(self.source, offset, "unexpected end of expression"));
        };
        self.pos += 1;

        match token {
            Token::LParen => {
                let inner = self.or()?;
                if !self.eat(&Token::RParen) {
                    return Err(syntax(self.source, self.offset(), "expected ')'"));
                }
                Ok(inner)
            }
            Token::Ref(reference) => Ok(Expr::Ref(reference)),
            Token::Literal(value) => Ok(Expr::Literal(value)),
            _ => Err(syntax(self.source, offset, "expected a value")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Payload, PipelineOutcome};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn context() -> ExecutionContext {
        let mut env = BTreeMap::new();
        env.insert("API_KEY".to_string(), "abc.123".to_string());

        let mut ctx = ExecutionContext::new(json!({"x": 5, "name": "ada"}), Arc::new(env));
        ctx.record("create", Payload::from(json!({"team": {"id": 9, "tags": ["a", "b"]}})));
        ctx.record("notify", Payload::from(json!({"sent": true})));
        ctx
    }

    fn eval(source: &str, ctx: &ExecutionContext) -> Value {
        parse_mapping(source).unwrap().evaluate(ctx).unwrap()
    }

    #[test]
    fn test_reference_roots() {
        let ctx = context();
        assert_eq!(eval("${args.x}", &ctx), json!(5));
        assert_eq!(eval("${env.API_KEY}", &ctx), json!("abc.123"));
        assert_eq!(eval("${pipeline[0].team.id}", &ctx), json!(9));
        assert_eq!(eval("${create.team.tags[1]}", &ctx), json!("b"));
        assert_eq!(eval("notify.sent", &ctx), json!(true));
    }

    #[test]
    fn test_templates_and_literals() {
        let ctx = context();
        assert_eq!(eval("Hello ${args.name}!", &ctx), json!("Hello ada!"));
        assert_eq!(eval("${args.name}-${create.team.id}", &ctx), json!("ada-9"));
        assert_eq!(eval("'fixed'", &ctx), json!("fixed"));
        assert_eq!(eval("42", &ctx), json!(42));
    }

    #[test]
    fn test_conditions() {
        let ctx = context();
        let check = |s: &str| parse_condition(s).unwrap().test(&ctx).unwrap();

        assert!(check("${args.x} == 5"));
        assert!(check("args.x == 5.0"));
        assert!(check("${args.name} != 'bob' && notify.sent"));
        assert!(check("not (args.x == 1) or false"));
        assert!(!check("!notify.sent || args.name == \"bob\""));
    }

    #[test]
    fn test_unresolved_references() {
        let ctx = context();
        let missing = parse_mapping("${missing.field}").unwrap().evaluate(&ctx);
        assert!(matches!(missing, Err(UnresolvedReferenceError { .. })));

        assert!(parse_mapping("${env.NOPE}").unwrap().evaluate(&ctx).is_err());
        assert!(parse_mapping("${pipeline[7]}").unwrap().evaluate(&ctx).is_err());
        assert!(parse_mapping("${args.x.y}").unwrap().evaluate(&ctx).is_err());
    }

    #[test]
    fn test_outcome_fields() {
        let outcome = PipelineOutcome::failed("validate", "bad", Some(json!({"field1": "x"})));
        let ctx = ExecutionContext::empty().with_outcome(&outcome);

        assert_eq!(eval("${field1}", &ctx), json!("x"));
        assert_eq!(eval("${outcome.success}", &ctx), json!(false));

        let ok = PipelineOutcome::succeeded(Payload::from(json!({"id": 1})));
        let ctx = ExecutionContext::empty().with_outcome(&ok);
        assert!(parse_condition("${success}").unwrap().test(&ctx).unwrap());
    }

    #[test]
    fn test_malformed_expressions() {
        assert!(matches!(
            parse_condition("${args.x"),
            Err(ExpressionError::Syntax { .. })
        ));
        assert!(parse_condition("args.x ==").is_err());
        assert!(parse_condition("(args.x").is_err());
        assert!(parse_condition("pipeline.x").is_err());
        assert!(parse_condition("'open").is_err());
        assert!(parse_mapping("   ").is_err());
    }

    #[test]
    fn test_references_listed() {
        let expr = parse_condition("${a.x} == b.y && ${args.z}").unwrap();
        let names: Vec<_> = expr.references().iter().filter_map(|r| r.step_name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_insert_path_creates_objects() {
        let mut map = Map::new();
        insert_path(&mut map, "team.owner.id", json!(1));
        insert_path(&mut map, "flat", json!("v"));
        assert_eq!(Value::Object(map), json!({"team": {"owner": {"id": 1}}, "flat": "v"}));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(values_equal(&json!(1), &json!(1.0)));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let ids = crate::core::IdGenerator::new(0).unwrap();
        let a = ids.snowflake();
        let b = ids.snowflake();

        assert!(!values_equal(&json!(a), &json!(b)));
        assert!(values_equal(&json!(a), &json!(a)));
        assert!(!values_equal(&json!(u64::MAX), &json!(u64::MAX - 1)));
        assert!(!values_equal(&json!(-1), &json!(u64::MAX)));
        assert!(values_equal(&json!(2), &json!(2.0)));
    }
}
