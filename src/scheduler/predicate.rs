// src/scheduler/predicate.rs

//! Sandboxed boolean expressions over dependency outputs.
//!
//! An edge predicate gates a dependent task on the result data of its
//! dependencies. The first path segment names a dependency id; the rest
//! walk into that dependency's result data:
//!
//! ```text
//! lint.warnings < 10 and build.target matches "^x86"
//! not (tests.flaky == true) || tests.retries == 0
//! ```
//!
//! There is no dynamic evaluation: the parser builds a small AST and the
//! evaluator only reads values.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::task::Payload;

/// Longest accepted predicate source, in bytes.
pub const MAX_SOURCE_LEN: usize = 4096;

/// Deepest accepted nesting of `not` and parentheses.
pub const MAX_DEPTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredicateError {
    #[error("invalid edge predicate at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("invalid regex '{pattern}' in edge predicate: {message}")]
    InvalidRegex { pattern: String, message: String },
}

/// A parsed, reusable predicate.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(syntax(
                MAX_SOURCE_LEN,
                format!("expression longer than {MAX_SOURCE_LEN} bytes"),
            ));
        }
        let tokens = lex(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        if let Some(tok) = parser.tokens.get(parser.pos) {
            return Err(syntax(tok.offset, format!("unexpected {}", tok.kind)));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `dependency id -> result data`.
    pub fn evaluate(&self, outputs: &HashMap<String, Payload>) -> bool {
        truthy(&self.expr.eval(outputs))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    Matches(Box<Expr>, Regex),
}

impl Expr {
    fn eval(&self, outputs: &HashMap<String, Payload>) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(segments) => resolve(outputs, segments),
            Expr::Not(inner) => Value::Bool(!truthy(&inner.eval(outputs))),
            Expr::And(l, r) => Value::Bool(truthy(&l.eval(outputs)) && truthy(&r.eval(outputs))),
            Expr::Or(l, r) => Value::Bool(truthy(&l.eval(outputs)) || truthy(&r.eval(outputs))),
            Expr::Cmp(l, op, r) => Value::Bool(compare(&l.eval(outputs), *op, &r.eval(outputs))),
            Expr::Matches(l, re) => Value::Bool(match l.eval(outputs) {
                Value::String(s) => re.is_match(&s),
                _ => false,
            }),
        }
    }
}

fn resolve(outputs: &HashMap<String, Payload>, segments: &[String]) -> Value {
    let Some((dep, rest)) = segments.split_first() else {
        return Value::Null;
    };
    let Some(data) = outputs.get(dep) else {
        return Value::Null;
    };
    let Some((first, tail)) = rest.split_first() else {
        return Value::Object(data.clone());
    };
    let mut current = data.get(first);
    for seg in tail {
        current = match current {
            Some(Value::Object(map)) => map.get(seg),
            Some(Value::Array(items)) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
    }
    current.cloned().unwrap_or(Value::Null)
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(l: &Value, op: CmpOp, r: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(l, r),
        CmpOp::Ne => !values_equal(l, r),
        _ => {
            let ordering = match (l, r) {
                (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => false,
            }
        }
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Matches,
    Op(CmpOp),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Ident(String),
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::And => f.write_str("'and'"),
            TokenKind::Or => f.write_str("'or'"),
            TokenKind::Not => f.write_str("'not'"),
            TokenKind::Matches => f.write_str("'matches'"),
            TokenKind::Op(op) => write!(f, "operator {op:?}"),
            TokenKind::Str(s) => write!(f, "string {s:?}"),
            TokenKind::Num(n) => write!(f, "number {n}"),
            TokenKind::True => f.write_str("'true'"),
            TokenKind::False => f.write_str("'false'"),
            TokenKind::Null => f.write_str("'null'"),
            TokenKind::Ident(s) => write!(f, "path '{s}'"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn syntax(offset: usize, message: impl Into<String>) -> PredicateError {
    PredicateError::Syntax {
        offset,
        message: message.into(),
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn lex(src: &str) -> Result<Vec<Token>, PredicateError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let push = |tokens: &mut Vec<Token>, kind| tokens.push(Token { kind, offset });

        match (c, next) {
            (c, _) if c.is_whitespace() => i += 1,
            ('(', _) => {
                push(&mut tokens, TokenKind::LParen);
                i += 1;
            }
            (')', _) => {
                push(&mut tokens, TokenKind::RParen);
                i += 1;
            }
            ('&', Some('&')) => {
                push(&mut tokens, TokenKind::And);
                i += 2;
            }
            ('|', Some('|')) => {
                push(&mut tokens, TokenKind::Or);
                i += 2;
            }
            ('=', Some('=')) => {
                push(&mut tokens, TokenKind::Op(CmpOp::Eq));
                i += 2;
            }
            ('!', Some('=')) => {
                push(&mut tokens, TokenKind::Op(CmpOp::Ne));
                i += 2;
            }
            ('<', Some('=')) => {
                push(&mut tokens, TokenKind::Op(CmpOp::Le));
                i += 2;
            }
            ('>', Some('=')) => {
                push(&mut tokens, TokenKind::Op(CmpOp::Ge));
                i += 2;
            }
            ('<', _) => {
                push(&mut tokens, TokenKind::Op(CmpOp::Lt));
                i += 1;
            }
            ('>', _) => {
                push(&mut tokens, TokenKind::Op(CmpOp::Gt));
                i += 1;
            }
            ('!', _) => {
                push(&mut tokens, TokenKind::Not);
                i += 1;
            }
            ('"' | '\'', _) => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    let Some(&(_, ch)) = chars.get(i) else {
                        return Err(syntax(offset, "unterminated string"));
                    };
                    i += 1;
                    match ch {
                        '\\' => {
                            let Some(&(_, escaped)) = chars.get(i) else {
                                return Err(syntax(offset, "unterminated string"));
                            };
                            i += 1;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                        ch if ch == quote => break,
                        ch => value.push(ch),
                    }
                }
                push(&mut tokens, TokenKind::Str(value));
            }
            (c, _) if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i].1) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let kind = match word.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "matches" => TokenKind::Matches,
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "null" => TokenKind::Null,
                    w => match w.parse::<f64>() {
                        Ok(n) if n.is_finite() => TokenKind::Num(n),
                        _ => TokenKind::Ident(w.to_string()),
                    },
                };
                push(&mut tokens, kind);
            }
            (c, _) => return Err(syntax(offset, format!("unexpected character '{c}'"))),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser (recursive descent, lowest precedence first)
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.offset)
            .unwrap_or(0)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expr(&mut self) -> Result<Expr, PredicateError> {
        self.or()
    }

    fn descend(&mut self, offset: usize) -> Result<(), PredicateError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(syntax(offset, format!("nested deeper than {MAX_DEPTH} levels")));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, PredicateError> {
        let mut left = self.and()?;
        while self.peek() == Some(&TokenKind::Or) {
            self.bump();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, PredicateError> {
        let mut left = self.not()?;
        while self.peek() == Some(&TokenKind::And) {
            self.bump();
            let right = self.not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, PredicateError> {
        if self.peek() == Some(&TokenKind::Not) {
            self.descend(self.offset())?;
            self.bump();
            let inner = self.not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> Result<Expr, PredicateError> {
        let left = self.value()?;
        match self.peek() {
            Some(TokenKind::Op(op)) => {
                let op = *op;
                self.bump();
                let right = self.value()?;
                Ok(Expr::Cmp(Box::new(left), op, Box::new(right)))
            }
            Some(TokenKind::Matches) => {
                self.bump();
                let offset = self.offset();
                match self.bump().map(|t| t.kind) {
                    Some(TokenKind::Str(pattern)) => {
                        let re = Regex::new(&pattern).map_err(|e| PredicateError::InvalidRegex {
                            pattern: pattern.clone(),
                            message: e.to_string(),
                        })?;
                        Ok(Expr::Matches(Box::new(left), re))
                    }
                    _ => Err(syntax(offset, "'matches' expects a string literal")),
                }
            }
            _ => Ok(left),
        }
    }

    fn value(&mut self) -> Result<Expr, PredicateError> {
        let offset = self.offset();
        let Some(tok) = self.bump() else {
            return Err(syntax(offset, "unexpected end of expression"));
        };
        match tok.kind {
            TokenKind::Num(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::Ident(path) => {
                let segments: Vec<String> = path.split('.').map(str::to_string).collect();
                if segments.iter().any(String::is_empty) {
                    return Err(syntax(tok.offset, format!("malformed path '{path}'")));
                }
                Ok(Expr::Path(segments))
            }
            TokenKind::LParen => {
                self.descend(tok.offset)?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.bump().map(|t| t.kind) {
                    Some(TokenKind::RParen) => Ok(inner),
                    _ => Err(syntax(tok.offset, "unbalanced '('")),
                }
            }
            other => Err(syntax(tok.offset, format!("unexpected {other}"))),
        }
    }
}
