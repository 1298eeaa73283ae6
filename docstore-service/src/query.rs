//! Server-side predicate evaluation.
//!
//! A predicate arrives on the wire as a string and is compiled into a pure
//! `record -> bool` function. The grammar is deliberately small: field
//! accesses, JSON literals, comparisons, `in` membership and boolean
//! combinators. Nothing else parses.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use crate::errors::{DbError, DbResult};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Number),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone)]
enum Operand {
    Field(String),
    Literal(Value),
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(CmpOp, Operand, Operand),
    Test(Operand),
}

/// A compiled predicate. Parsing is the only fallible step; evaluation is
/// total and side-effect free.
#[derive(Debug, Clone)]
pub struct Predicate {
    root: Expr,
}

impl Predicate {
    pub fn parse(input: &str) -> DbResult<Self> {
        let tokens = lex(input).map_err(|detail| malformed(input, &detail))?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr().map_err(|detail| malformed(input, &detail))?;
        if parser.pos != parser.tokens.len() {
            return Err(malformed(input, "trailing input after expression"));
        }
        Ok(Predicate { root })
    }

    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        eval(&self.root, record)
    }
}

fn malformed(query: &str, detail: &str) -> DbError {
    DbError::MalformedQuery(format!("query {query:?} is malformed: {detail}"))
}

// --- lexer ---------------------------------------------------------------

fn lex(input: &str) -> Result<Vec<Token>, String> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => pos += 1,
            b'(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            b'[' => {
                tokens.push(Token::LBracket);
                pos += 1;
            }
            b']' => {
                tokens.push(Token::RBracket);
                pos += 1;
            }
            b',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            b'=' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::Eq);
                    pos += 2;
                } else {
                    return Err("single '=' (use '==')".into());
                }
            }
            b'!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::Ne);
                    pos += 2;
                } else {
                    return Err("unexpected '!'".into());
                }
            }
            b'<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    pos += 2;
                } else {
                    tokens.push(Token::Lt);
                    pos += 1;
                }
            }
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    pos += 2;
                } else {
                    tokens.push(Token::Gt);
                    pos += 1;
                }
            }
            b'\'' | b'"' => {
                let (literal, next) = lex_string(input, pos, c)?;
                tokens.push(Token::Str(literal));
                pos = next;
            }
            b'0'..=b'9' | b'-' => {
                let (number, next) = lex_number(input, pos)?;
                tokens.push(Token::Num(number));
                pos = next;
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                tokens.push(match &input[start..pos] {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    ident => Token::Ident(ident.to_string()),
                });
            }
            other => return Err(format!("unexpected character {:?}", other as char)),
        }
    }
    Ok(tokens)
}

fn lex_string(input: &str, start: usize, quote: u8) -> Result<(String, usize), String> {
    let bytes = input.as_bytes();
    let mut out = String::new();
    let mut pos = start + 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => {
                let escaped = bytes
                    .get(pos + 1)
                    .ok_or_else(|| "unterminated escape".to_string())?;
                out.push(match escaped {
                    b'\\' => '\\',
                    b'\'' => '\'',
                    b'"' => '"',
                    b'n' => '\n',
                    b't' => '\t',
                    other => return Err(format!("unsupported escape \\{}", *other as char)),
                });
                pos += 2;
            }
            c if c == quote => return Ok((out, pos + 1)),
            _ => {
                // multi-byte characters pass through untouched
                let ch = input[pos..].chars().next().expect("in-bounds char");
                out.push(ch);
                pos += ch.len_utf8();
            }
        }
    }
    Err("unterminated string literal".into())
}

fn lex_number(input: &str, start: usize) -> Result<(Number, usize), String> {
    let bytes = input.as_bytes();
    let mut pos = start;
    if bytes[pos] == b'-' {
        pos += 1;
    }
    let mut is_float = false;
    while pos < bytes.len() {
        match bytes[pos] {
            b'0'..=b'9' => pos += 1,
            b'.' | b'e' | b'E' => {
                is_float = true;
                pos += 1;
            }
            b'+' | b'-' if is_float => pos += 1,
            _ => break,
        }
    }
    let text = &input[start..pos];
    let number = if is_float {
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .ok_or_else(|| format!("invalid number {text:?}"))?
    } else {
        text.parse::<i64>()
            .map(Number::from)
            .map_err(|_| format!("invalid number {text:?}"))?
    };
    Ok((number, pos))
}

// --- parser --------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected:?}, found {token:?}")),
            None => Err(format!("expected {expected:?}, found end of input")),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.conjunction()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.conjunction()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn conjunction(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        // A parenthesized sub-expression may itself be a boolean expression,
        // so '(' is handled here before operands.
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.expr()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        let lhs = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::In) => CmpOp::In,
            _ => return Ok(Expr::Test(lhs)),
        };
        self.pos += 1;
        let rhs = self.operand()?;
        Ok(Expr::Cmp(op, lhs, rhs))
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(Operand::Field(name)),
            Some(Token::Str(text)) => Ok(Operand::Literal(Value::String(text))),
            Some(Token::Num(number)) => Ok(Operand::Literal(Value::Number(number))),
            Some(Token::True) => Ok(Operand::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Operand::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Operand::Literal(Value::Null)),
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.pos += 1;
                    return Ok(Operand::Literal(Value::Array(items)));
                }
                loop {
                    match self.operand()? {
                        Operand::Literal(value) => items.push(value),
                        Operand::Field(name) => {
                            return Err(format!("field {name:?} not allowed inside a list literal"))
                        }
                    }
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => return Err(format!("expected ',' or ']', found {other:?}")),
                    }
                }
                Ok(Operand::Literal(Value::Array(items)))
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of input".into()),
        }
    }
}

// --- evaluation ----------------------------------------------------------

fn eval(expr: &Expr, record: &Map<String, Value>) -> bool {
    match expr {
        Expr::Or(lhs, rhs) => eval(lhs, record) || eval(rhs, record),
        Expr::And(lhs, rhs) => eval(lhs, record) && eval(rhs, record),
        Expr::Not(inner) => !eval(inner, record),
        Expr::Test(operand) => resolve(operand, record).map(truthy).unwrap_or(false),
        Expr::Cmp(op, lhs, rhs) => {
            let (Some(lhs), Some(rhs)) = (resolve(lhs, record), resolve(rhs, record)) else {
                // A missing field compares as false, whatever the operator.
                return false;
            };
            match op {
                CmpOp::Eq => values_equal(lhs, rhs),
                CmpOp::Ne => !values_equal(lhs, rhs),
                CmpOp::Lt => values_cmp(lhs, rhs) == Some(Ordering::Less),
                CmpOp::Le => matches!(
                    values_cmp(lhs, rhs),
                    Some(Ordering::Less) | Some(Ordering::Equal)
                ),
                CmpOp::Gt => values_cmp(lhs, rhs) == Some(Ordering::Greater),
                CmpOp::Ge => matches!(
                    values_cmp(lhs, rhs),
                    Some(Ordering::Greater) | Some(Ordering::Equal)
                ),
                CmpOp::In => contains(lhs, rhs),
            }
        }
    }
}

fn resolve<'a>(operand: &'a Operand, record: &'a Map<String, Value>) -> Option<&'a Value> {
    match operand {
        Operand::Field(name) => record.get(name),
        Operand::Literal(value) => Some(value),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        // 1 and 1.0 are the same number on this wire
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => lhs == rhs,
    }
}

fn values_cmp(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(needle: &Value, haystack: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| values_equal(needle, item)),
        Value::String(text) => matches!(needle, Value::String(sub) if text.contains(sub.as_str())),
        Value::Object(map) => matches!(needle, Value::String(key) if map.contains_key(key)),
        _ => false,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
