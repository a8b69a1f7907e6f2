//! Condition language for guards and branch steps.
//!
//! Conditions are a closed expression tree interpreted against the instance
//! data context. Free-form text such as
//!
//! ```text
//! qualityScore >= 0.7 && (status == "draft" || !published)
//! ```
//!
//! is parsed into the same tree (`Condition::parse`), normally once when a
//! definition is registered.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConditionError;
use crate::workflow::context::{lookup, DataMap};

const MAX_REF_DEPTH: usize = 32;
/// Parenthesis and `!` nesting allowed in expression text.
const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Contains => "contains",
        }
    }

    /// The operator with its operands swapped (`a < b` == `b > a`).
    fn flipped(self) -> Option<CompareOp> {
        match self {
            Self::Eq | Self::Ne => Some(self),
            Self::Gt => Some(Self::Lt),
            Self::Ge => Some(Self::Le),
            Self::Lt => Some(Self::Gt),
            Self::Le => Some(Self::Ge),
            Self::Contains => None,
        }
    }
}

/// A boolean predicate over the data context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Always,
    Never,
    /// Field is present and not null
    Exists { field: String },
    /// Field is present and truthy; a missing field is false
    Truthy { field: String },
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    CompareFields {
        left: String,
        op: CompareOp,
        right: String,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    /// Named entry in the definition's `conditions` table
    Ref(String),
    /// Uncompiled expression text
    Expr(String),
}

impl Condition {
    pub fn expr(source: impl Into<String>) -> Self {
        Condition::Expr(source.into())
    }

    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Condition::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Parse expression text into a condition tree.
    pub fn parse(source: &str) -> Result<Condition, ConditionError> {
        let tokens = tokenize(source).map_err(|message| parse_error(source, message))?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
            depth: 0,
        };
        let condition = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parse_error(
                source,
                format!("unexpected token {:?}", parser.tokens[parser.pos]),
            ));
        }
        Ok(condition)
    }

    /// Replace every `Expr` node with its parsed tree.
    pub fn compile(&self) -> Result<Condition, ConditionError> {
        Ok(match self {
            Condition::Expr(source) => Condition::parse(source)?,
            Condition::And(items) => Condition::And(
                items.iter().map(Condition::compile).collect::<Result<_, _>>()?,
            ),
            Condition::Or(items) => Condition::Or(
                items.iter().map(Condition::compile).collect::<Result<_, _>>()?,
            ),
            Condition::Not(inner) => Condition::Not(Box::new(inner.compile()?)),
            other => other.clone(),
        })
    }

    /// Evaluate against `data`, resolving `Ref` nodes through `named`.
    pub fn evaluate(
        &self,
        data: &DataMap,
        named: &BTreeMap<String, Condition>,
    ) -> Result<bool, ConditionError> {
        self.evaluate_at(data, named, 0)
    }

    fn evaluate_at(
        &self,
        data: &DataMap,
        named: &BTreeMap<String, Condition>,
        depth: usize,
    ) -> Result<bool, ConditionError> {
        match self {
            Condition::Always => Ok(true),
            Condition::Never => Ok(false),
            Condition::Exists { field } => Ok(lookup(data, field).is_some_and(|v| !v.is_null())),
            Condition::Truthy { field } => Ok(lookup(data, field).is_some_and(is_truthy)),
            Condition::Compare { field, op, value } => compare_field(data, field, *op, value),
            Condition::CompareFields { left, op, right } => {
                let right_value = lookup(data, right).cloned().unwrap_or(Value::Null);
                compare_field(data, left, *op, &right_value)
            }
            Condition::And(items) => {
                for item in items {
                    if !item.evaluate_at(data, named, depth)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(items) => {
                for item in items {
                    if item.evaluate_at(data, named, depth)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!inner.evaluate_at(data, named, depth)?),
            Condition::Ref(name) => {
                if depth >= MAX_REF_DEPTH {
                    return Err(ConditionError::UnknownReference(format!(
                        "{} (reference chain too deep)",
                        name
                    )));
                }
                named
                    .get(name)
                    .ok_or_else(|| ConditionError::UnknownReference(name.clone()))?
                    .evaluate_at(data, named, depth + 1)
            }
            Condition::Expr(source) => Condition::parse(source)?.evaluate_at(data, named, depth),
        }
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::parse(s)
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_field(
    data: &DataMap,
    field: &str,
    op: CompareOp,
    expected: &Value,
) -> Result<bool, ConditionError> {
    let actual = lookup(data, field);
    match op {
        CompareOp::Eq => Ok(values_equal(actual.unwrap_or(&Value::Null), expected)),
        CompareOp::Ne => Ok(!values_equal(actual.unwrap_or(&Value::Null), expected)),
        CompareOp::Contains => {
            let actual = actual.ok_or_else(|| ConditionError::MissingField(field.to_string()))?;
            match (actual, expected) {
                (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
                (Value::Array(items), needle) => Ok(items.iter().any(|v| values_equal(v, needle))),
                (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
                (a, b) => Err(incompatible(a, b, op)),
            }
        }
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            let actual = actual.ok_or_else(|| ConditionError::MissingField(field.to_string()))?;
            let ordering = match (actual, expected) {
                (Value::Number(x), Value::Number(y)) => x
                    .as_f64()
                    .zip(y.as_f64())
                    .and_then(|(x, y)| x.partial_cmp(&y)),
                (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                _ => None,
            }
            .ok_or_else(|| incompatible(actual, expected, op))?;
            Ok(match op {
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Ge => ordering != Ordering::Less,
                CompareOp::Lt => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
    }
}

fn incompatible(a: &Value, b: &Value, op: CompareOp) -> ConditionError {
    ConditionError::IncompatibleTypes {
        left: type_name(a).to_string(),
        right: type_name(b).to_string(),
        op: op.as_str().to_string(),
    }
}

fn parse_error(source: &str, message: impl Into<String>) -> ConditionError {
    ConditionError::Parse {
        source_text: source.to_string(),
        message: message.into(),
    }
}

// ─── Tokenizer ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let or_equal = next == Some('=');
                let op = match (c, or_equal) {
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Le,
                    _ => CompareOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if or_equal { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = if let Ok(n) = text.parse::<i64>() {
                    Value::from(n)
                } else {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(|| format!("invalid number '{}'", text))?
                };
                tokens.push(Token::Literal(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '$'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Op(CompareOp::Contains),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

// ─── Parser ───────────────────────────────────────────────────────────────

enum Operand {
    Field(String),
    Literal(Value),
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> ConditionError {
        parse_error(self.source, message)
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionError> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Condition::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionError> {
        let mut items = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Condition::And(items)
        })
    }

    fn parse_unary(&mut self) -> Result<Condition, ConditionError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.parse_unary();
                self.depth -= 1;
                Ok(Condition::Not(Box::new(inner?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.parse_or();
                self.depth -= 1;
                let inner = inner?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn enter(&mut self) -> Result<(), ConditionError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("nesting deeper than {} levels", MAX_NESTING)));
        }
        self.depth += 1;
        Ok(())
    }

    fn parse_operand(&mut self) -> Result<Operand, ConditionError> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(Operand::Field(name)),
            Some(Token::Literal(v)) => Ok(Operand::Literal(v)),
            Some(other) => Err(self.error(format!("expected a field or literal, found {:?}", other))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_comparison(&mut self) -> Result<Condition, ConditionError> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Op(op)) => *op,
            _ => {
                return match left {
                    Operand::Field(field) => Ok(Condition::Truthy { field }),
                    Operand::Literal(Value::Bool(true)) => Ok(Condition::Always),
                    Operand::Literal(Value::Bool(false)) => Ok(Condition::Never),
                    Operand::Literal(v) => Err(self.error(format!("literal {} is not a condition", v))),
                };
            }
        };
        self.pos += 1;
        let right = self.parse_operand()?;

        match (left, right) {
            (Operand::Field(field), Operand::Literal(value)) => Ok(Condition::Compare { field, op, value }),
            (Operand::Field(left), Operand::Field(right)) => Ok(Condition::CompareFields { left, op, right }),
            (Operand::Literal(value), Operand::Field(field)) => {
                let op = op
                    .flipped()
                    .ok_or_else(|| self.error("'contains' needs a field on the left"))?;
                Ok(Condition::Compare { field, op, value })
            }
            (Operand::Literal(_), Operand::Literal(_)) => {
                Err(self.error("a comparison needs at least one field"))
            }
        }
    }
}
