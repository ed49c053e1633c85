//! Sandboxed boolean expressions for `custom` conditions.
//!
//! The language covers literals, snapshot field references, `${path}`
//! placeholders, comparisons and boolean connectives. There are no function
//! calls, assignments or arithmetic, and placeholder values are bound as data
//! rather than spliced into the source text, so a snapshot value can never
//! change the shape of the expression.

use serde_json::{Number, Value};
use std::iter::Peekable;
use std::str::CharIndices;
use thiserror::Error;

use super::paths::lookup_path;

#[derive(Debug, Error, PartialEq)]
pub enum ExpressionError {
    #[error("expression parse error: {0}")]
    Parse(String),
    #[error("expression evaluation error: {0}")]
    Evaluation(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Field(String),
    Placeholder(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Access {
        target: Box<Expr>,
        segment: String,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Not,
    Minus,
    EqEq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    AndAnd,
    OrOr,
    Contains,
    In,
    Placeholder(String),
    Identifier(String),
    Number(f64),
    String(String),
    True,
    False,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationOptions {
    pub max_length: usize,
    pub max_depth: usize,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            max_length: 4_096,
            max_depth: 32,
        }
    }
}

/// A parsed expression, reusable across snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression {
    expr: Expr,
    placeholders: Vec<String>,
}

impl CompiledExpression {
    /// Dotted paths referenced through `${...}`, in source order.
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    pub fn evaluate(&self, snapshot: &Value) -> Result<Value, ExpressionError> {
        eval(&self.expr, snapshot)
    }

    /// Only a boolean `true` result counts as a match.
    pub fn matches(&self, snapshot: &Value) -> Result<bool, ExpressionError> {
        Ok(matches!(self.evaluate(snapshot)?, Value::Bool(true)))
    }
}

pub fn compile(
    source: &str,
    options: EvaluationOptions,
) -> Result<CompiledExpression, ExpressionError> {
    if source.len() > options.max_length {
        return Err(ExpressionError::Parse(format!(
            "expression exceeds max length {}",
            options.max_length
        )));
    }
    if source.trim().is_empty() {
        return Err(ExpressionError::Parse("expression is empty".to_owned()));
    }

    let tokens = tokenize(source)?;
    let placeholders = tokens
        .iter()
        .filter_map(|token| match token {
            Token::Placeholder(path) => Some(path.clone()),
            _ => None,
        })
        .collect();

    let mut parser = Parser::new(tokens, options.max_depth);
    let expr = parser.parse_expression()?;
    parser.expect_end()?;

    let depth = expression_depth(&expr);
    if depth > options.max_depth {
        return Err(ExpressionError::Parse(format!(
            "expression depth {depth} exceeds max depth {}",
            options.max_depth
        )));
    }

    Ok(CompiledExpression { expr, placeholders })
}

fn expression_depth(expr: &Expr) -> usize {
    match expr {
        Expr::Literal(_) | Expr::Field(_) | Expr::Placeholder(_) => 1,
        Expr::List(items) => 1 + items.iter().map(expression_depth).max().unwrap_or(0),
        Expr::Not(inner) | Expr::Neg(inner) => 1 + expression_depth(inner),
        Expr::Binary { left, right, .. } => {
            1 + expression_depth(left).max(expression_depth(right))
        }
        Expr::Access { target, .. } => 1 + expression_depth(target),
        Expr::Index { target, index } => {
            1 + expression_depth(target).max(expression_depth(index))
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut chars = input.char_indices().peekable();
    let mut tokens = Vec::new();

    while let Some((idx, ch)) = chars.peek().copied() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        if ch.is_ascii_digit() {
            chars.next();
            while let Some((_, c)) = chars.peek().copied() {
                if c.is_ascii_digit() || c == '.' {
                    chars.next();
                } else {
                    break;
                }
            }
            let end = chars.peek().map(|(i, _)| *i).unwrap_or(input.len());
            let text = &input[idx..end];
            let number = text
                .parse::<f64>()
                .map_err(|err| ExpressionError::Parse(format!("invalid number '{text}': {err}")))?;
            tokens.push(Token::Number(number));
            continue;
        }

        if ch == '\'' || ch == '"' {
            chars.next();
            let mut value = String::new();
            let mut escaped = false;
            let mut terminated = false;

            for (_, c) in chars.by_ref() {
                if escaped {
                    value.push(match c {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == ch {
                    terminated = true;
                    break;
                } else {
                    value.push(c);
                }
            }

            if !terminated {
                return Err(ExpressionError::Parse(
                    "unterminated string literal".to_owned(),
                ));
            }
            tokens.push(Token::String(value));
            continue;
        }

        if ch == '$' {
            chars.next();
            if !matches!(chars.next(), Some((_, '{'))) {
                return Err(ExpressionError::Parse(
                    "expected '{' after '$' in placeholder".to_owned(),
                ));
            }
            let mut path = String::new();
            let mut terminated = false;
            for (_, c) in chars.by_ref() {
                if c == '}' {
                    terminated = true;
                    break;
                }
                path.push(c);
            }
            let path = path.trim();
            if !terminated || path.is_empty() {
                return Err(ExpressionError::Parse(
                    "placeholder must look like ${field.path}".to_owned(),
                ));
            }
            tokens.push(Token::Placeholder(path.to_owned()));
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            chars.next();
            while let Some((_, c)) = chars.peek().copied() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    chars.next();
                } else {
                    break;
                }
            }
            let end = chars.peek().map(|(i, _)| *i).unwrap_or(input.len());
            let token = match &input[idx..end] {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                "and" => Token::AndAnd,
                "or" => Token::OrOr,
                "not" => Token::Not,
                "contains" => Token::Contains,
                "in" => Token::In,
                ident => Token::Identifier(ident.to_owned()),
            };
            tokens.push(token);
            continue;
        }

        chars.next();
        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '.' => Token::Dot,
            ',' => Token::Comma,
            '-' => Token::Minus,
            '!' => {
                if next_is(&mut chars, '=') {
                    // `!==` is accepted as an alias of `!=`
                    next_is(&mut chars, '=');
                    Token::NotEq
                } else {
                    Token::Not
                }
            }
            '=' => {
                if !next_is(&mut chars, '=') {
                    return Err(ExpressionError::Parse(
                        "unexpected '='; use '==' for comparison".to_owned(),
                    ));
                }
                next_is(&mut chars, '=');
                Token::EqEq
            }
            '>' => {
                if next_is(&mut chars, '=') {
                    Token::Gte
                } else {
                    Token::Gt
                }
            }
            '<' => {
                if next_is(&mut chars, '=') {
                    Token::Lte
                } else {
                    Token::Lt
                }
            }
            '&' => {
                if !next_is(&mut chars, '&') {
                    return Err(ExpressionError::Parse("unexpected '&'; use '&&'".to_owned()));
                }
                Token::AndAnd
            }
            '|' => {
                if !next_is(&mut chars, '|') {
                    return Err(ExpressionError::Parse("unexpected '|'; use '||'".to_owned()));
                }
                Token::OrOr
            }
            other => {
                return Err(ExpressionError::Parse(format!(
                    "unexpected character '{other}'"
                )));
            }
        };
        tokens.push(token);
    }

    Ok(tokens)
}

fn next_is(chars: &mut Peekable<CharIndices<'_>>, want: char) -> bool {
    if matches!(chars.peek(), Some((_, c)) if *c == want) {
        chars.next();
        true
    } else {
        false
    }
}

// Nesting is bounded while parsing, so hostile input fails with a parse
// error before recursion can exhaust the stack.
struct Parser {
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, max_depth: usize) -> Self {
        Self {
            tokens,
            index: 0,
            depth: 0,
            max_depth,
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ExpressionError::Parse(format!(
                "expression nesting exceeds max depth {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    fn leave(&mut self, levels: usize) {
        self.depth = self.depth.saturating_sub(levels);
    }

    fn parse_expression(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        let mut chained = 0;
        while self.eat(&Token::OrOr) {
            self.enter()?;
            chained += 1;
            let right = self.parse_and()?;
            left = binary(left, BinaryOp::Or, right);
        }
        self.leave(chained);
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        let mut chained = 0;
        while self.eat(&Token::AndAnd) {
            self.enter()?;
            chained += 1;
            let right = self.parse_comparison()?;
            left = binary(left, BinaryOp::And, right);
        }
        self.leave(chained);
        Ok(left)
    }

    // Comparisons do not chain: `a < b < c` is a parse error.
    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_unary()?;
        let Some(op) = self.comparison_op() else {
            return Ok(left);
        };
        let right = self.parse_unary()?;
        if self.comparison_op().is_some() {
            return Err(ExpressionError::Parse(
                "comparisons cannot be chained; combine them with '&&'".to_owned(),
            ));
        }
        Ok(binary(left, op, right))
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.parse_unary()?;
            self.leave(1);
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.eat(&Token::Minus) {
            self.enter()?;
            let inner = self.parse_unary()?;
            self.leave(1);
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        let mut chained = 0;
        loop {
            if self.peek() == Some(&Token::Dot) || self.peek() == Some(&Token::LBracket) {
                self.enter()?;
                chained += 1;
            }
            if self.eat(&Token::Dot) {
                let segment = match self.advance() {
                    Some(Token::Identifier(name)) => name,
                    Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                        format!("{}", n as u64)
                    }
                    _ => {
                        return Err(ExpressionError::Parse(
                            "expected field name after '.'".to_owned(),
                        ))
                    }
                };
                expr = Expr::Access {
                    target: Box::new(expr),
                    segment,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_expression()?;
                self.expect(&Token::RBracket, "expected ']' after index")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                self.leave(chained);
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let Some(token) = self.advance() else {
            return Err(ExpressionError::Parse(
                "unexpected end of expression".to_owned(),
            ));
        };

        match token {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Number(v) => Number::from_f64(v)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| ExpressionError::Parse(format!("invalid number literal '{v}'"))),
            Token::String(v) => Ok(Expr::Literal(Value::String(v))),
            Token::Placeholder(path) => Ok(Expr::Placeholder(path)),
            Token::Identifier(name) => {
                if self.peek() == Some(&Token::LParen) {
                    return Err(ExpressionError::Parse(format!(
                        "function calls are not supported ('{name}')"
                    )));
                }
                Ok(Expr::Field(name))
            }
            Token::LParen => {
                self.enter()?;
                let expr = self.parse_expression()?;
                self.expect(&Token::RParen, "expected ')' after expression")?;
                self.leave(1);
                Ok(expr)
            }
            Token::LBracket => {
                self.enter()?;
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expression()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma, "expected ',' between list items")?;
                    }
                }
                self.leave(1);
                Ok(Expr::List(items))
            }
            other => Err(ExpressionError::Parse(format!(
                "unexpected token {other:?}"
            ))),
        }
    }

    fn comparison_op(&mut self) -> Option<BinaryOp> {
        let op = match self.peek()? {
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Neq,
            Token::Gt => BinaryOp::Gt,
            Token::Gte => BinaryOp::Gte,
            Token::Lt => BinaryOp::Lt,
            Token::Lte => BinaryOp::Lte,
            Token::Contains => BinaryOp::Contains,
            Token::In => BinaryOp::In,
            _ => return None,
        };
        self.index += 1;
        Some(op)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, msg: &str) -> Result<(), ExpressionError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(ExpressionError::Parse(msg.to_owned()))
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn expect_end(&self) -> Result<(), ExpressionError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(ExpressionError::Parse(format!(
                "unexpected trailing token {token:?}"
            ))),
        }
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

fn eval(expr: &Expr, snapshot: &Value) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(name) => Ok(snapshot.get(name).cloned().unwrap_or(Value::Null)),
        Expr::Placeholder(path) => Ok(lookup_path(snapshot, Some(path.as_str()))
            .cloned()
            .unwrap_or(Value::Null)),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, snapshot))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Not(inner) => Ok(Value::Bool(!expect_bool(&eval(inner, snapshot)?)?)),
        Expr::Neg(inner) => {
            let value = eval(inner, snapshot)?;
            let number = to_number(&value).ok_or_else(|| {
                ExpressionError::Evaluation(format!("cannot negate non-number value {value}"))
            })?;
            Number::from_f64(-number)
                .map(Value::Number)
                .ok_or_else(|| ExpressionError::Evaluation("non-finite number".to_owned()))
        }
        Expr::Binary { left, op, right } => match op {
            BinaryOp::And => {
                if !expect_bool(&eval(left, snapshot)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(expect_bool(&eval(right, snapshot)?)?))
            }
            BinaryOp::Or => {
                if expect_bool(&eval(left, snapshot)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(expect_bool(&eval(right, snapshot)?)?))
            }
            _ => {
                let left = eval(left, snapshot)?;
                let right = eval(right, snapshot)?;
                compare(&left, *op, &right).map(Value::Bool)
            }
        },
        Expr::Access { target, segment } => {
            let value = eval(target, snapshot)?;
            Ok(lookup_path(&value, Some(segment.as_str()))
                .cloned()
                .unwrap_or(Value::Null))
        }
        Expr::Index { target, index } => {
            let value = eval(target, snapshot)?;
            let index = eval(index, snapshot)?;
            Ok(match (&value, &index) {
                (Value::Array(items), Value::Number(n)) => n
                    .as_f64()
                    .filter(|n| *n >= 0.0 && n.fract() == 0.0)
                    .and_then(|n| items.get(n as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            })
        }
    }
}

fn expect_bool(value: &Value) -> Result<bool, ExpressionError> {
    value.as_bool().ok_or_else(|| {
        ExpressionError::Evaluation(format!("expected a boolean operand, got {value}"))
    })
}

fn compare(left: &Value, op: BinaryOp, right: &Value) -> Result<bool, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(values_equal(left, right)),
        BinaryOp::Neq => Ok(!values_equal(left, right)),
        BinaryOp::Contains => Ok(contains(left, right)),
        BinaryOp::In => Ok(contains(right, left)),
        BinaryOp::Gt | BinaryOp::Gte | BinaryOp::Lt | BinaryOp::Lte => {
            if let (Some(a), Some(b)) = (to_number(left), to_number(right)) {
                return Ok(ordered(a.partial_cmp(&b), op));
            }
            if let (Value::String(a), Value::String(b)) = (left, right) {
                return Ok(ordered(Some(a.cmp(b)), op));
            }
            Err(ExpressionError::Evaluation(format!(
                "cannot order {left} and {right}"
            )))
        }
        BinaryOp::And | BinaryOp::Or => Err(ExpressionError::Evaluation(
            "boolean connective used as comparison".to_owned(),
        )),
    }
}

fn ordered(ordering: Option<std::cmp::Ordering>, op: BinaryOp) -> bool {
    use std::cmp::Ordering::*;
    match (ordering, op) {
        (Some(Greater), BinaryOp::Gt | BinaryOp::Gte) => true,
        (Some(Less), BinaryOp::Lt | BinaryOp::Lte) => true,
        (Some(Equal), BinaryOp::Gte | BinaryOp::Lte) => true,
        _ => false,
    }
}

/// Numbers compare by value regardless of integer/float representation.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(a), Value::String(b)) => a.contains(b.as_str()),
        (Value::Array(items), value) => items.iter().any(|item| values_equal(item, value)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(v) => v.as_f64(),
        Value::String(v) => v.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}
