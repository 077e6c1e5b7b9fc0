//! Sandboxed guard/mapping expression evaluation.
//!
//! Rule conditions and handler guards are user-authored strings evaluated
//! against untrusted event payloads, so they run in a tiny expression
//! interpreter rather than anything resembling general code execution.
//! Only the variables explicitly bound into a [`Scope`] are visible; there
//! is no ambient process access, no function calls, and no assignment.
//!
//! Supported grammar, loosest to tightest binding:
//! `or`/`||`, `and`/`&&`, comparisons (`==  != < <= > >=`), `+ -`,
//! unary `not`/`!`/`-`, literals (numbers, single- or double-quoted
//! strings, `true`, `false`, `null`) and dotted variable paths such as
//! `doc.status` or `payload.client.externalId`.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("unexpected character {0:?} at position {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unknown variable {0:?}")]
    UnknownVariable(String),
    #[error("cannot apply {op} to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
}

/// Explicit variable bindings for one evaluation. Roots not bound here do
/// not exist as far as the expression is concerned.
#[derive(Default, Clone)]
pub struct Scope {
    vars: HashMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: &str, value: Value) -> Self {
        self.vars.insert(name.to_string(), value);
        self
    }

    fn resolve(&self, path: &[String]) -> Result<Value, EvalError> {
        let root = self
            .vars
            .get(&path[0])
            .ok_or_else(|| EvalError::UnknownVariable(path[0].clone()))?;
        let mut current = root;
        for segment in &path[1..] {
            match current {
                Value::Object(map) => current = map.get(segment).unwrap_or(&Value::Null),
                _ => return Ok(Value::Null),
            }
        }
        Ok(current.clone())
    }
}

/// Evaluate an expression, returning its value.
pub fn eval(expression: &str, scope: &Scope) -> Result<Value, EvalError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::UnexpectedToken(format!(
            "{}",
            parser.tokens[parser.pos]
        )));
    }
    eval_node(&expr, scope)
}

/// Evaluate an expression and reduce the result to a boolean by truthiness:
/// `null`, `false`, `0`, `""` and empty containers are falsy.
pub fn eval_bool(expression: &str, scope: &Scope) -> Result<bool, EvalError> {
    Ok(truthy(&eval(expression, scope)?))
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Value),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Dot,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Ident(name) => write!(f, "{name}"),
            other => write!(f, "{other:?}"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
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
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(EvalError::UnexpectedEnd),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                let mut is_float = false;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || (chars[i] == '.' && !is_float))
                {
                    // Only consume a dot followed by a digit, so `1.name`
                    // stays a parse error rather than a float.
                    if chars[i] == '.' {
                        if !chars.get(i + 1).map(char::is_ascii_digit).unwrap_or(false) {
                            break;
                        }
                        is_float = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = if is_float {
                    serde_json::Number::from_f64(
                        text.parse::<f64>()
                            .map_err(|_| EvalError::UnexpectedToken(text.clone()))?,
                    )
                    .map(Value::Number)
                    .ok_or(EvalError::UnexpectedToken(text))?
                } else {
                    Value::Number(
                        text.parse::<i64>()
                            .map_err(|_| EvalError::UnexpectedToken(text))?
                            .into(),
                    )
                };
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "null" | "None" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(EvalError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, EvalError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(EvalError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.next()? {
            Token::Number(n) => Ok(Expr::Literal(n)),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(first) => {
                let mut path = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.pos += 1;
                    match self.next()? {
                        Token::Ident(segment) => path.push(segment),
                        other => return Err(EvalError::UnexpectedToken(format!("{other}"))),
                    }
                }
                Ok(Expr::Var(path))
            }
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.next()? {
                    Token::RParen => Ok(inner),
                    other => Err(EvalError::UnexpectedToken(format!("{other}"))),
                }
            }
            other => Err(EvalError::UnexpectedToken(format!("{other}"))),
        }
    }
}

fn eval_node(expr: &Expr, scope: &Scope) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(path) => scope.resolve(path),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval_node(inner, scope)?))),
        Expr::Neg(inner) => {
            let value = eval_node(inner, scope)?;
            match &value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::Number((-i).into()))
                    } else {
                        let f = n.as_f64().unwrap_or(0.0);
                        Ok(serde_json::Number::from_f64(-f)
                            .map(Value::Number)
                            .unwrap_or(Value::Null))
                    }
                }
                _ => Err(EvalError::TypeMismatch {
                    op: "-",
                    left: type_name(&value),
                    right: "number",
                }),
            }
        }
        Expr::Binary(BinOp::Or, left, right) => {
            let lhs = eval_node(left, scope)?;
            if truthy(&lhs) {
                Ok(lhs)
            } else {
                eval_node(right, scope)
            }
        }
        Expr::Binary(BinOp::And, left, right) => {
            let lhs = eval_node(left, scope)?;
            if truthy(&lhs) {
                eval_node(right, scope)
            } else {
                Ok(lhs)
            }
        }
        Expr::Binary(op, left, right) => {
            let lhs = eval_node(left, scope)?;
            let rhs = eval_node(right, scope)?;
            binary(*op, &lhs, &rhs)
        }
    }
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(loose_eq(lhs, rhs))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(lhs, rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(lhs, rhs).ok_or(EvalError::TypeMismatch {
                op: op_name(op),
                left: type_name(lhs),
                right: type_name(rhs),
            })?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }))
        }
        BinOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => arithmetic(lhs, rhs, op),
        },
        BinOp::Sub => arithmetic(lhs, rhs, op),
        BinOp::Or | BinOp::And => unreachable!("short-circuited in eval_node"),
    }
}

fn arithmetic(lhs: &Value, rhs: &Value, op: BinOp) -> Result<Value, EvalError> {
    let (Some(a), Some(b)) = (as_f64(lhs), as_f64(rhs)) else {
        return Err(EvalError::TypeMismatch {
            op: op_name(op),
            left: type_name(lhs),
            right: type_name(rhs),
        });
    };
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        _ => unreachable!(),
    };
    if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
        Ok(Value::Number((result as i64).into()))
    } else {
        Ok(serde_json::Number::from_f64(result)
            .map(Value::Number)
            .unwrap_or(Value::Null))
    }
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (as_f64(lhs), as_f64(rhs)) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => {
            let (a, b) = (as_f64(lhs)?, as_f64(rhs)?);
            a.partial_cmp(&b)
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn op_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Or => "or",
        BinOp::And => "and",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::Add => "+",
        BinOp::Sub => "-",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_scope() -> Scope {
        Scope::new().bind(
            "doc",
            json!({
                "status": "Active",
                "amount": 150,
                "disabled": false,
                "client": {"externalId": "EXT-9"},
            }),
        )
    }

    #[test]
    fn evaluates_comparisons_against_bound_document() {
        let scope = doc_scope();
        assert!(eval_bool("doc.status == 'Active'", &scope).unwrap());
        assert!(eval_bool("doc.amount > 100", &scope).unwrap());
        assert!(eval_bool("doc.amount <= 150", &scope).unwrap());
        assert!(!eval_bool("doc.amount > 150", &scope).unwrap());
    }

    #[test]
    fn boolean_connectives_short_circuit() {
        let scope = doc_scope();
        assert!(eval_bool("doc.status == 'Active' and doc.amount > 10", &scope).unwrap());
        assert!(eval_bool("doc.missing or doc.amount", &scope).unwrap());
        assert!(eval_bool("not doc.disabled", &scope).unwrap());
        // Short-circuit means the unknown-root right side is never touched.
        assert!(eval_bool("doc.amount or nonsense.field", &scope).unwrap());
    }

    #[test]
    fn missing_fields_are_null_but_unknown_roots_error() {
        let scope = doc_scope();
        assert_eq!(eval("doc.nope", &scope).unwrap(), Value::Null);
        assert_eq!(eval("doc.client.missing", &scope).unwrap(), Value::Null);
        assert!(matches!(
            eval("settings.db", &scope),
            Err(EvalError::UnknownVariable(_))
        ));
    }

    #[test]
    fn nested_paths_and_string_concat() {
        let scope = doc_scope();
        assert_eq!(
            eval("doc.client.externalId", &scope).unwrap(),
            json!("EXT-9")
        );
        assert_eq!(
            eval("'id-' + doc.client.externalId", &scope).unwrap(),
            json!("id-EXT-9")
        );
        assert_eq!(eval("doc.amount - 50", &scope).unwrap(), json!(100));
    }

    #[test]
    fn malformed_expressions_error_instead_of_defaulting() {
        let scope = doc_scope();
        assert!(eval("doc.amount >", &scope).is_err());
        assert!(eval("(doc.amount", &scope).is_err());
        assert!(eval("doc.amount @ 3", &scope).is_err());
        assert!(eval("'unterminated", &scope).is_err());
    }

    #[test]
    fn equality_is_loose_across_numeric_widths() {
        let scope = Scope::new().bind("payload", json!({"count": 3}));
        assert!(eval_bool("payload.count == 3.0", &scope).unwrap());
        assert!(eval_bool("payload.count != '3'", &scope).unwrap());
    }

    #[test]
    fn comparing_incompatible_types_is_an_error_not_false() {
        let scope = doc_scope();
        let result = eval("doc.status > 5", &scope);
        assert!(matches!(result, Err(EvalError::TypeMismatch { .. })));
    }
}
