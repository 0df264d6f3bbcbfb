//! Step and tool-grant conditions.
//!
//! A small expression language over the run scope:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := unary ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" ) unary )?
//! unary   := "!" unary | primary
//! primary := number | string | true | false | null | path | "(" expr ")"
//! ```
//!
//! Paths use the same syntax as step inputs. A path that does not resolve
//! evaluates to null. Ordering comparisons are defined between two numbers
//! or two strings and are false otherwise. `null`, `false`, `0`, `""`, `[]`
//! and `{}` are falsy.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

use crate::resolve::Scope;

/// A condition that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed condition '{source_text}' at offset {offset}: {message}")]
pub struct ConditionError {
    pub source_text: String,
    pub offset: usize,
    pub message: String,
}

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.expr()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(error(source, *offset, format!("unexpected {token:?}")));
        }
        Ok(Self { expr })
    }

    pub fn evaluate(&self, scope: &Scope) -> bool {
        truthy(&self.expr.eval(scope))
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, scope: &Scope) -> Result<bool, ConditionError> {
    Ok(Condition::parse(source)?.evaluate(scope))
}

/// Truthiness used by `!`, `&&`, `||` and the final result.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn error(source: &str, offset: usize, message: impl Into<String>) -> ConditionError {
    ConditionError {
        source_text: source.to_string(),
        offset,
        message: message.into(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokens
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Literal(Value),
    Op(CmpOp),
    Not,
    And,
    Or,
    Open,
    Close,
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

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => tokens.push((offset, Token::Open)),
            ')' => tokens.push((offset, Token::Close)),
            '&' if next == Some('&') => {
                tokens.push((offset, Token::And));
                i += 1;
            }
            '|' if next == Some('|') => {
                tokens.push((offset, Token::Or));
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push((offset, Token::Op(CmpOp::Eq)));
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push((offset, Token::Op(CmpOp::Ne)));
                i += 1;
            }
            '!' => tokens.push((offset, Token::Not)),
            '<' if next == Some('=') => {
                tokens.push((offset, Token::Op(CmpOp::Le)));
                i += 1;
            }
            '<' => tokens.push((offset, Token::Op(CmpOp::Lt))),
            '>' if next == Some('=') => {
                tokens.push((offset, Token::Op(CmpOp::Ge)));
                i += 1;
            }
            '>' => tokens.push((offset, Token::Op(CmpOp::Gt))),
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    let Some(&(_, ch)) = chars.get(j) else {
                        return Err(error(source, offset, "unterminated string"));
                    };
                    if ch == quote {
                        break;
                    }
                    if ch == '\\'
                        && let Some(&(_, escaped)) = chars.get(j + 1)
                    {
                        text.push(escaped);
                        j += 2;
                        continue;
                    }
                    text.push(ch);
                    j += 1;
                }
                tokens.push((offset, Token::Literal(Value::String(text))));
                i = j;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while chars
                    .get(j)
                    .is_some_and(|(_, ch)| ch.is_ascii_digit() || *ch == '.')
                {
                    j += 1;
                }
                let end = chars.get(j).map_or(source.len(), |(o, _)| *o);
                let text = &source[offset..end];
                let number: serde_json::Number = text
                    .parse::<i64>()
                    .map(Into::into)
                    .ok()
                    .or_else(|| text.parse::<f64>().ok().and_then(serde_json::Number::from_f64))
                    .ok_or_else(|| error(source, offset, format!("invalid number '{text}'")))?;
                tokens.push((offset, Token::Literal(Value::Number(number))));
                i = j;
                continue;
            }
            c if is_path_char(c) => {
                let mut j = i + 1;
                while chars.get(j).is_some_and(|(_, ch)| is_path_char(*ch)) {
                    j += 1;
                }
                let end = chars.get(j).map_or(source.len(), |(o, _)| *o);
                let word = &source[offset..end];
                let token = match word {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    path => Token::Path(path.to_string()),
                };
                tokens.push((offset, token));
                i = j;
                continue;
            }
            other => return Err(error(source, offset, format!("unexpected character '{other}'"))),
        }
        i += 1;
    }

    Ok(tokens)
}

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '[' | ']')
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.source.len(), |(o, _)| *o)
    }

    fn expr(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.comparison()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.unary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.unary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        let offset = self.offset();
        let Some((_, token)) = self.tokens.get(self.pos).cloned() else {
            return Err(error(self.source, offset, "unexpected end of condition"));
        };
        self.pos += 1;
        match token {
            Token::Literal(value) => Ok(Expr::Literal(value)),
            Token::Path(path) => Ok(Expr::Path(path)),
            Token::Open => {
                let inner = self.expr()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(error(self.source, self.offset(), "expected ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            other => Err(error(self.source, offset, format!("unexpected {other:?}"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluation
// ─────────────────────────────────────────────────────────────────────────────

impl Expr {
    fn eval(&self, scope: &Scope) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Path(path) => scope.lookup(path).cloned().unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!truthy(&inner.eval(scope))),
            Expr::And(left, right) => {
                Value::Bool(truthy(&left.eval(scope)) && truthy(&right.eval(scope)))
            }
            Expr::Or(left, right) => {
                Value::Bool(truthy(&left.eval(scope)) || truthy(&right.eval(scope)))
            }
            Expr::Compare(op, left, right) => {
                Value::Bool(compare(*op, &left.eval(scope), &right.eval(scope)))
            }
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => loosely_equal(left, right),
        CmpOp::Ne => !loosely_equal(left, right),
        CmpOp::Lt => order(left, right) == Some(Ordering::Less),
        CmpOp::Le => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => order(left, right) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(
            order(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
    }
}

/// Numbers compare by value so that `1 == 1.0`.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        Scope::from_roots([
            (
                "classification".to_string(),
                json!({"label": "billing", "confidence": 0.92, "escalate": false}),
            ),
            ("trigger".to_string(), json!({"amount": 40, "tags": []})),
            ("project".to_string(), json!({"tier": "gold"})),
        ])
    }

    fn eval(source: &str) -> bool {
        evaluate(source, &scope()).unwrap()
    }

    #[test]
    fn test_equality_with_string_literal() {
        assert!(eval("classification.label == 'billing'"));
        assert!(eval("classification.label != \"shipping\""));
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(eval("trigger.amount < 100"));
        assert!(eval("classification.confidence >= 0.9"));
        assert!(!eval("trigger.amount > 40"));
        assert!(eval("trigger.amount == 40.0"));
    }

    #[test]
    fn test_boolean_operators_and_grouping() {
        assert!(eval("!classification.escalate && project.tier == 'gold'"));
        assert!(eval("classification.escalate || (trigger.amount <= 40 && true)"));
        assert!(!eval("!(trigger.amount == 40)"));
    }

    #[test]
    fn test_bare_path_truthiness() {
        assert!(eval("classification"));
        assert!(!eval("trigger.tags"));
        assert!(!eval("classification.escalate"));
    }

    #[test]
    fn test_missing_path_is_null() {
        assert!(!eval("classification.reason"));
        assert!(eval("classification.reason == null"));
        assert!(!eval("unknown.root > 1"));
    }

    #[test]
    fn test_mixed_types_do_not_order() {
        assert!(!eval("project.tier > 1"));
        assert!(!eval("project.tier <= 1"));
    }

    #[test]
    fn test_malformed() {
        for source in ["", "a ==", "(a", "a b", "'open", "a & b", "a == == b", "#"] {
            assert!(Condition::parse(source).is_err(), "{source} should not parse");
        }
    }

    #[test]
    fn test_error_reports_offset() {
        let err = Condition::parse("a == 1 )").unwrap_err();
        assert_eq!(err.offset, 7);
    }

    #[test]
    fn test_truthy() {
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!(-1)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!([0])));
    }
}
