use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};
use crate::tags::store::{Subscription, TagKind, TagStore};
use crate::tags::structures::TagValue;

const OPERATORS: &str = "+-*/()<>=";

/// Splits a definition on the delimiter set `{space, + - * / ( ) < >}`,
/// keeping non-space delimiters as their own tokens. `=` is folded into
/// the same delimiter set so equality reads without requiring surrounding
/// whitespace.
pub fn tokenize(definition: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in definition.chars() {
        if c == ' ' || OPERATORS.contains(c) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            if c != ' ' {
                tokens.push(c.to_string());
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

pub fn is_identifier(token: &str) -> bool {
    token.chars().next().is_some_and(|c| c.is_alphabetic())
}

/// Walks the token stream, subscribes the expression to each distinct
/// identifier tag (so it re-evaluates when any of them change), and
/// records `usedtags` in first-seen order. Fails with `BadExpression` if
/// any identifier is unknown; nothing is subscribed in that case.
pub fn analyze(store: &TagStore, expr_key: &str) -> EngineResult<()> {
    let entry = store
        .get(expr_key)
        .ok_or_else(|| EngineError::UnknownTag(expr_key.to_string()))?;
    let TagKind::Expression(state) = &entry.kind else {
        return Err(EngineError::BadExpression(format!(
            "{expr_key} is not an expression"
        )));
    };

    let mut seen = HashSet::new();
    let mut usedtags = Vec::new();
    for token in &state.tokens {
        if is_identifier(token) {
            if store.get(token).is_none() {
                return Err(EngineError::BadExpression(format!(
                    "unknown tag '{token}' referenced by {expr_key}"
                )));
            }
            if seen.insert(token.clone()) {
                usedtags.push(token.clone());
            }
        }
    }

    for tag_key in &usedtags {
        store.subscribe(tag_key, Subscription::Reevaluate(expr_key.to_string()))?;
    }
    *state.usedtags.write() = usedtags;
    Ok(())
}

enum Token {
    Value(TagValue),
    Op(String),
}

/// Rebuilds the evaluation sequence by substituting each identifier token
/// with its tag's current value and evaluates it with standard
/// arithmetic/comparison semantics. If any referenced tag is null,
/// evaluation short-circuits to `TagValue::Null` rather than erroring.
pub fn evaluate(store: &TagStore, expr_key: &str) -> EngineResult<TagValue> {
    let entry = store
        .get(expr_key)
        .ok_or_else(|| EngineError::UnknownTag(expr_key.to_string()))?;
    let TagKind::Expression(state) = &entry.kind else {
        return Err(EngineError::BadExpression(format!(
            "{expr_key} is not an expression"
        )));
    };

    let mut stream = Vec::with_capacity(state.tokens.len());
    for token in &state.tokens {
        if is_identifier(token) {
            let tag = store
                .get(token)
                .ok_or_else(|| EngineError::Eval(format!("unknown tag '{token}'")))?;
            let v = tag.value.read().clone();
            if v.is_null() {
                return Ok(TagValue::Null);
            }
            stream.push(Token::Value(v));
        } else if token.len() == 1 && OPERATORS.contains(token.as_str()) {
            stream.push(Token::Op(token.clone()));
        } else if let Ok(i) = token.parse::<i64>() {
            stream.push(Token::Value(TagValue::Int(i)));
        } else if let Ok(f) = token.parse::<f64>() {
            stream.push(Token::Value(TagValue::Float(f)));
        } else {
            return Err(EngineError::Eval(format!(
                "invalid token '{token}' in '{}'",
                state.definition
            )));
        }
    }

    let mut parser = Parser {
        tokens: &stream,
        pos: 0,
    };
    let result = parser.parse_expr()?;
    if parser.pos != stream.len() {
        return Err(EngineError::Eval(format!(
            "trailing tokens in '{}'",
            state.definition
        )));
    }
    Ok(result)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek_op(&self) -> Option<&str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// comparisons/equality bind loosest, then `+ -`, then `* /`.
    fn parse_expr(&mut self) -> EngineResult<TagValue> {
        let mut left = self.parse_additive()?;
        while let Some(op) = self.peek_op() {
            if matches!(op, "=" | "<" | ">") {
                let op = op.to_string();
                self.pos += 1;
                let right = self.parse_additive()?;
                left = apply_comparison(&op, left, right)?;
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> EngineResult<TagValue> {
        let mut left = self.parse_term()?;
        loop {
            match self.peek_op() {
                Some("+") => {
                    self.pos += 1;
                    let right = self.parse_term()?;
                    left = apply_arith("+", left, right)?;
                }
                Some("-") => {
                    self.pos += 1;
                    let right = self.parse_term()?;
                    left = apply_arith("-", left, right)?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> EngineResult<TagValue> {
        let mut left = self.parse_factor()?;
        loop {
            match self.peek_op() {
                Some("*") => {
                    self.pos += 1;
                    let right = self.parse_factor()?;
                    left = apply_arith("*", left, right)?;
                }
                Some("/") => {
                    self.pos += 1;
                    let right = self.parse_factor()?;
                    left = apply_arith("/", left, right)?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> EngineResult<TagValue> {
        match self.tokens.get(self.pos) {
            Some(Token::Value(v)) => {
                self.pos += 1;
                Ok(v.clone())
            }
            Some(Token::Op(s)) if s == "(" => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                match self.tokens.get(self.pos) {
                    Some(Token::Op(s)) if s == ")" => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(EngineError::Eval("unbalanced parentheses".to_string())),
                }
            }
            _ => Err(EngineError::Eval("unexpected token in expression".to_string())),
        }
    }
}

fn apply_arith(op: &str, l: TagValue, r: TagValue) -> EngineResult<TagValue> {
    if let (TagValue::Int(a), TagValue::Int(b)) = (&l, &r) {
        let (a, b) = (*a, *b);
        return match op {
            "+" => Ok(TagValue::Int(a + b)),
            "-" => Ok(TagValue::Int(a - b)),
            "*" => Ok(TagValue::Int(a * b)),
            "/" if b == 0 => Err(EngineError::Eval("division by zero".to_string())),
            "/" => Ok(TagValue::Int(a / b)),
            _ => unreachable!(),
        };
    }

    let a = l
        .as_f64()
        .ok_or_else(|| EngineError::Eval("non-numeric operand".to_string()))?;
    let b = r
        .as_f64()
        .ok_or_else(|| EngineError::Eval("non-numeric operand".to_string()))?;
    match op {
        "+" => Ok(TagValue::Float(a + b)),
        "-" => Ok(TagValue::Float(a - b)),
        "*" => Ok(TagValue::Float(a * b)),
        "/" if b == 0.0 => Err(EngineError::Eval("division by zero".to_string())),
        "/" => Ok(TagValue::Float(a / b)),
        _ => unreachable!(),
    }
}

fn apply_comparison(op: &str, l: TagValue, r: TagValue) -> EngineResult<TagValue> {
    match op {
        "=" => Ok(TagValue::Bool(values_equal(&l, &r))),
        "<" | ">" => {
            let a = l
                .as_f64()
                .ok_or_else(|| EngineError::Eval("non-numeric comparison operand".to_string()))?;
            let b = r
                .as_f64()
                .ok_or_else(|| EngineError::Eval("non-numeric comparison operand".to_string()))?;
            Ok(TagValue::Bool(if op == "<" { a < b } else { a > b }))
        }
        _ => unreachable!(),
    }
}

fn values_equal(l: &TagValue, r: &TagValue) -> bool {
    match (l, r) {
        (TagValue::Str(a), TagValue::Str(b)) => a == b,
        (TagValue::Bool(a), TagValue::Bool(b)) => a == b,
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => l == r,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_spaced_comparison() {
        let tokens = tokenize("t > 100");
        assert_eq!(tokens, vec!["t", ">", "100"]);
    }

    #[test]
    fn tokenizes_dense_arithmetic() {
        let tokens = tokenize("2+3*4");
        assert_eq!(tokens, vec!["2", "+", "3", "*", "4"]);
    }

    #[test]
    fn evaluates_constant_expression() {
        let store = TagStore::new();
        let tokens = tokenize("2 + 3 * 4");
        store.create_expression("e", "", "2 + 3 * 4", tokens, false);
        analyze(&store, "e").unwrap();
        let v = evaluate(&store, "e").unwrap();
        assert_eq!(v, TagValue::Int(14));
    }
}
