// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Container cost expressions.
//!
//! Each configured container carries a numeric expression evaluated over the size of the file
//! being uploaded and the duration it will be kept remotely; the engine picks the cheapest
//! container for every upload. Expressions support `+ - * /`, parentheses, unary minus, and the
//! variables below. Unknown variables are rejected at parse time, so a bad expression is fatal
//! at startup rather than at upload time.

use std::{fmt, str::FromStr, time::Duration};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

const KB: f64 = 1024.0;
const SECS_PER_HOUR: f64 = 3600.0;
const SECS_PER_DAY: f64 = 24.0 * SECS_PER_HOUR;

/// Error returned when parsing a cost expression.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CostError {
    /// Unexpected character in the expression.
    #[error("cost expression '{expr}': unexpected character '{found}'")]
    UnexpectedCharacter {
        /// The full expression.
        expr: String,
        /// The offending character.
        found: char,
    },
    /// The expression ends (or a token appears) where a value was expected.
    #[error("cost expression '{expr}': malformed expression")]
    Malformed {
        /// The full expression.
        expr: String,
    },
    /// The expression references a variable the evaluator does not provide.
    #[error("cost expression '{expr}': unknown variable '{name}'")]
    UnknownVariable {
        /// The full expression.
        expr: String,
        /// The unknown identifier.
        name: String,
    },
}

/// Variables available to cost expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variable {
    Size,
    SizeKb,
    SizeMb,
    SizeGb,
    SizeTb,
    DurationSecs,
    DurationHours,
    DurationDays,
    DurationMonths,
    DurationYears,
}

impl Variable {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "size" => Variable::Size,
            "size_KB" => Variable::SizeKb,
            "size_MB" => Variable::SizeMb,
            "size_GB" => Variable::SizeGb,
            "size_TB" => Variable::SizeTb,
            "duration_secs" => Variable::DurationSecs,
            "duration_hours" => Variable::DurationHours,
            "duration_days" => Variable::DurationDays,
            "duration_months" => Variable::DurationMonths,
            "duration_years" => Variable::DurationYears,
            _ => return None,
        })
    }

    fn resolve(self, size: u64, duration: Duration) -> f64 {
        let size = size as f64;
        let secs = duration.as_secs_f64();
        match self {
            Variable::Size => size,
            Variable::SizeKb => size / KB,
            Variable::SizeMb => size / (KB * KB),
            Variable::SizeGb => size / (KB * KB * KB),
            Variable::SizeTb => size / (KB * KB * KB * KB),
            Variable::DurationSecs => secs,
            Variable::DurationHours => secs / SECS_PER_HOUR,
            Variable::DurationDays => secs / SECS_PER_DAY,
            Variable::DurationMonths => secs / (30.0 * SECS_PER_DAY),
            Variable::DurationYears => secs / (365.0 * SECS_PER_DAY),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Variable(Variable),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl Expr {
    fn evaluate(&self, size: u64, duration: Duration) -> f64 {
        match self {
            Expr::Number(value) => *value,
            Expr::Variable(variable) => variable.resolve(size, duration),
            Expr::Negate(inner) => -inner.evaluate(size, duration),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = lhs.evaluate(size, duration);
                let rhs = rhs.evaluate(size, duration);
                match op {
                    BinaryOp::Add => lhs + rhs,
                    BinaryOp::Sub => lhs - rhs,
                    BinaryOp::Mul => lhs * rhs,
                    BinaryOp::Div => lhs / rhs,
                }
            }
        }
    }
}

/// A parsed, ready-to-evaluate cost expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CostExpression {
    source: String,
    expr: Expr,
}

impl CostExpression {
    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression for a file of `size` bytes kept remotely for `duration`.
    pub fn evaluate(&self, size: u64, duration: Duration) -> f64 {
        self.expr.evaluate(size, duration)
    }
}

impl FromStr for CostExpression {
    type Err = CostError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser::new(source)?;
        let expr = parser.expression()?;
        if parser.peek().is_some() {
            return Err(CostError::Malformed {
                expr: source.to_string(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }
}

impl fmt::Display for CostExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for CostExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for CostExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        source.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    LeftParen,
    RightParen,
}

struct Parser {
    source: String,
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, CostError> {
        let mut tokens = Vec::new();
        let mut chars = source.chars().peekable();
        while let Some(&c) = chars.peek() {
            match c {
                ' ' | '\t' => {
                    chars.next();
                }
                '+' => {
                    chars.next();
                    tokens.push(Token::Plus);
                }
                '-' => {
                    chars.next();
                    tokens.push(Token::Minus);
                }
                '*' => {
                    chars.next();
                    tokens.push(Token::Star);
                }
                '/' => {
                    chars.next();
                    tokens.push(Token::Slash);
                }
                '(' => {
                    chars.next();
                    tokens.push(Token::LeftParen);
                }
                ')' => {
                    chars.next();
                    tokens.push(Token::RightParen);
                }
                '0'..='9' | '.' => {
                    let mut literal = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_digit() || c == '.' {
                            literal.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let value = literal.parse().map_err(|_| CostError::Malformed {
                        expr: source.to_string(),
                    })?;
                    tokens.push(Token::Number(value));
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push(Token::Identifier(name));
                }
                found => {
                    return Err(CostError::UnexpectedCharacter {
                        expr: source.to_string(),
                        found,
                    });
                }
            }
        }
        Ok(Self {
            source: source.to_string(),
            tokens,
            position: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expression(&mut self) -> Result<Expr, CostError> {
        let mut expr = self.term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(BinaryOp::Add),
            Some(Token::Minus) => Some(BinaryOp::Sub),
            _ => None,
        } {
            self.advance();
            let rhs = self.term()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr, CostError> {
        let mut expr = self.factor()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(BinaryOp::Mul),
            Some(Token::Slash) => Some(BinaryOp::Div),
            _ => None,
        } {
            self.advance();
            let rhs = self.factor()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn factor(&mut self) -> Result<Expr, CostError> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::Identifier(name)) => Variable::from_name(&name)
                .map(Expr::Variable)
                .ok_or_else(|| CostError::UnknownVariable {
                    expr: self.source.clone(),
                    name,
                }),
            Some(Token::Minus) => Ok(Expr::Negate(Box::new(self.factor()?))),
            Some(Token::LeftParen) => {
                let expr = self.expression()?;
                match self.advance() {
                    Some(Token::RightParen) => Ok(expr),
                    _ => Err(CostError::Malformed {
                        expr: self.source.clone(),
                    }),
                }
            }
            _ => Err(CostError::Malformed {
                expr: self.source.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use barry_test_utils::param_test;

    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn days(count: u64) -> Duration {
        Duration::from_secs(count * 86_400)
    }

    param_test! {
        evaluates: [
            constant: ("1.5", 0, 0, 1.5),
            size_gb: ("size_GB", 10 * GB, 0, 10.0),
            gb_day_rate: ("size_GB * duration_days * 0.001", 10 * GB, 90, 0.9),
            hot: ("size_GB*1", 5 * GB, 30, 5.0),
            cold: ("size_GB*0.1 + duration_days*0.01", 5 * GB, 30, 0.8),
            precedence: ("1 + 2 * 3", 0, 0, 7.0),
            parentheses: ("(1 + 2) * 3", 0, 0, 9.0),
            unary_minus: ("-size_KB / 2", 2048, 0, -1.0),
        ]
    }
    fn evaluates(source: &str, size: u64, keep_days: u64, expected: f64) {
        let expr: CostExpression = source.parse().expect("expression should parse");
        let cost = expr.evaluate(size, days(keep_days));
        assert!(
            (cost - expected).abs() < 1e-9,
            "'{source}' evaluated to {cost}, expected {expected}"
        );
    }

    param_test! {
        rejects: [
            empty: (""),
            unknown_variable: ("size_PB * 2"),
            dangling_operator: ("size_GB *"),
            unbalanced_paren: ("(size_GB * 2"),
            bad_character: ("size_GB % 2"),
            double_number: ("1 2"),
        ]
    }
    fn rejects(source: &str) {
        source
            .parse::<CostExpression>()
            .expect_err("expression should be rejected");
    }

    #[test]
    fn roundtrips_through_serde() {
        let expr: CostExpression = "size_GB * 0.5".parse().expect("should parse");
        let json = serde_json::to_string(&expr).expect("should serialize");
        assert_eq!(json, "\"size_GB * 0.5\"");
        let back: CostExpression = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back, expr);
    }
}
