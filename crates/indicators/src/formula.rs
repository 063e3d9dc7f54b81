//! Custom calculation formulas.
//!
//! A formula is an arithmetic expression over named variables, where each
//! variable binds an aggregation (sum, average, count, min, max) over the
//! value series, optionally restricted to one disaggregation slice. Example:
//!
//! ```text
//! expression: "served / target * 100"
//! variables:  served = sum(category = "status", subcategory = "served")
//!             target = sum()
//! ```
//!
//! Grammar (recursive descent, no external parser):
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/') factor)*
//! factor := NUMBER | IDENT | '-' factor | '(' expr ')'
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::calculation::{AggregateFn, SliceFilter};

/// One named binding available to the expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaVariable {
    pub name: String,
    pub aggregate: AggregateFn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<SliceFilter>,
}

/// A stored custom calculation: expression source plus its variable list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub expression: String,
    pub variables: Vec<FormulaVariable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormulaError {
    /// A character the tokenizer does not understand, with its byte offset.
    UnexpectedChar { pos: usize, ch: char },
    /// A token out of place, with its byte offset.
    UnexpectedToken { pos: usize, token: String },
    /// Expression ended mid-parse.
    UnexpectedEnd,
    /// The expression references a variable that is not declared.
    UnknownVariable(String),
    DivisionByZero,
}

impl core::fmt::Display for FormulaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FormulaError::UnexpectedChar { pos, ch } => {
                write!(f, "unexpected character '{ch}' at offset {pos}")
            }
            FormulaError::UnexpectedToken { pos, token } => {
                write!(f, "unexpected token '{token}' at offset {pos}")
            }
            FormulaError::UnexpectedEnd => write!(f, "unexpected end of expression"),
            FormulaError::UnknownVariable(name) => write!(f, "unknown variable '{name}'"),
            FormulaError::DivisionByZero => write!(f, "division by zero"),
        }
    }
}

impl std::error::Error for FormulaError {}

impl Formula {
    /// Parse and check that every referenced identifier is declared.
    pub fn validate(&self) -> Result<(), FormulaError> {
        let expr = parse(&self.expression)?;
        let declared: Vec<&str> = self.variables.iter().map(|v| v.name.as_str()).collect();
        expr.check_vars(&declared)
    }

    /// Evaluate against concrete variable bindings.
    pub fn evaluate(&self, bindings: &HashMap<String, f64>) -> Result<f64, FormulaError> {
        parse(&self.expression)?.eval(bindings)
    }
}

// ── Tokens ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Ident(s) => s.clone(),
            Token::Plus => "+".to_string(),
            Token::Minus => "-".to_string(),
            Token::Star => "*".to_string(),
            Token::Slash => "/".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push((pos, Token::Plus));
            }
            '-' => {
                chars.next();
                tokens.push((pos, Token::Minus));
            }
            '*' => {
                chars.next();
                tokens.push((pos, Token::Star));
            }
            '/' => {
                chars.next();
                tokens.push((pos, Token::Slash));
            }
            '(' => {
                chars.next();
                tokens.push((pos, Token::LParen));
            }
            ')' => {
                chars.next();
                tokens.push((pos, Token::RParen));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut text = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number: f64 = text
                    .parse()
                    .map_err(|_| FormulaError::UnexpectedToken { pos, token: text.clone() })?;
                tokens.push((pos, Token::Number(number)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((pos, Token::Ident(text)));
            }
            _ => return Err(FormulaError::UnexpectedChar { pos, ch }),
        }
    }

    Ok(tokens)
}

// ── AST ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var(String),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, vars: &HashMap<String, f64>) -> Result<f64, FormulaError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Var(name) => vars
                .get(name)
                .copied()
                .ok_or_else(|| FormulaError::UnknownVariable(name.clone())),
            Expr::Neg(inner) => Ok(-inner.eval(vars)?),
            Expr::Add(a, b) => Ok(a.eval(vars)? + b.eval(vars)?),
            Expr::Sub(a, b) => Ok(a.eval(vars)? - b.eval(vars)?),
            Expr::Mul(a, b) => Ok(a.eval(vars)? * b.eval(vars)?),
            Expr::Div(a, b) => {
                let denom = b.eval(vars)?;
                if denom == 0.0 {
                    return Err(FormulaError::DivisionByZero);
                }
                Ok(a.eval(vars)? / denom)
            }
        }
    }

    fn check_vars(&self, declared: &[&str]) -> Result<(), FormulaError> {
        match self {
            Expr::Number(_) => Ok(()),
            Expr::Var(name) => {
                if declared.contains(&name.as_str()) {
                    Ok(())
                } else {
                    Err(FormulaError::UnknownVariable(name.clone()))
                }
            }
            Expr::Neg(inner) => inner.check_vars(declared),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.check_vars(declared)?;
                b.check_vars(declared)
            }
        }
    }
}

fn parse(src: &str) -> Result<Expr, FormulaError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if let Some((pos, token)) = parser.tokens.get(parser.pos) {
        return Err(FormulaError::UnexpectedToken {
            pos: *pos,
            token: token.describe(),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn bump(&mut self) -> Option<(usize, Token)> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.bump();
                    lhs = Expr::Add(Box::new(lhs), Box::new(self.term()?));
                }
                Some(Token::Minus) => {
                    self.bump();
                    lhs = Expr::Sub(Box::new(lhs), Box::new(self.term()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.bump();
                    lhs = Expr::Mul(Box::new(lhs), Box::new(self.factor()?));
                }
                Some(Token::Slash) => {
                    self.bump();
                    lhs = Expr::Div(Box::new(lhs), Box::new(self.factor()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn factor(&mut self) -> Result<Expr, FormulaError> {
        match self.bump() {
            Some((_, Token::Number(n))) => Ok(Expr::Number(n)),
            Some((_, Token::Ident(name))) => Ok(Expr::Var(name)),
            Some((_, Token::Minus)) => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some((_, Token::LParen)) => {
                let inner = self.expr()?;
                match self.bump() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((pos, token)) => Err(FormulaError::UnexpectedToken {
                        pos,
                        token: token.describe(),
                    }),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some((pos, token)) => Err(FormulaError::UnexpectedToken {
                pos,
                token: token.describe(),
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str, vars: &[(&str, f64)]) -> Result<f64, FormulaError> {
        let bindings: HashMap<String, f64> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        parse(src)?.eval(&bindings)
    }

    #[test]
    fn precedence_and_parens() {
        assert_eq!(eval("1 + 2 * 3", &[]).unwrap(), 7.0);
        assert_eq!(eval("(1 + 2) * 3", &[]).unwrap(), 9.0);
        assert_eq!(eval("10 - 4 - 3", &[]).unwrap(), 3.0);
        assert_eq!(eval("12 / 3 / 2", &[]).unwrap(), 2.0);
    }

    #[test]
    fn unary_minus() {
        assert_eq!(eval("-4 + 10", &[]).unwrap(), 6.0);
        assert_eq!(eval("2 * -3", &[]).unwrap(), -6.0);
        assert_eq!(eval("--5", &[]).unwrap(), 5.0);
    }

    #[test]
    fn variables_bind() {
        assert_eq!(
            eval("served / target * 100", &[("served", 30.0), ("target", 120.0)]).unwrap(),
            25.0
        );
    }

    #[test]
    fn unknown_variable_is_reported() {
        assert_eq!(
            eval("a + b", &[("a", 1.0)]),
            Err(FormulaError::UnknownVariable("b".to_string()))
        );
    }

    #[test]
    fn division_by_zero_is_reported() {
        assert_eq!(eval("1 / 0", &[]), Err(FormulaError::DivisionByZero));
        assert_eq!(eval("1 / (2 - 2)", &[]), Err(FormulaError::DivisionByZero));
    }

    #[test]
    fn parse_errors_carry_position() {
        assert_eq!(
            parse("1 + $"),
            Err(FormulaError::UnexpectedChar { pos: 4, ch: '$' })
        );
        assert!(matches!(
            parse("1 + "),
            Err(FormulaError::UnexpectedEnd)
        ));
        assert!(matches!(
            parse("1 2"),
            Err(FormulaError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse("(1 + 2"),
            Err(FormulaError::UnexpectedEnd)
        ));
    }

    #[test]
    fn formula_validate_checks_declared_variables() {
        let formula = Formula {
            expression: "served / total".to_string(),
            variables: vec![FormulaVariable {
                name: "served".to_string(),
                aggregate: AggregateFn::Sum,
                filter: None,
            }],
        };
        assert_eq!(
            formula.validate(),
            Err(FormulaError::UnknownVariable("total".to_string()))
        );
    }
}
