//! Recursive-descent parser and evaluator for the condition sandbox.
//!
//! Grammar (precedence low to high):
//!
//! ```text
//! or_expr    := and_expr ( '||' and_expr )*
//! and_expr   := comparison ( '&&' comparison )*
//! comparison := atom ( comparator atom )?
//! atom       := '-'? NUMBER | 'true' | 'false' | '(' or_expr ')'
//! comparator := '===' | '!==' | '>' | '<' | '>=' | '<='
//! ```
//!
//! This is the entire language. There is no arithmetic beyond unary minus,
//! no function calls, no property access, no string literals -- by
//! construction, not by a denylist layered on top of a general evaluator.

use super::lexer::{tokenize, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError(pub String);

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn or_expr(&mut self) -> Result<Evaluated, ParseError> {
        let mut lhs = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.and_expr()?;
            lhs = Evaluated::Bool(as_bool(&lhs)? || as_bool(&rhs)?);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Evaluated, ParseError> {
        let mut lhs = self.comparison()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.comparison()?;
            lhs = Evaluated::Bool(as_bool(&lhs)? && as_bool(&rhs)?);
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Evaluated, ParseError> {
        let lhs = self.atom()?;
        let op = match self.peek() {
            Some(Token::EqEqEq) => Some(CmpOp::Eq),
            Some(Token::NotEqEq) => Some(CmpOp::Ne),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(lhs);
        };
        self.advance();
        let rhs = self.atom()?;
        Ok(Evaluated::Bool(apply_cmp(op, &lhs, &rhs)?))
    }

    fn atom(&mut self) -> Result<Evaluated, ParseError> {
        match self.advance() {
            Some(Token::Minus) => match self.advance() {
                Some(Token::Num(n)) => Ok(Evaluated::Num(-n)),
                _ => Err(ParseError("unary '-' must precede a number".to_string())),
            },
            Some(Token::Num(n)) => Ok(Evaluated::Num(*n)),
            Some(Token::True) => Ok(Evaluated::Bool(true)),
            Some(Token::False) => Ok(Evaluated::Bool(false)),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ParseError("unmatched '('".to_string())),
                }
            }
            other => Err(ParseError(format!("unexpected token: {other:?}"))),
        }
    }
}

#[derive(Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

fn apply_cmp(op: CmpOp, lhs: &Evaluated, rhs: &Evaluated) -> Result<bool, ParseError> {
    match (lhs, rhs) {
        (Evaluated::Num(a), Evaluated::Num(b)) => Ok(match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
        }),
        (Evaluated::Bool(a), Evaluated::Bool(b)) => match op {
            CmpOp::Eq => Ok(a == b),
            CmpOp::Ne => Ok(a != b),
            _ => Err(ParseError("ordering comparators require numbers".to_string())),
        },
        _ => Err(ParseError("cannot compare number with boolean".to_string())),
    }
}

fn as_bool(v: &Evaluated) -> Result<bool, ParseError> {
    match v {
        Evaluated::Bool(b) => Ok(*b),
        Evaluated::Num(_) => Err(ParseError(
            "'&&'/'||' operands must be boolean expressions".to_string(),
        )),
    }
}

/// Parse and evaluate `expr`, returning `false` on any lex/parse/type
/// error or trailing input, per the condition engine's "never throw"
/// contract. Callers that want the error for logging should use
/// [`evaluate_checked`].
pub fn evaluate(expr: &str) -> bool {
    evaluate_checked(expr)
        .map(|v| matches!(v, Evaluated::Bool(true)))
        .unwrap_or(false)
}

pub fn evaluate_checked(expr: &str) -> Result<Evaluated, String> {
    let tokens = tokenize(expr).map_err(|e| e.0)?;
    let mut parser = Parser::new(&tokens);
    let result = parser.or_expr().map_err(|e| e.0)?;
    if parser.pos != tokens.len() {
        return Err("trailing tokens after expression".to_string());
    }
    match result {
        Evaluated::Bool(_) => Ok(result),
        Evaluated::Num(_) => Err("a bare number is not a valid condition result".to_string()),
    }
}
