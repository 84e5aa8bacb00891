//! Recursive-descent parser producing an evaluable expression tree.

use regex::Regex;

use super::lexer::{tokenize, Token, TokenKind};
use super::{like_pattern_to_regex, Failure};
use crate::error::ParseError;

/// A failure attribute a rule can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Test,
    Reason,
}

impl Field {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "test" => Some(Field::Test),
            "reason" => Some(Field::Reason),
            _ => None,
        }
    }

    fn value<'a>(&self, failure: &'a Failure) -> &'a str {
        match self {
            Field::Test => &failure.test_id,
            Field::Reason => failure.reason.as_deref().unwrap_or(""),
        }
    }
}

/// A compiled boolean expression over failure attributes.
#[derive(Debug, Clone)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Equal { field: Field, value: String },
    In { field: Field, values: Vec<String> },
    Like { field: Field, pattern: Regex },
    RegexpContains { field: Field, pattern: Regex },
}

impl Expr {
    pub fn evaluate(&self, failure: &Failure) -> bool {
        match self {
            Expr::And(lhs, rhs) => lhs.evaluate(failure) && rhs.evaluate(failure),
            Expr::Or(lhs, rhs) => lhs.evaluate(failure) || rhs.evaluate(failure),
            Expr::Not(inner) => !inner.evaluate(failure),
            Expr::Equal { field, value } => field.value(failure) == value,
            Expr::In { field, values } => {
                let actual = field.value(failure);
                values.iter().any(|v| v == actual)
            }
            Expr::Like { field, pattern } | Expr::RegexpContains { field, pattern } => {
                pattern.is_match(field.value(failure))
            }
        }
    }
}

const RESERVED: &[&str] = &["AND", "OR", "NOT", "LIKE", "IN"];

pub(crate) fn parse_expr(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    if tokens.len() == 1 {
        return Err(ParseError::new("empty rule definition", 0));
    }
    let mut parser = Parser { tokens, cursor: 0 };
    let expr = parser.or_expr()?;
    let trailing = parser.peek();
    if trailing.kind != TokenKind::End {
        return Err(ParseError::new("unexpected trailing input", trailing.pos));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token stream always ends with End, and the cursor never passes it.
        &self.tokens[self.cursor.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::End {
            self.cursor += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_keyword(keyword) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), ParseError> {
        let token = self.advance();
        if token.kind == kind {
            Ok(())
        } else {
            Err(ParseError::new(format!("expected {}", what), token.pos))
        }
    }

    fn expect_string(&mut self) -> Result<(String, usize), ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Str(value) => Ok((value, token.pos)),
            _ => Err(ParseError::new("expected string literal", token.pos)),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and_expr()?;
        while self.eat_keyword("OR") {
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        while self.eat_keyword("AND") {
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::LParen => {
                let inner = self.or_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(ref name) if name.eq_ignore_ascii_case("REGEXP_CONTAINS") => {
                self.regexp_contains()
            }
            TokenKind::Ident(ref name) => {
                if RESERVED.iter().any(|kw| name.eq_ignore_ascii_case(kw)) {
                    return Err(ParseError::new(
                        format!("unexpected keyword {}", name),
                        token.pos,
                    ));
                }
                let field = Field::from_name(name).ok_or_else(|| {
                    ParseError::new(format!("unknown field '{}'", name), token.pos)
                })?;
                self.comparison(field)
            }
            TokenKind::End => Err(ParseError::new("unexpected end of input", token.pos)),
            _ => Err(ParseError::new("expected expression", token.pos)),
        }
    }

    fn field(&mut self) -> Result<Field, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Ident(ref name) => Field::from_name(name)
                .ok_or_else(|| ParseError::new(format!("unknown field '{}'", name), token.pos)),
            _ => Err(ParseError::new("expected field name", token.pos)),
        }
    }

    fn regexp_contains(&mut self) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LParen, "'(' after REGEXP_CONTAINS")?;
        let field = self.field()?;
        self.expect(TokenKind::Comma, "','")?;
        let (source, pos) = self.expect_string()?;
        self.expect(TokenKind::RParen, "')'")?;
        let pattern = Regex::new(&source)
            .map_err(|e| ParseError::new(format!("invalid regular expression: {}", e), pos))?;
        Ok(Expr::RegexpContains { field, pattern })
    }

    fn comparison(&mut self, field: Field) -> Result<Expr, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Eq => {
                let (value, _) = self.expect_string()?;
                Ok(Expr::Equal { field, value })
            }
            TokenKind::NotEq => {
                let (value, _) = self.expect_string()?;
                Ok(Expr::Not(Box::new(Expr::Equal { field, value })))
            }
            _ if token.is_keyword("NOT") => {
                let next = self.advance();
                let inner = if next.is_keyword("LIKE") {
                    self.like(field)?
                } else if next.is_keyword("IN") {
                    self.in_list(field)?
                } else {
                    return Err(ParseError::new("expected LIKE or IN after NOT", next.pos));
                };
                Ok(Expr::Not(Box::new(inner)))
            }
            _ if token.is_keyword("LIKE") => self.like(field),
            _ if token.is_keyword("IN") => self.in_list(field),
            _ => Err(ParseError::new(
                "expected comparison operator (=, !=, LIKE, IN)",
                token.pos,
            )),
        }
    }

    fn like(&mut self, field: Field) -> Result<Expr, ParseError> {
        let (source, pos) = self.expect_string()?;
        let regex_source =
            like_pattern_to_regex(&source).map_err(|e| ParseError::new(e.message, pos))?;
        let pattern = Regex::new(&regex_source)
            .map_err(|e| ParseError::new(format!("invalid LIKE pattern: {}", e), pos))?;
        Ok(Expr::Like { field, pattern })
    }

    fn in_list(&mut self, field: Field) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LParen, "'(' after IN")?;
        let mut values = vec![self.expect_string()?.0];
        loop {
            let token = self.advance();
            match token.kind {
                TokenKind::Comma => values.push(self.expect_string()?.0),
                TokenKind::RParen => break,
                _ => return Err(ParseError::new("expected ',' or ')'", token.pos)),
            }
        }
        Ok(Expr::In { field, values })
    }
}
