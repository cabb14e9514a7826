// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inventory filter expressions over the `Datacenter` and `Cluster` names.
//!
//! ```text
//! expr  := or
//! or    := and ('||' and)*
//! and   := unary ('&&' unary)*
//! unary := '!' unary | '(' expr ')' | cmp
//! cmp   := ident ('==' | '!=') string
//! ```

use std::fmt;

use crate::errors::FilterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Datacenter,
    Cluster,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp {
        field: Field,
        equal: bool,
        value: String,
    },
}

impl Expr {
    fn eval(&self, datacenter: &str, cluster: &str) -> bool {
        match self {
            Expr::Or(l, r) => l.eval(datacenter, cluster) || r.eval(datacenter, cluster),
            Expr::And(l, r) => l.eval(datacenter, cluster) && r.eval(datacenter, cluster),
            Expr::Not(e) => !e.eval(datacenter, cluster),
            Expr::Cmp {
                field,
                equal,
                value,
            } => {
                let actual = match field {
                    Field::Datacenter => datacenter,
                    Field::Cluster => cluster,
                };
                (actual == value) == *equal
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier {s}"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Eq => f.write_str("'=='"),
            Token::Ne => f.write_str("'!='"),
            Token::And => f.write_str("'&&'"),
            Token::Or => f.write_str("'||'"),
            Token::Not => f.write_str("'!'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '=' | '&' | '|' => {
                if chars.next_if(|&(_, next)| next == c).is_none() {
                    return Err(FilterError::UnexpectedChar { found: c, offset });
                }
                match c {
                    '=' => Token::Eq,
                    '&' => Token::And,
                    _ => Token::Or,
                }
            }
            '!' => {
                if chars.next_if(|&(_, next)| next == '=').is_some() {
                    Token::Ne
                } else {
                    Token::Not
                }
            }
            '\'' | '"' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, q)) if q == c => break,
                        Some((_, ch)) => value.push(ch),
                        None => return Err(FilterError::UnterminatedString(offset)),
                    }
                }
                Token::Str(value)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = c.to_string();
                while let Some((_, ch)) =
                    chars.next_if(|&(_, ch)| ch.is_alphanumeric() || ch == '_')
                {
                    ident.push(ch);
                }
                Token::Ident(ident)
            }
            found => return Err(FilterError::UnexpectedChar { found, offset }),
        };
        tokens.push(token);
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self, expected: &'static str) -> Result<Token, FilterError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| FilterError::UnexpectedToken {
                found: "end of expression".to_string(),
                expected,
            })?;
        self.pos += 1;
        Ok(token)
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.parse_and()?));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.parse_unary()?));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, FilterError> {
        match self.next("an expression")? {
            Token::Not => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.next("')'")? {
                    Token::RParen => Ok(inner),
                    other => Err(unexpected(other, "')'")),
                }
            }
            Token::Ident(name) => {
                let field = match name.as_str() {
                    "Datacenter" => Field::Datacenter,
                    "Cluster" => Field::Cluster,
                    _ => return Err(FilterError::UnknownIdentifier(name)),
                };
                let equal = match self.next("'==' or '!='")? {
                    Token::Eq => true,
                    Token::Ne => false,
                    other => return Err(unexpected(other, "'==' or '!='")),
                };
                match self.next("a string")? {
                    Token::Str(value) => Ok(Expr::Cmp {
                        field,
                        equal,
                        value,
                    }),
                    other => Err(unexpected(other, "a string")),
                }
            }
            other => Err(unexpected(other, "an expression")),
        }
    }
}

fn unexpected(token: Token, expected: &'static str) -> FilterError {
    FilterError::UnexpectedToken {
        found: token.to_string(),
        expected,
    }
}

/// A compiled filter. Datacenters and clusters it rejects are not traversed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryFilter {
    expr: Expr,
}

impl InventoryFilter {
    /// A blank expression means no filtering and yields `None`.
    pub fn parse(source: &str) -> Result<Option<Self>, FilterError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Ok(None);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(extra) = parser.peek() {
            return Err(unexpected(extra.clone(), "end of expression"));
        }
        Ok(Some(InventoryFilter { expr }))
    }

    pub fn matches(&self, datacenter: &str, cluster: &str) -> bool {
        self.expr.eval(datacenter, cluster)
    }
}
