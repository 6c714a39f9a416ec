//! Pratt parser producing the path expression tree.

use super::tokenizer::Token;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Boolean(bool),
    String(String),
    Integer(i64),
    Decimal(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Equal,
    NotEqual,
    And,
    Or,
    Union,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Field name or type name, evaluated against the current input.
    Identifier(String),
    This,
    Literal(Literal),
    Member(Box<Expr>, String),
    Function {
        base: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
    },
    Index(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Type specifier carried by `as(X)`, `ofType(FHIR.X)` and `is(X)`.
    pub fn type_specifier(&self) -> Option<&str> {
        match self {
            Expr::Identifier(name) => Some(name),
            Expr::Member(_, name) => Some(name),
            _ => None,
        }
    }
}

/// Binding strength, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Or,
    And,
    Equality,
    Union,
}

fn binary_operator(token: &Token) -> Option<(BinaryOp, Precedence)> {
    match token {
        Token::Or => Some((BinaryOp::Or, Precedence::Or)),
        Token::And => Some((BinaryOp::And, Precedence::And)),
        Token::Equal | Token::Equivalent => Some((BinaryOp::Equal, Precedence::Equality)),
        Token::NotEqual => Some((BinaryOp::NotEqual, Precedence::Equality)),
        Token::Union => Some((BinaryOp::Union, Precedence::Union)),
        _ => None,
    }
}

pub struct PrattParser {
    tokens: Vec<Token>,
    position: usize,
}

impl PrattParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, position: 0 }
    }

    /// Parses a whole expression and rejects trailing tokens.
    pub fn parse(mut self) -> Result<Expr, String> {
        let expr = self.parse_expression(Precedence::Lowest)?;
        match self.current() {
            Token::Eof => Ok(expr),
            other => Err(format!("unexpected trailing token {other:?}")),
        }
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        if *self.current() == expected {
            self.advance();
            Ok(())
        } else {
            Err(format!("expected {expected:?}, found {:?}", self.current()))
        }
    }

    fn parse_expression(&mut self, min: Precedence) -> Result<Expr, String> {
        let primary = self.parse_primary()?;
        let mut left = self.parse_postfix(primary)?;

        while let Some((op, precedence)) = binary_operator(self.current()) {
            if precedence <= min {
                break;
            }
            self.advance();
            let right = self.parse_expression(precedence)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Token::Identifier(name) => {
                if *self.current() == Token::LeftParen {
                    let args = self.parse_arguments()?;
                    Ok(Expr::Function {
                        base: None,
                        name,
                        args,
                    })
                } else {
                    Ok(Expr::Identifier(name))
                }
            }
            Token::Variable(name) if name == "this" => Ok(Expr::This),
            Token::Variable(name) => Err(format!("unsupported variable ${name}")),
            Token::String(s) => Ok(Expr::Literal(Literal::String(s))),
            Token::Integer(i) => Ok(Expr::Literal(Literal::Integer(i))),
            Token::Decimal(d) => Ok(Expr::Literal(Literal::Decimal(d))),
            Token::Boolean(b) => Ok(Expr::Literal(Literal::Boolean(b))),
            Token::LeftParen => {
                let inner = self.parse_expression(Precedence::Lowest)?;
                self.expect(Token::RightParen)?;
                Ok(inner)
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn parse_postfix(&mut self, mut left: Expr) -> Result<Expr, String> {
        loop {
            match self.current() {
                Token::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        Token::Identifier(name) => name,
                        other => {
                            return Err(format!("expected member name after '.', found {other:?}"))
                        }
                    };
                    left = if *self.current() == Token::LeftParen {
                        let args = self.parse_arguments()?;
                        Expr::Function {
                            base: Some(Box::new(left)),
                            name,
                            args,
                        }
                    } else {
                        Expr::Member(Box::new(left), name)
                    };
                }
                Token::LeftBracket => {
                    self.advance();
                    let index = self.parse_expression(Precedence::Lowest)?;
                    self.expect(Token::RightBracket)?;
                    left = Expr::Index(Box::new(left), Box::new(index));
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, String> {
        self.expect(Token::LeftParen)?;
        let mut args = Vec::new();
        if *self.current() == Token::RightParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression(Precedence::Lowest)?);
            match self.advance() {
                Token::Comma => continue,
                Token::RightParen => return Ok(args),
                other => return Err(format!("expected ',' or ')', found {other:?}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tokenizer::tokenize;
    use super::*;

    fn parse(text: &str) -> Expr {
        PrattParser::new(tokenize(text).expect("tokens"))
            .parse()
            .expect("expression")
    }

    #[test]
    fn member_chain_with_function() {
        let expr = parse("Observation.code.coding.first()");
        match expr {
            Expr::Function { base: Some(_), name, args } => {
                assert_eq!(name, "first");
                assert!(args.is_empty());
            }
            other => panic!("expected function call, got {other:?}"),
        }
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("a = 'x' or b = 'y' and c = 'z'");
        match expr {
            Expr::Binary(BinaryOp::Or, _, right) => {
                assert!(matches!(*right, Expr::Binary(BinaryOp::And, _, _)));
            }
            other => panic!("expected or at the top, got {other:?}"),
        }
    }

    #[test]
    fn type_specifier_arguments() {
        let expr = parse("value.as(FHIR.Quantity)");
        match expr {
            Expr::Function { name, args, .. } => {
                assert_eq!(name, "as");
                assert_eq!(args[0].type_specifier(), Some("Quantity"));
            }
            other => panic!("expected as(), got {other:?}"),
        }
    }

    #[test]
    fn dangling_dot_is_rejected() {
        let err = PrattParser::new(tokenize("code.").expect("tokens"))
            .parse()
            .expect_err("should fail");
        assert!(err.contains("member name"));
    }
}
