//! Expression Parser
//!
//! Tokenizes and parses the expression language used inside `${{ }}`
//! and `if:` conditions into an [`Expr`] tree.
//!
//! Precedence, lowest first: `||`, `&&`, `==`/`!=`, `<`/`<=`/`>`/`>=`,
//! unary `!`, then property access, indexing and calls.

use serde_json::{Number, Value};

use crate::error::{Result, RunnerError};

/// Deepest tree accepted, counting parentheses, operators and arguments.
const MAX_DEPTH: usize = 50;

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Top-level context name (`matrix`, `env`, ...)
    Context(String),
    Property(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Not(Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// True if the expression calls `success()`, `failure()`,
    /// `always()` or `cancelled()` anywhere.
    pub fn uses_status_function(&self) -> bool {
        match self {
            Expr::Call(name, args) => {
                matches!(
                    name.to_ascii_lowercase().as_str(),
                    "success" | "failure" | "always" | "cancelled"
                ) || args.iter().any(Expr::uses_status_function)
            }
            Expr::Property(inner, _) | Expr::Not(inner) => inner.uses_status_function(),
            Expr::Index(a, b) | Expr::Compare(a, _, b) | Expr::And(a, b) | Expr::Or(a, b) => {
                a.uses_status_function() || b.uses_status_function()
            }
            Expr::Literal(_) | Expr::Context(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Not,
    Cmp(CompareOp),
    And,
    Or,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let err = |message: String| RunnerError::expression(source, message);
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' if !chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CompareOp::Eq));
                i += 2;
            }
            '<' | '>' => {
                let with_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, with_eq) {
                    ('<', true) => CompareOp::Le,
                    ('<', false) => CompareOp::Lt,
                    (_, true) => CompareOp::Ge,
                    (_, false) => CompareOp::Gt,
                };
                tokens.push(Token::Cmp(op));
                i += if with_eq { 2 } else { 1 };
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string literal".to_string())),
                        // '' is an escaped quote
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            text.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '.' || (c == '-' && is_number_start(&chars, i + 1)) => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '+'
                        || (chars[i] == '-' && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = parse_number(&text)
                    .ok_or_else(|| err(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(err(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

fn is_number_start(chars: &[char], index: usize) -> bool {
    chars.get(index).is_some_and(|c| c.is_ascii_digit() || *c == '.')
}

fn parse_number(text: &str) -> Option<f64> {
    if let Some(hex) = text.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    text.parse::<f64>().ok()
}

/// Parses expression source into a tree.
pub fn parse(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(RunnerError::expression(source, "empty expression"));
    }

    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;

    if parser.pos != parser.tokens.len() {
        return Err(parser.error(format!(
            "unexpected token {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> RunnerError {
        RunnerError::expression(self.source, message)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.error(format!("expected {:?}, found {:?}", expected, token))),
            None => Err(self.error(format!("expected {:?}, found end of expression", expected))),
        }
    }

    /// Counts one level of tree depth; callers restore `depth` when done.
    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!(
                "expression nested deeper than {} levels",
                MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let saved = self.depth;
        self.enter()?;
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            self.enter()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = saved;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let saved = self.depth;
        let mut left = self.parse_equality()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            self.enter()?;
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = saved;
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let saved = self.depth;
        let mut left = self.parse_comparison()?;
        while let Some(Token::Cmp(op @ (CompareOp::Eq | CompareOp::Ne))) = self.peek().cloned() {
            self.pos += 1;
            self.enter()?;
            let right = self.parse_comparison()?;
            left = Expr::Compare(Box::new(left), op, Box::new(right));
        }
        self.depth = saved;
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let saved = self.depth;
        let mut left = self.parse_unary()?;
        while let Some(Token::Cmp(
            op @ (CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge),
        )) = self.peek().cloned()
        {
            self.pos += 1;
            self.enter()?;
            let right = self.parse_unary()?;
            left = Expr::Compare(Box::new(left), op, Box::new(right));
        }
        self.depth = saved;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let saved = self.depth;
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth = saved;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek().cloned() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => {
                            expr = Expr::Property(Box::new(expr), name);
                        }
                        other => {
                            return Err(self.error(format!(
                                "expected property name after '.', found {:?}",
                                other
                            )))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Number::from_f64(n)
                .map(|num| Expr::Literal(Value::Number(num)))
                .ok_or_else(|| self.error("number out of range")),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let args = self.parse_arguments()?;
                    return Ok(Expr::Call(name, args));
                }
                Ok(match name.as_str() {
                    "true" => Expr::Literal(Value::Bool(true)),
                    "false" => Expr::Literal(Value::Bool(false)),
                    "null" => Expr::Literal(Value::Null),
                    _ => Expr::Context(name),
                })
            }
            Some(token) => Err(self.error(format!("unexpected token {:?}", token))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                other => {
                    return Err(self.error(format!(
                        "expected ',' or ')' in argument list, found {:?}",
                        other
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(name: &str) -> Box<Expr> {
        Box::new(Expr::Context(name.to_string()))
    }

    #[test]
    fn test_property_chain_with_hyphen() {
        let expr = parse("matrix.python-version").unwrap();
        assert_eq!(
            expr,
            Expr::Property(context("matrix"), "python-version".to_string())
        );
    }

    #[test]
    fn test_index_access() {
        let expr = parse("steps['build'].outcome").unwrap();
        assert_eq!(
            expr,
            Expr::Property(
                Box::new(Expr::Index(
                    context("steps"),
                    Box::new(Expr::Literal(json!("build")))
                )),
                "outcome".to_string()
            )
        );
    }

    #[test]
    fn test_string_escape() {
        assert_eq!(
            parse("'it''s'").unwrap(),
            Expr::Literal(json!("it's"))
        );
    }

    #[test]
    fn test_precedence() {
        // a || b && c  ==  a || (b && c)
        let expr = parse("a || b && c").unwrap();
        match expr {
            Expr::Or(_, right) => assert!(matches!(*right, Expr::And(_, _))),
            other => panic!("unexpected tree {:?}", other),
        }

        // !a == b  ==  (!a) == b
        let expr = parse("!a == b").unwrap();
        assert!(matches!(expr, Expr::Compare(_, CompareOp::Eq, _)));
    }

    #[test]
    fn test_call_with_arguments() {
        let expr = parse("hashFiles('requirements.txt', '**/setup.py') != ''").unwrap();
        match expr {
            Expr::Compare(left, CompareOp::Ne, _) => match *left {
                Expr::Call(name, args) => {
                    assert_eq!(name, "hashFiles");
                    assert_eq!(args.len(), 2);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse("3.10").unwrap(), Expr::Literal(json!(3.1)));
        assert_eq!(parse("-2").unwrap(), Expr::Literal(json!(-2.0)));
        assert_eq!(parse("0xff").unwrap(), Expr::Literal(json!(255.0)));
    }

    #[test]
    fn test_keywords() {
        assert_eq!(parse("true").unwrap(), Expr::Literal(json!(true)));
        assert_eq!(parse("null").unwrap(), Expr::Literal(Value::Null));
    }

    #[test]
    fn test_errors() {
        assert!(parse("").is_err());
        assert!(parse("'open").is_err());
        assert!(parse("a ==").is_err());
        assert!(parse("f(a b)").is_err());
        assert!(parse("a = b").is_err());
        assert!(parse("matrix.").is_err());
        assert!(parse("(a").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let shallow = format!("{}true{}", "(".repeat(10), ")".repeat(10));
        assert!(parse(&shallow).is_ok());

        let deep = format!("{}true{}", "(".repeat(100_000), ")".repeat(100_000));
        let err = parse(&deep).unwrap_err();
        assert!(matches!(err, RunnerError::Expression { .. }));
        assert!(err.to_string().contains("nested deeper than"));

        assert!(parse(&format!("{}true", "!".repeat(100_000))).is_err());
        assert!(parse(&vec!["a"; 1_000].join(" || ")).is_err());
        assert!(parse(&vec!["a"; 10].join(" || ")).is_ok());
    }

    #[test]
    fn test_uses_status_function() {
        assert!(parse("always()").unwrap().uses_status_function());
        assert!(parse("failure() && github.ref == 'main'").unwrap().uses_status_function());
        assert!(!parse("github.ref == 'main'").unwrap().uses_status_function());
        assert!(!parse("hashFiles('a') != ''").unwrap().uses_status_function());
    }
}
