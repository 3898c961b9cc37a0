//! Recursive-descent parser for logic formulas
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := NUMBER | STRING | 'true' | 'false' | VARIABLE
//!          | IDENT '(' [expr (',' expr)*] ')' | '(' expr ')'
//! ```

use serde_json::Value;

use super::lexer::{tokenize, Token, TokenKind};
use crate::error::FormulaError;

/// Deepest expression tree a formula may produce.
///
/// Parentheses, calls, unary minus and each chained operator add a level.
pub const MAX_DEPTH: usize = 128;

/// Binary arithmetic operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

/// Allow-listed formula functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Min,
    Max,
    Clamp,
    Abs,
    Round,
    Floor,
    Ceil,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "clamp" => Some(Function::Clamp),
            "abs" => Some(Function::Abs),
            "round" => Some(Function::Round),
            "floor" => Some(Function::Floor),
            "ceil" => Some(Function::Ceil),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Min => "min",
            Function::Max => "max",
            Function::Clamp => "clamp",
            Function::Abs => "abs",
            Function::Round => "round",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
        }
    }

    /// Accepted argument count as (min, max)
    fn arity(&self) -> (usize, usize) {
        match self {
            Function::Min | Function::Max => (1, usize::MAX),
            Function::Clamp => (3, 3),
            Function::Abs | Function::Round | Function::Floor | Function::Ceil => (1, 1),
        }
    }
}

/// Parsed formula expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Collect every variable the expression references, in source order
    pub fn variables(&self, out: &mut Vec<String>) {
        match self {
            Expr::Variable(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Negate(inner) => inner.variables(out),
            Expr::Binary { left, right, .. } => {
                left.variables(out);
                right.variables(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.variables(out)),
            Expr::Literal(_) => {}
        }
    }
}

/// Parse a formula into an expression tree
pub fn parse(source: &str) -> Result<Expr, FormulaError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(FormulaError::malformed(0, "empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.len(),
        depth: 0,
    };
    let expr = parser.expr()?;
    if let Some(token) = parser.peek() {
        return Err(FormulaError::malformed(token.offset, "unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
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

    fn offset(&self) -> usize {
        self.peek().map_or(self.end, |t| t.offset)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), FormulaError> {
        match self.next() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(FormulaError::malformed(token.offset, format!("expected {}", what))),
            None => Err(FormulaError::malformed(self.end, format!("expected {}", what))),
        }
    }

    fn enter(&mut self, offset: usize) -> Result<(), FormulaError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FormulaError::malformed(
                offset,
                format!("expression nested deeper than {} levels", MAX_DEPTH),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // Each operator in a chain adds one level to the left-leaning tree,
    // so chains count toward the depth limit like explicit nesting.
    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut left = self.term()?;
        let mut chain = 0;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Subtract,
                _ => break,
            };
            self.enter(self.offset())?;
            chain += 1;
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth -= chain;
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut left = self.unary()?;
        let mut chain = 0;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Star) => BinaryOp::Multiply,
                Some(TokenKind::Slash) => BinaryOp::Divide,
                _ => break,
            };
            self.enter(self.offset())?;
            chain += 1;
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth -= chain;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Minus)) {
            self.enter(self.offset())?;
            self.pos += 1;
            let inner = self.unary()?;
            self.leave();
            return Ok(Expr::Negate(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let offset = self.offset();
        let Some(token) = self.next() else {
            return Err(FormulaError::malformed(offset, "unexpected end of expression"));
        };

        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(super::number_value(n)?)),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Variable(name) => Ok(Expr::Variable(name)),
            TokenKind::LParen => {
                self.enter(token.offset)?;
                let inner = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                self.leave();
                Ok(inner)
            }
            TokenKind::Ident(name) => self.call(name, token.offset),
            _ => Err(FormulaError::malformed(token.offset, "expected a value")),
        }
    }

    fn call(&mut self, name: String, offset: usize) -> Result<Expr, FormulaError> {
        if !matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
            return Err(FormulaError::malformed(
                offset,
                format!("bare identifier '{}' (variables use {{{{name}}}})", name),
            ));
        }
        let function = Function::from_name(&name).ok_or(FormulaError::UnknownFunction(name))?;
        self.enter(offset)?;
        self.pos += 1;

        let mut args = Vec::new();
        if !matches!(self.peek().map(|t| &t.kind), Some(TokenKind::RParen)) {
            loop {
                args.push(self.expr()?);
                if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Comma)) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        self.leave();

        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("at least {}", min)
            };
            return Err(FormulaError::Arity {
                name: function.name().to_string(),
                expected,
                found: args.len(),
            });
        }
        Ok(Expr::Call { function, args })
    }
}
