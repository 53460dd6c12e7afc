//! Recursive-descent parser producing the statement list of one submission

use crate::script::lexer::{Token, TokenKind};
use crate::types::{Diagnostic, SourceLocation, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 6,
        }
    }

    fn from_token(kind: &TokenKind) -> Option<Self> {
        Some(match kind {
            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus => BinaryOp::Sub,
            TokenKind::Star => BinaryOp::Mul,
            TokenKind::Slash => BinaryOp::Div,
            TokenKind::Percent => BinaryOp::Rem,
            TokenKind::EqEq => BinaryOp::Eq,
            TokenKind::NotEq => BinaryOp::Ne,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::LtEq => BinaryOp::Le,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::GtEq => BinaryOp::Ge,
            TokenKind::AndAnd => BinaryOp::And,
            TokenKind::OrOr => BinaryOp::Or,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value, SourceLocation),
    /// Possibly dotted name, e.g. `a` or `x.Length`
    Name(String, SourceLocation),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        location: SourceLocation,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        location: SourceLocation,
    },
    Call {
        target: String,
        args: Vec<Expr>,
        location: SourceLocation,
    },
    Await(Box<Expr>, SourceLocation),
}

impl Expr {
    pub fn location(&self) -> SourceLocation {
        match self {
            Expr::Literal(_, location)
            | Expr::Name(_, location)
            | Expr::Await(_, location)
            | Expr::Unary { location, .. }
            | Expr::Binary { location, .. }
            | Expr::Call { location, .. } => *location,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Using {
        namespace: String,
        location: SourceLocation,
    },
    Declare {
        name: String,
        init: Expr,
        location: SourceLocation,
    },
    Assign {
        name: String,
        op: AssignOp,
        value: Expr,
        location: SourceLocation,
    },
    Throw {
        exception: String,
        message: Option<Expr>,
        location: SourceLocation,
    },
    /// An expression statement; `trailing` marks a final expression with no
    /// semicolon, whose value becomes the submission's return value
    Expr { expr: Expr, trailing: bool },
}

/// Deepest expression nesting accepted; the checker and evaluator recurse on
/// the tree, so this bounds their stack use too
const MAX_NESTING_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    diagnostics: Vec<Diagnostic>,
}

type ParseResult<T> = Result<T, Diagnostic>;

impl Parser {
    fn peek(&self) -> &TokenKind {
        &self.token().kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn token(&self) -> &Token {
        // tokenize always ends with Eof, which is never consumed
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn location(&self) -> SourceLocation {
        self.token().location
    }

    fn advance(&mut self) -> Token {
        let token = self.token().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, code: &str) -> ParseResult<()> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(Diagnostic::error(code, format!("{} expected", kind.describe()))
                .at(self.location()))
        }
    }

    fn expect_semi(&mut self) -> ParseResult<()> {
        if self.eat(&TokenKind::Semi) {
            Ok(())
        } else {
            Err(self.semi_expected())
        }
    }

    fn semi_expected(&self) -> Diagnostic {
        Diagnostic::error("CS1002", "; expected").at(self.location())
    }

    fn ident(&mut self) -> ParseResult<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(Diagnostic::error("CS1001", "Identifier expected").at(self.location())),
        }
    }

    fn qualified_ident(&mut self) -> ParseResult<String> {
        let mut name = self.ident()?;
        while self.check(&TokenKind::Dot) {
            self.advance();
            name.push('.');
            name.push_str(&self.ident()?);
        }
        Ok(name)
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(Diagnostic::error(
                "CS8078",
                "An expression is too long or complex to compile",
            )
            .at(self.location()));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// Skip past the next `;` so parsing can resume at a statement boundary
    fn synchronize(&mut self) {
        loop {
            match self.advance().kind {
                TokenKind::Semi | TokenKind::Eof => return,
                _ => {}
            }
        }
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        let location = self.location();
        match self.peek() {
            TokenKind::Using => {
                self.advance();
                let namespace = self.qualified_ident()?;
                self.expect_semi()?;
                Ok(Stmt::Using {
                    namespace,
                    location,
                })
            }
            TokenKind::Var => {
                self.advance();
                let name = self.ident()?;
                self.expect(TokenKind::Assign, "CS0818")
                    .map_err(|d| Diagnostic {
                        message: "Implicitly-typed variables must be initialized".into(),
                        ..d
                    })?;
                let init = self.expression()?;
                self.expect_semi()?;
                Ok(Stmt::Declare {
                    name,
                    init,
                    location,
                })
            }
            TokenKind::Throw => {
                self.advance();
                self.expect(TokenKind::New, "CS1525")?;
                let exception = self.qualified_ident()?;
                self.expect(TokenKind::LParen, "CS1003")?;
                let message = if self.check(&TokenKind::RParen) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(TokenKind::RParen, "CS1026")?;
                self.expect_semi()?;
                Ok(Stmt::Throw {
                    exception,
                    message,
                    location,
                })
            }
            TokenKind::Ident(name)
                if matches!(
                    self.peek_at(1),
                    TokenKind::Assign | TokenKind::PlusAssign | TokenKind::MinusAssign
                ) =>
            {
                let name = name.clone();
                self.advance();
                let op = match self.advance().kind {
                    TokenKind::PlusAssign => AssignOp::Add,
                    TokenKind::MinusAssign => AssignOp::Sub,
                    _ => AssignOp::Set,
                };
                let value = self.expression()?;
                self.expect_semi()?;
                Ok(Stmt::Assign {
                    name,
                    op,
                    value,
                    location,
                })
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&TokenKind::Semi) {
                    Ok(Stmt::Expr {
                        expr,
                        trailing: false,
                    })
                } else if self.check(&TokenKind::Eof) {
                    Ok(Stmt::Expr {
                        expr,
                        trailing: true,
                    })
                } else {
                    Err(self.semi_expected())
                }
            }
        }
    }

    fn expression(&mut self) -> ParseResult<Expr> {
        self.binary(0)
    }

    fn binary(&mut self, min_precedence: u8) -> ParseResult<Expr> {
        self.nested(|parser| {
            let mut lhs = parser.unary()?;
            while let Some(op) = BinaryOp::from_token(parser.peek()) {
                if op.precedence() <= min_precedence {
                    break;
                }
                let location = parser.advance().location;
                let rhs = parser.binary(op.precedence())?;
                lhs = Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                    location,
                };
            }
            Ok(lhs)
        })
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        self.nested(|parser| {
            let location = parser.location();
            let op = match parser.peek() {
                TokenKind::Minus => UnaryOp::Neg,
                TokenKind::Bang => UnaryOp::Not,
                TokenKind::Await => {
                    parser.advance();
                    let operand = parser.unary()?;
                    return Ok(Expr::Await(Box::new(operand), location));
                }
                _ => return parser.primary(),
            };
            parser.advance();
            let operand = parser.unary()?;
            Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                location,
            })
        })
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let location = self.location();
        let literal = match self.peek().clone() {
            TokenKind::Int(n) => Some(Value::Int(n)),
            TokenKind::Str(s) => Some(Value::Str(s)),
            TokenKind::True => Some(Value::Bool(true)),
            TokenKind::False => Some(Value::Bool(false)),
            TokenKind::Null => Some(Value::Null),
            _ => None,
        };
        if let Some(value) = literal {
            self.advance();
            return Ok(Expr::Literal(value, location));
        }

        match self.peek() {
            TokenKind::LParen => {
                self.advance();
                let inner = self.nested(Self::expression)?;
                self.expect(TokenKind::RParen, "CS1026")?;
                Ok(inner)
            }
            TokenKind::Ident(_) => {
                let name = self.qualified_ident()?;
                if !self.eat(&TokenKind::LParen) {
                    return Ok(Expr::Name(name, location));
                }
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RParen, "CS1026")?;
                Ok(Expr::Call {
                    target: name,
                    args,
                    location,
                })
            }
            other => Err(Diagnostic::error(
                "CS1525",
                format!("Invalid expression term '{}'", other.describe()),
            )
            .at(location)),
        }
    }
}

/// Parse a token stream into statements
///
/// Recovers at statement boundaries so every syntax error in the
/// submission is reported.
pub fn parse(tokens: Vec<Token>) -> Result<Vec<Stmt>, Vec<Diagnostic>> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        diagnostics: Vec::new(),
    };
    let mut statements = Vec::new();

    while !parser.check(&TokenKind::Eof) {
        if parser.eat(&TokenKind::Semi) {
            continue;
        }
        match parser.statement() {
            Ok(stmt) => statements.push(stmt),
            Err(diagnostic) => {
                parser.diagnostics.push(diagnostic);
                parser.synchronize();
            }
        }
    }

    if parser.diagnostics.is_empty() {
        Ok(statements)
    } else {
        Err(parser.diagnostics)
    }
}
