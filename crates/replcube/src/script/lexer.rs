//! Tokenizer for the script language

use crate::types::{Diagnostic, SourceLocation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Str(String),

    // keywords
    Var,
    True,
    False,
    Null,
    Using,
    Await,
    Throw,
    New,

    Semi,
    Comma,
    Dot,
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    PlusAssign,
    MinusAssign,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,

    Eof,
}

impl TokenKind {
    /// Source spelling, used in diagnostics
    pub fn describe(&self) -> String {
        let text = match self {
            TokenKind::Ident(name) => return name.clone(),
            TokenKind::Int(n) => return n.to_string(),
            TokenKind::Str(_) => "string literal",
            TokenKind::Var => "var",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Null => "null",
            TokenKind::Using => "using",
            TokenKind::Await => "await",
            TokenKind::Throw => "throw",
            TokenKind::New => "new",
            TokenKind::Semi => ";",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Bang => "!",
            TokenKind::Assign => "=",
            TokenKind::PlusAssign => "+=",
            TokenKind::MinusAssign => "-=",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Eof => "end of input",
        };
        text.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub location: SourceLocation,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
            diagnostics: Vec::new(),
        }
    }

    fn location(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn error(&mut self, code: &str, message: String, location: SourceLocation) {
        self.diagnostics
            .push(Diagnostic::error(code, message).at(location));
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    match ahead.next() {
                        Some('/') => {
                            while !matches!(self.peek(), None | Some('\n')) {
                                self.bump();
                            }
                        }
                        Some('*') => {
                            let start = self.location();
                            self.bump();
                            self.bump();
                            let mut closed = false;
                            while let Some(c) = self.bump() {
                                if c == '*' && self.eat('/') {
                                    closed = true;
                                    break;
                                }
                            }
                            if !closed {
                                self.error("CS1035", "End-of-file found, '*/' expected".into(), start);
                            }
                        }
                        _ => return,
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self, start: SourceLocation) -> Option<String> {
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    self.error("CS1010", "Newline in constant".into(), start);
                    return None;
                }
                Some('"') => {
                    self.bump();
                    return Some(value);
                }
                Some('\\') => {
                    self.bump();
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some('\'') => '\'',
                        _ => {
                            self.error(
                                "CS1009",
                                "Unrecognized escape sequence".into(),
                                start,
                            );
                            continue;
                        }
                    };
                    value.push(escaped);
                }
                Some(c) => {
                    self.bump();
                    value.push(c);
                }
            }
        }
    }

    fn number(&mut self, first: char, start: SourceLocation) -> Option<i64> {
        let mut digits = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.bump();
            } else if c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        match digits.parse::<i64>() {
            Ok(n) => Some(n),
            Err(_) => {
                self.error("CS1021", "Integral constant is too large".into(), start);
                None
            }
        }
    }

    fn word(&mut self, first: char) -> TokenKind {
        let mut word = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match word.as_str() {
            "var" => TokenKind::Var,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            "using" => TokenKind::Using,
            "await" => TokenKind::Await,
            "throw" => TokenKind::Throw,
            "new" => TokenKind::New,
            _ => TokenKind::Ident(word),
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        self.skip_trivia();
        let location = self.location();
        let Some(c) = self.bump() else {
            return Some(Token {
                kind: TokenKind::Eof,
                location,
            });
        };

        let kind = match c {
            ';' => TokenKind::Semi,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '+' if self.eat('=') => TokenKind::PlusAssign,
            '+' => TokenKind::Plus,
            '-' if self.eat('=') => TokenKind::MinusAssign,
            '-' => TokenKind::Minus,
            '!' if self.eat('=') => TokenKind::NotEq,
            '!' => TokenKind::Bang,
            '=' if self.eat('=') => TokenKind::EqEq,
            '=' => TokenKind::Assign,
            '<' if self.eat('=') => TokenKind::LtEq,
            '<' => TokenKind::Lt,
            '>' if self.eat('=') => TokenKind::GtEq,
            '>' => TokenKind::Gt,
            '&' if self.eat('&') => TokenKind::AndAnd,
            '|' if self.eat('|') => TokenKind::OrOr,
            '"' => TokenKind::Str(self.string(location)?),
            c if c.is_ascii_digit() => TokenKind::Int(self.number(c, location)?),
            c if c.is_alphabetic() || c == '_' => self.word(c),
            other => {
                self.error("CS1056", format!("Unexpected character '{other}'"), location);
                return None;
            }
        };
        Some(Token { kind, location })
    }
}

/// Split `source` into tokens, ending with [`TokenKind::Eof`]
///
/// Lexical errors are collected rather than stopping at the first one.
pub fn tokenize(source: &str) -> Result<Vec<Token>, Vec<Diagnostic>> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        if let Some(token) = lexer.next_token() {
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
    }
    if lexer.diagnostics.is_empty() {
        Ok(tokens)
    } else {
        Err(lexer.diagnostics)
    }
}
