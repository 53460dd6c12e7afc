//! Lexical scan of submitted source
//!
//! Extracts qualified names (`System.IO.File.ReadAllText`) and string literal
//! contents with their locations. Comments are skipped. Anything the scanner
//! cannot classify with certainty is reported as an error so the guard can
//! fail closed.

use crate::types::SourceLocation;

/// An item of interest found in source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanItem {
    /// Dotted identifier chain with whitespace and `::` separators collapsed to `.`
    QualifiedName {
        name: String,
        location: SourceLocation,
    },
    /// Decoded contents of a string literal
    StringLiteral {
        value: String,
        location: SourceLocation,
    },
}

/// Reasons a scan could not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanError {
    pub reason: &'static str,
    pub location: SourceLocation,
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

impl Scanner {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn location(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, reason: &'static str, location: SourceLocation) -> ScanError {
        ScanError { reason, location }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), ScanError> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                (Some('/'), Some('*')) => {
                    let start = self.location();
                    self.bump();
                    self.bump();
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some('*'), Some('/')) => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            (Some(_), _) => {
                                self.bump();
                            }
                            (None, _) => return Err(self.error("unterminated comment", start)),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn identifier(&mut self) -> String {
        let mut ident = String::new();
        // verbatim identifiers (@class) name the same symbol as the bare word
        if self.peek() == Some('@') {
            self.bump();
        }
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }
        ident
    }

    /// Read an identifier chain starting at the current identifier
    fn qualified_name(&mut self) -> Result<String, ScanError> {
        let mut name = self.identifier();
        loop {
            let save = (self.pos, self.line, self.column);
            self.skip_whitespace_and_comments()?;
            let separator = match (self.peek(), self.peek_at(1)) {
                (Some('.'), _) => 1,
                (Some(':'), Some(':')) => 2,
                // null-conditional member access still names the member
                (Some('?'), Some('.')) => 2,
                _ => 0,
            };
            if separator == 0 {
                (self.pos, self.line, self.column) = save;
                return Ok(name);
            }
            for _ in 0..separator {
                self.bump();
            }
            self.skip_whitespace_and_comments()?;
            match self.peek() {
                Some(c) if is_ident_start(c) => {
                    name.push('.');
                    name.push_str(&self.identifier());
                }
                Some('\\') => {
                    return Err(self.error("escape sequence in identifier", self.location()));
                }
                _ => return Ok(name),
            }
        }
    }

    fn string_literal(&mut self, verbatim: bool) -> Result<String, ScanError> {
        let start = self.location();
        // opening quote
        self.bump();
        let mut value = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated string literal", start));
            };
            match c {
                '"' if verbatim && self.peek() == Some('"') => {
                    self.bump();
                    value.push('"');
                }
                '"' => return Ok(value),
                '\n' if !verbatim => {
                    return Err(self.error("unterminated string literal", start));
                }
                '\\' if !verbatim => {
                    let Some(escaped) = self.bump() else {
                        return Err(self.error("unterminated string literal", start));
                    };
                    match escaped {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '0' => value.push('\0'),
                        '\\' => value.push('\\'),
                        '"' => value.push('"'),
                        '\'' => value.push('\''),
                        // unicode escapes can spell any name; refuse to guess
                        'u' | 'U' | 'x' => {
                            return Err(self.error("unicode escape in string literal", start));
                        }
                        _ => return Err(self.error("unknown escape sequence", start)),
                    }
                }
                other => value.push(other),
            }
        }
    }

    fn char_literal(&mut self) -> Result<(), ScanError> {
        let start = self.location();
        self.bump();
        loop {
            match self.bump() {
                Some('\\') => {
                    self.bump();
                }
                Some('\'') => return Ok(()),
                Some('\n') | None => return Err(self.error("unterminated character literal", start)),
                Some(_) => {}
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '@'
}

/// Scan `source`, returning every qualified name and string literal in order
pub fn scan(source: &str) -> Result<Vec<ScanItem>, ScanError> {
    let mut scanner = Scanner::new(source);
    let mut items = Vec::new();

    loop {
        scanner.skip_whitespace_and_comments()?;
        let Some(c) = scanner.peek() else {
            return Ok(items);
        };
        let location = scanner.location();

        match (c, scanner.peek_at(1), scanner.peek_at(2)) {
            ('@', Some('"'), _) => {
                scanner.bump();
                let value = scanner.string_literal(true)?;
                items.push(ScanItem::StringLiteral { value, location });
            }
            // interpolated strings; holes are scanned as part of the literal text
            ('$', Some('"'), _) => {
                scanner.bump();
                let value = scanner.string_literal(false)?;
                items.push(ScanItem::StringLiteral { value, location });
            }
            ('$', Some('@'), Some('"')) | ('@', Some('$'), Some('"')) => {
                scanner.bump();
                scanner.bump();
                let value = scanner.string_literal(true)?;
                items.push(ScanItem::StringLiteral { value, location });
            }
            ('"', _, _) => {
                let value = scanner.string_literal(false)?;
                items.push(ScanItem::StringLiteral { value, location });
            }
            ('\'', _, _) => scanner.char_literal()?,
            ('\\', _, _) => {
                return Err(scanner.error("escape sequence in identifier", location));
            }
            (c, _, _) if is_ident_start(c) => {
                let name = scanner.qualified_name()?;
                if !name.is_empty() {
                    items.push(ScanItem::QualifiedName { name, location });
                }
            }
            (c, _, _) if c.is_ascii_digit() => {
                while let Some(c) = scanner.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        scanner.bump();
                    } else {
                        break;
                    }
                }
            }
            _ => {
                scanner.bump();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(source: &str) -> Vec<String> {
        scan(source)
            .unwrap()
            .into_iter()
            .filter_map(|item| match item {
                ScanItem::QualifiedName { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    fn strings(source: &str) -> Vec<String> {
        scan(source)
            .unwrap()
            .into_iter()
            .filter_map(|item| match item {
                ScanItem::StringLiteral { value, .. } => Some(value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn collapses_whitespace_in_qualified_names() {
        assert_eq!(
            names("System . Diagnostics\n.Process.Start(\"ls\");"),
            vec!["System.Diagnostics.Process.Start"]
        );
    }

    #[test]
    fn global_alias_separator() {
        assert_eq!(names("global::System.IO.File"), vec!["global.System.IO.File"]);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            names("// Process.Start\n/* Environment.Exit */ var x = 1;"),
            vec!["var", "x"]
        );
    }

    #[test]
    fn comments_between_segments_are_skipped() {
        assert_eq!(names("Process/* hi */.Start()"), vec!["Process.Start"]);
    }

    #[test]
    fn decodes_string_literals() {
        assert_eq!(strings(r#"var p = "C:\\Windows";"#), vec!["C:\\Windows"]);
        assert_eq!(strings(r#"var p = @"C:\Windows";"#), vec!["C:\\Windows"]);
        assert_eq!(strings(r#"var q = @"say ""hi""";"#), vec!["say \"hi\""]);
        assert_eq!(strings(r#"var r = $"/etc/{name}";"#), vec!["/etc/{name}"]);
    }

    #[test]
    fn locations_are_one_based() {
        let items = scan("var a = 1;\n  \"x\"").unwrap();
        let last = items.last().unwrap();
        assert_eq!(
            *last,
            ScanItem::StringLiteral {
                value: "x".to_string(),
                location: SourceLocation::new(2, 3),
            }
        );
    }

    #[test]
    fn unterminated_string_is_error() {
        let err = scan("var s = \"abc").unwrap_err();
        assert_eq!(err.reason, "unterminated string literal");
        assert_eq!(err.location, SourceLocation::new(1, 9));
    }

    #[test]
    fn unterminated_comment_is_error() {
        assert!(scan("/* never closed").is_err());
    }

    #[test]
    fn unicode_escapes_are_errors() {
        assert!(scan(r"\u0050rocess.Start()").is_err());
        assert!(scan(r#"Type.GetType("\u0053ystem")"#).is_err());
    }

    #[test]
    fn char_literals_are_skipped() {
        assert_eq!(names("var c = '\\''; d"), vec!["var", "c", "d"]);
    }

    #[test]
    fn numbers_are_not_names() {
        assert_eq!(names("1.5 + x2"), vec!["x2"]);
    }
}
