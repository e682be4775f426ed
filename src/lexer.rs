//! Token stream over the target machine's textual formats.
//!
//! One lexer serves both the assembly parser and the debug-info parser;
//! the two grammars share literals, punctuation and comment syntax.
//! Every token records the row and column of its first character so
//! parse errors can point at the offending input.

use crate::error::{Error, Result};

/// Kind and payload of a single token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier: `[A-Za-z_][A-Za-z0-9_]*`.
    Id(String),
    /// Integer literal, optionally negated by a directly leading `-`.
    Num(i64),
    /// Float literal: an integer literal containing a single `.`.
    Float(f64),
    /// String literal delimited by `"` with `\n \t \\ \"` escapes.
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Plus,
    Times,
    Comma,
    Semicolon,
    Colon,
    End,
}

/// A token with its source position (0-based).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub row: usize,
    pub col: usize,
}

/// Lexer over a complete input text.
pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    row: usize,
    col: usize,
    /// When set, characters that begin no token are discarded instead
    /// of raising an error. Used while skipping unknown sections.
    ignore: bool,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            chars: input.chars().collect(),
            pos: 0,
            row: 0,
            col: 0,
            ignore: false,
        }
    }

    /// Toggle discarding of unrecognized characters.
    pub fn set_ignore_mode(&mut self, on: bool) {
        self.ignore = on;
    }

    /// The raw, untokenized remainder of the input.
    pub fn rest(&self) -> String {
        self.chars[self.pos..].iter().collect()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied();
        if let Some(c) = ch {
            self.pos += 1;
            if c == '\n' {
                self.row += 1;
                self.col = 0;
            } else {
                self.col += 1;
            }
        }
        ch
    }

    fn err(&self, row: usize, col: usize, msg: impl Into<String>) -> Error {
        Error::Lex {
            row,
            col,
            msg: msg.into(),
        }
    }

    /// Produce the next token, skipping whitespace and `#` line comments.
    pub fn next_token(&mut self) -> Result<Token> {
        loop {
            match self.peek() {
                Some('#') => {
                    while let Some(c) = self.peek() {
                        self.bump();
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                _ => break,
            }
        }

        let row = self.row;
        let col = self.col;
        let make = |kind| Token { kind, row, col };

        let ch = match self.peek() {
            None => return Ok(make(TokenKind::End)),
            Some(c) => c,
        };

        let kind = match ch {
            ';' => {
                self.bump();
                TokenKind::Semicolon
            }
            ',' => {
                self.bump();
                TokenKind::Comma
            }
            '[' => {
                self.bump();
                TokenKind::LBracket
            }
            ']' => {
                self.bump();
                TokenKind::RBracket
            }
            '{' => {
                self.bump();
                TokenKind::LBrace
            }
            '}' => {
                self.bump();
                TokenKind::RBrace
            }
            '+' => {
                self.bump();
                TokenKind::Plus
            }
            '*' => {
                self.bump();
                TokenKind::Times
            }
            ':' => {
                self.bump();
                TokenKind::Colon
            }
            '.' => {
                self.bump();
                TokenKind::Dot
            }
            '"' => self.lex_string(row, col)?,
            c if c.is_ascii_digit() || c == '-' => self.lex_number(row, col)?,
            c if c.is_ascii_alphabetic() || c == '_' => self.lex_ident(),
            c => {
                if self.ignore {
                    self.bump();
                    return self.next_token();
                }
                return Err(self.err(row, col, format!("no token beginning with '{}'", c)));
            }
        };
        Ok(make(kind))
    }

    fn lex_string(&mut self, row: usize, col: usize) -> Result<TokenKind> {
        self.bump(); // opening quote
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(self.err(row, col, "unterminated string")),
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('\\') => s.push('\\'),
                    Some('"') => s.push('"'),
                    Some(c) => {
                        return Err(self.err(
                            row,
                            col,
                            format!("unknown escape sequence: '\\{}'", c),
                        ))
                    }
                    None => return Err(self.err(row, col, "unterminated string")),
                },
                Some(c) => s.push(c),
            }
        }
        Ok(TokenKind::Str(s))
    }

    fn lex_number(&mut self, row: usize, col: usize) -> Result<TokenKind> {
        let neg = self.peek() == Some('-');
        if neg {
            self.bump();
            if !matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                return Err(self.err(row, col, "expected digit after '-'"));
            }
        }
        let mut digits = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.bump();
            } else if c == '.' {
                if is_float {
                    return Err(self.err(row, col, "second '.' in numeric literal"));
                }
                is_float = true;
                digits.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if is_float {
            let val: f64 = digits
                .parse()
                .map_err(|_| self.err(row, col, format!("bad float literal '{}'", digits)))?;
            Ok(TokenKind::Float(if neg { -val } else { val }))
        } else {
            let val: i64 = digits
                .parse()
                .map_err(|_| self.err(row, col, format!("bad integer literal '{}'", digits)))?;
            Ok(TokenKind::Num(if neg { -val } else { val }))
        }
    }

    fn lex_ident(&mut self) -> TokenKind {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        TokenKind::Id(s)
    }
}
