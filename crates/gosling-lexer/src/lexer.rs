use logos::Logos;

use crate::{Span, TokenKind};

/// A token with its source span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// The gosling lexer.
///
/// Converts source code into a stream of tokens. Newlines are produced as
/// tokens so the parser can apply Go's statement-termination rule.
pub struct Lexer<'src> {
    inner: logos::Lexer<'src, TokenKind>,
    source: &'src str,
    peeked: Option<Token>,
    at_eof: bool,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            inner: TokenKind::lexer(source),
            source,
            peeked: None,
            at_eof: false,
        }
    }

    pub fn source(&self) -> &'src str {
        self.source
    }

    /// Get the next token from the source.
    pub fn next_token(&mut self) -> Token {
        if let Some(token) = self.peeked.take() {
            return token;
        }

        if self.at_eof {
            return Token::new(
                TokenKind::Eof,
                Span::new(self.source.len(), self.source.len()),
            );
        }

        match self.inner.next() {
            Some(Ok(kind)) => {
                let span = self.inner.span();
                Token::new(kind, Span::new(span.start, span.end))
            }
            Some(Err(())) => {
                let span = self.inner.span();
                Token::new(TokenKind::Error, Span::new(span.start, span.end))
            }
            None => {
                self.at_eof = true;
                Token::new(
                    TokenKind::Eof,
                    Span::new(self.source.len(), self.source.len()),
                )
            }
        }
    }

    /// Peek at the next token without consuming it.
    pub fn peek(&mut self) -> Token {
        if self.peeked.is_none() {
            self.peeked = Some(self.next_token());
        }
        self.peeked.unwrap()
    }

    /// Get the slice of source code for a span.
    pub fn slice(&self, span: Span) -> &'src str {
        &self.source[span.start as usize..span.end as usize]
    }

    pub fn collect_all(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        tokens
    }
}

/// Parse a decimal integer literal.
pub fn parse_int(s: &str) -> Result<i64, std::num::ParseIntError> {
    s.replace('_', "").parse()
}

/// Parse a float literal.
pub fn parse_float(s: &str) -> Result<f64, std::num::ParseFloatError> {
    s.replace('_', "").parse()
}

/// Parse a string literal, handling escape sequences. The input includes
/// the surrounding quotes.
pub fn parse_string(s: &str) -> String {
    let s = &s[1..s.len() - 1];
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('r') => result.push('\r'),
                Some('t') => result.push('\t'),
                Some('\\') => result.push('\\'),
                Some('"') => result.push('"'),
                Some('\'') => result.push('\''),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Parse a character literal into its byte value. The input includes the
/// surrounding single quotes.
pub fn parse_char(s: &str) -> Option<u8> {
    let inner = &s[1..s.len() - 1];
    let mut chars = inner.chars();
    let c = chars.next()?;
    let value = if c == '\\' {
        match chars.next()? {
            'n' => b'\n',
            'r' => b'\r',
            't' => b'\t',
            '\\' => b'\\',
            '\'' => b'\'',
            '"' => b'"',
            '0' => 0,
            _ => return None,
        }
    } else if c.is_ascii() {
        c as u8
    } else {
        return None;
    };
    if chars.next().is_some() {
        return None;
    }
    Some(value)
}
