//! S-expression lexer for Aurora Scheme source code.

use crate::compiler::tokens::{Span, Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("unexpected character '{ch}' at line {line}, col {col}")]
    UnexpectedChar { ch: char, line: usize, col: usize },
    #[error("unterminated string at line {line}, col {col}")]
    UnterminatedString { line: usize, col: usize },
    #[error("invalid literal '{text}' at line {line}, col {col}")]
    InvalidLiteral { text: String, line: usize, col: usize },
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    byte_offset: usize,
}

/// True when `text` should be read as a number literal.
///
/// Guards against words like `inf` or `nan` that `f64::from_str` would
/// otherwise accept.
pub fn looks_numeric(text: &str) -> bool {
    let body = text.strip_prefix(['+', '-']).unwrap_or(text);
    let body = body.strip_prefix('.').unwrap_or(body);
    body.chars().next().is_some_and(|c| c.is_ascii_digit()) && text.parse::<f64>().is_ok()
}

fn is_delimiter(ch: char) -> bool {
    ch.is_whitespace() || matches!(ch, '(' | ')' | '[' | ']' | '"' | ';' | '\'' | '`' | ',')
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self { source: source.chars().collect(), pos: 0, line: 1, col: 1, byte_offset: 0 }
    }

    fn current(&self) -> Option<char> { self.source.get(self.pos).copied() }

    fn advance(&mut self) -> Option<char> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        self.byte_offset += ch.len_utf8();
        if ch == '\n' { self.line += 1; self.col = 1; } else { self.col += 1; }
        Some(ch)
    }

    fn span_here(&self) -> Span {
        Span::new(self.byte_offset, self.byte_offset, self.line, self.col)
    }

    fn span_from(&self, so: usize, sl: usize, sc: usize) -> Span {
        Span::new(so, self.byte_offset, sl, sc)
    }

    fn single(&mut self, kind: TokenKind) -> Token {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        self.advance();
        Token::new(kind, self.span_from(so, sl, sc))
    }

    fn read_string(&mut self) -> Result<Token, LexError> {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        self.advance(); // opening quote
        let mut s = String::new();
        loop {
            match self.current() {
                None => return Err(LexError::UnterminatedString { line: sl, col: sc }),
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => { s.push('\n'); self.advance(); }
                        Some('t') => { s.push('\t'); self.advance(); }
                        Some('\\') => { s.push('\\'); self.advance(); }
                        Some('"') => { s.push('"'); self.advance(); }
                        Some(c) => { s.push('\\'); s.push(c); self.advance(); }
                        None => return Err(LexError::UnterminatedString { line: sl, col: sc }),
                    }
                }
                Some('"') => { self.advance(); break; }
                Some(c) => { s.push(c); self.advance(); }
            }
        }
        Ok(Token::new(TokenKind::StringLit(s), self.span_from(so, sl, sc)))
    }

    fn read_atom(&mut self) -> Result<Token, LexError> {
        let (so, sl, sc) = (self.byte_offset, self.line, self.col);
        let mut text = String::new();
        while let Some(ch) = self.current() {
            if is_delimiter(ch) { break; }
            text.push(ch);
            self.advance();
        }
        let span = self.span_from(so, sl, sc);
        let kind = match text.as_str() {
            "#t" | "#true" => TokenKind::Boolean(true),
            "#f" | "#false" => TokenKind::Boolean(false),
            _ if looks_numeric(&text) => {
                let n = text.parse::<f64>().map_err(|_| LexError::InvalidLiteral {
                    text: text.clone(), line: sl, col: sc,
                })?;
                TokenKind::Number(n)
            }
            _ if text.starts_with('#') => {
                return Err(LexError::InvalidLiteral { text, line: sl, col: sc });
            }
            _ => TokenKind::Symbol(text),
        };
        Ok(Token::new(kind, span))
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        while let Some(ch) = self.current() {
            match ch {
                c if c.is_whitespace() => { self.advance(); }
                ';' => { while matches!(self.current(), Some(c) if c != '\n') { self.advance(); } }
                '(' | '[' => tokens.push(self.single(TokenKind::LParen)),
                ')' | ']' => tokens.push(self.single(TokenKind::RParen)),
                '\'' => tokens.push(self.single(TokenKind::Quote)),
                '`' => tokens.push(self.single(TokenKind::Quasiquote)),
                ',' => tokens.push(self.single(TokenKind::Unquote)),
                '"' => tokens.push(self.read_string()?),
                c if c.is_control() => {
                    return Err(LexError::UnexpectedChar { ch: c, line: self.line, col: self.col });
                }
                _ => tokens.push(self.read_atom()?),
            }
        }
        tokens.push(Token::new(TokenKind::Eof, self.span_here()));
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_lex_application() {
        let k = kinds("(+ 1 2.5)");
        assert_eq!(k[0], TokenKind::LParen);
        assert_eq!(k[1], TokenKind::Symbol("+".into()));
        assert_eq!(k[2], TokenKind::Number(1.0));
        assert_eq!(k[3], TokenKind::Number(2.5));
        assert_eq!(k[4], TokenKind::RParen);
        assert_eq!(k[5], TokenKind::Eof);
    }

    #[test]
    fn test_lex_quote_forms() {
        let k = kinds("'(a `b ,c)");
        assert_eq!(k[0], TokenKind::Quote);
        assert_eq!(k[3], TokenKind::Quasiquote);
        assert_eq!(k[5], TokenKind::Unquote);
    }

    #[test]
    fn test_lex_booleans_and_strings() {
        let k = kinds(r#"#t #f "hi\n""#);
        assert_eq!(k[0], TokenKind::Boolean(true));
        assert_eq!(k[1], TokenKind::Boolean(false));
        assert_eq!(k[2], TokenKind::StringLit("hi\n".into()));
    }

    #[test]
    fn test_lex_comments_skipped() {
        let k = kinds("; header\n(display 1) ; trailing");
        assert_eq!(k.len(), 5);
    }

    #[test]
    fn test_symbols_that_look_like_numbers() {
        assert!(matches!(&kinds("inf")[0], TokenKind::Symbol(s) if s == "inf"));
        assert!(matches!(&kinds("-")[0], TokenKind::Symbol(s) if s == "-"));
        assert_eq!(kinds("-3")[0], TokenKind::Number(-3.0));
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("\"abc").tokenize().unwrap_err();
        assert!(matches!(err, LexError::UnterminatedString { line: 1, col: 1 }));
    }

    #[test]
    fn test_spans_track_lines() {
        let tokens = Lexer::new("(a\n  b)").tokenize().unwrap();
        assert_eq!(tokens[2].span.line, 2);
        assert_eq!(tokens[2].span.col, 3);
    }
}
