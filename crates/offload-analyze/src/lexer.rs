use crate::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Number(String),
    /// Decoded body of a string literal (prefix and quotes stripped, escapes left raw).
    Str(String),
    Dot,
    Comma,
    Colon,
    Equals,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    /// Any operator we don't special-case (`+`, `-`, `->`, `*`, `**`, `==`, ...).
    Op(String),
    /// End of a logical line. Suppressed while inside `()`/`[]`/`{}` nesting, matching
    /// Python's implicit line continuation rule.
    Newline,
    /// Leading whitespace width of a logical line, emitted once right after `Newline`.
    Indent(u32),
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        self.span.text(source)
    }
}

pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    at_line_start: bool,
    paren_depth: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            at_line_start: true,
            paren_depth: 0,
        }
    }

    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token();
            let is_eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        tokens
    }

    fn next_token(&mut self) -> Token {
        if self.at_line_start && self.paren_depth == 0 {
            let start = self.pos;
            let mut width = 0u32;
            loop {
                match self.peek() {
                    Some(b' ') => {
                        self.pos += 1;
                        width += 1;
                    }
                    Some(b'\t') => {
                        self.pos += 1;
                        width += 8;
                    }
                    _ => break,
                }
            }
            self.at_line_start = false;
            // blank or comment-only lines carry no indentation signal
            if !matches!(self.peek(), Some(b'\n') | Some(b'\r') | Some(b'#') | None) {
                return Token::new(
                    TokenKind::Indent(width),
                    Span::new(start as u32, self.pos as u32),
                );
            }
        }

        self.skip_trivia();

        if self.pos >= self.bytes.len() {
            return Token::new(TokenKind::Eof, Span::new(self.pos as u32, self.pos as u32));
        }

        let start = self.pos;
        let ch = self.peek().unwrap();

        match ch {
            b'\n' | b'\r' => {
                self.advance();
                if ch == b'\r' && self.peek() == Some(b'\n') {
                    self.pos += 1;
                }
                self.at_line_start = true;
                if self.paren_depth > 0 {
                    self.next_token()
                } else {
                    Token::new(TokenKind::Newline, Span::new(start as u32, self.pos as u32))
                }
            }
            b'\\' if self.bytes.get(self.pos + 1) == Some(&b'\n') => {
                self.pos += 2;
                self.next_token()
            }
            b'#' => {
                while !matches!(self.peek(), Some(b'\n') | None) {
                    self.pos += 1;
                }
                self.next_token()
            }
            b'(' => {
                self.paren_depth += 1;
                self.advance();
                Token::new(TokenKind::LParen, Span::new(start as u32, self.pos as u32))
            }
            b')' => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                self.advance();
                Token::new(TokenKind::RParen, Span::new(start as u32, self.pos as u32))
            }
            b'[' => {
                self.paren_depth += 1;
                self.advance();
                Token::new(
                    TokenKind::LBracket,
                    Span::new(start as u32, self.pos as u32),
                )
            }
            b']' => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                self.advance();
                Token::new(
                    TokenKind::RBracket,
                    Span::new(start as u32, self.pos as u32),
                )
            }
            b'{' => {
                self.paren_depth += 1;
                self.advance();
                Token::new(TokenKind::LBrace, Span::new(start as u32, self.pos as u32))
            }
            b'}' => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                self.advance();
                Token::new(TokenKind::RBrace, Span::new(start as u32, self.pos as u32))
            }
            b'.' if !self.bytes.get(self.pos + 1).is_some_and(|b| b.is_ascii_digit()) => {
                self.advance();
                Token::new(TokenKind::Dot, Span::new(start as u32, self.pos as u32))
            }
            b',' => {
                self.advance();
                Token::new(TokenKind::Comma, Span::new(start as u32, self.pos as u32))
            }
            b':' => {
                self.advance();
                Token::new(TokenKind::Colon, Span::new(start as u32, self.pos as u32))
            }
            b'=' if self.bytes.get(self.pos + 1) != Some(&b'=') => {
                self.advance();
                Token::new(TokenKind::Equals, Span::new(start as u32, self.pos as u32))
            }
            b'\'' | b'"' => self.lex_string(start, 0),
            _ if is_ident_start(ch) => self.lex_ident_or_string_prefix(start),
            _ if ch.is_ascii_digit() => self.lex_number(start),
            _ => {
                self.advance();
                while self
                    .peek()
                    .is_some_and(|b| is_op_continue(b) && !matches!(b, b'(' | b')'))
                {
                    self.pos += 1;
                }
                let text = &self.source[start..self.pos];
                Token::new(
                    TokenKind::Op(text.to_string()),
                    Span::new(start as u32, self.pos as u32),
                )
            }
        }
    }

    fn lex_ident_or_string_prefix(&mut self, start: usize) -> Token {
        while self.peek().is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        let text = &self.source[start..self.pos];
        if is_string_prefix(text) && matches!(self.peek(), Some(b'\'') | Some(b'"')) {
            return self.lex_string(start, text.len());
        }
        Token::new(
            TokenKind::Ident(text.to_string()),
            Span::new(start as u32, self.pos as u32),
        )
    }

    fn lex_string(&mut self, start: usize, prefix_len: usize) -> Token {
        let quote = self.bytes[start + prefix_len];
        let triple = self.bytes.get(start + prefix_len + 1) == Some(&quote)
            && self.bytes.get(start + prefix_len + 2) == Some(&quote);
        let quote_len = if triple { 3 } else { 1 };
        self.pos = start + prefix_len + quote_len;
        let body_start = self.pos;
        loop {
            match self.peek() {
                None => break,
                Some(b'\\') => {
                    self.pos += 2;
                }
                Some(b) if b == quote => {
                    if !triple {
                        break;
                    }
                    if self.bytes.get(self.pos + 1) == Some(&quote)
                        && self.bytes.get(self.pos + 2) == Some(&quote)
                    {
                        break;
                    }
                    self.pos += 1;
                }
                _ => {
                    self.pos += 1;
                }
            }
        }
        let body_end = self.pos.min(self.bytes.len());
        let body = self.source[body_start..body_end].to_string();
        self.pos = (self.pos + quote_len).min(self.bytes.len());
        Token::new(TokenKind::Str(body), Span::new(start as u32, self.pos as u32))
    }

    fn lex_number(&mut self, start: usize) -> Token {
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_')
        {
            self.pos += 1;
        }
        let text = &self.source[start..self.pos];
        Token::new(
            TokenKind::Number(text.to_string()),
            Span::new(start as u32, self.pos as u32),
        )
    }

    fn skip_trivia(&mut self) {
        while let Some(b' ' | b'\t') = self.peek() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn advance(&mut self) -> u8 {
        let b = self.bytes[self.pos];
        self.pos += 1;
        b
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_op_continue(b: u8) -> bool {
    matches!(
        b,
        b'+' | b'-' | b'*' | b'/' | b'%' | b'<' | b'>' | b'=' | b'!' | b'&' | b'|' | b'^' | b'~'
    )
}

fn is_string_prefix(text: &str) -> bool {
    matches!(
        text.to_ascii_lowercase().as_str(),
        "r" | "b" | "u" | "f" | "rb" | "br" | "rf" | "fr"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn import_statement() {
        let tokens = lex("import os\n");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Ident("import".to_string()),
                TokenKind::Ident("os".to_string()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn call_with_string_arg() {
        let tokens = lex("open(\"data.csv\")");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Ident("open".to_string()),
                TokenKind::LParen,
                TokenKind::Str("data.csv".to_string()),
                TokenKind::RParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn multiline_import_inside_parens_has_no_newline_tokens() {
        let tokens = lex("from a import (\n    b,\n    c,\n)\n");
        assert!(!tokens.contains(&TokenKind::Newline));
    }

    #[test]
    fn triple_quoted_string() {
        let tokens = lex("x = '''hello\nworld'''");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Ident("x".to_string()),
                TokenKind::Equals,
                TokenKind::Str("hello\nworld".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn indentation_is_tracked_per_line() {
        let tokens = lex("def f():\n    return 1\n");
        assert!(matches!(tokens[0], TokenKind::Ident(_)));
        assert!(tokens.iter().any(|t| matches!(t, TokenKind::Indent(4))));
    }
}
