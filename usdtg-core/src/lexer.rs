//! Lexer for USDTgScript.

use crate::diagnostic::{Diagnostic, Stage};
use crate::span::Span;

/// Kind of a token produced by the lexer.
///
/// Keywords are recognized here; everything else that looks like a
/// name is an `Ident` and is interpreted by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Special
    Eof,

    // Identifiers and literals
    Ident,
    IntLiteral,
    BoolLiteral, // true / false

    // Punctuation
    LParen,    // (
    RParen,    // )
    LBrace,    // {
    RBrace,    // }
    Comma,     // ,
    Semi,      // ;
    Colon,     // :
    Arrow,     // ->

    // Operators
    Assign,    // =
    EqEq,      // ==
    NotEq,     // !=
    Less,      // <
    LessEq,    // <=
    Greater,   // >
    GreaterEq, // >=
    Plus,      // +
    Minus,     // -
    Star,      // *
    Slash,     // /
    Percent,   // %
    Bang,      // !
    AndAnd,    // &&
    OrOr,      // ||

    // Keywords
    Contract,
    Storage,
    Function,
    Public,
    Private,
    View,
    Let,
    If,
    Else,
    While,
    Return,
    Require,
    I32,
    Bool,
}

/// A single token. The span doubles as the byte range of its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn text<'src>(&self, source: &'src str) -> &'src str {
        &source[self.span.start as usize..self.span.end as usize]
    }
}

/// Result of lexing a source file.
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<Token>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Lex a source string into tokens. The token list always ends with `Eof`.
pub fn lex(source: &str) -> LexResult {
    let mut lexer = Lexer {
        chars: source.as_bytes(),
        source,
        index: 0,
        diagnostics: Vec::new(),
    };
    lexer.run()
}

struct Lexer<'src> {
    source: &'src str,
    chars: &'src [u8],
    index: usize,
    diagnostics: Vec<Diagnostic>,
}

impl<'src> Lexer<'src> {
    fn run(&mut self) -> LexResult {
        let mut tokens = Vec::new();

        while let Some(ch) = self.peek_char() {
            if is_whitespace(ch) {
                self.consume_char();
                continue;
            }
            if ch == b'/' && self.peek_next() == Some(b'/') {
                self.skip_line_comment();
                continue;
            }

            let start = self.index as u32;
            let token = match ch {
                b'(' => self.single(TokenKind::LParen, start),
                b')' => self.single(TokenKind::RParen, start),
                b'{' => self.single(TokenKind::LBrace, start),
                b'}' => self.single(TokenKind::RBrace, start),
                b',' => self.single(TokenKind::Comma, start),
                b';' => self.single(TokenKind::Semi, start),
                b':' => self.single(TokenKind::Colon, start),
                b'+' => self.single(TokenKind::Plus, start),
                b'*' => self.single(TokenKind::Star, start),
                b'/' => self.single(TokenKind::Slash, start),
                b'%' => self.single(TokenKind::Percent, start),
                b'-' => self.pair(b'>', TokenKind::Arrow, TokenKind::Minus, start),
                b'=' => self.pair(b'=', TokenKind::EqEq, TokenKind::Assign, start),
                b'!' => self.pair(b'=', TokenKind::NotEq, TokenKind::Bang, start),
                b'<' => self.pair(b'=', TokenKind::LessEq, TokenKind::Less, start),
                b'>' => self.pair(b'=', TokenKind::GreaterEq, TokenKind::Greater, start),
                b'&' => self.doubled(b'&', TokenKind::AndAnd, start),
                b'|' => self.doubled(b'|', TokenKind::OrOr, start),
                b'0'..=b'9' => self.lex_number(start),
                _ if is_ident_start(ch) => self.lex_ident_or_keyword(start),
                _ => {
                    self.consume_char();
                    self.unexpected_char(start)
                }
            };

            if let Some(tok) = token {
                tokens.push(tok);
            }
        }

        let len = self.chars.len() as u32;
        tokens.push(Token {
            kind: TokenKind::Eof,
            span: Span::new(len, len),
        });

        LexResult {
            tokens,
            diagnostics: std::mem::take(&mut self.diagnostics),
        }
    }

    fn single(&mut self, kind: TokenKind, start: u32) -> Option<Token> {
        self.consume_char();
        self.simple_token(kind, start)
    }

    /// One-or-two character operator: `second` selects `long`.
    fn pair(&mut self, second: u8, long: TokenKind, short: TokenKind, start: u32) -> Option<Token> {
        self.consume_char();
        if self.peek_char() == Some(second) {
            self.consume_char();
            self.simple_token(long, start)
        } else {
            self.simple_token(short, start)
        }
    }

    /// Operators that only exist doubled (`&&`, `||`).
    fn doubled(&mut self, second: u8, kind: TokenKind, start: u32) -> Option<Token> {
        self.consume_char();
        if self.peek_char() == Some(second) {
            self.consume_char();
            self.simple_token(kind, start)
        } else {
            self.unexpected_char(start)
        }
    }

    fn simple_token(&self, kind: TokenKind, start: u32) -> Option<Token> {
        Some(Token {
            kind,
            span: Span::new(start, self.index as u32),
        })
    }

    fn unexpected_char(&mut self, start: u32) -> Option<Token> {
        let span = Span::new(start, self.index as u32);
        let text = self.source.get(span.start as usize..span.end as usize).unwrap_or("?");
        self.diagnostics.push(Diagnostic::error(
            Stage::Syntax,
            "E0101",
            format!("unexpected character `{text}`"),
            span,
        ));
        None
    }

    fn skip_line_comment(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch == b'\n' {
                break;
            }
            self.consume_char();
        }
    }

    fn lex_number(&mut self, start: u32) -> Option<Token> {
        while let Some(ch) = self.peek_char() {
            if matches!(ch, b'0'..=b'9' | b'_') {
                self.consume_char();
            } else {
                break;
            }
        }
        // `12abc` is one malformed token, not a number followed by a name.
        if self.peek_char().is_some_and(is_ident_start) {
            while self.peek_char().is_some_and(is_ident_continue) {
                self.consume_char();
            }
            let span = Span::new(start, self.index as u32);
            self.diagnostics.push(Diagnostic::error(
                Stage::Syntax,
                "E0102",
                "malformed integer literal",
                span,
            ));
            return None;
        }
        self.simple_token(TokenKind::IntLiteral, start)
    }

    fn lex_ident_or_keyword(&mut self, start: u32) -> Option<Token> {
        while self.peek_char().is_some_and(is_ident_continue) {
            self.consume_char();
        }

        let end = self.index as u32;
        let kind = match &self.source[start as usize..end as usize] {
            "contract" => TokenKind::Contract,
            "storage" => TokenKind::Storage,
            "function" => TokenKind::Function,
            "public" => TokenKind::Public,
            "private" => TokenKind::Private,
            "view" => TokenKind::View,
            "let" => TokenKind::Let,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "return" => TokenKind::Return,
            "require" => TokenKind::Require,
            "i32" => TokenKind::I32,
            "bool" => TokenKind::Bool,
            "true" | "false" => TokenKind::BoolLiteral,
            _ => TokenKind::Ident,
        };
        self.simple_token(kind, start)
    }

    fn peek_char(&self) -> Option<u8> {
        self.chars.get(self.index).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.chars.get(self.index + 1).copied()
    }

    fn consume_char(&mut self) {
        if self.index < self.chars.len() {
            self.index += 1;
        }
    }
}

fn is_whitespace(ch: u8) -> bool {
    matches!(ch, b' ' | b'\t' | b'\n' | b'\r')
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_ident_continue(ch: u8) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_keywords_and_operators() {
        assert_eq!(
            kinds("function f() -> i32 { return a <= 3 && !b; }"),
            vec![
                TokenKind::Function,
                TokenKind::Ident,
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::Arrow,
                TokenKind::I32,
                TokenKind::LBrace,
                TokenKind::Return,
                TokenKind::Ident,
                TokenKind::LessEq,
                TokenKind::IntLiteral,
                TokenKind::AndAnd,
                TokenKind::Bang,
                TokenKind::Ident,
                TokenKind::Semi,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn skips_line_comments() {
        assert_eq!(
            kinds("let x = 1; // trailing\n// whole line\n"),
            vec![
                TokenKind::Let,
                TokenKind::Ident,
                TokenKind::Assign,
                TokenKind::IntLiteral,
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn reports_unexpected_characters() {
        let result = lex("let x = 1 # 2;");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, "E0101");
        assert_eq!(result.diagnostics[0].span, Span::new(10, 11));
    }

    #[test]
    fn single_ampersand_is_rejected() {
        let result = lex("a & b");
        assert_eq!(result.diagnostics.len(), 1);
    }

    #[test]
    fn token_text_slices_source() {
        let source = "storage balance: i32;";
        let result = lex(source);
        assert_eq!(result.tokens[1].text(source), "balance");
    }
}
