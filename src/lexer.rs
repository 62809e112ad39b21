//! Tokenizer for the annotation query language.

use std::ops::Range;

use logos::{Lexer, Logos};

/// Token kinds of the query language. Keywords win over identifiers at
/// equal length, so `AND` is [`TokenKind::And`] while `ANDx` lexes as an
/// identifier.
#[derive(Logos, Clone, Copy, Debug, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum TokenKind {
    /// `(`
    #[token("(")]
    LParen,
    /// `)`
    #[token(")")]
    RParen,
    /// `&&`, `AND`, `and`
    #[token("&&")]
    #[token("AND")]
    #[token("and")]
    And,
    /// `||`, `OR`, `or`
    #[token("||")]
    #[token("OR")]
    #[token("or")]
    Or,
    /// `NOT`
    #[token("NOT")]
    Not,
    /// `IN`
    #[token("IN")]
    In,
    /// `GLOB`
    #[token("GLOB")]
    Glob,
    /// `=`
    #[token("=")]
    Eq,
    /// `!=`
    #[token("!=")]
    NotEq,
    /// `<`
    #[token("<")]
    Lt,
    /// `<=`
    #[token("<=")]
    Le,
    /// `>`
    #[token(">")]
    Gt,
    /// `>=`
    #[token(">=")]
    Ge,
    /// `~` (pattern match, same as `GLOB`)
    #[token("~")]
    Tilde,
    /// `!~` (same as `NOT GLOB`)
    #[token("!~")]
    NotTilde,
    /// `$all`, the match-everything query.
    #[token("$all")]
    All,
    /// `*`, alias of `$all`.
    #[token("*")]
    Star,
    /// Identifier: a letter or underscore then letters, digits, or
    /// underscores, optionally `$`-prefixed (system annotations). Unicode
    /// letters are permitted.
    #[regex(r"\$?[\p{L}_][\p{L}\p{N}_]*")]
    Ident,
    /// Unsigned decimal number.
    #[regex(r"[0-9]+")]
    Number,
    /// Hex literal: an entity key (64 digits) or address (40 digits).
    #[regex(r"0x[0-9a-fA-F]+")]
    HexLit,
    /// Double-quoted string with backslash escapes.
    #[regex(r#""([^"\\]|\\.)*""#)]
    QuotedString,
    /// End of input, emitted once after the last real token.
    Eoi,
}

/// One lexed token with its source slice.
#[derive(Clone, PartialEq, Eq)]
pub struct Token<'a> {
    /// The full query text.
    pub source: &'a str,
    /// Token kind.
    pub kind: TokenKind,
    /// Byte range of the token within `source`.
    pub span: Range<usize>,
}

impl<'a> Token<'a> {
    fn eoi(source: &'a str) -> Self {
        Token {
            source,
            kind: TokenKind::Eoi,
            span: source.len()..source.len(),
        }
    }

    /// The matched text.
    pub fn text(&self) -> &'a str {
        &self.source[self.span.clone()]
    }
}

impl std::fmt::Debug for Token<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({:?})", self.kind, self.span)
    }
}

/// Iterator over the tokens of a query, ending with a single
/// [`TokenKind::Eoi`].
#[derive(Debug)]
pub struct Tokenizer<'a> {
    source: &'a str,
    lexer: Lexer<'a, TokenKind>,
    eoi: bool,
}

impl<'a> Tokenizer<'a> {
    /// Tokenize `source`.
    pub fn new(source: &'a str) -> Self {
        Tokenizer {
            source,
            lexer: TokenKind::lexer(source),
            eoi: false,
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Result<Token<'a>, Range<usize>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lexer.next() {
            Some(Err(())) => Some(Err(self.lexer.span())),
            Some(Ok(kind)) => Some(Ok(Token {
                source: self.source,
                kind,
                span: self.lexer.span(),
            })),
            None if !self.eoi => {
                self.eoi = true;
                Some(Ok(Token::eoi(self.source)))
            }
            None => None,
        }
    }
}
