//! Quiver EQL - The graph query language
//!
//! EQL queries either enumerate a kind (`get`) or fetch explicit keys
//! (`lookup`), filter with `where` conditions, follow edges with
//! nested `traverse` blocks and select output columns with `show`:
//!
//! ```text
//! get Song where ranking > 3
//!   traverse :Wrote:Author:Author end
//! show 1:n:key, 2:n:name
//! ```
//!
//! The crate provides the lexer, AST, parser, canonical pretty-printer
//! and the executor producing labeled result tables.

mod ast;
mod error;
mod eval;
mod exec;
mod parser;
mod printer;
mod token;

pub use ast::*;
pub use error::EqlError;
pub use exec::{run_query, SearchHeader, SearchResult};
pub use parser::parse;
pub use printer::ToEql;
pub use token::TokenKind;

use logos::Logos;

pub type Result<T> = std::result::Result<T, EqlError>;

/// A token with its span.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.span.start..self.span.end]
    }
}

/// Tokenize a source string into a vector of tokens.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut lexer = TokenKind::lexer(source);

    while let Some(result) = lexer.next() {
        let span = Span::new(lexer.span().start, lexer.span().end);
        let kind = match result {
            Ok(kind) => kind,
            Err(_) => TokenKind::Error,
        };
        tokens.push(Token { kind, span });
    }

    // Add EOF token
    let end = source.len();
    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span::new(end, end),
    });

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_and_values() {
        let tokens = tokenize("get Song where ranking > 3");
        assert_eq!(tokens[0].kind, TokenKind::Get);
        assert_eq!(tokens[1].kind, TokenKind::Ident);
        assert_eq!(tokens[2].kind, TokenKind::Where);
        assert_eq!(tokens[3].kind, TokenKind::Ident);
        assert_eq!(tokens[4].kind, TokenKind::Gt);
        assert_eq!(tokens[5].kind, TokenKind::Int);
        assert_eq!(tokens[6].kind, TokenKind::Eof);
    }

    #[test]
    fn specs_are_single_tokens() {
        let tokens = tokenize("traverse :Wrote:Author:Author end");
        assert_eq!(tokens[0].kind, TokenKind::Traverse);
        assert_eq!(tokens[1].kind, TokenKind::Spec);
        assert_eq!(tokens[2].kind, TokenKind::End);
    }

    #[test]
    fn row_sources_are_single_tokens() {
        let tokens = tokenize("show 1:n:key, 2:e:name");
        assert_eq!(tokens[0].kind, TokenKind::Show);
        assert_eq!(tokens[1].kind, TokenKind::RowSource);
        assert_eq!(tokens[2].kind, TokenKind::Comma);
        assert_eq!(tokens[3].kind, TokenKind::RowSource);
    }

    #[test]
    fn both_quote_styles_lex_as_strings() {
        let tokens = tokenize(r#"lookup Author "000", '001'"#);
        assert_eq!(tokens[0].kind, TokenKind::Lookup);
        assert_eq!(tokens[1].kind, TokenKind::Ident);
        assert_eq!(tokens[2].kind, TokenKind::String);
        assert_eq!(tokens[4].kind, TokenKind::String);
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = tokenize("get Song # only songs\nshow key");
        assert_eq!(tokens[0].kind, TokenKind::Get);
        assert_eq!(tokens[2].kind, TokenKind::Show);
    }
}
