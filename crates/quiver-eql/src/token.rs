//! Token definitions for EQL

use logos::Logos;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")] // Skip whitespace
#[logos(skip r"#[^\n]*")] // Skip line comments
pub enum TokenKind {
    // === Keywords ===
    #[token("get")]
    Get,
    #[token("lookup")]
    Lookup,
    #[token("where")]
    Where,
    #[token("traverse")]
    Traverse,
    #[token("end")]
    End,
    #[token("primary")]
    Primary,
    #[token("show")]
    Show,
    #[token("as")]
    As,
    #[token("format")]
    Format,
    #[token("with")]
    With,
    #[token("ordering")]
    Ordering,
    #[token("filtering")]
    Filtering,
    #[token("nulltraversal")]
    NullTraversal,
    #[token("ascending")]
    Ascending,
    #[token("descending")]
    Descending,
    #[token("unique")]
    Unique,

    // Boolean / comparison keywords
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("in")]
    In,
    #[token("notin")]
    NotIn,
    #[token("like")]
    Like,
    #[token("contains")]
    Contains,
    #[token("containsnot")]
    ContainsNot,
    #[token("beginswith")]
    BeginsWith,
    #[token("endswith")]
    EndsWith,

    // Literals
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("NULL")]
    Null,

    // === Operators ===
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("//")]
    SlashSlash,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token(">=")]
    Ge,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token("<")]
    Lt,
    #[token("!=")]
    Neq,
    #[token("=")]
    Eq,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,

    // === Values ===
    /// A full traversal spec: four colon-separated fields, each
    /// possibly empty.
    #[regex(r"[A-Za-z0-9_]*:[A-Za-z0-9_]*:[A-Za-z0-9_]*:[A-Za-z0-9_]*")]
    Spec,

    /// A row source reference: `step:entity:attr` with entity `n` or
    /// `e`.
    #[regex(r"[0-9]+:[ne]:[A-Za-z0-9_]+")]
    RowSource,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,

    #[regex(r"[0-9]+\.[0-9]+")]
    Float,

    #[regex(r"[0-9]+")]
    Int,

    #[regex(r#""([^"\\]|\\.)*""#)]
    #[regex(r#"'([^'\\]|\\.)*'"#)]
    String,

    Error,
    Eof,
}

impl TokenKind {
    /// Human readable description for error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::Get => "'get'",
            TokenKind::Lookup => "'lookup'",
            TokenKind::Where => "'where'",
            TokenKind::Traverse => "'traverse'",
            TokenKind::End => "'end'",
            TokenKind::Primary => "'primary'",
            TokenKind::Show => "'show'",
            TokenKind::As => "'as'",
            TokenKind::Format => "'format'",
            TokenKind::With => "'with'",
            TokenKind::Ordering => "'ordering'",
            TokenKind::Filtering => "'filtering'",
            TokenKind::NullTraversal => "'nulltraversal'",
            TokenKind::Ascending => "'ascending'",
            TokenKind::Descending => "'descending'",
            TokenKind::Unique => "'unique'",
            TokenKind::And => "'and'",
            TokenKind::Or => "'or'",
            TokenKind::Not => "'not'",
            TokenKind::In => "'in'",
            TokenKind::NotIn => "'notin'",
            TokenKind::Like => "'like'",
            TokenKind::Contains => "'contains'",
            TokenKind::ContainsNot => "'containsnot'",
            TokenKind::BeginsWith => "'beginswith'",
            TokenKind::EndsWith => "'endswith'",
            TokenKind::True => "'true'",
            TokenKind::False => "'false'",
            TokenKind::Null => "'NULL'",
            TokenKind::Plus => "'+'",
            TokenKind::Minus => "'-'",
            TokenKind::Star => "'*'",
            TokenKind::Slash => "'/'",
            TokenKind::SlashSlash => "'//'",
            TokenKind::Percent => "'%'",
            TokenKind::Gt => "'>'",
            TokenKind::Lt => "'<'",
            TokenKind::Ge => "'>='",
            TokenKind::Le => "'<='",
            TokenKind::Eq => "'='",
            TokenKind::Neq => "'!='",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::Comma => "','",
            TokenKind::Dot => "'.'",
            TokenKind::Spec => "traversal spec",
            TokenKind::RowSource => "row source",
            TokenKind::Ident => "identifier",
            TokenKind::Int => "integer",
            TokenKind::Float => "float",
            TokenKind::String => "string",
            TokenKind::Error => "invalid input",
            TokenKind::Eof => "end of input",
        }
    }
}
