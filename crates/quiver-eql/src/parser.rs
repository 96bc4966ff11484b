//! Recursive descent parser for EQL

use crate::ast::*;
use crate::error::EqlError;
use crate::token::TokenKind;
use crate::{tokenize, Result, Token};

use quiver_graph::Value;

/// Parse a query string.
pub fn parse(source: &str) -> Result<Query> {
    let tokens = tokenize(source);
    Parser::new(source, tokens).parse_query()
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
        }
    }

    // === Utilities ===

    fn current(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .unwrap_or_else(|| self.tokens.last().expect("tokens should have at least EOF"))
    }

    fn peek(&self) -> TokenKind {
        self.current().kind
    }

    fn advance(&mut self) -> &Token {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        // Return the token we just passed
        &self.tokens[self.pos - 1]
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek() == kind
    }

    fn consume(&mut self, kind: TokenKind) -> Result<&Token> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(kind.describe()))
        }
    }

    fn consume_text(&mut self, kind: TokenKind) -> Result<String> {
        let span = self.consume(kind)?.span;
        Ok(self.source[span.start..span.end].to_string())
    }

    fn unexpected(&self, expected: &str) -> EqlError {
        let tok = self.current();
        let found = if tok.kind == TokenKind::Eof {
            "end of input".to_string()
        } else {
            format!("{} {:?}", tok.kind.describe(), tok.text(self.source))
        };
        EqlError::parse_at(self.source, tok.span.start, expected.to_string(), found)
    }

    fn consume_string_literal(&mut self) -> Result<String> {
        let text = self.consume_text(TokenKind::String)?;
        Ok(unescape_string(&text))
    }

    /// A label or format value: bare identifier or quoted string.
    fn consume_name(&mut self) -> Result<String> {
        match self.peek() {
            TokenKind::Ident => self.consume_text(TokenKind::Ident),
            TokenKind::String => self.consume_string_literal(),
            _ => Err(self.unexpected("identifier or string")),
        }
    }

    // === Query structure ===

    fn parse_query(&mut self) -> Result<Query> {
        let source = match self.peek() {
            TokenKind::Get => {
                self.advance();
                let kind = self.consume_text(TokenKind::Ident)?;
                QuerySource::Get { kind }
            }
            TokenKind::Lookup => {
                self.advance();
                let kind = self.consume_text(TokenKind::Ident)?;
                let mut keys = vec![self.consume_string_literal()?];
                while self.at(TokenKind::Comma) {
                    self.advance();
                    keys.push(self.consume_string_literal()?);
                }
                QuerySource::Lookup { kind, keys }
            }
            _ => return Err(self.unexpected("'get' or 'lookup'")),
        };

        let where_clause = if self.at(TokenKind::Where) {
            self.advance();
            Some(self.parse_expr(0)?)
        } else {
            None
        };

        let mut traversals = Vec::new();
        while self.at(TokenKind::Traverse) {
            traversals.push(self.parse_traversal()?);
        }

        let primary = if self.at(TokenKind::Primary) {
            self.advance();
            Some(self.consume_text(TokenKind::Ident)?)
        } else {
            None
        };

        let show = if self.at(TokenKind::Show) {
            self.advance();
            let mut clauses = vec![self.parse_show_clause()?];
            while self.at(TokenKind::Comma) {
                self.advance();
                clauses.push(self.parse_show_clause()?);
            }
            clauses
        } else {
            Vec::new()
        };

        let with = if self.at(TokenKind::With) {
            self.advance();
            let mut clauses = vec![self.parse_with_clause()?];
            while self.at(TokenKind::Comma) {
                self.advance();
                clauses.push(self.parse_with_clause()?);
            }
            clauses
        } else {
            Vec::new()
        };

        self.consume(TokenKind::Eof)?;

        Ok(Query {
            source,
            where_clause,
            traversals,
            primary,
            show,
            with,
        })
    }

    fn parse_traversal(&mut self) -> Result<TraversalBlock> {
        self.consume(TokenKind::Traverse)?;
        let spec = self.consume_text(TokenKind::Spec)?;

        let where_clause = if self.at(TokenKind::Where) {
            self.advance();
            Some(self.parse_expr(0)?)
        } else {
            None
        };

        let mut traversals = Vec::new();
        while self.at(TokenKind::Traverse) {
            traversals.push(self.parse_traversal()?);
        }

        self.consume(TokenKind::End)?;
        Ok(TraversalBlock {
            spec,
            where_clause,
            traversals,
        })
    }

    fn parse_show_clause(&mut self) -> Result<ShowClause> {
        let source = self.parse_column_ref()?;

        let label = if self.at(TokenKind::As) {
            self.advance();
            Some(self.consume_name()?)
        } else {
            None
        };

        let format = if self.at(TokenKind::Format) {
            self.advance();
            Some(self.consume_name()?)
        } else {
            None
        };

        Ok(ShowClause {
            source,
            label,
            format,
        })
    }

    fn parse_column_ref(&mut self) -> Result<ColumnRef> {
        match self.peek() {
            TokenKind::RowSource => {
                let text = self.consume_text(TokenKind::RowSource)?;
                parse_row_source(self.source, self.current().span.start, &text)
            }
            TokenKind::Ident => Ok(ColumnRef::Attr(self.consume_text(TokenKind::Ident)?)),
            _ => Err(self.unexpected("row source or attribute name")),
        }
    }

    fn parse_with_clause(&mut self) -> Result<WithClause> {
        match self.peek() {
            TokenKind::NullTraversal => {
                self.advance();
                self.consume(TokenKind::LParen)?;
                let enabled = match self.peek() {
                    TokenKind::True => {
                        self.advance();
                        true
                    }
                    TokenKind::False => {
                        self.advance();
                        false
                    }
                    _ => return Err(self.unexpected("'true' or 'false'")),
                };
                self.consume(TokenKind::RParen)?;
                Ok(WithClause::NullTraversal(enabled))
            }
            TokenKind::Ordering => {
                self.advance();
                self.consume(TokenKind::LParen)?;
                let mut terms = vec![self.parse_ordering_term()?];
                while self.at(TokenKind::Comma) {
                    self.advance();
                    terms.push(self.parse_ordering_term()?);
                }
                self.consume(TokenKind::RParen)?;
                Ok(WithClause::Ordering(terms))
            }
            TokenKind::Filtering => {
                self.advance();
                self.consume(TokenKind::LParen)?;
                let mut columns = Vec::new();
                loop {
                    self.consume(TokenKind::Unique)?;
                    columns.push(self.parse_column_ref()?);
                    if self.at(TokenKind::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.consume(TokenKind::RParen)?;
                Ok(WithClause::Filtering(columns))
            }
            _ => Err(self.unexpected("'nulltraversal', 'ordering' or 'filtering'")),
        }
    }

    fn parse_ordering_term(&mut self) -> Result<OrderingTerm> {
        let ascending = match self.peek() {
            TokenKind::Ascending => {
                self.advance();
                true
            }
            TokenKind::Descending => {
                self.advance();
                false
            }
            _ => return Err(self.unexpected("'ascending' or 'descending'")),
        };
        Ok(OrderingTerm {
            ascending,
            column: self.parse_column_ref()?,
        })
    }

    // === Expressions ===

    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        while let Some(op) = binary_op(self.peek()) {
            if op.precedence() < min_prec {
                break;
            }
            self.advance();
            let right = self.parse_expr(op.precedence() + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            TokenKind::Not => {
                self.advance();
                // `not` binds looser than comparisons but tighter
                // than `and`/`or`.
                let expr = self.parse_expr(3)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(expr),
                })
            }
            TokenKind::Minus => {
                self.advance();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(expr),
                })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.peek() {
            TokenKind::Int => {
                let text = self.consume_text(TokenKind::Int)?;
                let value: i64 = text
                    .parse()
                    .map_err(|_| self.unexpected("integer literal"))?;
                Ok(Expr::Literal(Value::Int(value)))
            }
            TokenKind::Float => {
                let text = self.consume_text(TokenKind::Float)?;
                let value: f64 = text.parse().map_err(|_| self.unexpected("float literal"))?;
                Ok(Expr::Literal(Value::Float(value)))
            }
            TokenKind::String => Ok(Expr::Literal(Value::Str(self.consume_string_literal()?))),
            TokenKind::True => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr(0)?;
                self.consume(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.at(TokenKind::RBracket) {
                    items.push(self.parse_expr(0)?);
                    while self.at(TokenKind::Comma) {
                        self.advance();
                        items.push(self.parse_expr(0)?);
                    }
                }
                self.consume(TokenKind::RBracket)?;
                Ok(Expr::List(items))
            }
            TokenKind::Ident => {
                let mut path = vec![self.consume_text(TokenKind::Ident)?];
                while self.at(TokenKind::Dot) {
                    self.advance();
                    path.push(self.consume_text(TokenKind::Ident)?);
                }
                Ok(Expr::Attr { path })
            }
            _ => Err(self.unexpected("expression")),
        }
    }
}

fn binary_op(kind: TokenKind) -> Option<BinaryOp> {
    match kind {
        TokenKind::Plus => Some(BinaryOp::Add),
        TokenKind::Minus => Some(BinaryOp::Sub),
        TokenKind::Star => Some(BinaryOp::Mul),
        TokenKind::Slash => Some(BinaryOp::Div),
        TokenKind::SlashSlash => Some(BinaryOp::IntDiv),
        TokenKind::Percent => Some(BinaryOp::Mod),
        TokenKind::Gt => Some(BinaryOp::Gt),
        TokenKind::Lt => Some(BinaryOp::Lt),
        TokenKind::Ge => Some(BinaryOp::Ge),
        TokenKind::Le => Some(BinaryOp::Le),
        TokenKind::Eq => Some(BinaryOp::Eq),
        TokenKind::Neq => Some(BinaryOp::Neq),
        TokenKind::And => Some(BinaryOp::And),
        TokenKind::Or => Some(BinaryOp::Or),
        TokenKind::In => Some(BinaryOp::In),
        TokenKind::NotIn => Some(BinaryOp::NotIn),
        TokenKind::Like => Some(BinaryOp::Like),
        TokenKind::Contains => Some(BinaryOp::Contains),
        TokenKind::ContainsNot => Some(BinaryOp::ContainsNot),
        TokenKind::BeginsWith => Some(BinaryOp::BeginsWith),
        TokenKind::EndsWith => Some(BinaryOp::EndsWith),
        _ => None,
    }
}

fn parse_row_source(source: &str, offset: usize, text: &str) -> Result<ColumnRef> {
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 3 {
        return Err(EqlError::parse_at(
            source,
            offset,
            "row source".to_string(),
            text.to_string(),
        ));
    }
    let step: usize = parts[0].parse().map_err(|_| {
        EqlError::parse_at(source, offset, "step number".to_string(), text.to_string())
    })?;
    Ok(ColumnRef::RowSource {
        step,
        is_edge: parts[1] == "e",
        attr: parts[2].to_string(),
    })
}

fn unescape_string(text: &str) -> String {
    // Strip the surrounding quotes
    let inner = &text[1..text.len() - 1];
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some(other) => result.push(other),
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }
    result
}
