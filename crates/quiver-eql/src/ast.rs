//! EQL abstract syntax tree

use serde::{Deserialize, Serialize};

use quiver_graph::Value;

/// A span representing a range in source code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Byte offset of the start.
    pub start: usize,
    /// Byte offset of the end (exclusive).
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }
}

impl Default for Span {
    fn default() -> Self {
        Self::dummy()
    }
}

/// A parsed query.
///
/// Structural equality ignores spans, so a query and its re-parsed
/// canonical print compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub source: QuerySource,
    pub where_clause: Option<Expr>,
    pub traversals: Vec<TraversalBlock>,
    pub primary: Option<String>,
    pub show: Vec<ShowClause>,
    pub with: Vec<WithClause>,
}

/// Where the initial rows come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuerySource {
    /// Enumerate all nodes of a kind.
    Get { kind: String },
    /// Fetch explicit keys of a kind.
    Lookup { kind: String, keys: Vec<String> },
}

impl QuerySource {
    pub fn kind(&self) -> &str {
        match self {
            QuerySource::Get { kind } => kind,
            QuerySource::Lookup { kind, .. } => kind,
        }
    }
}

/// A `traverse <spec> … end` block. Blocks nest; every block adds one
/// step to the rows it extends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalBlock {
    pub spec: String,
    pub where_clause: Option<Expr>,
    pub traversals: Vec<TraversalBlock>,
}

/// One output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowClause {
    pub source: ColumnRef,
    pub label: Option<String>,
    pub format: Option<String>,
}

/// Reference to a column value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnRef {
    /// Qualified `step:entity:attr` reference.
    RowSource {
        step: usize,
        is_edge: bool,
        attr: String,
    },
    /// Unqualified attribute of the primary step's node.
    Attr(String),
}

/// Post-processing directives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WithClause {
    /// Keep rows whose traversals found no target, filling nulls.
    NullTraversal(bool),
    /// Sort rows by columns.
    Ordering(Vec<OrderingTerm>),
    /// Keep only the first row per distinct value of a column.
    Filtering(Vec<ColumnRef>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderingTerm {
    pub ascending: bool,
    pub column: ColumnRef,
}

/// A `where` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    /// List literal, used with `in` / `notin`.
    List(Vec<Expr>),
    /// Attribute access on the current step's node (or edge when the
    /// path starts with the `e` qualifier). Nested path segments
    /// descend into map values.
    Attr { path: Vec<String> },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Neq,
    And,
    Or,
    In,
    NotIn,
    Like,
    Contains,
    ContainsNot,
    BeginsWith,
    EndsWith,
}

impl BinaryOp {
    /// The operator as it appears in query text.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::IntDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Gt => ">",
            BinaryOp::Lt => "<",
            BinaryOp::Ge => ">=",
            BinaryOp::Le => "<=",
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "!=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "notin",
            BinaryOp::Like => "like",
            BinaryOp::Contains => "contains",
            BinaryOp::ContainsNot => "containsnot",
            BinaryOp::BeginsWith => "beginswith",
            BinaryOp::EndsWith => "endswith",
        }
    }

    /// Binding strength for parsing and parenthesis-free printing.
    /// Higher binds tighter.
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Gt
            | BinaryOp::Lt
            | BinaryOp::Ge
            | BinaryOp::Le
            | BinaryOp::Eq
            | BinaryOp::Neq
            | BinaryOp::In
            | BinaryOp::NotIn
            | BinaryOp::Like
            | BinaryOp::Contains
            | BinaryOp::ContainsNot
            | BinaryOp::BeginsWith
            | BinaryOp::EndsWith => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::IntDiv | BinaryOp::Mod => 5,
        }
    }
}

impl ColumnRef {
    /// The row-source string for result headers. Unqualified
    /// attributes resolve against `primary_step`.
    pub fn data_string(&self, primary_step: usize) -> String {
        match self {
            ColumnRef::RowSource {
                step,
                is_edge,
                attr,
            } => format!("{step}:{}:{attr}", if *is_edge { "e" } else { "n" }),
            ColumnRef::Attr(attr) => format!("{primary_step}:n:{attr}"),
        }
    }

    /// Default column label.
    pub fn default_label(&self) -> &str {
        match self {
            ColumnRef::RowSource { attr, .. } => attr,
            ColumnRef::Attr(attr) => attr,
        }
    }
}
