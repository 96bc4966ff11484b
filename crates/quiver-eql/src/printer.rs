//! Canonical text printer for the EQL AST
//!
//! Serializes a query back to canonical EQL text. Printing and
//! re-parsing yields a structurally identical AST, which the result
//! cache and the query round-trip tests rely on.

use crate::ast::*;

use quiver_graph::Value;

/// Trait for converting AST nodes to canonical EQL text.
pub trait ToEql {
    /// Convert to canonical EQL with the given indentation level.
    fn to_eql(&self, indent: usize) -> String;
}

/// Helper to generate indentation string (two spaces per level).
fn indent_str(level: usize) -> String {
    "  ".repeat(level)
}

/// Escape a string literal for output.
fn escape_string(s: &str) -> String {
    let mut result = String::new();
    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\t' => result.push_str("\\t"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", escape_string(s))
}

/// Print a name bare when it lexes as an identifier, quoted otherwise.
fn name(s: &str) -> String {
    let ident_like = !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ident_like {
        s.to_string()
    } else {
        quoted(s)
    }
}

impl ToEql for Query {
    fn to_eql(&self, indent: usize) -> String {
        let ind = indent_str(indent);
        let mut out = String::new();

        match &self.source {
            QuerySource::Get { kind } => {
                out.push_str(&format!("{ind}get {kind}"));
            }
            QuerySource::Lookup { kind, keys } => {
                let keys: Vec<String> = keys.iter().map(|k| quoted(k)).collect();
                out.push_str(&format!("{ind}lookup {kind} {}", keys.join(", ")));
            }
        }

        if let Some(cond) = &self.where_clause {
            out.push_str(" where ");
            out.push_str(&print_expr(cond, 0));
        }
        out.push('\n');

        for block in &self.traversals {
            out.push_str(&block.to_eql(indent));
        }

        if let Some(primary) = &self.primary {
            out.push_str(&format!("{ind}primary {primary}\n"));
        }

        if !self.show.is_empty() {
            let cols: Vec<String> = self.show.iter().map(|c| c.to_eql(0)).collect();
            out.push_str(&format!("{ind}show {}\n", cols.join(", ")));
        }

        if !self.with.is_empty() {
            let terms: Vec<String> = self.with.iter().map(|w| w.to_eql(0)).collect();
            out.push_str(&format!("{ind}with {}\n", terms.join(", ")));
        }

        out
    }
}

impl ToEql for TraversalBlock {
    fn to_eql(&self, indent: usize) -> String {
        let ind = indent_str(indent);
        let mut out = format!("{ind}traverse {}", self.spec);
        if let Some(cond) = &self.where_clause {
            out.push_str(" where ");
            out.push_str(&print_expr(cond, 0));
        }
        out.push('\n');
        for block in &self.traversals {
            out.push_str(&block.to_eql(indent + 1));
        }
        out.push_str(&format!("{ind}end\n"));
        out
    }
}

impl ToEql for ShowClause {
    fn to_eql(&self, _indent: usize) -> String {
        let mut out = self.source.to_eql(0);
        if let Some(label) = &self.label {
            out.push_str(&format!(" as {}", name(label)));
        }
        if let Some(format) = &self.format {
            out.push_str(&format!(" format {}", name(format)));
        }
        out
    }
}

impl ToEql for ColumnRef {
    fn to_eql(&self, _indent: usize) -> String {
        match self {
            ColumnRef::RowSource {
                step,
                is_edge,
                attr,
            } => format!("{step}:{}:{attr}", if *is_edge { "e" } else { "n" }),
            ColumnRef::Attr(attr) => attr.clone(),
        }
    }
}

impl ToEql for WithClause {
    fn to_eql(&self, _indent: usize) -> String {
        match self {
            WithClause::NullTraversal(enabled) => format!("nulltraversal({enabled})"),
            WithClause::Ordering(terms) => {
                let terms: Vec<String> = terms
                    .iter()
                    .map(|t| {
                        format!(
                            "{} {}",
                            if t.ascending { "ascending" } else { "descending" },
                            t.column.to_eql(0)
                        )
                    })
                    .collect();
                format!("ordering({})", terms.join(", "))
            }
            WithClause::Filtering(columns) => {
                let columns: Vec<String> =
                    columns.iter().map(|c| format!("unique {}", c.to_eql(0))).collect();
                format!("filtering({})", columns.join(", "))
            }
        }
    }
}

/// Print an expression, parenthesizing only where the surrounding
/// precedence requires it.
pub fn print_expr(expr: &Expr, parent_prec: u8) -> String {
    match expr {
        Expr::Literal(value) => print_literal(value),
        Expr::List(items) => {
            let items: Vec<String> = items.iter().map(|i| print_expr(i, 0)).collect();
            format!("[{}]", items.join(", "))
        }
        Expr::Attr { path } => path.join("."),
        Expr::Unary { op, expr } => {
            let printed = match op {
                UnaryOp::Not => format!("not {}", print_expr(expr, 3)),
                UnaryOp::Neg => format!("-{}", print_expr(expr, 6)),
            };
            if parent_prec > 3 && *op == UnaryOp::Not {
                format!("({printed})")
            } else {
                printed
            }
        }
        Expr::Binary { op, left, right } => {
            let printed = format!(
                "{} {} {}",
                print_expr(left, op.precedence()),
                op.symbol(),
                print_expr(right, op.precedence() + 1)
            );
            if op.precedence() < parent_prec {
                format!("({printed})")
            } else {
                printed
            }
        }
    }
}

fn print_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{f:.1}")
            } else {
                f.to_string()
            }
        }
        Value::Str(s) => quoted(s),
        // Composite literals cannot be written in query text; print
        // their canonical form quoted so output stays parseable.
        other => quoted(&other.canonical_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn roundtrip(query: &str) {
        let ast = parse(query).unwrap();
        let printed = ast.to_eql(0);
        let reparsed = parse(&printed).unwrap();
        assert_eq!(ast, reparsed, "print/reparse changed the AST:\n{printed}");
    }

    #[test]
    fn simple_queries_roundtrip() {
        roundtrip("get Song");
        roundtrip(r#"lookup Author "000", "001""#);
        roundtrip("get Song where ranking > 3");
    }

    #[test]
    fn full_query_roundtrips() {
        roundtrip(
            "get Song where ranking > 3 \
             traverse :Wrote:Author:Author end \
             primary Song \
             show 1:n:key, 2:n:name as Author \
             with ordering(ascending key)",
        );
    }

    #[test]
    fn expression_parens_are_preserved_when_needed() {
        roundtrip("get Song where (a + b) * 2 > 10");
        roundtrip("get Song where not (a or b)");
        roundtrip("get Song where a and (b or c)");
        roundtrip("get Song where -a + 3 = 0");
        roundtrip("get Song where name in [\"x\", \"y\"]");
    }

    #[test]
    fn nested_traversals_roundtrip() {
        roundtrip(
            "get Author \
             traverse Author:Wrote:Song:Song where ranking > 2 \
               traverse Song:Appears:Album:Album end \
             end \
             show 1:n:key",
        );
    }
}
