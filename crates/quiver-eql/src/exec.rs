//! Query execution
//!
//! A query runs as a pipeline: source (kind enumeration or explicit
//! keys) → filter (`where`) → traverse (one step per `traverse`
//! block, pre-order) → show (column selection). Every result column
//! carries a row source `step:entity:attr` in the header, and every
//! cell records the entity it came from.

use std::collections::HashSet;
use std::fmt;

use quiver_graph::{Edge, GraphManager, Node, TraversalSpec, Value};

use crate::ast::{ColumnRef, Expr, Query, QuerySource, ShowClause, TraversalBlock, WithClause};
use crate::error::EqlError;
use crate::eval::{compare, eval_condition, EvalContext};
use crate::parse;
use crate::Result;

/// Result table header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHeader {
    /// Partition the query ran against.
    pub partition: String,
    /// Kind of the primary node of each row.
    pub primary_kind: String,
    /// Column labels.
    pub labels: Vec<String>,
    /// Column format hints.
    pub formats: Vec<String>,
    /// Column row sources (`step:entity:attr`).
    pub data: Vec<String>,
}

/// A labeled result table.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// The query that produced this result.
    pub query: String,
    pub header: SearchHeader,
    pub rows: Vec<Vec<Value>>,
    /// Per cell: `n:<kind>:<key>` or `e:<kind>:<key>` of the entity
    /// the cell came from; empty entity slots yield `n::`.
    pub sources: Vec<Vec<String>>,
}

impl SearchResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

impl fmt::Display for SearchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header.labels.join("\t"))?;
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(Value::canonical_string).collect();
            writeln!(f, "{}", cells.join("\t"))?;
        }
        Ok(())
    }
}

/// One step's entities within a row. The edge is the one traveled to
/// reach the node; the root step has none.
type StepEntity = Option<(Node, Option<Edge>)>;

struct StepPlan<'a> {
    /// 1-based step number of the node this step traverses from.
    parent: usize,
    spec: &'a str,
    where_clause: Option<&'a Expr>,
}

/// Parse and execute a query against one partition.
pub fn run_query(gm: &GraphManager, partition: &str, query_text: &str) -> Result<SearchResult> {
    let query = parse(query_text)?;
    execute(gm, partition, &query, query_text)
}

/// Execute a parsed query.
pub fn execute(
    gm: &GraphManager,
    partition: &str,
    query: &Query,
    query_text: &str,
) -> Result<SearchResult> {
    // Plan: flatten traversal blocks pre-order into steps 2..n and
    // validate their specs before touching the graph.
    let mut steps = Vec::new();
    flatten_steps(&query.traversals, 1, &mut steps);
    for step in &steps {
        TraversalSpec::parse(step.spec)
            .map_err(|_| EqlError::Construct(format!("invalid traversal spec: {}", step.spec)))?;
    }

    let null_traversal = query.with.iter().any(|w| matches!(w, WithClause::NullTraversal(true)));

    // Source
    let mut rows = source_rows(gm, partition, query, steps.len() + 1)?;

    // Traverse
    for (i, step) in steps.iter().enumerate() {
        let step_slot = i + 1;
        let mut extended = Vec::new();

        for row in rows {
            let origin = row[step.parent - 1].as_ref().map(|(node, _)| node.clone());
            let Some(origin) = origin else {
                if null_traversal {
                    extended.push(row);
                }
                continue;
            };

            let (nodes, edges) = gm
                .traverse_multi(partition, origin.key(), origin.kind(), step.spec, true)?;

            let mut found = false;
            for (node, edge) in nodes.into_iter().zip(edges) {
                let Some(node) = node else { continue };
                if let Some(cond) = step.where_clause {
                    let ctx = EvalContext {
                        node: Some(&node),
                        edge: Some(&edge),
                    };
                    if !eval_condition(cond, &ctx)? {
                        continue;
                    }
                }
                let mut next = row.clone();
                next[step_slot] = Some((node, Some(edge)));
                extended.push(next);
                found = true;
            }

            if !found && null_traversal {
                let mut next = row.clone();
                next[step_slot] = None;
                extended.push(next);
            }
        }
        rows = extended;
    }

    // Show
    let show = effective_show(gm, query);
    let primary_kind = query
        .primary
        .clone()
        .unwrap_or_else(|| query.source.kind().to_string());

    let mut labels = Vec::new();
    let mut formats = Vec::new();
    let mut data = Vec::new();
    for clause in &show {
        if let ColumnRef::RowSource { step, .. } = &clause.source {
            if *step == 0 || *step > steps.len() + 1 {
                return Err(EqlError::Construct(format!(
                    "query has no step {step}"
                )));
            }
        }
        labels.push(
            clause
                .label
                .clone()
                .unwrap_or_else(|| clause.source.default_label().to_string()),
        );
        formats.push(clause.format.clone().unwrap_or_else(|| "auto".to_string()));
        data.push(clause.source.data_string(1));
    }

    let mut out_rows = Vec::with_capacity(rows.len());
    let mut out_sources = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut cells = Vec::with_capacity(show.len());
        let mut cell_sources = Vec::with_capacity(show.len());
        for clause in &show {
            let (value, source) = column_value(row, &clause.source);
            cells.push(value);
            cell_sources.push(source);
        }
        out_rows.push(cells);
        out_sources.push(cell_sources);
    }

    let mut result = SearchResult {
        query: query_text.to_string(),
        header: SearchHeader {
            partition: partition.to_string(),
            primary_kind,
            labels,
            formats,
            data,
        },
        rows: out_rows,
        sources: out_sources,
    };

    apply_with_clauses(&mut result, query)?;
    Ok(result)
}

fn flatten_steps<'a>(
    blocks: &'a [TraversalBlock],
    parent: usize,
    steps: &mut Vec<StepPlan<'a>>,
) {
    for block in blocks {
        steps.push(StepPlan {
            parent,
            spec: &block.spec,
            where_clause: block.where_clause.as_ref(),
        });
        let my_step = steps.len() + 1;
        flatten_steps(&block.traversals, my_step, steps);
    }
}

fn source_rows(
    gm: &GraphManager,
    partition: &str,
    query: &Query,
    row_len: usize,
) -> Result<Vec<Vec<StepEntity>>> {
    let mut nodes = Vec::new();
    match &query.source {
        QuerySource::Get { kind } => {
            if let Some(iter) = gm.node_key_iterator(partition, kind)? {
                let mut keys = Vec::new();
                for key in iter {
                    keys.push(key.map_err(EqlError::Exec)?);
                }
                keys.sort();
                for key in keys {
                    if let Some(node) = gm.fetch_node(partition, &key, kind)? {
                        nodes.push(node);
                    }
                }
            }
        }
        QuerySource::Lookup { kind, keys } => {
            for key in keys {
                if let Some(node) = gm.fetch_node(partition, key, kind)? {
                    nodes.push(node);
                }
            }
        }
    }

    let mut rows = Vec::new();
    for node in nodes {
        if let Some(cond) = &query.where_clause {
            let ctx = EvalContext {
                node: Some(&node),
                edge: None,
            };
            if !eval_condition(cond, &ctx)? {
                continue;
            }
        }
        let mut row: Vec<StepEntity> = vec![None; row_len];
        row[0] = Some((node, None));
        rows.push(row);
    }
    Ok(rows)
}

/// The show clauses to output: the query's own, or a default of the
/// key plus every known attribute of the source kind.
fn effective_show(gm: &GraphManager, query: &Query) -> Vec<ShowClause> {
    if !query.show.is_empty() {
        return query.show.clone();
    }

    let kind = query.source.kind();
    let mut show = vec![ShowClause {
        source: ColumnRef::RowSource {
            step: 1,
            is_edge: false,
            attr: "key".to_string(),
        },
        label: None,
        format: None,
    }];
    for attr in gm.node_attrs(kind) {
        if attr == "key" || attr == "kind" {
            continue;
        }
        show.push(ShowClause {
            source: ColumnRef::RowSource {
                step: 1,
                is_edge: false,
                attr,
            },
            label: None,
            format: None,
        });
    }
    show
}

fn column_value(row: &[StepEntity], column: &ColumnRef) -> (Value, String) {
    let (step, is_edge, attr) = match column {
        ColumnRef::RowSource {
            step,
            is_edge,
            attr,
        } => (*step, *is_edge, attr.as_str()),
        ColumnRef::Attr(attr) => (1, false, attr.as_str()),
    };

    let Some(Some((node, edge))) = row.get(step - 1) else {
        return (Value::Null, "n::".to_string());
    };

    if is_edge {
        match edge {
            Some(edge) => (
                edge.node().attr(attr).cloned().unwrap_or(Value::Null),
                format!("e:{}:{}", edge.kind(), edge.key()),
            ),
            None => (Value::Null, "n::".to_string()),
        }
    } else {
        (
            node.attr(attr).cloned().unwrap_or(Value::Null),
            format!("n:{}:{}", node.kind(), node.key()),
        )
    }
}

fn apply_with_clauses(result: &mut SearchResult, query: &Query) -> Result<()> {
    for clause in &query.with {
        match clause {
            WithClause::NullTraversal(_) => {}
            WithClause::Ordering(terms) => {
                // Apply in reverse so the first term dominates.
                for term in terms.iter().rev() {
                    let col = column_index(result, &term.column)?;
                    let mut paired: Vec<(Vec<Value>, Vec<String>)> = result
                        .rows
                        .drain(..)
                        .zip(result.sources.drain(..))
                        .collect();
                    paired.sort_by(|a, b| {
                        let ord = compare(&a.0[col], &b.0[col]);
                        if term.ascending {
                            ord
                        } else {
                            ord.reverse()
                        }
                    });
                    (result.rows, result.sources) = paired.into_iter().unzip();
                }
            }
            WithClause::Filtering(columns) => {
                for column in columns {
                    let col = column_index(result, column)?;
                    let mut seen = HashSet::new();
                    let mut rows = Vec::new();
                    let mut sources = Vec::new();
                    for (row, source) in result.rows.drain(..).zip(result.sources.drain(..)) {
                        if seen.insert(row[col].canonical_string()) {
                            rows.push(row);
                            sources.push(source);
                        }
                    }
                    result.rows = rows;
                    result.sources = sources;
                }
            }
        }
    }
    Ok(())
}

fn column_index(result: &SearchResult, column: &ColumnRef) -> Result<usize> {
    let wanted = column.data_string(1);
    result
        .header
        .data
        .iter()
        .position(|d| *d == wanted)
        .ok_or_else(|| EqlError::Construct(format!("unknown result column: {wanted}")))
}
