//! EQL error types

use quiver_graph::GraphError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EqlError {
    /// Malformed query text. Carries the 1-based source position.
    #[error("Parse error: expected {expected}, found {found} (line {line}, pos {col})")]
    Parse {
        expected: String,
        found: String,
        line: usize,
        col: usize,
    },

    /// Syntactically valid query with an invalid construct (unknown
    /// step reference, bad spec, …).
    #[error("Invalid construct: {0}")]
    Construct(String),

    /// A graph operation failed while the query ran.
    #[error("Execution error: {0}")]
    Exec(#[from] GraphError),
}

impl EqlError {
    /// Build a parse error pointing at a byte offset in `source`.
    pub fn parse_at(source: &str, offset: usize, expected: String, found: String) -> Self {
        let (line, col) = line_col(source, offset);
        EqlError::Parse {
            expected,
            found,
            line,
            col,
        }
    }
}

/// 1-based line and column of a byte offset.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, c) in source.char_indices() {
        if i >= offset {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_counts_from_one() {
        let src = "get Song\nwhere x";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 4), (1, 5));
        assert_eq!(line_col(src, 9), (2, 1));
        assert_eq!(line_col(src, 15), (2, 7));
    }
}
