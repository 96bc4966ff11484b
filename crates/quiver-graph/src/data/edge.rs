//! Edge model and traversal specs

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::value::Value;

use super::{
    is_valid_kind, Node, ATTR_END1_CASCADING, ATTR_END1_KEY, ATTR_END1_KIND, ATTR_END1_ROLE,
    ATTR_END2_CASCADING, ATTR_END2_KEY, ATTR_END2_KIND, ATTR_END2_ROLE,
};

/// A graph edge.
///
/// An edge is a node with eight additional mandatory attributes
/// describing its two ends. Edges are bidirectional; traversal from
/// either endpoint yields the same edge with the ends swapped to
/// reflect the direction of travel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    node: Node,
}

impl Edge {
    /// Wrap a node carrying edge attributes.
    pub fn from_node(node: Node) -> Self {
        Edge { node }
    }

    /// Build an edge between two endpoints. Each end is given as
    /// `(key, kind, role, cascading)`.
    pub fn between(
        key: &str,
        kind: &str,
        end1: (&str, &str, &str, bool),
        end2: (&str, &str, &str, bool),
    ) -> Self {
        let mut node = Node::with_key_kind(key, kind);
        node.set_attr(ATTR_END1_KEY, Value::from(end1.0));
        node.set_attr(ATTR_END1_KIND, Value::from(end1.1));
        node.set_attr(ATTR_END1_ROLE, Value::from(end1.2));
        node.set_attr(ATTR_END1_CASCADING, Value::Bool(end1.3));
        node.set_attr(ATTR_END2_KEY, Value::from(end2.0));
        node.set_attr(ATTR_END2_KIND, Value::from(end2.1));
        node.set_attr(ATTR_END2_ROLE, Value::from(end2.2));
        node.set_attr(ATTR_END2_CASCADING, Value::Bool(end2.3));
        Edge { node }
    }

    pub fn key(&self) -> &str {
        self.node.key()
    }

    pub fn kind(&self) -> &str {
        self.node.kind()
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    pub fn into_node(self) -> Node {
        self.node
    }

    fn end_str(&self, attr: &str) -> &str {
        self.node.attr(attr).and_then(Value::as_str).unwrap_or("")
    }

    pub fn end1_key(&self) -> &str {
        self.end_str(ATTR_END1_KEY)
    }

    pub fn end1_kind(&self) -> &str {
        self.end_str(ATTR_END1_KIND)
    }

    pub fn end1_role(&self) -> &str {
        self.end_str(ATTR_END1_ROLE)
    }

    pub fn end1_cascading(&self) -> bool {
        self.node
            .attr(ATTR_END1_CASCADING)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn end2_key(&self) -> &str {
        self.end_str(ATTR_END2_KEY)
    }

    pub fn end2_kind(&self) -> &str {
        self.end_str(ATTR_END2_KIND)
    }

    pub fn end2_role(&self) -> &str {
        self.end_str(ATTR_END2_ROLE)
    }

    pub fn end2_cascading(&self) -> bool {
        self.node
            .attr(ATTR_END2_CASCADING)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Which end (1 or 2) the given node sits at, if any.
    pub fn end_of(&self, key: &str, kind: &str) -> Option<u8> {
        if self.end1_key() == key && self.end1_kind() == kind {
            Some(1)
        } else if self.end2_key() == key && self.end2_kind() == kind {
            Some(2)
        } else {
            None
        }
    }

    /// Cascading flag of the given end.
    pub fn cascading(&self, end: u8) -> bool {
        if end == 1 {
            self.end1_cascading()
        } else {
            self.end2_cascading()
        }
    }

    /// A copy of this edge with the two ends swapped. Used when a
    /// traversal reaches the edge from end 2, so that end 1 always
    /// denotes the node traveled from.
    pub fn swapped(&self) -> Edge {
        let mut node = self.node.clone();
        let pairs = [
            (ATTR_END1_KEY, ATTR_END2_KEY),
            (ATTR_END1_KIND, ATTR_END2_KIND),
            (ATTR_END1_ROLE, ATTR_END2_ROLE),
            (ATTR_END1_CASCADING, ATTR_END2_CASCADING),
        ];
        for (a1, a2) in pairs {
            let v1 = self.node.attr(a1).cloned().unwrap_or(Value::Null);
            let v2 = self.node.attr(a2).cloned().unwrap_or(Value::Null);
            node.set_attr(a1, v2);
            node.set_attr(a2, v1);
        }
        Edge { node }
    }

    /// Validate node attributes plus the eight end attributes.
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;

        for (name, attr) in [
            ("end1key", ATTR_END1_KEY),
            ("end1kind", ATTR_END1_KIND),
            ("end1role", ATTR_END1_ROLE),
            ("end2key", ATTR_END2_KEY),
            ("end2kind", ATTR_END2_KIND),
            ("end2role", ATTR_END2_ROLE),
        ] {
            if self.end_str(attr).is_empty() {
                return Err(GraphError::InvalidData(format!(
                    "Edge is missing the {name} attribute"
                )));
            }
        }
        for attr in [ATTR_END1_CASCADING, ATTR_END2_CASCADING] {
            if self
                .node
                .attr(attr)
                .and_then(Value::as_bool)
                .is_none()
            {
                return Err(GraphError::InvalidData(format!(
                    "Edge attribute {attr} must be a boolean"
                )));
            }
        }
        if !is_valid_kind(self.end1_kind()) || !is_valid_kind(self.end2_kind()) {
            return Err(GraphError::InvalidData(
                "Edge endpoint kinds must be alphanumeric".to_string(),
            ));
        }
        Ok(())
    }
}

/// A parsed traversal spec: `role1:edgekind:role2:nodekind`.
///
/// Empty fields are wildcards. Field 1 is interpreted from the
/// perspective of the node traveled from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalSpec {
    pub role1: String,
    pub edge_kind: String,
    pub role2: String,
    pub node_kind: String,
}

impl TraversalSpec {
    /// Parse a spec string. Fails unless it has exactly three colons.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() != 4 {
            return Err(GraphError::InvalidData(format!("Invalid spec: {spec}")));
        }
        Ok(TraversalSpec {
            role1: parts[0].to_string(),
            edge_kind: parts[1].to_string(),
            role2: parts[2].to_string(),
            node_kind: parts[3].to_string(),
        })
    }

    /// The all-wildcard spec `:::`.
    pub fn wildcard() -> Self {
        TraversalSpec {
            role1: String::new(),
            edge_kind: String::new(),
            role2: String::new(),
            node_kind: String::new(),
        }
    }

    /// Match an edge reached from its end `from_end`.
    pub fn matches(&self, edge: &Edge, from_end: u8) -> bool {
        let (from_role, to_role, to_kind) = if from_end == 1 {
            (edge.end1_role(), edge.end2_role(), edge.end2_kind())
        } else {
            (edge.end2_role(), edge.end1_role(), edge.end1_kind())
        };

        (self.role1.is_empty() || self.role1 == from_role)
            && (self.edge_kind.is_empty() || self.edge_kind == edge.kind())
            && (self.role2.is_empty() || self.role2 == to_role)
            && (self.node_kind.is_empty() || self.node_kind == to_kind)
    }
}

impl std::fmt::Display for TraversalSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.role1, self.edge_kind, self.role2, self.node_kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrote_edge() -> Edge {
        Edge::between(
            "e1",
            "Wrote",
            ("000", "Author", "Author", true),
            ("Aria1", "Song", "Song", false),
        )
    }

    #[test]
    fn edge_accessors() {
        let edge = wrote_edge();
        assert_eq!(edge.kind(), "Wrote");
        assert_eq!(edge.end1_key(), "000");
        assert_eq!(edge.end2_kind(), "Song");
        assert!(edge.end1_cascading());
        assert!(!edge.end2_cascading());
        assert_eq!(edge.end_of("Aria1", "Song"), Some(2));
        assert_eq!(edge.end_of("nope", "Song"), None);
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn swapped_reverses_ends() {
        let edge = wrote_edge().swapped();
        assert_eq!(edge.end1_key(), "Aria1");
        assert_eq!(edge.end2_key(), "000");
        assert!(edge.end2_cascading());
    }

    #[test]
    fn spec_parsing() {
        let spec = TraversalSpec::parse("Author:Wrote:Song:Song").unwrap();
        assert_eq!(spec.role1, "Author");
        assert_eq!(spec.node_kind, "Song");

        assert!(TraversalSpec::parse("a:b:c").is_err());
        assert!(TraversalSpec::parse("a:b:c:d:e").is_err());

        let wild = TraversalSpec::parse(":::").unwrap();
        assert_eq!(wild, TraversalSpec::wildcard());
    }

    #[test]
    fn spec_matching() {
        let edge = wrote_edge();

        let spec = TraversalSpec::parse("Author:Wrote:Song:Song").unwrap();
        assert!(spec.matches(&edge, 1));
        assert!(!spec.matches(&edge, 2));

        let wild = TraversalSpec::wildcard();
        assert!(wild.matches(&edge, 1));
        assert!(wild.matches(&edge, 2));

        let kind_only = TraversalSpec::parse(":Wrote::").unwrap();
        assert!(kind_only.matches(&edge, 1));
    }

    #[test]
    fn incomplete_edge_fails_validation() {
        let mut node = Node::with_key_kind("e1", "Wrote");
        node.set_attr(ATTR_END1_KEY, Value::from("000"));
        assert!(Edge::from_node(node).validate().is_err());
    }
}
