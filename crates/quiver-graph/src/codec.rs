//! Attribute map codec
//!
//! Nodes and edges are stored as their encoded attribute maps. The
//! encoding is self-describing (every value carries its type tag and
//! length) and deterministic: attribute maps are ordered, so encoding
//! the same entity twice yields identical bytes.

use std::collections::BTreeMap;

use crate::data::{Edge, Node};
use crate::error::Result;
use crate::value::Value;

/// Encode an attribute map.
pub fn encode_attrs(attrs: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
    Ok(bincode::serialize(attrs)?)
}

/// Decode an attribute map.
pub fn decode_attrs(data: &[u8]) -> Result<BTreeMap<String, Value>> {
    Ok(bincode::deserialize(data)?)
}

/// Encode a node record.
pub fn encode_node(node: &Node) -> Result<Vec<u8>> {
    encode_attrs(node.attrs())
}

/// Decode a node record.
pub fn decode_node(data: &[u8]) -> Result<Node> {
    Ok(Node::from_attrs(decode_attrs(data)?))
}

/// Encode an edge record.
pub fn encode_edge(edge: &Edge) -> Result<Vec<u8>> {
    encode_attrs(edge.node().attrs())
}

/// Decode an edge record.
pub fn decode_edge(data: &[u8]) -> Result<Edge> {
    Ok(Edge::from_node(decode_node(data)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_roundtrip() {
        let mut node = Node::with_key_kind("000", "Author");
        node.set_attr("name", Value::from("John"));
        node.set_attr("ranking", Value::Int(3));
        node.set_attr("active", Value::Bool(true));
        node.set_attr("tags", Value::List(vec![Value::from("a"), Value::from("b")]));

        let bytes = encode_node(&node).unwrap();
        assert_eq!(decode_node(&bytes).unwrap(), node);
    }

    #[test]
    fn encoding_is_deterministic() {
        let mut a = Node::with_key_kind("000", "Author");
        a.set_attr("zeta", Value::Int(1));
        a.set_attr("alpha", Value::Int(2));

        let mut b = Node::with_key_kind("000", "Author");
        b.set_attr("alpha", Value::Int(2));
        b.set_attr("zeta", Value::Int(1));

        assert_eq!(encode_node(&a).unwrap(), encode_node(&b).unwrap());
    }

    #[test]
    fn edge_roundtrip() {
        let edge = Edge::between(
            "e1",
            "Wrote",
            ("000", "Author", "Author", true),
            ("Aria1", "Song", "Song", false),
        );
        let bytes = encode_edge(&edge).unwrap();
        assert_eq!(decode_edge(&bytes).unwrap(), edge);
    }
}
