//! Node model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::value::Value;

use super::{is_valid_attr, is_valid_kind, ATTR_KEY, ATTR_KIND};

/// A graph node: an attribute map with mandatory `key` and `kind`
/// string attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    attrs: BTreeMap<String, Value>,
}

impl Node {
    /// Create an empty node.
    pub fn new() -> Self {
        Node {
            attrs: BTreeMap::new(),
        }
    }

    /// Create a node with its mandatory attributes set.
    pub fn with_key_kind(key: &str, kind: &str) -> Self {
        let mut node = Node::new();
        node.set_attr(ATTR_KEY, Value::from(key));
        node.set_attr(ATTR_KIND, Value::from(kind));
        node
    }

    /// Build a node from an existing attribute map.
    pub fn from_attrs(attrs: BTreeMap<String, Value>) -> Self {
        Node { attrs }
    }

    pub fn key(&self) -> &str {
        self.attrs
            .get(ATTR_KEY)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        self.attrs
            .get(ATTR_KIND)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    /// String view of an attribute via its canonical form. Missing
    /// attributes yield `None`.
    pub fn attr_string(&self, name: &str) -> Option<String> {
        self.attrs.get(name).map(Value::canonical_string)
    }

    pub fn set_attr(&mut self, name: &str, value: Value) {
        self.attrs.insert(name.to_string(), value);
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<Value> {
        self.attrs.remove(name)
    }

    pub fn attrs(&self) -> &BTreeMap<String, Value> {
        &self.attrs
    }

    /// Names of all attributes, in sorted order.
    pub fn attr_names(&self) -> Vec<String> {
        self.attrs.keys().cloned().collect()
    }

    /// Merge the attributes of `other` into this node, overwriting on
    /// conflict. Used by update operations.
    pub fn merge(&mut self, other: &Node) {
        for (name, value) in &other.attrs {
            self.attrs.insert(name.clone(), value.clone());
        }
    }

    /// Validate the mandatory attributes and all attribute names.
    pub fn validate(&self) -> Result<()> {
        let key = self
            .attrs
            .get(ATTR_KEY)
            .and_then(Value::as_str)
            .unwrap_or("");
        if key.is_empty() {
            return Err(GraphError::InvalidData(
                "Node is missing a key attribute".to_string(),
            ));
        }

        let kind = self
            .attrs
            .get(ATTR_KIND)
            .and_then(Value::as_str)
            .unwrap_or("");
        if !is_valid_kind(kind) {
            return Err(GraphError::InvalidData(format!(
                "Invalid node kind: {kind:?}"
            )));
        }

        for name in self.attrs.keys() {
            if !is_valid_attr(name) {
                return Err(GraphError::InvalidData(format!(
                    "Invalid attribute name: {name:?}"
                )));
            }
        }
        Ok(())
    }
}
