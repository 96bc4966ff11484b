//! Quiver Graph - Typed graph model over slotted storage
//!
//! This crate provides the graph layer of the database:
//! - Dynamically typed attribute values ([`Value`])
//! - Nodes and edges as attribute maps with traversal roles
//! - Graph storage bundles (disk-backed and in-memory)
//! - A full-text / value index over attribute values
//! - The graph manager: CRUD, traversal, metadata, cross-partition
//!   search
//! - Transactions with an operation queue that rules can extend
//!   (cascading removals run inside the triggering commit)

mod codec;
pub mod data;
mod error;
mod graph;
pub mod index;
mod iterator;
mod rules;
pub mod storage;
mod trans;
mod value;

pub use codec::{decode_attrs, decode_edge, decode_node, encode_attrs, encode_edge, encode_node};
pub use data::{Edge, Node, TraversalSpec};
pub use error::{GraphError, Result};
pub use graph::{FindMatch, GraphManager, IncidentEdge};
pub use index::IndexManager;
pub use iterator::NodeKeyIterator;
pub use rules::{CascadeRule, Event, EventKind, Rule, RuleOutcome};
pub use storage::{DiskGraphStorage, GraphStorage, MemoryGraphStorage};
pub use trans::{OpQueue, RollingTransaction, TransOp, Transaction};
pub use value::Value;
