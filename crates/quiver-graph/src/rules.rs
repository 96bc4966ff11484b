//! Rule engine
//!
//! Rules are in-process observers of graph mutations. Every mutation
//! emits a pre-event (`…Store` / `…Update` / `…Delete`) carrying the
//! full intended entity, and a post-event (`…Created` / `…Updated` /
//! `…Deleted`) once the default action succeeded. A rule returning
//! [`RuleOutcome::Handled`] from a pre-event suppresses the default
//! action; any error aborts the containing transaction.

use crate::data::{Edge, Node};
use crate::error::Result;
use crate::graph::GraphManager;
use crate::trans::{OpQueue, TransOp};

/// The twelve event kinds a rule can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeStore,
    NodeUpdate,
    NodeDelete,
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    EdgeStore,
    EdgeUpdate,
    EdgeDelete,
    EdgeCreated,
    EdgeUpdated,
    EdgeDeleted,
}

impl EventKind {
    /// Pre-events precede the mutation and may veto or take it over.
    pub fn is_pre(&self) -> bool {
        matches!(
            self,
            EventKind::NodeStore
                | EventKind::NodeUpdate
                | EventKind::NodeDelete
                | EventKind::EdgeStore
                | EventKind::EdgeUpdate
                | EventKind::EdgeDelete
        )
    }
}

/// State object handed to rules.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub partition: String,
    pub node: Option<Node>,
    pub edge: Option<Edge>,
    pub old_node: Option<Node>,
    pub old_edge: Option<Edge>,
}

impl Event {
    pub fn node(kind: EventKind, partition: &str, node: Node) -> Self {
        Event {
            kind,
            partition: partition.to_string(),
            node: Some(node),
            edge: None,
            old_node: None,
            old_edge: None,
        }
    }

    pub fn edge(kind: EventKind, partition: &str, edge: Edge) -> Self {
        Event {
            kind,
            partition: partition.to_string(),
            node: None,
            edge: Some(edge),
            old_node: None,
            old_edge: None,
        }
    }

    pub fn with_old_node(mut self, old: Option<Node>) -> Self {
        self.old_node = old;
        self
    }

    pub fn with_old_edge(mut self, old: Option<Edge>) -> Self {
        self.old_edge = old;
        self
    }
}

/// What a rule decided about an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    /// Nothing special; dispatch continues.
    Continue,
    /// The rule performed the default action itself. Dispatch stops
    /// and the manager skips its own side-effect.
    Handled,
}

/// A graph rule.
///
/// `handle` may schedule follow-up operations on the queue; they run
/// after the current operation inside the same commit.
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    fn handles(&self) -> Vec<EventKind>;

    fn handle(
        &self,
        gm: &GraphManager,
        queue: &mut OpQueue,
        event: &Event,
    ) -> Result<RuleOutcome>;
}

/// System rule: node removal removes all incident edges and cascades
/// across edges whose removed end is flagged cascading.
///
/// The cascade closure is gathered iteratively: every removed node
/// queues removals for its incident edges, followed by conditional
/// removals of the nodes across cascading edges. A conditional removal
/// only fires if the candidate has no remaining incident edge that
/// would keep it alive (see [`TransOp::CascadeRemoveNode`]).
pub struct CascadeRule;

impl Rule for CascadeRule {
    fn name(&self) -> &str {
        "system.cascade"
    }

    fn handles(&self) -> Vec<EventKind> {
        vec![EventKind::NodeDeleted]
    }

    fn handle(
        &self,
        gm: &GraphManager,
        queue: &mut OpQueue,
        event: &Event,
    ) -> Result<RuleOutcome> {
        let Some(node) = &event.node else {
            return Ok(RuleOutcome::Continue);
        };

        for info in gm.incident_edges(&event.partition, node.key(), node.kind())? {
            let Some(edge) = gm.fetch_edge(&event.partition, &info.key, &info.kind)? else {
                continue;
            };
            let Some(this_end) = edge.end_of(node.key(), node.kind()) else {
                continue;
            };

            queue.push_back(TransOp::RemoveEdge {
                partition: event.partition.clone(),
                key: edge.key().to_string(),
                kind: edge.kind().to_string(),
            });

            if edge.cascading(this_end) {
                let (other_key, other_kind) = if this_end == 1 {
                    (edge.end2_key(), edge.end2_kind())
                } else {
                    (edge.end1_key(), edge.end1_kind())
                };
                queue.push_back(TransOp::CascadeRemoveNode {
                    partition: event.partition.clone(),
                    key: other_key.to_string(),
                    kind: other_kind.to_string(),
                });
            }
        }

        Ok(RuleOutcome::Continue)
    }
}
