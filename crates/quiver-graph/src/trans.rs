//! Graph transactions
//!
//! A transaction queues graph operations and applies them in order on
//! commit. Rules may append follow-up operations (e.g. cascading
//! removals) to the running queue; the queue drains until empty. A
//! commit is atomic per graph storage: on failure everything since the
//! last flush is rolled back and the unapplied operations stay queued
//! for a retry.

use std::collections::VecDeque;

use crate::data::{Edge, Node};
use crate::error::Result;
use crate::graph::GraphManager;

/// A queued graph operation.
#[derive(Debug, Clone)]
pub enum TransOp {
    StoreNode {
        partition: String,
        node: Node,
    },
    UpdateNode {
        partition: String,
        node: Node,
    },
    RemoveNode {
        partition: String,
        key: String,
        kind: String,
    },
    StoreEdge {
        partition: String,
        edge: Edge,
    },
    RemoveEdge {
        partition: String,
        key: String,
        kind: String,
    },
    /// Remove a node only if all of its remaining incident edges would
    /// cascade into it anyway. Queued by the cascade rule after the
    /// connecting edge has been removed.
    CascadeRemoveNode {
        partition: String,
        key: String,
        kind: String,
    },
}

/// The work queue a commit drains. Rules receive it to schedule
/// follow-up operations.
pub type OpQueue = VecDeque<TransOp>;

/// A batch of graph operations committed together.
pub struct Transaction<'a> {
    gm: &'a GraphManager,
    ops: Vec<TransOp>,
    failed: Option<(TransOp, String)>,
}

impl<'a> Transaction<'a> {
    pub fn new(gm: &'a GraphManager) -> Self {
        Transaction {
            gm,
            ops: Vec::new(),
            failed: None,
        }
    }

    pub fn store_node(&mut self, partition: &str, node: Node) {
        self.ops.push(TransOp::StoreNode {
            partition: partition.to_string(),
            node,
        });
    }

    pub fn update_node(&mut self, partition: &str, node: Node) {
        self.ops.push(TransOp::UpdateNode {
            partition: partition.to_string(),
            node,
        });
    }

    pub fn remove_node(&mut self, partition: &str, key: &str, kind: &str) {
        self.ops.push(TransOp::RemoveNode {
            partition: partition.to_string(),
            key: key.to_string(),
            kind: kind.to_string(),
        });
    }

    pub fn store_edge(&mut self, partition: &str, edge: Edge) {
        self.ops.push(TransOp::StoreEdge {
            partition: partition.to_string(),
            edge,
        });
    }

    pub fn remove_edge(&mut self, partition: &str, key: &str, kind: &str) {
        self.ops.push(TransOp::RemoveEdge {
            partition: partition.to_string(),
            key: key.to_string(),
            kind: kind.to_string(),
        });
    }

    /// Number of queued operations.
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queued operation counts as
    /// `(node inserts, edge inserts, node removals, edge removals)`.
    /// Updates count as inserts.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut c = (0, 0, 0, 0);
        for op in &self.ops {
            match op {
                TransOp::StoreNode { .. } | TransOp::UpdateNode { .. } => c.0 += 1,
                TransOp::StoreEdge { .. } => c.1 += 1,
                TransOp::RemoveNode { .. } | TransOp::CascadeRemoveNode { .. } => c.2 += 1,
                TransOp::RemoveEdge { .. } => c.3 += 1,
            }
        }
        c
    }

    /// The operation that failed the last commit, with its cause.
    pub fn failed(&self) -> Option<&(TransOp, String)> {
        self.failed.as_ref()
    }

    /// Apply all queued operations in order. On failure the storage is
    /// rolled back, the failing operation and everything after it stay
    /// queued, and the cause is returned.
    pub fn commit(&mut self) -> Result<()> {
        self.failed = None;
        let mut queue: OpQueue = self.ops.drain(..).collect();

        match self.gm.apply_queue(&mut queue) {
            Ok(()) => {
                self.gm.flush()?;
                Ok(())
            }
            Err((op, err)) => {
                self.gm.rollback()?;
                self.failed = Some((op.clone(), err.to_string()));
                self.ops = std::iter::once(op).chain(queue).collect();
                Err(err)
            }
        }
    }

    /// Drop all queued operations.
    pub fn discard(&mut self) {
        self.ops.clear();
        self.failed = None;
    }
}

/// A transaction that commits automatically whenever the queued
/// operation count reaches a threshold.
pub struct RollingTransaction<'a> {
    trans: Transaction<'a>,
    threshold: usize,
    commits: usize,
}

impl<'a> RollingTransaction<'a> {
    pub fn new(gm: &'a GraphManager, threshold: usize) -> Self {
        RollingTransaction {
            trans: Transaction::new(gm),
            threshold: threshold.max(1),
            commits: 0,
        }
    }

    fn roll(&mut self) -> Result<()> {
        if self.trans.op_count() >= self.threshold {
            self.trans.commit()?;
            self.commits += 1;
        }
        Ok(())
    }

    pub fn store_node(&mut self, partition: &str, node: Node) -> Result<()> {
        self.trans.store_node(partition, node);
        self.roll()
    }

    pub fn update_node(&mut self, partition: &str, node: Node) -> Result<()> {
        self.trans.update_node(partition, node);
        self.roll()
    }

    pub fn remove_node(&mut self, partition: &str, key: &str, kind: &str) -> Result<()> {
        self.trans.remove_node(partition, key, kind);
        self.roll()
    }

    pub fn store_edge(&mut self, partition: &str, edge: Edge) -> Result<()> {
        self.trans.store_edge(partition, edge);
        self.roll()
    }

    pub fn remove_edge(&mut self, partition: &str, key: &str, kind: &str) -> Result<()> {
        self.trans.remove_edge(partition, key, kind);
        self.roll()
    }

    /// Number of automatic commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Commit whatever is still queued.
    pub fn commit(&mut self) -> Result<()> {
        if !self.trans.is_empty() {
            self.trans.commit()?;
            self.commits += 1;
        }
        Ok(())
    }
}

impl TransOp {
    /// Partition and kind the operation touches, for logging.
    pub fn describe(&self) -> (&str, &str) {
        match self {
            TransOp::StoreNode { partition, node } | TransOp::UpdateNode { partition, node } => {
                (partition, node.kind())
            }
            TransOp::StoreEdge { partition, edge } => (partition, edge.kind()),
            TransOp::RemoveNode {
                partition, kind, ..
            }
            | TransOp::RemoveEdge {
                partition, kind, ..
            }
            | TransOp::CascadeRemoveNode {
                partition, kind, ..
            } => (partition, kind),
        }
    }
}
