//! Graph manager
//!
//! The public API of the graph layer: partitions, node and edge CRUD,
//! key iteration, traversal, metadata queries and cross-partition
//! search. All mutations run through an operation queue so rules can
//! schedule follow-up work (cascading removals) inside the same commit.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use quiver_storage::{PersistentMap, StorageManager};

use crate::codec;
use crate::data::{
    is_valid_kind, is_valid_partition, is_visible_partition, Edge, Node, TraversalSpec,
    CONTAINMENT_EDGE_KIND, CONTAINMENT_ROLE_GROUP, CONTAINMENT_ROLE_MEMBER, GROUP_NODE_KIND,
};
use crate::error::{GraphError, Result};
use crate::index::IndexManager;
use crate::iterator::NodeKeyIterator;
use crate::rules::{Event, EventKind, Rule, RuleOutcome};
use crate::storage::{
    manager_name, GraphStorage, SUFFIX_BLOB, SUFFIX_EDGES, SUFFIX_EDGE_INDEX, SUFFIX_NODES,
    SUFFIX_NODE_INDEX,
};
use crate::trans::{OpQueue, TransOp};

/// Root id of the key → record location table on an index storage.
const ROOT_KEY_MAP: u8 = 0;

/// Root id of the full-text index on an index storage.
const ROOT_INDEX: u8 = 1;

/// Root id of the incidence table on a node index storage.
const ROOT_INCIDENCE: u8 = 2;

// Main db keys
const MAIN_PARTITIONS: &str = "partitions";
const MAIN_NODE_KINDS: &str = "node_kinds";
const MAIN_EDGE_KINDS: &str = "edge_kinds";

fn node_attrs_key(kind: &str) -> String {
    format!("node_attrs:{kind}")
}

fn edge_attrs_key(kind: &str) -> String {
    format!("edge_attrs:{kind}")
}

fn node_edges_key(kind: &str) -> String {
    format!("node_edges:{kind}")
}

fn node_count_key(kind: &str) -> String {
    format!("node_count:{kind}")
}

fn edge_count_key(kind: &str) -> String {
    format!("edge_count:{kind}")
}

/// An edge incident to a node, as stored in the incidence table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentEdge {
    /// Edge key.
    pub key: String,
    /// Edge kind.
    pub kind: String,
    /// Which end of the edge the node sits at (1 or 2).
    pub end: u8,
}

/// A hit of a cross-partition search.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FindMatch {
    pub partition: String,
    pub kind: String,
    pub is_edge: bool,
    pub key: String,
    pub attr: String,
}

/// The graph manager.
pub struct GraphManager {
    gs: Arc<dyn GraphStorage>,
    main: RwLock<std::collections::HashMap<String, String>>,
    rules: RwLock<Vec<Arc<dyn Rule>>>,
}

impl GraphManager {
    /// Create a graph manager over the given storage. The cascade
    /// system rule is registered by default.
    pub fn new(gs: Arc<dyn GraphStorage>) -> Result<Self> {
        let main = gs.main_db()?;
        let gm = GraphManager {
            gs,
            main: RwLock::new(main),
            rules: RwLock::new(Vec::new()),
        };
        gm.register_rule(Arc::new(crate::rules::CascadeRule));
        Ok(gm)
    }

    /// Name of the underlying graph storage.
    pub fn name(&self) -> String {
        self.gs.name().to_string()
    }

    /// Register a rule. Rules are consulted in registration order.
    pub fn register_rule(&self, rule: Arc<dyn Rule>) {
        self.rules.write().unwrap().push(rule);
    }

    // === Node operations ===

    /// Store a node, overwriting all attributes of an existing node
    /// with the same key and kind.
    pub fn store_node(&self, partition: &str, node: Node) -> Result<()> {
        self.check_partition(partition)?;
        node.validate()?;
        self.apply_ops(vec![TransOp::StoreNode {
            partition: partition.to_string(),
            node,
        }])
    }

    /// Update a node, merging the given attributes into the stored
    /// ones. The node must exist.
    pub fn update_node(&self, partition: &str, node: Node) -> Result<()> {
        self.check_partition(partition)?;
        node.validate()?;
        self.apply_ops(vec![TransOp::UpdateNode {
            partition: partition.to_string(),
            node,
        }])
    }

    /// Remove a node and all its incident edges. Returns the removed
    /// node, or `None` if it did not exist.
    pub fn remove_node(
        &self,
        partition: &str,
        key: &str,
        kind: &str,
    ) -> Result<Option<Node>> {
        self.check_partition(partition)?;
        let mut queue = OpQueue::new();

        let removed = match self.apply_remove_node(partition, key, kind, &mut queue, false) {
            Ok(removed) => removed,
            Err(err) => {
                self.rollback()?;
                return Err(err);
            }
        };
        if let Err((_, err)) = self.apply_queue(&mut queue) {
            self.rollback()?;
            return Err(err);
        }
        self.flush()?;
        Ok(removed)
    }

    /// Fetch a node by key and kind. Absent nodes yield `None`.
    pub fn fetch_node(
        &self,
        partition: &str,
        key: &str,
        kind: &str,
    ) -> Result<Option<Node>> {
        self.check_partition(partition)?;
        let Some(loc) = self.lookup_location(partition, kind, SUFFIX_NODE_INDEX, key)? else {
            return Ok(None);
        };
        let Some(sm) = self.manager(partition, kind, SUFFIX_NODES, false)? else {
            return Ok(None);
        };
        Ok(Some(codec::decode_node(&sm.fetch(loc)?)?))
    }

    // === Edge operations ===

    /// Store an edge. Both endpoint nodes must exist.
    pub fn store_edge(&self, partition: &str, edge: Edge) -> Result<()> {
        self.check_partition(partition)?;
        edge.validate()?;
        self.apply_ops(vec![TransOp::StoreEdge {
            partition: partition.to_string(),
            edge,
        }])
    }

    /// Remove an edge. Returns the removed edge, or `None` if it did
    /// not exist.
    pub fn remove_edge(
        &self,
        partition: &str,
        key: &str,
        kind: &str,
    ) -> Result<Option<Edge>> {
        self.check_partition(partition)?;
        let mut queue = OpQueue::new();

        let removed = match self.apply_remove_edge(partition, key, kind, &mut queue) {
            Ok(removed) => removed,
            Err(err) => {
                self.rollback()?;
                return Err(err);
            }
        };
        if let Err((_, err)) = self.apply_queue(&mut queue) {
            self.rollback()?;
            return Err(err);
        }
        self.flush()?;
        Ok(removed)
    }

    /// Fetch an edge by key and kind.
    pub fn fetch_edge(
        &self,
        partition: &str,
        key: &str,
        kind: &str,
    ) -> Result<Option<Edge>> {
        self.check_partition(partition)?;
        let Some(loc) = self.lookup_location(partition, kind, SUFFIX_EDGE_INDEX, key)? else {
            return Ok(None);
        };
        let Some(sm) = self.manager(partition, kind, SUFFIX_EDGES, false)? else {
            return Ok(None);
        };
        Ok(Some(codec::decode_edge(&sm.fetch(loc)?)?))
    }

    // === Iteration and traversal ===

    /// Lazy iterator over the node keys of a kind. Unknown partitions
    /// or kinds yield `None`.
    pub fn node_key_iterator(
        &self,
        partition: &str,
        kind: &str,
    ) -> Result<Option<NodeKeyIterator>> {
        self.check_partition(partition)?;
        let Some(sm) = self.manager(partition, kind, SUFFIX_NODE_INDEX, false)? else {
            return Ok(None);
        };
        let map = PersistentMap::open(sm, ROOT_KEY_MAP)?;
        Ok(Some(NodeKeyIterator::new(map.iter())))
    }

    /// Follow all edges of a node that match the traversal spec
    /// `role1:edgekind:role2:nodekind` (empty fields are wildcards).
    ///
    /// Returns parallel vectors of reached nodes and traversed edges in
    /// storage order; callers sort for deterministic output. Every
    /// returned edge has end 1 swapped to the node traveled from. With
    /// `filter_nil` set, edges whose target cannot be loaded are
    /// dropped; otherwise the node slot is `None`.
    pub fn traverse_multi(
        &self,
        partition: &str,
        key: &str,
        kind: &str,
        spec: &str,
        filter_nil: bool,
    ) -> Result<(Vec<Option<Node>>, Vec<Edge>)> {
        self.check_partition(partition)?;
        let spec = TraversalSpec::parse(spec)?;

        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        for info in self.incident_edges(partition, key, kind)? {
            let Some(edge) = self.fetch_edge(partition, &info.key, &info.kind)? else {
                continue;
            };
            if !spec.matches(&edge, info.end) {
                continue;
            }

            let oriented = if info.end == 1 { edge } else { edge.swapped() };
            let target = self.fetch_node(partition, oriented.end2_key(), oriented.end2_kind())?;
            if filter_nil && target.is_none() {
                continue;
            }
            nodes.push(target);
            edges.push(oriented);
        }

        Ok((nodes, edges))
    }

    /// The edges incident to a node, as recorded in the incidence
    /// table.
    pub fn incident_edges(
        &self,
        partition: &str,
        key: &str,
        kind: &str,
    ) -> Result<Vec<IncidentEdge>> {
        let Some(sm) = self.manager(partition, kind, SUFFIX_NODE_INDEX, false)? else {
            return Ok(Vec::new());
        };
        let map = PersistentMap::open(sm, ROOT_INCIDENCE)?;
        match map.get(key)? {
            Some(data) => Ok(bincode::deserialize(&data)?),
            None => Ok(Vec::new()),
        }
    }

    // === Metadata ===

    /// All known partitions, sorted.
    pub fn partitions(&self) -> Vec<String> {
        self.get_set(MAIN_PARTITIONS).into_iter().collect()
    }

    /// All known node kinds, sorted.
    pub fn node_kinds(&self) -> Vec<String> {
        self.get_set(MAIN_NODE_KINDS).into_iter().collect()
    }

    /// All known edge kinds, sorted.
    pub fn edge_kinds(&self) -> Vec<String> {
        self.get_set(MAIN_EDGE_KINDS).into_iter().collect()
    }

    /// Attribute names ever stored on nodes of a kind, sorted.
    pub fn node_attrs(&self, kind: &str) -> Vec<String> {
        self.get_set(&node_attrs_key(kind)).into_iter().collect()
    }

    /// Attribute names ever stored on edges of a kind, sorted.
    pub fn edge_attrs(&self, kind: &str) -> Vec<String> {
        self.get_set(&edge_attrs_key(kind)).into_iter().collect()
    }

    /// Traversal specs observed from nodes of a kind, sorted.
    pub fn node_edges(&self, kind: &str) -> Vec<String> {
        self.get_set(&node_edges_key(kind)).into_iter().collect()
    }

    /// Number of stored nodes of a kind, over all partitions.
    pub fn node_count(&self, kind: &str) -> u64 {
        self.get_count(&node_count_key(kind))
    }

    /// Number of stored edges of a kind, over all partitions.
    pub fn edge_count(&self, kind: &str) -> u64 {
        self.get_count(&edge_count_key(kind))
    }

    // === Index access ===

    /// Full-text index over the nodes of a kind, or `None` if the kind
    /// is unknown in the partition.
    pub fn node_index(&self, partition: &str, kind: &str) -> Result<Option<IndexManager>> {
        self.check_partition(partition)?;
        match self.manager(partition, kind, SUFFIX_NODE_INDEX, false)? {
            Some(sm) => Ok(Some(IndexManager::open(sm, ROOT_INDEX)?)),
            None => Ok(None),
        }
    }

    /// Full-text index over the edges of a kind.
    pub fn edge_index(&self, partition: &str, kind: &str) -> Result<Option<IndexManager>> {
        self.check_partition(partition)?;
        match self.manager(partition, kind, SUFFIX_EDGE_INDEX, false)? {
            Some(sm) => Ok(Some(IndexManager::open(sm, ROOT_INDEX)?)),
            None => Ok(None),
        }
    }

    /// Search for a phrase in every attribute of every kind of every
    /// visible partition (partitions starting with `_` are skipped).
    pub fn find(&self, phrase: &str) -> Result<Vec<FindMatch>> {
        let mut matches = Vec::new();

        for partition in self.partitions() {
            if !is_visible_partition(&partition) {
                continue;
            }
            for kind in self.node_kinds() {
                if let Some(index) = self.node_index(&partition, &kind)? {
                    for attr in self.node_attrs(&kind) {
                        for key in index.lookup_phrase(&attr, phrase)? {
                            matches.push(FindMatch {
                                partition: partition.clone(),
                                kind: kind.clone(),
                                is_edge: false,
                                key,
                                attr: attr.clone(),
                            });
                        }
                    }
                }
            }
            for kind in self.edge_kinds() {
                if let Some(index) = self.edge_index(&partition, &kind)? {
                    for attr in self.edge_attrs(&kind) {
                        for key in index.lookup_phrase(&attr, phrase)? {
                            matches.push(FindMatch {
                                partition: partition.clone(),
                                kind: kind.clone(),
                                is_edge: true,
                                key,
                                attr: attr.clone(),
                            });
                        }
                    }
                }
            }
        }

        matches.sort();
        matches.dedup();
        Ok(matches)
    }

    // === Blob storage ===

    /// Store opaque binary data in the partition's blob storage and
    /// return its location.
    pub fn store_blob(&self, partition: &str, data: &[u8]) -> Result<u64> {
        self.check_partition(partition)?;
        let sm = self.must_manager(partition, "", SUFFIX_BLOB)?;
        let loc = sm.insert(data)?;
        self.flush()?;
        Ok(loc)
    }

    /// Fetch binary data. Unknown locations yield `None`.
    pub fn fetch_blob(&self, partition: &str, loc: u64) -> Result<Option<Vec<u8>>> {
        self.check_partition(partition)?;
        let Some(sm) = self.manager(partition, "", SUFFIX_BLOB, false)? else {
            return Ok(None);
        };
        match sm.fetch(loc) {
            Ok(data) => Ok(Some(data)),
            Err(quiver_storage::StorageError::SlotNotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Overwrite binary data at a location.
    pub fn update_blob(&self, partition: &str, loc: u64, data: &[u8]) -> Result<()> {
        self.check_partition(partition)?;
        let sm = self.must_manager(partition, "", SUFFIX_BLOB)?;
        sm.update(loc, data)?;
        self.flush()
    }

    /// Delete binary data. Unknown locations are a quiet no-op.
    pub fn remove_blob(&self, partition: &str, loc: u64) -> Result<()> {
        self.check_partition(partition)?;
        let Some(sm) = self.manager(partition, "", SUFFIX_BLOB, false)? else {
            return Ok(());
        };
        match sm.free(loc) {
            Ok(()) => self.flush(),
            Err(quiver_storage::StorageError::SlotNotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // === Group nodes ===

    /// Store a group node.
    pub fn store_group(&self, partition: &str, name: &str) -> Result<()> {
        self.store_node(partition, Node::with_key_kind(name, GROUP_NODE_KIND))
    }

    /// Link a node into a group via a containment edge.
    pub fn add_group_member(
        &self,
        partition: &str,
        group: &str,
        key: &str,
        kind: &str,
    ) -> Result<()> {
        let edge = Edge::between(
            &group_edge_key(group, key, kind),
            CONTAINMENT_EDGE_KIND,
            (group, GROUP_NODE_KIND, CONTAINMENT_ROLE_GROUP, false),
            (key, kind, CONTAINMENT_ROLE_MEMBER, false),
        );
        self.store_edge(partition, edge)
    }

    /// Unlink a node from a group.
    pub fn remove_group_member(
        &self,
        partition: &str,
        group: &str,
        key: &str,
        kind: &str,
    ) -> Result<()> {
        self.remove_edge(
            partition,
            &group_edge_key(group, key, kind),
            CONTAINMENT_EDGE_KIND,
        )?;
        Ok(())
    }

    /// Keys and kinds of a group's members, sorted.
    pub fn group_members(&self, partition: &str, group: &str) -> Result<Vec<(String, String)>> {
        let spec = format!("{CONTAINMENT_ROLE_GROUP}:{CONTAINMENT_EDGE_KIND}:{CONTAINMENT_ROLE_MEMBER}:");
        let (nodes, _) =
            self.traverse_multi(partition, group, GROUP_NODE_KIND, &spec, true)?;
        let mut members: Vec<(String, String)> = nodes
            .into_iter()
            .flatten()
            .map(|n| (n.key().to_string(), n.kind().to_string()))
            .collect();
        members.sort();
        Ok(members)
    }

    // === Flush / rollback ===

    /// Persist all storages.
    pub fn flush(&self) -> Result<()> {
        Ok(self.gs.flush_all()?)
    }

    /// Revert all storages to the last flush and reload the registry.
    pub fn rollback(&self) -> Result<()> {
        self.gs.rollback_all()?;
        *self.main.write().unwrap() = self.gs.main_db()?;
        Ok(())
    }

    /// Flush and close all storages.
    pub fn close(&self) -> Result<()> {
        Ok(self.gs.close()?)
    }

    // === Operation queue ===

    /// Drain the queue, applying each operation. Rules may push more
    /// operations while the queue drains. Neither flushes nor rolls
    /// back; callers own the commit boundary.
    pub(crate) fn apply_queue(
        &self,
        queue: &mut OpQueue,
    ) -> std::result::Result<(), (TransOp, GraphError)> {
        while let Some(op) = queue.pop_front() {
            if let Err(err) = self.apply_op(&op, queue) {
                return Err((op, err));
            }
        }
        Ok(())
    }

    fn apply_ops(&self, ops: Vec<TransOp>) -> Result<()> {
        let mut queue: OpQueue = ops.into();
        match self.apply_queue(&mut queue) {
            Ok(()) => self.flush(),
            Err((_, err)) => {
                self.rollback()?;
                Err(err)
            }
        }
    }

    fn apply_op(&self, op: &TransOp, queue: &mut OpQueue) -> Result<()> {
        match op {
            TransOp::StoreNode { partition, node } => {
                self.apply_store_node(partition, node, false, queue)
            }
            TransOp::UpdateNode { partition, node } => {
                self.apply_store_node(partition, node, true, queue)
            }
            TransOp::RemoveNode {
                partition,
                key,
                kind,
            } => self
                .apply_remove_node(partition, key, kind, queue, false)
                .map(|_| ()),
            TransOp::CascadeRemoveNode {
                partition,
                key,
                kind,
            } => self
                .apply_remove_node(partition, key, kind, queue, true)
                .map(|_| ()),
            TransOp::StoreEdge { partition, edge } => {
                self.apply_store_edge(partition, edge, queue)
            }
            TransOp::RemoveEdge {
                partition,
                key,
                kind,
            } => self.apply_remove_edge(partition, key, kind, queue).map(|_| ()),
        }
    }

    fn apply_store_node(
        &self,
        partition: &str,
        node: &Node,
        merge: bool,
        queue: &mut OpQueue,
    ) -> Result<()> {
        self.check_partition(partition)?;
        node.validate()?;
        let key = node.key().to_string();
        let kind = node.kind().to_string();

        let pre = if merge {
            EventKind::NodeUpdate
        } else {
            EventKind::NodeStore
        };
        if self.dispatch(queue, &Event::node(pre, partition, node.clone()))? {
            return Ok(());
        }

        let nodes_sm = self.must_manager(partition, &kind, SUFFIX_NODES)?;
        let idx_sm = self.must_manager(partition, &kind, SUFFIX_NODE_INDEX)?;
        let mut key_map = PersistentMap::open(Arc::clone(&idx_sm), ROOT_KEY_MAP)?;

        let old = match key_map.get(&key)? {
            Some(loc_bytes) => {
                let loc: u64 = bincode::deserialize(&loc_bytes)?;
                Some((loc, codec::decode_node(&nodes_sm.fetch(loc)?)?))
            }
            None => None,
        };

        let stored = match (&old, merge) {
            (None, true) => {
                return Err(GraphError::NotFound(format!(
                    "node {key} of kind {kind} in partition {partition}"
                )))
            }
            (Some((_, old_node)), true) => {
                let mut merged = old_node.clone();
                merged.merge(node);
                merged
            }
            (_, false) => node.clone(),
        };

        let mut index = IndexManager::open(Arc::clone(&idx_sm), ROOT_INDEX)?;
        match &old {
            Some((loc, old_node)) => {
                // Record first, index second: the reverse of removal.
                nodes_sm.update(*loc, &codec::encode_node(&stored)?)?;
                index.reindex_entity(&key, old_node.attrs(), stored.attrs())?;
            }
            None => {
                let loc = nodes_sm.insert(&codec::encode_node(&stored)?)?;
                key_map.put(&key, bincode::serialize(&loc)?)?;
                index.index_entity(&key, stored.attrs())?;
                self.bump_count(&node_count_key(&kind), 1)?;
            }
        }

        self.register_node(partition, &kind, &stored)?;
        debug!(%partition, %kind, %key, updated = old.is_some(), "stored node");

        let post = if old.is_some() {
            EventKind::NodeUpdated
        } else {
            EventKind::NodeCreated
        };
        let old_node = old.map(|(_, n)| n);
        self.dispatch(
            queue,
            &Event::node(post, partition, stored).with_old_node(old_node),
        )?;
        Ok(())
    }

    fn apply_remove_node(
        &self,
        partition: &str,
        key: &str,
        kind: &str,
        queue: &mut OpQueue,
        conditional: bool,
    ) -> Result<Option<Node>> {
        self.check_partition(partition)?;
        if !is_valid_kind(kind) {
            return Err(GraphError::InvalidData(format!(
                "Invalid node kind: {kind:?}"
            )));
        }

        let Some(nodes_sm) = self.manager(partition, kind, SUFFIX_NODES, false)? else {
            return Ok(None);
        };
        let Some(idx_sm) = self.manager(partition, kind, SUFFIX_NODE_INDEX, false)? else {
            return Ok(None);
        };
        let mut key_map = PersistentMap::open(Arc::clone(&idx_sm), ROOT_KEY_MAP)?;
        let Some(loc_bytes) = key_map.get(key)? else {
            return Ok(None);
        };
        let loc: u64 = bincode::deserialize(&loc_bytes)?;
        let node = codec::decode_node(&nodes_sm.fetch(loc)?)?;

        if conditional && !self.is_cascade_orphan(partition, key, kind)? {
            return Ok(None);
        }

        if self.dispatch(queue, &Event::node(EventKind::NodeDelete, partition, node.clone()))? {
            return Ok(Some(node));
        }

        // Index entries go before the record itself.
        let mut index = IndexManager::open(Arc::clone(&idx_sm), ROOT_INDEX)?;
        index.deindex_entity(key, node.attrs())?;
        key_map.remove(key)?;
        nodes_sm.free(loc)?;
        self.bump_count(&node_count_key(kind), -1)?;
        debug!(%partition, %kind, %key, "removed node");

        self.dispatch(
            queue,
            &Event::node(EventKind::NodeDeleted, partition, node.clone()),
        )?;
        Ok(Some(node))
    }

    /// True if every remaining incident edge of the node would cascade
    /// into it anyway, i.e. nothing keeps it alive.
    fn is_cascade_orphan(&self, partition: &str, key: &str, kind: &str) -> Result<bool> {
        for info in self.incident_edges(partition, key, kind)? {
            if let Some(edge) = self.fetch_edge(partition, &info.key, &info.kind)? {
                let other_end = if info.end == 1 { 2 } else { 1 };
                if !edge.cascading(other_end) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn apply_store_edge(
        &self,
        partition: &str,
        edge: &Edge,
        queue: &mut OpQueue,
    ) -> Result<()> {
        self.check_partition(partition)?;
        edge.validate()?;
        let key = edge.key().to_string();
        let kind = edge.kind().to_string();

        for (ekey, ekind, end) in [
            (edge.end1_key(), edge.end1_kind(), "end1"),
            (edge.end2_key(), edge.end2_kind(), "end2"),
        ] {
            if self
                .lookup_location(partition, ekind, SUFFIX_NODE_INDEX, ekey)?
                .is_none()
            {
                return Err(GraphError::NotFound(format!(
                    "edge {end} node {ekey} of kind {ekind} in partition {partition}"
                )));
            }
        }

        if self.dispatch(queue, &Event::edge(EventKind::EdgeStore, partition, edge.clone()))? {
            return Ok(());
        }

        let edges_sm = self.must_manager(partition, &kind, SUFFIX_EDGES)?;
        let idx_sm = self.must_manager(partition, &kind, SUFFIX_EDGE_INDEX)?;
        let mut key_map = PersistentMap::open(Arc::clone(&idx_sm), ROOT_KEY_MAP)?;

        let old = match key_map.get(&key)? {
            Some(loc_bytes) => {
                let loc: u64 = bincode::deserialize(&loc_bytes)?;
                Some((loc, codec::decode_edge(&edges_sm.fetch(loc)?)?))
            }
            None => None,
        };

        let mut index = IndexManager::open(Arc::clone(&idx_sm), ROOT_INDEX)?;
        match &old {
            Some((loc, old_edge)) => {
                // Endpoints may have changed; detach the old ones.
                self.remove_incidence(partition, old_edge, &key, &kind)?;
                edges_sm.update(*loc, &codec::encode_edge(edge)?)?;
                index.reindex_entity(&key, old_edge.node().attrs(), edge.node().attrs())?;
            }
            None => {
                let loc = edges_sm.insert(&codec::encode_edge(edge)?)?;
                key_map.put(&key, bincode::serialize(&loc)?)?;
                index.index_entity(&key, edge.node().attrs())?;
                self.bump_count(&edge_count_key(&kind), 1)?;
            }
        }

        self.add_incidence(
            partition,
            edge.end1_kind(),
            edge.end1_key(),
            IncidentEdge {
                key: key.clone(),
                kind: kind.clone(),
                end: 1,
            },
        )?;
        self.add_incidence(
            partition,
            edge.end2_kind(),
            edge.end2_key(),
            IncidentEdge {
                key: key.clone(),
                kind: kind.clone(),
                end: 2,
            },
        )?;

        self.register_edge(partition, edge)?;
        debug!(%partition, %kind, %key, updated = old.is_some(), "stored edge");

        let post = if old.is_some() {
            EventKind::EdgeUpdated
        } else {
            EventKind::EdgeCreated
        };
        let old_edge = old.map(|(_, e)| e);
        self.dispatch(
            queue,
            &Event::edge(post, partition, edge.clone()).with_old_edge(old_edge),
        )?;
        Ok(())
    }

    fn apply_remove_edge(
        &self,
        partition: &str,
        key: &str,
        kind: &str,
        queue: &mut OpQueue,
    ) -> Result<Option<Edge>> {
        self.check_partition(partition)?;
        if !is_valid_kind(kind) {
            return Err(GraphError::InvalidData(format!(
                "Invalid edge kind: {kind:?}"
            )));
        }

        let Some(edges_sm) = self.manager(partition, kind, SUFFIX_EDGES, false)? else {
            return Ok(None);
        };
        let Some(idx_sm) = self.manager(partition, kind, SUFFIX_EDGE_INDEX, false)? else {
            return Ok(None);
        };
        let mut key_map = PersistentMap::open(Arc::clone(&idx_sm), ROOT_KEY_MAP)?;
        let Some(loc_bytes) = key_map.get(key)? else {
            return Ok(None);
        };
        let loc: u64 = bincode::deserialize(&loc_bytes)?;
        let edge = codec::decode_edge(&edges_sm.fetch(loc)?)?;

        if self.dispatch(queue, &Event::edge(EventKind::EdgeDelete, partition, edge.clone()))? {
            return Ok(Some(edge));
        }

        let mut index = IndexManager::open(Arc::clone(&idx_sm), ROOT_INDEX)?;
        index.deindex_entity(key, edge.node().attrs())?;
        key_map.remove(key)?;
        edges_sm.free(loc)?;
        self.bump_count(&edge_count_key(kind), -1)?;
        self.remove_incidence(partition, &edge, key, kind)?;
        debug!(%partition, %kind, %key, "removed edge");

        self.dispatch(
            queue,
            &Event::edge(EventKind::EdgeDeleted, partition, edge.clone()),
        )?;
        Ok(Some(edge))
    }

    // === Event dispatch ===

    /// Run every rule subscribed to the event's kind. Returns true if
    /// a rule handled the event (dispatch stops and the default action
    /// is skipped).
    fn dispatch(&self, queue: &mut OpQueue, event: &Event) -> Result<bool> {
        let interested: Vec<Arc<dyn Rule>> = self
            .rules
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.handles().contains(&event.kind))
            .cloned()
            .collect();

        for rule in interested {
            match rule.handle(self, queue, event) {
                Ok(RuleOutcome::Continue) => {}
                Ok(RuleOutcome::Handled) => return Ok(true),
                Err(GraphError::EventHandled) => return Ok(true),
                // Sentinels pass through unwrapped so callers can
                // compare by identity.
                Err(err @ GraphError::WebEventHandled { .. }) => return Err(err),
                Err(err) => {
                    return Err(GraphError::Rule {
                        rule: rule.name().to_string(),
                        source: Box::new(err),
                    })
                }
            }
        }
        Ok(false)
    }

    // === Storage plumbing ===

    fn check_partition(&self, partition: &str) -> Result<()> {
        if !is_valid_partition(partition) {
            return Err(GraphError::InvalidData(format!(
                "Invalid partition name: {partition:?}"
            )));
        }
        Ok(())
    }

    fn manager(
        &self,
        partition: &str,
        kind: &str,
        suffix: &str,
        create: bool,
    ) -> Result<Option<Arc<dyn StorageManager>>> {
        Ok(self
            .gs
            .storage_manager(&manager_name(partition, kind, suffix), create)?)
    }

    fn must_manager(
        &self,
        partition: &str,
        kind: &str,
        suffix: &str,
    ) -> Result<Arc<dyn StorageManager>> {
        self.manager(partition, kind, suffix, true)?.ok_or_else(|| {
            GraphError::Index(format!(
                "storage {} could not be created",
                manager_name(partition, kind, suffix)
            ))
        })
    }

    fn lookup_location(
        &self,
        partition: &str,
        kind: &str,
        idx_suffix: &str,
        key: &str,
    ) -> Result<Option<u64>> {
        let Some(sm) = self.manager(partition, kind, idx_suffix, false)? else {
            return Ok(None);
        };
        let map = PersistentMap::open(sm, ROOT_KEY_MAP)?;
        match map.get(key)? {
            Some(loc_bytes) => Ok(Some(bincode::deserialize(&loc_bytes)?)),
            None => Ok(None),
        }
    }

    fn add_incidence(
        &self,
        partition: &str,
        node_kind: &str,
        node_key: &str,
        entry: IncidentEdge,
    ) -> Result<()> {
        let sm = self.must_manager(partition, node_kind, SUFFIX_NODE_INDEX)?;
        let mut map = PersistentMap::open(sm, ROOT_INCIDENCE)?;
        let mut list: Vec<IncidentEdge> = match map.get(node_key)? {
            Some(data) => bincode::deserialize(&data)?,
            None => Vec::new(),
        };
        if !list.contains(&entry) {
            list.push(entry);
            map.put(node_key, bincode::serialize(&list)?)?;
        }
        Ok(())
    }

    /// Detach an edge from both of its endpoints' incidence lists.
    fn remove_incidence(
        &self,
        partition: &str,
        edge: &Edge,
        edge_key: &str,
        edge_kind: &str,
    ) -> Result<()> {
        for (nkind, nkey) in [
            (edge.end1_kind(), edge.end1_key()),
            (edge.end2_kind(), edge.end2_key()),
        ] {
            let Some(sm) = self.manager(partition, nkind, SUFFIX_NODE_INDEX, false)? else {
                continue;
            };
            let mut map = PersistentMap::open(sm, ROOT_INCIDENCE)?;
            let Some(data) = map.get(nkey)? else {
                continue;
            };
            let mut list: Vec<IncidentEdge> = bincode::deserialize(&data)?;
            let before = list.len();
            list.retain(|e| !(e.key == edge_key && e.kind == edge_kind));
            if list.len() != before {
                if list.is_empty() {
                    map.remove(nkey)?;
                } else {
                    map.put(nkey, bincode::serialize(&list)?)?;
                }
            }
        }
        Ok(())
    }

    // === Main db registry ===

    fn get_set(&self, key: &str) -> BTreeSet<String> {
        self.main
            .read()
            .unwrap()
            .get(key)
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default()
    }

    fn put_set(&self, key: &str, set: &BTreeSet<String>) -> Result<()> {
        let encoded = serde_json::to_string(set)
            .map_err(|e| GraphError::Index(format!("registry encoding failed: {e}")))?;
        let mut main = self.main.write().unwrap();
        main.insert(key.to_string(), encoded);
        self.gs.update_main_db(main.clone())?;
        Ok(())
    }

    fn get_count(&self, key: &str) -> u64 {
        self.main
            .read()
            .unwrap()
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn bump_count(&self, key: &str, delta: i64) -> Result<()> {
        let mut main = self.main.write().unwrap();
        let current: u64 = main.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = if delta < 0 {
            current.saturating_sub(delta.unsigned_abs())
        } else {
            current + delta as u64
        };
        main.insert(key.to_string(), next.to_string());
        self.gs.update_main_db(main.clone())?;
        Ok(())
    }

    fn register_node(&self, partition: &str, kind: &str, node: &Node) -> Result<()> {
        let mut partitions = self.get_set(MAIN_PARTITIONS);
        if partitions.insert(partition.to_string()) {
            self.put_set(MAIN_PARTITIONS, &partitions)?;
        }

        let mut kinds = self.get_set(MAIN_NODE_KINDS);
        if kinds.insert(kind.to_string()) {
            self.put_set(MAIN_NODE_KINDS, &kinds)?;
        }

        let mut attrs = self.get_set(&node_attrs_key(kind));
        let before = attrs.len();
        attrs.extend(node.attr_names());
        if attrs.len() != before {
            self.put_set(&node_attrs_key(kind), &attrs)?;
        }
        Ok(())
    }

    fn register_edge(&self, partition: &str, edge: &Edge) -> Result<()> {
        let mut partitions = self.get_set(MAIN_PARTITIONS);
        if partitions.insert(partition.to_string()) {
            self.put_set(MAIN_PARTITIONS, &partitions)?;
        }

        let kind = edge.kind();
        let mut kinds = self.get_set(MAIN_EDGE_KINDS);
        if kinds.insert(kind.to_string()) {
            self.put_set(MAIN_EDGE_KINDS, &kinds)?;
        }

        let mut attrs = self.get_set(&edge_attrs_key(kind));
        let before = attrs.len();
        attrs.extend(edge.node().attr_names());
        if attrs.len() != before {
            self.put_set(&edge_attrs_key(kind), &attrs)?;
        }

        // Observed traversal specs, from both directions.
        let forward = format!(
            "{}:{}:{}:{}",
            edge.end1_role(),
            kind,
            edge.end2_role(),
            edge.end2_kind()
        );
        let backward = format!(
            "{}:{}:{}:{}",
            edge.end2_role(),
            kind,
            edge.end1_role(),
            edge.end1_kind()
        );
        for (node_kind, spec) in [(edge.end1_kind(), forward), (edge.end2_kind(), backward)] {
            let mut specs = self.get_set(&node_edges_key(node_kind));
            if specs.insert(spec) {
                self.put_set(&node_edges_key(node_kind), &specs)?;
            }
        }
        Ok(())
    }
}

fn group_edge_key(group: &str, key: &str, kind: &str) -> String {
    format!("{group}:{kind}:{key}")
}
