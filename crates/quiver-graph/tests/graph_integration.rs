//! End-to-end tests for the graph manager

use std::sync::Arc;

use quiver_graph::{
    Edge, Event, EventKind, GraphError, GraphManager, GraphStorage, MemoryGraphStorage, Node,
    OpQueue, Rule, RuleOutcome, Transaction, Value,
};

fn fresh_gm() -> GraphManager {
    let gs: Arc<dyn GraphStorage> = Arc::new(MemoryGraphStorage::new("test"));
    GraphManager::new(gs).unwrap()
}

fn author_with_songs(gm: &GraphManager) {
    let mut author = Node::with_key_kind("000", "Author");
    author.set_attr("name", Value::from("John"));
    gm.store_node("main", author).unwrap();

    for key in ["Aria1", "Aria2"] {
        gm.store_node("main", Node::with_key_kind(key, "Song"))
            .unwrap();
        let edge = Edge::between(
            &format!("wrote-{key}"),
            "Wrote",
            ("000", "Author", "Author", true),
            (key, "Song", "Song", false),
        );
        gm.store_edge("main", edge).unwrap();
    }
}

#[test]
fn store_fetch_update_remove_roundtrip() {
    let gm = fresh_gm();

    let mut node = Node::with_key_kind("000", "Author");
    node.set_attr("name", Value::from("John"));
    node.set_attr("ranking", Value::Int(3));
    gm.store_node("main", node).unwrap();

    let fetched = gm.fetch_node("main", "000", "Author").unwrap().unwrap();
    assert_eq!(fetched.attr_string("name").as_deref(), Some("John"));
    assert_eq!(gm.node_count("Author"), 1);

    // Update merges attributes.
    let mut patch = Node::with_key_kind("000", "Author");
    patch.set_attr("ranking", Value::Int(5));
    gm.update_node("main", patch).unwrap();

    let fetched = gm.fetch_node("main", "000", "Author").unwrap().unwrap();
    assert_eq!(fetched.attr("ranking"), Some(&Value::Int(5)));
    assert_eq!(fetched.attr_string("name").as_deref(), Some("John"));

    // Store overwrites all attributes.
    let mut replacement = Node::with_key_kind("000", "Author");
    replacement.set_attr("ranking", Value::Int(1));
    gm.store_node("main", replacement).unwrap();
    let fetched = gm.fetch_node("main", "000", "Author").unwrap().unwrap();
    assert_eq!(fetched.attr("name"), None);

    let removed = gm.remove_node("main", "000", "Author").unwrap().unwrap();
    assert_eq!(removed.key(), "000");
    assert_eq!(gm.node_count("Author"), 0);
    assert!(gm.fetch_node("main", "000", "Author").unwrap().is_none());

    // Removing again is a quiet no-op.
    assert!(gm.remove_node("main", "000", "Author").unwrap().is_none());
}

#[test]
fn update_missing_node_is_not_found() {
    let gm = fresh_gm();
    let patch = Node::with_key_kind("ghost", "Author");
    assert!(matches!(
        gm.update_node("main", patch),
        Err(GraphError::NotFound(_))
    ));
}

#[test]
fn invalid_partition_is_rejected() {
    let gm = fresh_gm();
    let node = Node::with_key_kind("000", "Author");
    assert!(matches!(
        gm.store_node("bad partition", node),
        Err(GraphError::InvalidData(_))
    ));
}

#[test]
fn edge_requires_endpoints() {
    let gm = fresh_gm();
    gm.store_node("main", Node::with_key_kind("000", "Author"))
        .unwrap();

    let edge = Edge::between(
        "e1",
        "Wrote",
        ("000", "Author", "Author", false),
        ("missing", "Song", "Song", false),
    );
    assert!(matches!(
        gm.store_edge("main", edge),
        Err(GraphError::NotFound(_))
    ));
}

#[test]
fn traversal_follows_spec_in_both_directions() {
    let gm = fresh_gm();
    author_with_songs(&gm);

    let (nodes, edges) = gm
        .traverse_multi("main", "000", "Author", "Author:Wrote:Song:Song", true)
        .unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(edges.len(), 2);

    let mut keys: Vec<String> = nodes
        .iter()
        .map(|n| n.as_ref().unwrap().key().to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["Aria1".to_string(), "Aria2".to_string()]);

    // Every returned edge has end 1 at the traversal origin.
    for edge in &edges {
        assert_eq!(edge.end1_key(), "000");
        assert_eq!(edge.end2_kind(), "Song");
    }

    // From the song side the same edge appears with swapped ends.
    let (nodes, edges) = gm
        .traverse_multi("main", "Aria1", "Song", ":::", true)
        .unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(edges[0].end1_key(), "Aria1");
    assert_eq!(edges[0].end2_key(), "000");

    // A non-matching spec yields nothing.
    let (nodes, _) = gm
        .traverse_multi("main", "000", "Author", "Song:Wrote:Author:Author", true)
        .unwrap();
    assert!(nodes.is_empty());

    // Ill-formed specs fail.
    assert!(matches!(
        gm.traverse_multi("main", "000", "Author", "a:b", true),
        Err(GraphError::InvalidData(_))
    ));
}

#[test]
fn node_key_iterator_lists_kind() {
    let gm = fresh_gm();
    author_with_songs(&gm);

    let mut keys: Vec<String> = gm
        .node_key_iterator("main", "Song")
        .unwrap()
        .unwrap()
        .map(|k| k.unwrap())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["Aria1".to_string(), "Aria2".to_string()]);

    assert!(gm.node_key_iterator("main", "Unknown").unwrap().is_none());
    assert!(gm.node_key_iterator("other", "Song").unwrap().is_none());
}

#[test]
fn removing_node_removes_incident_edges() {
    let gm = fresh_gm();
    author_with_songs(&gm);
    assert_eq!(gm.edge_count("Wrote"), 2);

    gm.remove_node("main", "Aria1", "Song").unwrap();

    assert_eq!(gm.edge_count("Wrote"), 1);
    assert!(gm.fetch_edge("main", "wrote-Aria1", "Wrote").unwrap().is_none());

    let (nodes, _) = gm
        .traverse_multi("main", "000", "Author", ":::", true)
        .unwrap();
    assert_eq!(nodes.len(), 1);
}

#[test]
fn cascading_delete_removes_dependents() {
    let gm = fresh_gm();
    author_with_songs(&gm);
    assert_eq!(gm.node_count("Song"), 2);

    // The Wrote edges cascade from end 1 (the author): removing the
    // author removes the edges and both orphaned songs.
    gm.remove_node("main", "000", "Author").unwrap();

    assert_eq!(gm.edge_count("Wrote"), 0);
    assert_eq!(gm.node_count("Song"), 0);
    assert!(gm.fetch_node("main", "Aria1", "Song").unwrap().is_none());
}

#[test]
fn cascade_spares_nodes_with_other_support() {
    let gm = fresh_gm();
    author_with_songs(&gm);

    // Aria1 is also on an album; the album edge does not cascade into
    // the song, so the song survives the author's removal.
    gm.store_node("main", Node::with_key_kind("Album1", "Album"))
        .unwrap();
    let edge = Edge::between(
        "on-album",
        "Appears",
        ("Album1", "Album", "Album", false),
        ("Aria1", "Song", "Song", false),
    );
    gm.store_edge("main", edge).unwrap();

    gm.remove_node("main", "000", "Author").unwrap();

    assert!(gm.fetch_node("main", "Aria1", "Song").unwrap().is_some());
    assert!(gm.fetch_node("main", "Aria2", "Song").unwrap().is_none());
    assert_eq!(gm.node_count("Song"), 1);
}

#[test]
fn index_reflects_stored_values() {
    let gm = fresh_gm();
    let mut node = Node::with_key_kind("000", "Author");
    node.set_attr(
        "desc",
        Value::from(
            "One of the most popular acoustic artists of the decade \
             and one of its best-selling artists.",
        ),
    );
    gm.store_node("main", node).unwrap();

    let index = gm.node_index("main", "Author").unwrap().unwrap();
    let positions = index.lookup_word("desc", "artists").unwrap();
    assert_eq!(positions.get("000"), Some(&vec![7, 17]));

    assert_eq!(
        index.lookup_phrase("desc", "best-selling artists").unwrap(),
        vec!["000".to_string()]
    );

    gm.remove_node("main", "000", "Author").unwrap();
    let index = gm.node_index("main", "Author").unwrap().unwrap();
    assert!(index.lookup_word("desc", "artists").unwrap().is_empty());
}

#[test]
fn find_searches_visible_partitions() {
    let gm = fresh_gm();

    let mut node = Node::with_key_kind("000", "Author");
    node.set_attr("name", Value::from("John Lee"));
    gm.store_node("main", node.clone()).unwrap();
    gm.store_node("_hidden", node).unwrap();

    let matches = gm.find("John Lee").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].partition, "main");
    assert_eq!(matches[0].key, "000");
    assert_eq!(matches[0].attr, "name");
}

#[test]
fn metadata_registries() {
    let gm = fresh_gm();
    author_with_songs(&gm);

    assert_eq!(gm.partitions(), vec!["main".to_string()]);
    assert_eq!(
        gm.node_kinds(),
        vec!["Author".to_string(), "Song".to_string()]
    );
    assert_eq!(gm.edge_kinds(), vec!["Wrote".to_string()]);
    assert!(gm.node_attrs("Author").contains(&"name".to_string()));
    assert!(gm
        .node_edges("Author")
        .contains(&"Author:Wrote:Song:Song".to_string()));
    assert!(gm
        .node_edges("Song")
        .contains(&"Song:Wrote:Author:Author".to_string()));
}

#[test]
fn transaction_commits_atomically() {
    let gm = fresh_gm();

    let mut trans = Transaction::new(&gm);
    trans.store_node("main", Node::with_key_kind("000", "Author"));
    trans.store_node("main", Node::with_key_kind("Aria1", "Song"));
    trans.store_edge(
        "main",
        Edge::between(
            "e1",
            "Wrote",
            ("000", "Author", "Author", true),
            ("Aria1", "Song", "Song", false),
        ),
    );
    assert_eq!(trans.counts(), (2, 1, 0, 0));

    trans.commit().unwrap();
    assert_eq!(gm.node_count("Author"), 1);
    assert_eq!(gm.edge_count("Wrote"), 1);
}

#[test]
fn failed_commit_leaves_counts_unchanged() {
    let gm = fresh_gm();
    gm.store_node("main", Node::with_key_kind("000", "Author"))
        .unwrap();
    let nodes_before = gm.node_count("Author");
    let songs_before = gm.node_count("Song");

    let mut trans = Transaction::new(&gm);
    trans.store_node("main", Node::with_key_kind("Aria1", "Song"));
    // The edge references a missing endpoint and fails the commit.
    trans.store_edge(
        "main",
        Edge::between(
            "e1",
            "Wrote",
            ("ghost", "Author", "Author", false),
            ("Aria1", "Song", "Song", false),
        ),
    );

    assert!(trans.commit().is_err());
    assert_eq!(gm.node_count("Author"), nodes_before);
    assert_eq!(gm.node_count("Song"), songs_before);
    assert!(gm.fetch_node("main", "Aria1", "Song").unwrap().is_none());

    // The failing operation and its cause are retained.
    let (_, cause) = trans.failed().unwrap();
    assert!(cause.contains("Not found"));
}

#[test]
fn rolling_transaction_commits_at_threshold() {
    let gm = fresh_gm();

    let mut trans = quiver_graph::RollingTransaction::new(&gm, 2);
    for i in 0..5 {
        trans
            .store_node("main", Node::with_key_kind(&format!("n{i}"), "Author"))
            .unwrap();
    }
    // Two automatic commits at 2 and 4 queued operations.
    assert_eq!(trans.commit_count(), 2);
    assert_eq!(gm.node_count("Author"), 4);

    trans.commit().unwrap();
    assert_eq!(gm.node_count("Author"), 5);
}

struct VetoRule;

impl Rule for VetoRule {
    fn name(&self) -> &str {
        "test.veto"
    }

    fn handles(&self) -> Vec<EventKind> {
        vec![EventKind::NodeStore]
    }

    fn handle(
        &self,
        _gm: &GraphManager,
        _queue: &mut OpQueue,
        event: &Event,
    ) -> quiver_graph::Result<RuleOutcome> {
        if event.node.as_ref().map(|n| n.kind()) == Some("Forbidden") {
            return Err(GraphError::InvalidData("kind is forbidden".to_string()));
        }
        Ok(RuleOutcome::Continue)
    }
}

struct TakeOverRule;

impl Rule for TakeOverRule {
    fn name(&self) -> &str {
        "test.takeover"
    }

    fn handles(&self) -> Vec<EventKind> {
        vec![EventKind::NodeStore]
    }

    fn handle(
        &self,
        _gm: &GraphManager,
        _queue: &mut OpQueue,
        event: &Event,
    ) -> quiver_graph::Result<RuleOutcome> {
        if event.node.as_ref().map(|n| n.kind()) == Some("Virtual") {
            return Ok(RuleOutcome::Handled);
        }
        Ok(RuleOutcome::Continue)
    }
}

#[test]
fn rule_errors_abort_and_are_wrapped() {
    let gm = fresh_gm();
    gm.register_rule(Arc::new(VetoRule));

    let err = gm
        .store_node("main", Node::with_key_kind("x", "Forbidden"))
        .unwrap_err();
    match err {
        GraphError::Rule { rule, .. } => assert_eq!(rule, "test.veto"),
        other => panic!("expected rule error, got {other:?}"),
    }
    assert_eq!(gm.node_count("Forbidden"), 0);
}

#[test]
fn handled_events_suppress_default_storage() {
    let gm = fresh_gm();
    gm.register_rule(Arc::new(TakeOverRule));

    gm.store_node("main", Node::with_key_kind("v1", "Virtual"))
        .unwrap();
    assert!(gm.fetch_node("main", "v1", "Virtual").unwrap().is_none());
    assert_eq!(gm.node_count("Virtual"), 0);
}

#[test]
fn group_membership() {
    let gm = fresh_gm();
    author_with_songs(&gm);

    gm.store_group("main", "favorites").unwrap();
    gm.add_group_member("main", "favorites", "Aria1", "Song")
        .unwrap();
    gm.add_group_member("main", "favorites", "000", "Author")
        .unwrap();

    assert_eq!(
        gm.group_members("main", "favorites").unwrap(),
        vec![
            ("000".to_string(), "Author".to_string()),
            ("Aria1".to_string(), "Song".to_string())
        ]
    );

    gm.remove_group_member("main", "favorites", "000", "Author")
        .unwrap();
    assert_eq!(
        gm.group_members("main", "favorites").unwrap(),
        vec![("Aria1".to_string(), "Song".to_string())]
    );
}

#[test]
fn blob_storage_roundtrip() {
    let gm = fresh_gm();

    let loc = gm.store_blob("main", b"raw bytes").unwrap();
    assert_eq!(gm.fetch_blob("main", loc).unwrap(), Some(b"raw bytes".to_vec()));

    gm.update_blob("main", loc, b"new bytes").unwrap();
    assert_eq!(gm.fetch_blob("main", loc).unwrap(), Some(b"new bytes".to_vec()));

    gm.remove_blob("main", loc).unwrap();
    assert_eq!(gm.fetch_blob("main", loc).unwrap(), None);

    // Unknown partitions and locations read as absent.
    assert_eq!(gm.fetch_blob("other", 1).unwrap(), None);
    gm.remove_blob("main", 999).unwrap();
}

#[test]
fn disk_storage_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let gs: Arc<dyn GraphStorage> =
            Arc::new(quiver_graph::DiskGraphStorage::open(dir.path()).unwrap());
        let gm = GraphManager::new(gs).unwrap();
        author_with_songs(&gm);
        gm.close().unwrap();
    }

    let gs: Arc<dyn GraphStorage> =
        Arc::new(quiver_graph::DiskGraphStorage::open(dir.path()).unwrap());
    let gm = GraphManager::new(gs).unwrap();

    assert_eq!(gm.node_count("Song"), 2);
    let fetched = gm.fetch_node("main", "000", "Author").unwrap().unwrap();
    assert_eq!(fetched.attr_string("name").as_deref(), Some("John"));

    let (nodes, _) = gm
        .traverse_multi("main", "000", "Author", "Author:Wrote:Song:Song", true)
        .unwrap();
    assert_eq!(nodes.len(), 2);
}
