//! End-to-end scenarios across the storage, graph, query and cluster
//! layers

use std::sync::Arc;

use quiver::cluster::{ClusterConfig, ClusterError, MemberManager};
use quiver::eql::{parse, run_query, ToEql};
use quiver::graph::{
    Edge, GraphManager, GraphStorage, MemoryGraphStorage, Node, Transaction, Value,
};

fn fresh_gm() -> GraphManager {
    let gs: Arc<dyn GraphStorage> = Arc::new(MemoryGraphStorage::new("scenarios"));
    GraphManager::new(gs).unwrap()
}

fn store_author_and_songs(gm: &GraphManager, cascading: bool) {
    let mut author = Node::with_key_kind("000", "Author");
    author.set_attr("name", Value::from("John"));
    gm.store_node("main", author).unwrap();

    for key in ["Aria1", "Aria2"] {
        gm.store_node("main", Node::with_key_kind(key, "Song"))
            .unwrap();
        gm.store_edge(
            "main",
            Edge::between(
                &format!("wrote-{key}"),
                "Wrote",
                ("000", "Author", "Author", cascading),
                (key, "Song", "Song", false),
            ),
        )
        .unwrap();
    }
}

// Scenario A: traversal determinism.
#[test]
fn traversal_sorted_by_reached_key_is_deterministic() {
    let gm = fresh_gm();
    store_author_and_songs(&gm, false);

    let (nodes, edges) = gm
        .traverse_multi("main", "000", "Author", "Author:Wrote:Song:Song", true)
        .unwrap();

    let mut pairs: Vec<(String, String)> = nodes
        .iter()
        .zip(&edges)
        .map(|(n, e)| {
            (
                n.as_ref().unwrap().key().to_string(),
                e.key().to_string(),
            )
        })
        .collect();
    pairs.sort();

    assert_eq!(
        pairs,
        vec![
            ("Aria1".to_string(), "wrote-Aria1".to_string()),
            ("Aria2".to_string(), "wrote-Aria2".to_string())
        ]
    );
}

// Scenario B: index roundtrip.
#[test]
fn word_and_phrase_index_reflect_description() {
    let gm = fresh_gm();

    let mut author = Node::with_key_kind("000", "Author");
    author.set_attr("name", Value::from("John"));
    author.set_attr(
        "desc",
        Value::from(
            "One of the most popular acoustic artists of the decade \
             and one of its best-selling artists.",
        ),
    );
    gm.store_node("main", author).unwrap();

    let index = gm.node_index("main", "Author").unwrap().unwrap();

    let positions = index.lookup_word("desc", "artists").unwrap();
    assert_eq!(positions.get("000"), Some(&vec![7, 17]));

    assert_eq!(
        index.lookup_phrase("desc", "best-selling artists").unwrap(),
        vec!["000".to_string()]
    );
}

// Scenario C: cascading delete.
#[test]
fn cascading_delete_shrinks_song_count() {
    let gm = fresh_gm();
    store_author_and_songs(&gm, true);
    gm.remove_node("main", "Aria2", "Song").unwrap();
    assert_eq!(gm.node_count("Song"), 1);

    gm.remove_node("main", "000", "Author").unwrap();

    assert!(gm.fetch_edge("main", "wrote-Aria1", "Wrote").unwrap().is_none());
    assert!(gm.fetch_node("main", "Aria1", "Song").unwrap().is_none());
    assert_eq!(gm.node_count("Song"), 0);
    assert_eq!(gm.edge_count("Wrote"), 0);
}

// Scenario D: EQL parse / pretty-print round-trip.
#[test]
fn query_roundtrip_produces_identical_results() {
    let gm = fresh_gm();
    store_author_and_songs(&gm, false);
    let mut song = Node::with_key_kind("Aria1", "Song");
    song.set_attr("ranking", Value::Int(5));
    gm.update_node("main", song).unwrap();

    let text = "get Song where ranking > 3 \
                traverse :Wrote:Author:Author end \
                show 1:n:key, 2:n:name";

    let ast = parse(text).unwrap();
    let printed = ast.to_eql(0);
    assert_eq!(ast, parse(&printed).unwrap());

    let first = run_query(&gm, "main", text).unwrap();
    let second = run_query(&gm, "main", &printed).unwrap();
    assert_eq!(first.rows, second.rows);
    assert_eq!(first.header.labels, second.header.labels);
    assert_eq!(first.header.data, second.header.data);
    assert_eq!(first.row_count(), 1);
    assert_eq!(first.rows[0][1].canonical_string(), "John");
}

// Invariant 5: transaction counts match their effect.
#[test]
fn committed_counts_match_queued_counts() {
    let gm = fresh_gm();
    gm.store_node("main", Node::with_key_kind("000", "Author"))
        .unwrap();

    let mut trans = Transaction::new(&gm);
    trans.store_node("main", Node::with_key_kind("Aria1", "Song"));
    trans.store_node("main", Node::with_key_kind("Aria2", "Song"));
    trans.store_edge(
        "main",
        Edge::between(
            "e1",
            "Wrote",
            ("000", "Author", "Author", false),
            ("Aria1", "Song", "Song", false),
        ),
    );
    trans.remove_node("main", "001", "Author");

    let (node_ins, edge_ins, node_rem, edge_rem) = trans.counts();
    assert_eq!((node_ins, edge_ins, node_rem, edge_rem), (2, 1, 1, 0));

    let songs_before = gm.node_count("Song");
    let edges_before = gm.edge_count("Wrote");
    trans.commit().unwrap();
    assert_eq!(gm.node_count("Song"), songs_before + node_ins as u64);
    assert_eq!(gm.edge_count("Wrote"), edges_before + edge_ins as u64);
}

// Scenario E: cluster join.
#[test]
fn join_updates_member_list_and_timestamps() {
    let mut config_a = ClusterConfig::new("memberA", "127.0.0.1:0", "s3cret");
    config_a.gossip_interval_ms = 200;
    let mut config_b = ClusterConfig::new("memberB", "127.0.0.1:0", "s3cret");
    config_b.gossip_interval_ms = 200;

    let a = MemberManager::start(config_a).unwrap();
    let b = MemberManager::start(config_b).unwrap();

    b.join_cluster(a.addr()).unwrap();

    let state = b.state_info();
    let names: Vec<&str> = state.members.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["memberB", "memberA"]);
    assert_eq!(state.ts, ("memberB".to_string(), 2));
    assert_eq!(state.tsold, ("memberB".to_string(), 1));

    a.shutdown();
    b.shutdown();
}

// Scenario F: ping with wrong secret.
#[test]
fn mismatched_secrets_fail_authentication() {
    let a = MemberManager::start(ClusterConfig::new("memberA", "127.0.0.1:0", "secretA"))
        .unwrap();
    let b = MemberManager::start(ClusterConfig::new("memberB", "127.0.0.1:0", "secretB"))
        .unwrap();

    let err = b.ping(a.addr()).unwrap_err();
    assert!(matches!(err, ClusterError::Auth(_)));
    assert_eq!(a.members().len(), 1);
    assert_eq!(b.members().len(), 1);

    a.shutdown();
    b.shutdown();
}

// Invariant 1: fetch equals the fold of updates since the last store.
#[test]
fn fetch_reflects_update_fold() {
    let gm = fresh_gm();

    let mut node = Node::with_key_kind("000", "Author");
    node.set_attr("a", Value::Int(1));
    node.set_attr("b", Value::Int(2));
    gm.store_node("main", node).unwrap();

    let mut patch = Node::with_key_kind("000", "Author");
    patch.set_attr("b", Value::Int(20));
    patch.set_attr("c", Value::Int(30));
    gm.update_node("main", patch).unwrap();

    let fetched = gm.fetch_node("main", "000", "Author").unwrap().unwrap();
    assert_eq!(fetched.attr("a"), Some(&Value::Int(1)));
    assert_eq!(fetched.attr("b"), Some(&Value::Int(20)));
    assert_eq!(fetched.attr("c"), Some(&Value::Int(30)));

    gm.remove_node("main", "000", "Author").unwrap();
    assert!(gm.fetch_node("main", "000", "Author").unwrap().is_none());
}

// Invariant 2: removing either endpoint removes the edge.
#[test]
fn edge_disappears_with_either_endpoint() {
    let gm = fresh_gm();
    store_author_and_songs(&gm, false);

    gm.remove_node("main", "Aria1", "Song").unwrap();
    let (nodes, edges) = gm
        .traverse_multi("main", "000", "Author", ":::", true)
        .unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(edges[0].end2_key(), "Aria2");
}
