//! Cluster tests with in-process members

use std::sync::Arc;
use std::time::Duration;

use quiver_cluster::{ClusterConfig, ClusterError, DistributedStorage, MemberManager};
use quiver_graph::{GraphManager, GraphStorage, MemoryGraphStorage, Node, Value};

fn config(name: &str, secret: &str) -> ClusterConfig {
    let mut config = ClusterConfig::new(name, "127.0.0.1:0", secret);
    config.rpc_timeout_ms = 2000;
    config.gossip_interval_ms = 200;
    config
}

#[test]
fn ping_between_members() {
    let a = MemberManager::start(config("memberA", "s3cret")).unwrap();
    let b = MemberManager::start(config("memberB", "s3cret")).unwrap();

    a.ping(b.addr()).unwrap();
    b.ping(a.addr()).unwrap();

    a.shutdown();
    b.shutdown();
}

#[test]
fn ping_with_wrong_secret_fails_and_changes_nothing() {
    let a = MemberManager::start(config("memberA", "secretA")).unwrap();
    let b = MemberManager::start(config("memberB", "secretB")).unwrap();

    let err = b.ping(a.addr()).unwrap_err();
    assert!(matches!(err, ClusterError::Auth(_)));

    assert_eq!(a.members().len(), 1);
    assert_eq!(b.members().len(), 1);

    a.shutdown();
    b.shutdown();
}

#[test]
fn join_adopts_member_list_and_bumps_state() {
    let a = MemberManager::start(config("memberA", "s3cret")).unwrap();
    let b = MemberManager::start(config("memberB", "s3cret")).unwrap();

    b.join_cluster(a.addr()).unwrap();

    let state = b.state_info();
    let names: Vec<&str> = state.members.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["memberB", "memberA"]);
    assert_eq!(state.ts, ("memberB".to_string(), 2));
    assert_eq!(state.tsold, ("memberB".to_string(), 1));

    // The contacted member sees the joiner immediately.
    let names: Vec<String> = a.members().into_iter().map(|(n, _)| n).collect();
    assert!(names.contains(&"memberB".to_string()));

    a.shutdown();
    b.shutdown();
}

#[test]
fn eject_unknown_member_is_an_error() {
    let a = MemberManager::start(config("memberA", "s3cret")).unwrap();

    let err = a.eject_member("ghost").unwrap_err();
    assert_eq!(
        err.to_string(),
        "ClusterError: Member error (Unknown target member)"
    );

    a.shutdown();
}

#[test]
fn eject_removes_member() {
    let a = MemberManager::start(config("memberA", "s3cret")).unwrap();
    let b = MemberManager::start(config("memberB", "s3cret")).unwrap();

    b.join_cluster(a.addr()).unwrap();
    a.eject_member("memberB").unwrap();
    assert_eq!(a.members().len(), 1);

    a.shutdown();
    b.shutdown();
}

#[test]
fn gossip_detects_unreachable_members() {
    let a = MemberManager::start(config("memberA", "s3cret")).unwrap();
    let b = MemberManager::start(config("memberB", "s3cret")).unwrap();

    b.join_cluster(a.addr()).unwrap();
    b.shutdown();

    // Within a few gossip ticks the dead member lands in the failed
    // set and the event is logged.
    let mut failed = Vec::new();
    for _ in 0..50 {
        failed = a.failed();
        if !failed.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(failed, vec!["memberB".to_string()]);
    assert!(a
        .log_entries()
        .iter()
        .any(|e| e.contains("memberB unreachable")));

    a.shutdown();
}

#[test]
fn data_stored_via_one_member_is_readable_via_the_other() {
    let a = MemberManager::start(config("memberA", "s3cret")).unwrap();
    let b = MemberManager::start(config("memberB", "s3cret")).unwrap();
    b.join_cluster(a.addr()).unwrap();

    let local_a: Arc<dyn GraphStorage> = Arc::new(MemoryGraphStorage::new("a"));
    let local_b: Arc<dyn GraphStorage> = Arc::new(MemoryGraphStorage::new("b"));
    let dist_a = DistributedStorage::new(Arc::clone(&a), local_a);
    let dist_b = DistributedStorage::new(Arc::clone(&b), local_b);

    let gm_a = GraphManager::new(dist_a as Arc<dyn GraphStorage>).unwrap();
    let mut node = Node::with_key_kind("000", "Author");
    node.set_attr("name", Value::from("John"));
    gm_a.store_node("main", node).unwrap();

    let gm_b = GraphManager::new(dist_b as Arc<dyn GraphStorage>).unwrap();
    let fetched = gm_b.fetch_node("main", "000", "Author").unwrap().unwrap();
    assert_eq!(fetched.attr_string("name").as_deref(), Some("John"));
    assert_eq!(gm_b.node_count("Author"), 1);

    a.shutdown();
    b.shutdown();
}

#[test]
fn cluster_log_records_membership_events() {
    let a = MemberManager::start(config("memberA", "s3cret")).unwrap();
    let b = MemberManager::start(config("memberB", "s3cret")).unwrap();

    b.join_cluster(a.addr()).unwrap();

    assert!(b.log_entries().iter().any(|e| e.contains("joined cluster")));
    assert!(a.log_entries().iter().any(|e| e.contains("memberB joined")));

    a.shutdown();
    b.shutdown();
}
