//! Graph data model: nodes, edges, traversal specs

mod edge;
mod node;

pub use edge::{Edge, TraversalSpec};
pub use node::Node;

/// Mandatory node attribute holding the unique key.
pub const ATTR_KEY: &str = "key";

/// Mandatory node attribute holding the kind.
pub const ATTR_KIND: &str = "kind";

/// Mandatory edge attributes describing the two ends.
pub const ATTR_END1_KEY: &str = "end1key";
pub const ATTR_END1_KIND: &str = "end1kind";
pub const ATTR_END1_ROLE: &str = "end1role";
pub const ATTR_END1_CASCADING: &str = "end1cascading";
pub const ATTR_END2_KEY: &str = "end2key";
pub const ATTR_END2_KIND: &str = "end2kind";
pub const ATTR_END2_ROLE: &str = "end2role";
pub const ATTR_END2_CASCADING: &str = "end2cascading";

/// Reserved kind for group nodes.
pub const GROUP_NODE_KIND: &str = "group";

/// Well-known edge kind connecting a group node to its members.
pub const CONTAINMENT_EDGE_KIND: &str = "Containment";

/// Role of the group end of a containment edge.
pub const CONTAINMENT_ROLE_GROUP: &str = "group";

/// Role of the member end of a containment edge.
pub const CONTAINMENT_ROLE_MEMBER: &str = "member";

/// Check a partition name: one or more of `[A-Za-z0-9_]`.
pub fn is_valid_partition(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check a kind name: one or more ASCII alphanumerics.
pub fn is_valid_kind(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Check an attribute name: one or more ASCII alphanumerics.
pub fn is_valid_attr(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Partitions whose name starts with `_` are hidden from cross-partition
/// search.
pub fn is_visible_partition(name: &str) -> bool {
    !name.starts_with('_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(is_valid_partition("main"));
        assert!(is_valid_partition("_system"));
        assert!(!is_valid_partition(""));
        assert!(!is_valid_partition("bad name"));

        assert!(is_valid_kind("Song2"));
        assert!(!is_valid_kind("no_underscore"));

        assert!(is_visible_partition("main"));
        assert!(!is_visible_partition("_system"));
    }
}
