//! Quiver Cluster - Membership, gossip and replicated storage
//!
//! Several database instances form an eventually consistent cluster:
//! - Authenticated RPC between members (HMAC-SHA256 over every frame)
//! - Gossip of the member list, failed set and timestamp state
//! - A distributed graph storage that routes each record to its
//!   primary owner and forwards copies to replicas
//!
//! Plugging [`DistributedStorage`] into a graph manager transparently
//! replaces the local storage with the replicated one.

mod config;
mod distributed;
mod error;
mod log;
mod member;
mod rpc;

pub use config::ClusterConfig;
pub use distributed::{DistributedStorage, DistributedStorageManager};
pub use error::{ClusterError, Result};
pub use log::ClusterLog;
pub use member::{MemberManager, StorageHandler};
pub use rpc::{Request, Response, StateInfo};
