//! Cluster configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_replication() -> usize {
    1
}

fn default_rpc_timeout_ms() -> u64 {
    3000
}

fn default_gossip_interval_ms() -> u64 {
    1000
}

/// Configuration of one cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique human readable member name.
    pub name: String,

    /// Network address to listen on, e.g. `127.0.0.1:9020`. Port 0
    /// picks a free port; the chosen address is gossiped.
    pub addr: String,

    /// Shared secret. Every frame is authenticated with it.
    pub secret: String,

    /// How many members hold each record (primary included).
    #[serde(default = "default_replication")]
    pub replication_factor: usize,

    /// Per-call RPC deadline in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Housekeeping / gossip interval in milliseconds.
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,
}

impl ClusterConfig {
    pub fn new(name: &str, addr: &str, secret: &str) -> Self {
        ClusterConfig {
            name: name.to_string(),
            addr: addr.to_string(),
            secret: secret.to_string(),
            replication_factor: default_replication(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            gossip_interval_ms: default_gossip_interval_ms(),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_on_deserialization() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{"name":"member1","addr":"127.0.0.1:9020","secret":"s3cret"}"#,
        )
        .unwrap();
        assert_eq!(config.replication_factor, 1);
        assert_eq!(config.rpc_timeout(), Duration::from_millis(3000));
    }
}
