pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
}

/// Static description of a cluster. The member set never changes while a
/// node runs; every node must be started with the same set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddress>,
    #[serde(default = "defaults::election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "defaults::election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "defaults::rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Upper bound on entries carried by a single AppendLogs call.
    #[serde(default = "defaults::max_append_entries")]
    pub max_append_entries: usize,
}

mod defaults {
    pub fn election_timeout_min_ms() -> u64 {
        150
    }

    pub fn election_timeout_max_ms() -> u64 {
        300
    }

    pub fn heartbeat_interval_ms() -> u64 {
        50
    }

    pub fn rpc_timeout_ms() -> u64 {
        100
    }

    pub fn max_append_entries() -> usize {
        64
    }
}

const LOCAL_BASE_PORT: u16 = 7001;

impl ClusterConfig {
    /// A config with default timings for the given member ids, all on
    /// localhost. Ports count up from 7001 in member order, whatever the ids.
    pub fn local(ids: &[NodeId]) -> Self {
        Self {
            nodes: ids
                .iter()
                .enumerate()
                .map(|(position, &node_id)| NodeAddress {
                    host: "127.0.0.1".into(),
                    port: u16::try_from(position)
                        .map_or(u16::MAX, |p| LOCAL_BASE_PORT.saturating_add(p)),
                    node_id,
                })
                .collect(),
            election_timeout_min_ms: defaults::election_timeout_min_ms(),
            election_timeout_max_ms: defaults::election_timeout_max_ms(),
            heartbeat_interval_ms: defaults::heartbeat_interval_ms(),
            rpc_timeout_ms: defaults::rpc_timeout_ms(),
            max_append_entries: defaults::max_append_entries(),
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id).collect()
    }

    /// Every member except `me`.
    pub fn peers_of(&self, me: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .map(|n| n.node_id)
            .filter(|&id| id != me)
            .collect()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|n| n.node_id == id)
    }
}
