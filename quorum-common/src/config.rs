use crate::error::{QuorumError, Result};
use crate::types::ClusterConfig;
use std::collections::HashSet;
use std::fs;

/// Loads a cluster configuration from a JSON file and validates it.
pub fn load_config(path: &str) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    validate(&config)?;
    Ok(config)
}

/// Checks the timing relations the protocol relies on. A heartbeat must
/// land well inside every follower's election timeout, otherwise a healthy
/// leader gets deposed.
pub fn validate(config: &ClusterConfig) -> Result<()> {
    if config.nodes.is_empty() {
        return Err(QuorumError::Config("cluster has no nodes".into()));
    }

    let mut seen = HashSet::new();
    for node in &config.nodes {
        if !seen.insert(node.node_id) {
            return Err(QuorumError::Config(format!(
                "duplicate node id {}",
                node.node_id
            )));
        }
    }

    if config.election_timeout_min_ms >= config.election_timeout_max_ms {
        return Err(QuorumError::Config(format!(
            "election timeout range {}..{} is empty",
            config.election_timeout_min_ms, config.election_timeout_max_ms
        )));
    }

    if config.heartbeat_interval_ms == 0
        || config.heartbeat_interval_ms >= config.election_timeout_min_ms
    {
        return Err(QuorumError::Config(format!(
            "heartbeat interval {}ms must be positive and below the minimum election timeout {}ms",
            config.heartbeat_interval_ms, config.election_timeout_min_ms
        )));
    }

    if config.rpc_timeout_ms == 0 {
        return Err(QuorumError::Config("rpc timeout must be positive".into()));
    }

    if config.max_append_entries == 0 {
        return Err(QuorumError::Config(
            "max_append_entries must be positive".into(),
        ));
    }

    Ok(())
}
