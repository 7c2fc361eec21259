//! Node configuration (C5): the static roster of relay peers and their role
//! tags, plus the handful of core-relevant environment variable names
//! (spec §6). Generic process/CLI configuration is left to the embedding
//! binary — loading *this* typed document is the only in-scope piece.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CoreError;

/// Relay role tags a node in the roster may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayRole {
    Coordinator,
    Consensus,
    Tree,
    File,
    Naming,
    Payment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayNode {
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub types: Vec<RelayRole>,
}

impl RelayNode {
    pub fn has_role(&self, role: RelayRole) -> bool {
        self.types.contains(&role)
    }
}

/// `{id, network_id, nodes: [...]}` — see spec §6 for the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub network_id: String,
    pub nodes: Vec<RelayNode>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading node config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid node config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::invalid_input(e.to_string())
    }
}

impl NodeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// All relay nodes carrying `role`, in roster order.
    pub fn nodes_with_role(&self, role: RelayRole) -> Vec<&RelayNode> {
        self.nodes.iter().filter(|n| n.has_role(role)).collect()
    }

    pub fn coordinator(&self) -> Option<&RelayNode> {
        self.nodes_with_role(RelayRole::Coordinator).into_iter().next()
    }

    pub fn consensus(&self) -> Option<&RelayNode> {
        self.nodes_with_role(RelayRole::Consensus).into_iter().next()
    }

    /// Partition of tree-role peers responsible for a given space, by replication
    /// key modulo the number of tree peers (see space_keys::replication_key).
    /// A single-tree-peer roster (the common case) always returns that peer.
    pub fn tree_peers_for_replication_key(&self, replication_key: u64) -> Vec<&RelayNode> {
        let tree_peers = self.nodes_with_role(RelayRole::Tree);
        if tree_peers.is_empty() {
            return vec![];
        }
        let idx = (replication_key as usize) % tree_peers.len();
        vec![tree_peers[idx]]
    }
}

/// Core-relevant environment variable names (spec §6). Exposed as constants
/// rather than read automatically — the embedding binary decides how/when
/// to read them; reading env vars implicitly here would make `Peer::init`
/// depend on ambient process state, which the lifecycle redesign (SPEC_FULL
/// §10) explicitly avoids.
pub const ENV_NETWORK_CONFIG_PATH: &str = "NETWORK_CONFIG_PATH";
pub const ENV_DATA_DIR: &str = "DATA_DIR";
pub const ENV_KEEP_TEST_NETWORK: &str = "KEEP_TEST_NETWORK";
pub const ENV_TEST_VERBOSE: &str = "TEST_VERBOSE";

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
id: peer-1
network_id: matou-dev
nodes:
  - peer_id: coord1
    addresses: ["https://coord.example.com"]
    types: [coordinator]
  - peer_id: tree1
    addresses: ["https://tree1.example.com"]
    types: [tree, file]
  - peer_id: tree2
    addresses: ["https://tree2.example.com"]
    types: [tree]
"#;

    #[test]
    fn parses_sample_roster() {
        let cfg = NodeConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.id, "peer-1");
        assert_eq!(cfg.nodes.len(), 3);
        assert!(cfg.coordinator().is_some());
        assert_eq!(cfg.nodes_with_role(RelayRole::Tree).len(), 2);
    }

    #[test]
    fn tree_partition_is_deterministic() {
        let cfg = NodeConfig::from_yaml_str(SAMPLE).unwrap();
        let a = cfg.tree_peers_for_replication_key(42);
        let b = cfg.tree_peers_for_replication_key(42);
        assert_eq!(a[0].peer_id, b[0].peer_id);
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        assert!(NodeConfig::from_yaml_str("not: [valid").is_err());
    }
}
