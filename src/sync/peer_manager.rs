//! Peer manager (spec §4.9, per space): answers `responsible_peers()` from
//! the node configuration's tree-role partition.

use crate::config::{NodeConfig, RelayRole};
use crate::space_keys::replication_key;

/// Resolves which tree-role relay nodes own a given space's partition.
/// `broadcast`/`send` aren't separate wire calls in this HTTP-relay shape —
/// every RPC in [`super::client`] already addresses one relay directly, so
/// "broadcast" here just means "call the client once per responsible peer".
pub struct PeerManager<'a> {
    config: &'a NodeConfig,
}

impl<'a> PeerManager<'a> {
    pub fn new(config: &'a NodeConfig) -> Self {
        PeerManager { config }
    }

    pub fn responsible_peers(&self, space_id: &str) -> Vec<&crate::config::RelayNode> {
        self.config.tree_peers_for_replication_key(replication_key(space_id))
    }

    pub fn file_peers(&self) -> Vec<&crate::config::RelayNode> {
        self.config.nodes_with_role(RelayRole::File)
    }
}
