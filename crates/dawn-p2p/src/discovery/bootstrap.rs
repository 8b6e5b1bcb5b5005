//! Bootstrap discovery: join the network through configured addresses.
//!
//! For each bootstrap address the node opens a connection, then asks the
//! peer for its peer list (`node/list_peers`) and merges the result. The
//! connection handling lives in the node; this module owns the address list
//! and the merge step.

use serde_json::Value;

use crate::peers::{Peer, PeerRegistry};

#[derive(Debug, Clone, Default)]
pub struct BootstrapDiscovery {
    nodes: Vec<String>,
}

impl BootstrapDiscovery {
    pub fn new(nodes: Vec<String>) -> Self {
        tracing::debug!(count = nodes.len(), "bootstrap discovery configured");
        Self { nodes }
    }

    pub fn addresses(&self) -> &[String] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Merge a `node/list_peers` result into the registry. Returns how many
    /// records were merged.
    pub fn merge_peer_list(
        result: &Value,
        self_node_id: &str,
        registry: &mut PeerRegistry,
    ) -> usize {
        let Some(peers) = result.get("peers").and_then(Value::as_array) else {
            return 0;
        };
        let mut merged = 0;
        for record in peers {
            let Ok(peer) = serde_json::from_value::<Peer>(record.clone()) else {
                tracing::debug!("skipping malformed peer record from bootstrap");
                continue;
            };
            if peer.node_id == self_node_id {
                continue;
            }
            registry.add_peer(peer);
            merged += 1;
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_skips_self_and_malformed_records() {
        let me = "a".repeat(64);
        let other = "b".repeat(64);
        let mut registry = PeerRegistry::new(300.0);
        let result = json!({
            "peers": [
                Peer::new(me.clone(), "ws://127.0.0.1:1"),
                Peer::new(other.clone(), "ws://127.0.0.1:2"),
                {"garbage": true},
            ]
        });
        let merged = BootstrapDiscovery::merge_peer_list(&result, &me, &mut registry);
        assert_eq!(merged, 1);
        assert!(registry.get_peer(&other).is_some());
        assert!(registry.get_peer(&me).is_none());
    }

    #[test]
    fn merge_tolerates_missing_peers_field() {
        let mut registry = PeerRegistry::new(300.0);
        assert_eq!(
            BootstrapDiscovery::merge_peer_list(&json!({}), "x", &mut registry),
            0
        );
    }
}
