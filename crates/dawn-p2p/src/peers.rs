// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`PeerRegistry`] — the in-memory map of known peers.
//!
//! A peer is *alive* iff `now − last_seen < peer_timeout`. Health scores are
//! advisory: the router never hard-excludes a peer based on health, but
//! discovery ranking may. The registry can snapshot itself to a JSON file
//! under the node's data directory (atomic write, mode 0600) so peers
//! survive restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use dawn_crdt::unix_now;
use dawn_crypto::identity::write_secret_file;

use crate::error::P2pError;

/// One known peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Peer {
    pub node_id: String,
    /// Transport-scheme URL, e.g. `ws://10.0.0.5:8000`. Empty until learned
    /// (inbound connections do not reveal the peer's listen address).
    #[serde(default)]
    pub address: String,

    pub first_seen: f64,
    pub last_seen: f64,
    #[serde(default)]
    pub connected: bool,

    /// Best-effort mirror of the peer's capabilities, filled from gossip.
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub resources: Vec<Value>,
    #[serde(default)]
    pub prompts: Vec<Value>,

    /// Hex X25519 public key used for onion-layer key derivation.
    #[serde(default)]
    pub exchange_public_key: Option<String>,

    #[serde(default = "default_health")]
    pub health_score: f64,
    #[serde(default)]
    pub connection_attempts: u32,
    #[serde(default)]
    pub successful_connections: u32,
    #[serde(default)]
    pub failed_connections: u32,
}

fn default_health() -> f64 {
    1.0
}

impl Peer {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            node_id: node_id.into(),
            address: address.into(),
            first_seen: now,
            last_seen: now,
            connected: false,
            agents: Vec::new(),
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            exchange_public_key: None,
            health_score: 1.0,
            connection_attempts: 0,
            successful_connections: 0,
            failed_connections: 0,
        }
    }

    pub fn is_alive(&self, peer_timeout: f64) -> bool {
        unix_now() - self.last_seen < peer_timeout
    }

    pub fn touch(&mut self) {
        self.last_seen = unix_now();
    }

    /// Success: `h ← h + (1 − h) · 0.1`, clamped to 1.
    pub fn record_success(&mut self) {
        self.health_score = (self.health_score + (1.0 - self.health_score) * 0.1).min(1.0);
        self.successful_connections += 1;
        self.touch();
    }

    /// Failure: `h ← h · 0.9`, clamped to 0.
    pub fn record_failure(&mut self) {
        self.health_score = (self.health_score * 0.9).max(0.0);
        self.failed_connections += 1;
    }
}

/// Map of `node_id → Peer` with liveness sweeping and snapshot persistence.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
    peer_timeout: f64,
    persist_path: Option<PathBuf>,
}

impl PeerRegistry {
    pub fn new(peer_timeout: f64) -> Self {
        Self {
            peers: HashMap::new(),
            peer_timeout,
            persist_path: None,
        }
    }

    /// Enable persistence and load any existing snapshot from `path`.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<Vec<Peer>>(&text) {
                    Ok(peers) => {
                        tracing::info!(count = peers.len(), "loaded peer snapshot");
                        for mut peer in peers {
                            peer.connected = false;
                            self.peers.insert(peer.node_id.clone(), peer);
                        }
                    }
                    Err(e) => tracing::warn!("ignoring corrupt peer snapshot: {e}"),
                },
                Err(e) => tracing::warn!("could not read peer snapshot: {e}"),
            }
        }
        self.persist_path = Some(path);
        self
    }

    /// Insert a new peer or merge into the existing entry.
    ///
    /// Merging refreshes `last_seen`, fills in a previously unknown address
    /// or exchange key, and unions the capability mirrors; it never resets
    /// counters or health.
    pub fn add_peer(&mut self, peer: Peer) -> &Peer {
        let node_id = peer.node_id.clone();
        match self.peers.get_mut(&node_id) {
            Some(existing) => {
                existing.last_seen = unix_now();
                if existing.address.is_empty() && !peer.address.is_empty() {
                    existing.address = peer.address;
                }
                if existing.exchange_public_key.is_none() {
                    existing.exchange_public_key = peer.exchange_public_key;
                }
                for agent in peer.agents {
                    if !existing.agents.contains(&agent) {
                        existing.agents.push(agent);
                    }
                }
                for tool in peer.tools {
                    if !existing.tools.contains(&tool) {
                        existing.tools.push(tool);
                    }
                }
                for resource in peer.resources {
                    if !existing.resources.contains(&resource) {
                        existing.resources.push(resource);
                    }
                }
                for prompt in peer.prompts {
                    if !existing.prompts.contains(&prompt) {
                        existing.prompts.push(prompt);
                    }
                }
            }
            None => {
                let mut peer = peer;
                peer.first_seen = unix_now();
                peer.last_seen = peer.first_seen;
                tracing::debug!(
                    peer = %&node_id[..node_id.len().min(16)],
                    "discovered new peer"
                );
                self.peers.insert(node_id.clone(), peer);
            }
        }
        &self.peers[&node_id]
    }

    pub fn get_peer(&self, node_id: &str) -> Option<&Peer> {
        self.peers.get(node_id)
    }

    pub fn get_peer_mut(&mut self, node_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(node_id)
    }

    pub fn remove_peer(&mut self, node_id: &str) -> Option<Peer> {
        self.peers.remove(node_id)
    }

    pub fn list_peers(&self) -> Vec<&Peer> {
        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    /// Alive peers, best health first.
    pub fn list_alive_peers(&self) -> Vec<&Peer> {
        let mut peers: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| p.is_alive(self.peer_timeout))
            .collect();
        peers.sort_by(|a, b| b.health_score.total_cmp(&a.health_score));
        peers
    }

    pub fn set_connected(&mut self, node_id: &str, connected: bool) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.connected = connected;
            if connected {
                peer.touch();
            }
        }
    }

    pub fn record_success(&mut self, node_id: &str) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.record_success();
        }
    }

    pub fn record_failure(&mut self, node_id: &str) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.record_failure();
        }
    }

    /// Remove and return every peer whose `last_seen` exceeds the timeout.
    pub fn prune_expired(&mut self) -> Vec<Peer> {
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| !p.is_alive(self.peer_timeout))
            .map(|p| p.node_id.clone())
            .collect();
        let removed: Vec<Peer> = expired
            .iter()
            .filter_map(|id| self.peers.remove(id))
            .collect();
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "pruned expired peers");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Write the snapshot if persistence is enabled.
    pub fn save(&self) -> Result<(), P2pError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        self.save_to(path)
    }

    fn save_to(&self, path: &Path) -> Result<(), P2pError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let peers: Vec<&Peer> = self.list_peers();
        let text = serde_json::to_string_pretty(&peers)?;
        write_secret_file(path, text.as_bytes())?;
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_peer_sets_first_and_last_seen() {
        let mut reg = PeerRegistry::new(300.0);
        let p = reg.add_peer(Peer::new("a".repeat(64), "ws://127.0.0.1:1"));
        assert_eq!(p.first_seen, p.last_seen);
        assert!(p.is_alive(300.0));
    }

    #[test]
    fn merge_keeps_counters_and_unions_capabilities() {
        let mut reg = PeerRegistry::new(300.0);
        let id = "a".repeat(64);
        reg.add_peer(Peer::new(id.clone(), "ws://127.0.0.1:1"));
        reg.record_failure(&id);
        reg.record_success(&id);

        let mut update = Peer::new(id.clone(), "ws://127.0.0.1:1");
        update.agents = vec!["agent1".into(), "agent2".into()];
        reg.add_peer(update.clone());
        reg.add_peer(update); // adding twice must not duplicate

        let peer = reg.get_peer(&id).unwrap();
        assert_eq!(peer.failed_connections, 1);
        assert_eq!(peer.successful_connections, 1);
        assert_eq!(peer.agents, vec!["agent1", "agent2"]);
    }

    #[test]
    fn merge_fills_missing_address() {
        let mut reg = PeerRegistry::new(300.0);
        let id = "a".repeat(64);
        reg.add_peer(Peer::new(id.clone(), ""));
        reg.add_peer(Peer::new(id.clone(), "ws://10.0.0.5:8000"));
        assert_eq!(reg.get_peer(&id).unwrap().address, "ws://10.0.0.5:8000");
        // A different address never overwrites a known one.
        reg.add_peer(Peer::new(id.clone(), "ws://evil:1"));
        assert_eq!(reg.get_peer(&id).unwrap().address, "ws://10.0.0.5:8000");
    }

    #[test]
    fn health_scoring_formulas() {
        let mut p = Peer::new("n".repeat(64), "");
        p.health_score = 0.5;
        p.record_success();
        assert!((p.health_score - 0.55).abs() < 1e-9);
        p.health_score = 0.5;
        p.record_failure();
        assert!((p.health_score - 0.45).abs() < 1e-9);

        p.health_score = 1.0;
        p.record_success();
        assert_eq!(p.health_score, 1.0);
        p.health_score = 0.0;
        p.record_failure();
        assert_eq!(p.health_score, 0.0);
    }

    #[test]
    fn prune_removes_and_returns_stale_peers() {
        let mut reg = PeerRegistry::new(300.0);
        let stale = "a".repeat(64);
        let fresh = "b".repeat(64);
        reg.add_peer(Peer::new(stale.clone(), ""));
        reg.add_peer(Peer::new(fresh.clone(), ""));
        reg.get_peer_mut(&stale).unwrap().last_seen = unix_now() - 301.0;

        let removed = reg.prune_expired();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].node_id, stale);
        assert!(reg.get_peer(&fresh).is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn alive_peers_ranked_by_health() {
        let mut reg = PeerRegistry::new(300.0);
        let weak = "a".repeat(64);
        let strong = "b".repeat(64);
        reg.add_peer(Peer::new(weak.clone(), ""));
        reg.add_peer(Peer::new(strong.clone(), ""));
        for _ in 0..5 {
            reg.record_failure(&weak);
        }
        let alive = reg.list_alive_peers();
        assert_eq!(alive[0].node_id, strong);
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let mut reg = PeerRegistry::new(300.0).with_persistence(path.clone());
        let id = "c".repeat(64);
        reg.add_peer(Peer::new(id.clone(), "ws://127.0.0.1:9"));
        reg.set_connected(&id, true);
        reg.record_success(&id);
        reg.save().unwrap();

        let restored = PeerRegistry::new(300.0).with_persistence(path);
        let peer = restored.get_peer(&id).unwrap();
        assert_eq!(peer.address, "ws://127.0.0.1:9");
        assert_eq!(peer.successful_connections, 1);
        // Connection state is runtime-only.
        assert!(!peer.connected);
    }

    #[test]
    fn corrupt_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        std::fs::write(&path, "{{{").unwrap();
        let reg = PeerRegistry::new(300.0).with_persistence(path);
        assert!(reg.is_empty());
    }
}
