// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Gossip discovery: periodic unsolicited fan-out of the local peer list
//! plus the serialized agent- and task-registry CRDT states.
//!
//! Receivers merge the peer entries (excluding their own record) and both
//! CRDT states; announcements are never answered. The sender includes its
//! own peer record first so receivers learn its listen address and routing
//! exchange key.

use serde_json::Value;

use dawn_crdt::{unix_now, AgentRegistry, TaskRegistry};

use crate::envelope::WireEnvelope;
use crate::peers::{Peer, PeerRegistry};

#[derive(Debug, Clone)]
pub struct GossipDiscovery {
    max_peers_to_share: usize,
}

impl GossipDiscovery {
    pub fn new(max_peers_to_share: usize) -> Self {
        Self { max_peers_to_share }
    }

    /// Build one announcement envelope.
    pub fn build_announcement(
        &self,
        self_record: &Peer,
        registry: &PeerRegistry,
        agents: &AgentRegistry,
        tasks: &TaskRegistry,
    ) -> WireEnvelope {
        let mut peers: Vec<Value> = vec![serde_json::to_value(self_record).unwrap_or_default()];
        peers.extend(
            registry
                .list_alive_peers()
                .into_iter()
                .take(self.max_peers_to_share)
                .filter_map(|p| serde_json::to_value(p).ok()),
        );
        WireEnvelope::GossipAnnouncement {
            timestamp: unix_now(),
            peers,
            task_registry: tasks.get_crdt_state(),
            agent_registry: agents.get_crdt_state(),
        }
    }

    /// Apply a received announcement.
    pub fn handle_announcement(
        &self,
        peers: &[Value],
        task_registry: &Value,
        agent_registry: &Value,
        self_node_id: &str,
        registry: &mut PeerRegistry,
        agents: &mut AgentRegistry,
        tasks: &mut TaskRegistry,
    ) {
        let mut adopted = 0;
        for record in peers {
            let Ok(peer) = serde_json::from_value::<Peer>(record.clone()) else {
                tracing::debug!("skipping malformed gossip peer record");
                continue;
            };
            if peer.node_id == self_node_id {
                continue;
            }
            registry.add_peer(peer);
            adopted += 1;
        }

        agents.sync_from_crdt(agent_registry);
        tasks.sync_from_crdt(task_registry);
        tracing::debug!(peers = adopted, "processed gossip announcement");
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
