// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`AgentRegistry`] — the network-wide agent directory.
//!
//! Keys are the full agent id `<node_id>:<local_agent_id>`. Agents hosted by
//! this node are authoritative here; remote agents are best-effort replicas
//! reconstructed from gossip-merged CRDT state and must never overwrite a
//! local entry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lww::{unix_now, CrdtMap};

/// MCP capability classes an agent can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

/// Descriptor of one agent in the network, local or remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Full id: `<node_id>:<local_agent_id>`.
    pub agent_id: String,
    pub node_id: String,
    pub local_agent_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,

    /// MCP capability records (each `{name|uri, ...schema metadata}`).
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub resources: Vec<Value>,
    #[serde(default)]
    pub prompts: Vec<Value>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    #[serde(default = "unix_now")]
    pub registered_at: f64,
    #[serde(default = "unix_now")]
    pub last_seen: f64,

    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default = "default_health")]
    pub health_score: f64,
}

fn default_true() -> bool {
    true
}

fn default_health() -> f64 {
    1.0
}

impl AgentInfo {
    pub fn touch(&mut self) {
        self.last_seen = unix_now();
    }

    fn capabilities(&self, kind: CapabilityKind) -> &[Value] {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }
}

/// Registry statistics, as reported by `node/get_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub local_agents: usize,
    pub remote_agents: usize,
    pub available_agents: usize,
    pub unavailable_agents: usize,
}

/// CRDT-backed distributed agent registry.
#[derive(Debug)]
pub struct AgentRegistry {
    node_id: String,
    agents: HashMap<String, AgentInfo>,
    crdt: CrdtMap,
}

impl AgentRegistry {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            crdt: CrdtMap::new(node_id.clone()),
            agents: HashMap::new(),
            node_id,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register an agent hosted by this node.
    #[allow(clippy::too_many_arguments)]
    pub fn register_local_agent(
        &mut self,
        local_agent_id: &str,
        name: &str,
        description: Option<String>,
        tools: Vec<Value>,
        resources: Vec<Value>,
        prompts: Vec<Value>,
        metadata: HashMap<String, Value>,
    ) -> AgentInfo {
        let agent_id = format!("{}:{}", self.node_id, local_agent_id);
        let now = unix_now();
        let info = AgentInfo {
            agent_id: agent_id.clone(),
            node_id: self.node_id.clone(),
            local_agent_id: local_agent_id.to_string(),
            name: name.to_string(),
            description,
            tools,
            resources,
            prompts,
            metadata,
            registered_at: now,
            last_seen: now,
            available: true,
            health_score: 1.0,
        };
        self.agents.insert(agent_id.clone(), info.clone());
        self.stamp(&info);
        tracing::info!(agent = %agent_id, name = %info.name, "registered local agent");
        info
    }

    /// Unregister a local agent; propagation happens via the key being absent
    /// from subsequent gossip exchanges.
    pub fn unregister_local_agent(&mut self, local_agent_id: &str) {
        let agent_id = format!("{}:{}", self.node_id, local_agent_id);
        if self.agents.remove(&agent_id).is_some() {
            self.crdt.remove(&agent_id);
            tracing::info!(agent = %agent_id, "unregistered local agent");
        }
    }

    /// Register a replica of an agent hosted elsewhere.
    ///
    /// Refuses to shadow an agent this node owns.
    pub fn register_remote_agent(&mut self, info: AgentInfo) {
        if let Some(existing) = self.agents.get(&info.agent_id) {
            if existing.node_id == self.node_id {
                tracing::warn!(
                    agent = %info.agent_id,
                    "refusing to overwrite local agent with remote descriptor"
                );
                return;
            }
        }
        self.stamp(&info);
        self.agents.insert(info.agent_id.clone(), info);
    }

    /// Look up by full id, or by local id resolved against this node.
    pub fn get_agent(&self, agent_id: &str) -> Option<&AgentInfo> {
        if let Some(info) = self.agents.get(agent_id) {
            return Some(info);
        }
        self.agents.get(&format!("{}:{}", self.node_id, agent_id))
    }

    pub fn list_agents(
        &self,
        node_id: Option<&str>,
        available_only: bool,
        local_only: bool,
    ) -> Vec<&AgentInfo> {
        let mut agents: Vec<&AgentInfo> = self
            .agents
            .values()
            .filter(|a| !local_only || a.node_id == self.node_id)
            .filter(|a| node_id.is_none_or(|n| a.node_id == n))
            .filter(|a| !available_only || a.available)
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn list_local_agents(&self) -> Vec<&AgentInfo> {
        self.list_agents(None, false, true)
    }

    pub fn list_remote_agents(&self) -> Vec<&AgentInfo> {
        let mut agents: Vec<&AgentInfo> = self
            .agents
            .values()
            .filter(|a| a.node_id != self.node_id)
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Available agents exposing a capability of `kind`, optionally filtered
    /// by the capability's `name` (or `uri` for resources).
    pub fn find_agents_by_capability(
        &self,
        kind: CapabilityKind,
        name: Option<&str>,
    ) -> Vec<&AgentInfo> {
        let matches = |caps: &[Value]| match name {
            Some(wanted) => caps.iter().any(|c| {
                c.get("name").and_then(Value::as_str) == Some(wanted)
                    || c.get("uri").and_then(Value::as_str) == Some(wanted)
            }),
            None => !caps.is_empty(),
        };
        let mut agents: Vec<&AgentInfo> = self
            .agents
            .values()
            .filter(|a| a.available && matches(a.capabilities(kind)))
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn update_agent_health(&mut self, agent_id: &str, health_score: f64) {
        let full_id = self.resolve_id(agent_id);
        if let Some(agent) = self.agents.get_mut(&full_id) {
            agent.health_score = health_score.clamp(0.0, 1.0);
            agent.touch();
        }
    }

    pub fn mark_agent_available(&mut self, agent_id: &str, available: bool) {
        let full_id = self.resolve_id(agent_id);
        if let Some(agent) = self.agents.get_mut(&full_id) {
            agent.available = available;
            agent.touch();
        }
    }

    /// Merge a remote CRDT state and rebuild the replica set from it.
    pub fn sync_from_crdt(&mut self, crdt_state: &Value) {
        let merged = self.crdt.merge(crdt_state);
        for (agent_id, agent_data) in merged {
            if let Some(existing) = self.agents.get(&agent_id) {
                if existing.node_id == self.node_id {
                    continue;
                }
            }
            match serde_json::from_value::<AgentInfo>(agent_data) {
                Ok(info) => {
                    self.agents.insert(agent_id, info);
                }
                Err(e) => {
                    tracing::warn!(agent = %agent_id, "failed to parse agent descriptor: {e}");
                }
            }
        }
    }

    pub fn get_crdt_state(&self) -> Value {
        self.crdt.get_state()
    }

    pub fn get_stats(&self) -> RegistryStats {
        let local = self
            .agents
            .values()
            .filter(|a| a.node_id == self.node_id)
            .count();
        let available = self.agents.values().filter(|a| a.available).count();
        RegistryStats {
            total_agents: self.agents.len(),
            local_agents: local,
            remote_agents: self.agents.len() - local,
            available_agents: available,
            unavailable_agents: self.agents.len() - available,
        }
    }

    fn resolve_id(&self, agent_id: &str) -> String {
        if self.agents.contains_key(agent_id) {
            agent_id.to_string()
        } else {
            format!("{}:{}", self.node_id, agent_id)
        }
    }

    fn stamp(&mut self, info: &AgentInfo) {
        if let Ok(value) = serde_json::to_value(info) {
            self.crdt.set(info.agent_id.clone(), value);
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> Value {
        json!({"name": name, "description": name, "inputSchema": {"type": "object"}})
    }

    fn registry() -> AgentRegistry {
        let mut reg = AgentRegistry::new("node-a");
        reg.register_local_agent(
            "agent1",
            "FirstAgent",
            Some("test agent".into()),
            vec![tool("echo")],
            vec![],
            vec![],
            HashMap::new(),
        );
        reg
    }

    #[test]
    fn short_and_full_ids_resolve() {
        let reg = registry();
        assert!(reg.get_agent("agent1").is_some());
        assert!(reg.get_agent("node-a:agent1").is_some());
        assert!(reg.get_agent("node-b:agent1").is_none());
    }

    #[test]
    fn remote_agent_cannot_shadow_local() {
        let mut reg = registry();
        let mut remote = reg.get_agent("agent1").unwrap().clone();
        remote.name = "Impostor".into();
        reg.register_remote_agent(remote);
        assert_eq!(reg.get_agent("agent1").unwrap().name, "FirstAgent");
    }

    #[test]
    fn sync_does_not_overwrite_local_agents() {
        let mut reg = registry();
        let mut other = AgentRegistry::new("node-a");
        // A malicious/stale peer claims to know "our" agent under our key.
        let mut impostor = reg.get_agent("agent1").unwrap().clone();
        impostor.name = "Impostor".into();
        other.register_remote_agent(impostor);

        reg.sync_from_crdt(&other.get_crdt_state());
        assert_eq!(reg.get_agent("agent1").unwrap().name, "FirstAgent");
    }

    #[test]
    fn sync_adopts_remote_agents() {
        let mut a = registry();
        let mut b = AgentRegistry::new("node-b");
        b.register_local_agent(
            "agent2",
            "SecondAgent",
            None,
            vec![tool("grep")],
            vec![],
            vec![],
            HashMap::new(),
        );

        a.sync_from_crdt(&b.get_crdt_state());
        let adopted = a.get_agent("node-b:agent2").unwrap();
        assert_eq!(adopted.name, "SecondAgent");
        assert_eq!(a.list_remote_agents().len(), 1);
        assert_eq!(a.list_local_agents().len(), 1);
    }

    #[test]
    fn capability_search_filters_by_name() {
        let mut reg = registry();
        reg.register_remote_agent(AgentInfo {
            agent_id: "node-b:coder".into(),
            node_id: "node-b".into(),
            local_agent_id: "coder".into(),
            name: "Coder".into(),
            description: None,
            tools: vec![tool("format")],
            resources: vec![],
            prompts: vec![],
            metadata: HashMap::new(),
            registered_at: unix_now(),
            last_seen: unix_now(),
            available: true,
            health_score: 1.0,
        });

        let echoers = reg.find_agents_by_capability(CapabilityKind::Tool, Some("echo"));
        assert_eq!(echoers.len(), 1);
        assert_eq!(echoers[0].local_agent_id, "agent1");

        let any_tool = reg.find_agents_by_capability(CapabilityKind::Tool, None);
        assert_eq!(any_tool.len(), 2);

        assert!(reg
            .find_agents_by_capability(CapabilityKind::Resource, None)
            .is_empty());
    }

    #[test]
    fn unavailable_agents_are_excluded_from_capability_search() {
        let mut reg = registry();
        reg.mark_agent_available("agent1", false);
        assert!(reg
            .find_agents_by_capability(CapabilityKind::Tool, Some("echo"))
            .is_empty());
    }

    #[test]
    fn unregister_removes_from_crdt_state() {
        let mut reg = registry();
        reg.unregister_local_agent("agent1");
        assert!(reg.get_agent("agent1").is_none());
        assert_eq!(reg.get_crdt_state().as_object().unwrap().len(), 0);
    }

    #[test]
    fn stats_count_local_remote_available() {
        let mut a = registry();
        let mut b = AgentRegistry::new("node-b");
        b.register_local_agent("x", "X", None, vec![], vec![], vec![], HashMap::new());
        a.sync_from_crdt(&b.get_crdt_state());
        a.mark_agent_available("agent1", false);

        let stats = a.get_stats();
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.local_agents, 1);
        assert_eq!(stats.remote_agents, 1);
        assert_eq!(stats.available_agents, 1);
        assert_eq!(stats.unavailable_agents, 1);
    }

    #[test]
    fn health_is_clamped() {
        let mut reg = registry();
        reg.update_agent_health("agent1", 7.5);
        assert_eq!(reg.get_agent("agent1").unwrap().health_score, 1.0);
        reg.update_agent_health("agent1", -2.0);
        assert_eq!(reg.get_agent("agent1").unwrap().health_score, 0.0);
    }
}
