// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`DawnNode`] — the router that owns every subsystem.
//!
//! One node owns its identity, transports, peer registry, both CRDT
//! registries, the task manager, discovery, the DHT, and the privacy layer;
//! subsystems get handles, never ownership.
//!
//! # Routing
//!
//! The method string of every inbound JSON-RPC request selects the route:
//!
//! ```text
//! node/<sub>, dht_*                  → handled by this node
//! <node_id>:<agent_id>/<sub>         → local agent if <node_id> is ours,
//!                                      else forwarded with the method
//!                                      rewritten to <agent_id>/<sub>
//! <agent_id>/<sub>                   → local agent, or -32601
//! ```
//!
//! Forwarding wraps the rewritten request in a fresh correlation id, awaits
//! the peer's response with a 30-second timeout, and translates every
//! transport or crypto fault into a structured JSON-RPC error — agent code
//! never sees a transport exception.
//!
//! # Startup / shutdown
//!
//! `start()`: listener → peer registry (persisted snapshot) → discovery
//! (bootstrap, mDNS, gossip) → DHT → local agents announced into the agent
//! CRDT → periodic gossip. `shutdown()` cancels the background tasks, closes
//! transports best-effort, flushes the peer registry, and stops the
//! listener; a failing peer never blocks the rest.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dawn_crdt::{
    AgentRegistry, Task, TaskError, TaskManager, TaskRegistry, TaskStatus,
};
use dawn_crypto::{identity::write_secret_file, KeyExchange, NodeIdentity};
use dawn_mcp::{McpServer, RequestId, RpcError, RpcReply, RpcRequest, RpcResponse};

use crate::config::NodeConfig;
use crate::dht::{self, Dht, DhtNodeInfo, DhtRpc};
use crate::discovery::{BootstrapDiscovery, GossipDiscovery, MdnsDiscovery};
use crate::envelope::WireEnvelope;
use crate::error::P2pError;
use crate::peers::{Peer, PeerRegistry};
use crate::privacy::{PrivacyConfig, PrivacyLayer, Received, SendFn};
use crate::transport::{Role, Transport, TransportEvent};

/// How an inbound method string routes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    /// Handled by this node (`node/*` and the `dht_*` family).
    Node(String),
    /// Dispatched to a local agent's MCP server.
    LocalAgent { agent_id: String, sub: String },
    /// Forwarded to the peer owning the agent, method rewritten.
    Remote {
        node_id: String,
        agent_id: String,
        sub: String,
    },
    Unknown,
}

fn parse_route(self_node_id: &str, method: &str) -> Route {
    if method.starts_with("node/")
        || matches!(method, "dht_find_node" | "dht_find_value" | "dht_store")
    {
        return Route::Node(method.to_string());
    }
    let Some((target, sub)) = method.split_once('/') else {
        return Route::Unknown;
    };
    if target.is_empty() || sub.is_empty() {
        return Route::Unknown;
    }
    match target.split_once(':') {
        Some((node_id, agent_id)) => {
            if node_id.is_empty() || agent_id.is_empty() {
                Route::Unknown
            } else if node_id == self_node_id {
                Route::LocalAgent {
                    agent_id: agent_id.to_string(),
                    sub: sub.to_string(),
                }
            } else {
                Route::Remote {
                    node_id: node_id.to_string(),
                    agent_id: agent_id.to_string(),
                    sub: sub.to_string(),
                }
            }
        }
        None => Route::LocalAgent {
            agent_id: target.to_string(),
            sub: sub.to_string(),
        },
    }
}

struct PendingRequest {
    peer: String,
    reply: oneshot::Sender<Value>,
}

struct NodeInner {
    identity: Arc<NodeIdentity>,
    routing_key: Arc<KeyExchange>,
    config: NodeConfig,

    peers: Mutex<PeerRegistry>,
    agent_registry: Mutex<AgentRegistry>,
    task_registry: Mutex<TaskRegistry>,
    task_manager: Mutex<TaskManager>,
    dht: Option<Mutex<Dht>>,
    privacy: Option<PrivacyLayer>,
    gossip: GossipDiscovery,
    bootstrap: BootstrapDiscovery,

    /// Local agent MCP servers by local agent id.
    agents: Mutex<HashMap<String, Arc<McpServer>>>,
    /// Established transports by peer node id.
    transports: Mutex<HashMap<String, Transport>>,
    /// Connections still in handshake, by connection id.
    pending_conns: Mutex<HashMap<Uuid, Transport>>,
    /// Outbound requests awaiting a correlated response.
    pending_requests: Mutex<HashMap<String, PendingRequest>>,

    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: AsyncMutex<Option<mpsc::Receiver<TransportEvent>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    mdns: Mutex<Option<MdnsDiscovery>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// A dawn P2P node. Cheap to clone; all clones share one node.
#[derive(Clone)]
pub struct DawnNode {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for DawnNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DawnNode")
            .field("node_id", &self.node_id())
            .field("address", &self.inner.config.address)
            .finish()
    }
}

impl DawnNode {
    pub fn new(identity: NodeIdentity, config: NodeConfig) -> Result<Self, P2pError> {
        let node_id = identity.node_id();
        let routing_key = Arc::new(load_or_create_routing_key(config.data_dir.as_deref())?);

        let mut peers = PeerRegistry::new(config.peer_timeout);
        if let Some(dir) = &config.data_dir {
            peers = peers.with_persistence(dir.join("peers.json"));
        }

        let privacy = config.enable_privacy.then(|| {
            PrivacyLayer::new(PrivacyConfig::default(), Arc::clone(&routing_key))
        });
        let dht = config.enable_dht.then(|| Mutex::new(Dht::new(node_id.clone())));

        let (events_tx, events_rx) = mpsc::channel(256);

        Ok(Self {
            inner: Arc::new(NodeInner {
                identity: Arc::new(identity),
                routing_key,
                gossip: GossipDiscovery::new(config.max_peers_to_share),
                bootstrap: BootstrapDiscovery::new(config.bootstrap_nodes.clone()),
                peers: Mutex::new(peers),
                agent_registry: Mutex::new(AgentRegistry::new(node_id.clone())),
                task_registry: Mutex::new(TaskRegistry::new(node_id.clone())),
                task_manager: Mutex::new(TaskManager::new()),
                dht,
                privacy,
                agents: Mutex::new(HashMap::new()),
                transports: Mutex::new(HashMap::new()),
                pending_conns: Mutex::new(HashMap::new()),
                pending_requests: Mutex::new(HashMap::new()),
                events_tx,
                events_rx: AsyncMutex::new(Some(events_rx)),
                local_addr: Mutex::new(None),
                mdns: Mutex::new(None),
                background: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                config,
            }),
        })
    }

    pub fn node_id(&self) -> String {
        self.inner.identity.node_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// The actual bound listener address (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    /// This node's reachable `ws://` URL.
    pub fn ws_url(&self) -> String {
        match (self.local_addr(), self.inner.config.host_port()) {
            (Some(addr), Some((host, _))) => format!("ws://{host}:{}", addr.port()),
            _ => self.inner.config.address.clone(),
        }
    }

    /// Hex public half of the long-lived routing (onion) exchange key.
    pub fn routing_public_key(&self) -> String {
        hex::encode(self.inner.routing_key.public_key_bytes())
    }

    // ── Agents ────────────────────────────────────────────────────────────────

    /// Register a local agent and announce it into the agent-registry CRDT.
    pub fn register_agent(&self, local_agent_id: &str, server: Arc<McpServer>) {
        let tools = to_values(server.tools());
        let resources = to_values(server.resources());
        let prompts = to_values(server.prompts());
        let name = server.name().to_string();

        self.inner
            .agents
            .lock()
            .unwrap()
            .insert(local_agent_id.to_string(), server);
        self.inner.agent_registry.lock().unwrap().register_local_agent(
            local_agent_id,
            &name,
            None,
            tools,
            resources,
            prompts,
            HashMap::new(),
        );
    }

    pub fn unregister_agent(&self, local_agent_id: &str) {
        self.inner.agents.lock().unwrap().remove(local_agent_id);
        self.inner
            .agent_registry
            .lock()
            .unwrap()
            .unregister_local_agent(local_agent_id);
    }

    pub fn agent_info(&self, agent_id: &str) -> Option<dawn_crdt::AgentInfo> {
        self.inner
            .agent_registry
            .lock()
            .unwrap()
            .get_agent(agent_id)
            .cloned()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Bind the listener and start every background task.
    pub async fn start(&self) -> Result<(), P2pError> {
        let (host, port) = self
            .inner
            .config
            .host_port()
            .ok_or_else(|| P2pError::Address(self.inner.config.address.clone()))?;

        let listener = TcpListener::bind((host.as_str(), port)).await?;
        let bound = listener.local_addr()?;
        *self.inner.local_addr.lock().unwrap() = Some(bound);
        tracing::info!(
            node = %&self.node_id()[..16],
            addr = %bound,
            "dawn node listening"
        );

        let events_rx = self
            .inner
            .events_rx
            .lock()
            .await
            .take()
            .ok_or(P2pError::Shutdown)?;

        let mut background = Vec::new();
        background.push(tokio::spawn(self.clone().accept_loop(listener)));
        background.push(tokio::spawn(self.clone().event_loop(events_rx)));
        background.push(tokio::spawn(self.clone().gossip_loop()));
        background.push(tokio::spawn(self.clone().maintenance_loop()));

        if self.inner.config.enable_mdns {
            self.start_mdns(&host, bound.port());
        }
        if !self.inner.bootstrap.is_empty() {
            background.push(tokio::spawn(self.clone().bootstrap_all()));
        }

        self.inner.background.lock().unwrap().extend(background);
        Ok(())
    }

    /// Best-effort teardown; never blocks on a failing peer.
    pub async fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        tracing::info!(node = %&self.node_id()[..16], "shutting down");
        self.inner.cancel.cancel();

        if let Some(mdns) = self.inner.mdns.lock().unwrap().take() {
            mdns.stop();
        }

        let transports: Vec<Transport> = {
            let mut map = self.inner.transports.lock().unwrap();
            map.drain().map(|(_, t)| t).collect()
        };
        for transport in transports {
            transport.close().await;
        }
        self.inner.pending_requests.lock().unwrap().clear();

        if let Err(e) = self.inner.peers.lock().unwrap().save() {
            tracing::warn!("peer registry flush failed: {e}");
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut h = self.inner.background.lock().unwrap();
            h.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }

    // ── Connections ───────────────────────────────────────────────────────────

    /// Dial a peer, run the handshake, and return its node id.
    pub async fn connect_to_peer(&self, address: &str) -> Result<String, P2pError> {
        let (ws, _) = tokio_tungstenite::connect_async(address)
            .await
            .map_err(|e| P2pError::Transport(format!("connect {address}: {e}")))?;
        let transport = Transport::spawn(
            ws,
            Role::Initiator,
            Arc::clone(&self.inner.identity),
            self.inner.config.enable_encryption,
            self.inner.events_tx.clone(),
        );
        self.inner
            .pending_conns
            .lock()
            .unwrap()
            .insert(transport.conn_id(), transport.clone());

        let node_id = match transport
            .wait_established(self.inner.config.handshake_timeout)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.inner
                    .pending_conns
                    .lock()
                    .unwrap()
                    .remove(&transport.conn_id());
                transport.close().await;
                return Err(e);
            }
        };

        self.register_established(transport.conn_id(), &node_id, Some(address));
        {
            let mut peers = self.inner.peers.lock().unwrap();
            if let Some(peer) = peers.get_peer_mut(&node_id) {
                peer.connection_attempts += 1;
            }
            peers.record_success(&node_id);
        }
        Ok(node_id)
    }

    /// How many peers this node currently knows.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().unwrap().len()
    }

    pub fn peer_snapshot(&self, node_id: &str) -> Option<Peer> {
        self.inner.peers.lock().unwrap().get_peer(node_id).cloned()
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Route a JSON-RPC request as if it had arrived on a transport.
    /// Returns the response value, or `None` for notifications.
    pub async fn handle_request(&self, request: Value) -> Option<Value> {
        self.route(request).await
    }

    /// Send `method(params)` to a peer and await the full JSON-RPC response.
    pub async fn request_peer(
        &self,
        node_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, P2pError> {
        let corr_id = Uuid::new_v4().to_string();
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": corr_id,
        });
        self.request_raw(node_id, request, corr_id).await
    }

    async fn request_raw(
        &self,
        node_id: &str,
        request: Value,
        corr_id: String,
    ) -> Result<Value, P2pError> {
        if self.inner.cancel.is_cancelled() {
            return Err(P2pError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.pending_requests.lock().unwrap().insert(
            corr_id.clone(),
            PendingRequest {
                peer: node_id.to_string(),
                reply: tx,
            },
        );

        if let Err(e) = self.send_json(node_id, &request).await {
            self.inner.pending_requests.lock().unwrap().remove(&corr_id);
            self.inner.peers.lock().unwrap().record_failure(node_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(response)) => {
                self.inner.peers.lock().unwrap().record_success(node_id);
                Ok(response)
            }
            Ok(Err(_)) => Err(P2pError::Transport("connection closed".into())),
            Err(_) => {
                self.inner.pending_requests.lock().unwrap().remove(&corr_id);
                self.inner.peers.lock().unwrap().record_failure(node_id);
                Err(P2pError::Timeout)
            }
        }
    }

    /// Get the live transport for a peer, dialing its known address if
    /// necessary.
    async fn transport_for(&self, node_id: &str) -> Result<Transport, P2pError> {
        if let Some(t) = self.inner.transports.lock().unwrap().get(node_id) {
            return Ok(t.clone());
        }
        let address = self
            .inner
            .peers
            .lock()
            .unwrap()
            .get_peer(node_id)
            .map(|p| p.address.clone())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| P2pError::PeerNotFound(node_id.to_string()))?;
        self.connect_to_peer(&address).await?;
        self.inner
            .transports
            .lock()
            .unwrap()
            .get(node_id)
            .cloned()
            .ok_or_else(|| P2pError::PeerNotFound(node_id.to_string()))
    }

    fn existing_transport(&self, node_id: &str) -> Option<Transport> {
        self.inner.transports.lock().unwrap().get(node_id).cloned()
    }

    /// Send a JSON value to a peer, through the privacy layer when enabled.
    async fn send_json(&self, node_id: &str, value: &Value) -> Result<(), P2pError> {
        let transport = self.transport_for(node_id).await?;
        match &self.inner.privacy {
            Some(privacy) => {
                let node = self.clone();
                let send: SendFn = Arc::new(move |bytes, target| {
                    let node = node.clone();
                    Box::pin(async move {
                        let frame = WireEnvelope::Private {
                            data: hex::encode(&bytes),
                        };
                        let Ok(frame) = serde_json::to_value(&frame) else {
                            return;
                        };
                        match node.existing_transport(&target) {
                            Some(t) => {
                                if let Err(e) = t.send_value(&frame).await {
                                    tracing::debug!("private send failed: {e}");
                                }
                            }
                            None => tracing::debug!("no transport for privacy target"),
                        }
                    })
                });
                // No onion path is configured for routed traffic; the layer
                // degrades to padding + timing (see DESIGN notes).
                privacy
                    .send(&serde_json::to_vec(value)?, node_id, &[], send)
                    .await
            }
            None => transport.send_value(value).await,
        }
    }

    // ── Event handling ────────────────────────────────────────────────────────

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, remote)) = accepted else { continue };
                    let node = self.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => {
                                let transport = Transport::spawn(
                                    ws,
                                    Role::Responder,
                                    Arc::clone(&node.inner.identity),
                                    node.inner.config.enable_encryption,
                                    node.inner.events_tx.clone(),
                                );
                                node.inner
                                    .pending_conns
                                    .lock()
                                    .unwrap()
                                    .insert(transport.conn_id(), transport);
                            }
                            Err(e) => {
                                tracing::debug!(%remote, "websocket accept failed: {e}");
                            }
                        }
                    });
                }
            }
        }
    }

    async fn event_loop(self, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        TransportEvent::Established { conn_id, node_id } => {
                            self.register_established(conn_id, &node_id, None);
                        }
                        TransportEvent::Message { node_id, value, .. } => {
                            self.on_message(node_id, value).await;
                        }
                        TransportEvent::Closed { conn_id, node_id } => {
                            self.on_closed(conn_id, node_id);
                        }
                    }
                }
            }
        }
    }

    fn register_established(&self, conn_id: Uuid, node_id: &str, address: Option<&str>) {
        let transport = self.inner.pending_conns.lock().unwrap().remove(&conn_id);
        if let Some(transport) = transport {
            self.inner
                .transports
                .lock()
                .unwrap()
                .insert(node_id.to_string(), transport);
        }
        {
            let mut peers = self.inner.peers.lock().unwrap();
            peers.add_peer(Peer::new(node_id, address.unwrap_or("")));
            peers.set_connected(node_id, true);
        }
        if let Some(dht) = &self.inner.dht {
            dht.lock()
                .unwrap()
                .add_node(node_id, address.unwrap_or(""));
        }
    }

    fn on_closed(&self, conn_id: Uuid, node_id: Option<String>) {
        self.inner.pending_conns.lock().unwrap().remove(&conn_id);
        let Some(node_id) = node_id else { return };

        {
            let mut transports = self.inner.transports.lock().unwrap();
            if transports
                .get(&node_id)
                .is_some_and(|t| t.conn_id() == conn_id)
            {
                transports.remove(&node_id);
            }
        }
        self.inner.peers.lock().unwrap().set_connected(&node_id, false);

        // Fail every request that was waiting on this peer.
        let dropped: Vec<PendingRequest> = {
            let mut pending = self.inner.pending_requests.lock().unwrap();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.peer == node_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        if !dropped.is_empty() {
            tracing::debug!(
                peer = %&node_id[..node_id.len().min(16)],
                count = dropped.len(),
                "failing pending requests for closed connection"
            );
        }
    }

    async fn on_message(&self, from: String, value: Value) {
        // Any traffic counts as peer activity.
        {
            let mut peers = self.inner.peers.lock().unwrap();
            if let Some(peer) = peers.get_peer_mut(&from) {
                peer.touch();
            }
        }
        if let Some(dht) = &self.inner.dht {
            dht.lock().unwrap().touch_node(&from);
        }

        match WireEnvelope::classify(&value) {
            Some(WireEnvelope::GossipAnnouncement {
                peers,
                task_registry,
                agent_registry,
                ..
            }) => {
                self.on_gossip(&peers, &task_registry, &agent_registry);
            }
            Some(WireEnvelope::Private { data }) => {
                self.on_private(from, &data).await;
            }
            Some(_) => {
                // key_exchange / encrypted never surface past the transport.
                tracing::debug!("unexpected envelope at routing layer, dropping");
            }
            None => self.on_rpc(from, value),
        }
    }

    fn on_rpc(&self, from: String, value: Value) {
        if value.get("method").is_some() {
            // Requests run on their own task: forwarding awaits a response
            // that arrives through this very event loop.
            let node = self.clone();
            tokio::spawn(async move {
                if let Some(response) = node.route(value).await {
                    if let Err(e) = node.send_json(&from, &response).await {
                        tracing::debug!("response send failed: {e}");
                    }
                }
            });
        } else if let Some(id) = value.get("id").and_then(Value::as_str) {
            let pending = self.inner.pending_requests.lock().unwrap().remove(id);
            match pending {
                Some(p) => {
                    let _ = p.reply.send(value);
                }
                None => tracing::debug!("response for unknown request id, dropping"),
            }
        }
    }

    fn on_gossip(&self, peers: &[Value], task_state: &Value, agent_state: &Value) {
        let node_id = self.node_id();
        let mut registry = self.inner.peers.lock().unwrap();
        let mut agents = self.inner.agent_registry.lock().unwrap();
        let mut tasks = self.inner.task_registry.lock().unwrap();
        self.inner.gossip.handle_announcement(
            peers,
            task_state,
            agent_state,
            &node_id,
            &mut registry,
            &mut agents,
            &mut tasks,
        );
        drop((registry, agents, tasks));

        // Seed the DHT with newly learned contacts.
        if let Some(dht) = &self.inner.dht {
            let mut dht = dht.lock().unwrap();
            for record in peers {
                if let (Some(id), Some(addr)) = (
                    record.get("node_id").and_then(Value::as_str),
                    record.get("address").and_then(Value::as_str),
                ) {
                    dht.add_node(id, addr);
                }
            }
        }
    }

    async fn on_private(&self, from: String, data_hex: &str) {
        let Some(privacy) = &self.inner.privacy else {
            tracing::debug!("private frame but privacy disabled, dropping");
            return;
        };
        let Ok(bytes) = hex::decode(data_hex) else {
            tracing::debug!("private frame is not hex, dropping");
            return;
        };
        match privacy.receive(&bytes) {
            Ok(Received::Delivered(plaintext)) => {
                match serde_json::from_slice::<Value>(&plaintext) {
                    Ok(inner) => Box::pin(self.on_message(from, inner)).await,
                    Err(e) => tracing::debug!("private payload is not JSON: {e}"),
                }
            }
            Ok(Received::Forward { next_hop, payload }) => {
                let frame = WireEnvelope::Private {
                    data: hex::encode(payload),
                };
                let Ok(frame) = serde_json::to_value(&frame) else {
                    return;
                };
                match self.existing_transport(&next_hop) {
                    Some(t) => {
                        if let Err(e) = t.send_value(&frame).await {
                            tracing::debug!("onion forward failed: {e}");
                        }
                    }
                    None => tracing::debug!(
                        hop = %&next_hop[..next_hop.len().min(16)],
                        "no transport for onion next hop, dropping"
                    ),
                }
            }
            Err(e) => tracing::debug!("privacy receive failed, dropping: {e}"),
        }
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    async fn route(&self, request_value: Value) -> Option<Value> {
        let request = match RpcRequest::from_value(&request_value) {
            Ok(r) => r,
            Err((err, id)) => {
                let response = RpcResponse::failure(id.unwrap_or(RequestId::Null), err);
                return serde_json::to_value(response).ok();
            }
        };
        let notification = request.is_notification();
        let id = request.id.clone().unwrap_or(RequestId::Null);

        match parse_route(&self.node_id(), &request.method) {
            Route::Node(method) => {
                let outcome = self.handle_node_method(&method, request.params).await;
                if notification {
                    return None;
                }
                let response = match outcome {
                    Ok(result) => RpcResponse::success(id, result),
                    Err(err) => RpcResponse::failure(id, err),
                };
                serde_json::to_value(response).ok()
            }
            Route::LocalAgent { agent_id, sub } => {
                self.dispatch_local_agent(&agent_id, &sub, request).await
            }
            Route::Remote {
                node_id,
                agent_id,
                sub,
            } => self.forward(&node_id, &agent_id, &sub, request).await,
            Route::Unknown => {
                if notification {
                    return None;
                }
                let response =
                    RpcResponse::failure(id, RpcError::method_not_found(&request.method));
                serde_json::to_value(response).ok()
            }
        }
    }

    async fn dispatch_local_agent(
        &self,
        agent_id: &str,
        sub: &str,
        request: RpcRequest,
    ) -> Option<Value> {
        let server = self.inner.agents.lock().unwrap().get(agent_id).cloned();
        let Some(server) = server else {
            if request.is_notification() {
                return None;
            }
            let id = request.id.clone().unwrap_or(RequestId::Null);
            let response = RpcResponse::failure(
                id,
                RpcError::method_not_found(&format!("{agent_id}/{sub}")),
            );
            return serde_json::to_value(response).ok();
        };

        let mut inner_request = json!({
            "jsonrpc": "2.0",
            "method": sub,
        });
        if let Some(params) = &request.params {
            inner_request["params"] = params.clone();
        }
        if let Some(id) = &request.id {
            inner_request["id"] = serde_json::to_value(id).ok()?;
        }

        match server.handle_value(inner_request).await {
            Some(RpcReply::Single(response)) => serde_json::to_value(response).ok(),
            Some(RpcReply::Batch(responses)) => serde_json::to_value(responses).ok(),
            None => None,
        }
    }

    async fn forward(
        &self,
        node_id: &str,
        agent_id: &str,
        sub: &str,
        request: RpcRequest,
    ) -> Option<Value> {
        let rewritten_method = format!("{agent_id}/{sub}");

        if request.is_notification() {
            let mut forwarded = json!({
                "jsonrpc": "2.0",
                "method": rewritten_method,
            });
            if let Some(params) = &request.params {
                forwarded["params"] = params.clone();
            }
            if let Err(e) = self.send_json(node_id, &forwarded).await {
                tracing::debug!("notification forward failed: {e}");
            }
            return None;
        }

        let id = request.id.clone().unwrap_or(RequestId::Null);
        let corr_id = Uuid::new_v4().to_string();
        let mut forwarded = json!({
            "jsonrpc": "2.0",
            "method": rewritten_method,
            "id": corr_id,
        });
        if let Some(params) = &request.params {
            forwarded["params"] = params.clone();
        }

        match self.request_raw(node_id, forwarded, corr_id).await {
            Ok(mut response) => {
                // Re-correlate to the original caller's id.
                response["id"] = serde_json::to_value(&id).ok()?;
                Some(response)
            }
            Err(e) => {
                let response = RpcResponse::failure(
                    id,
                    RpcError::new(
                        dawn_mcp::protocol::INTERNAL_ERROR,
                        "Forwarding failed",
                        Some(Value::String(e.to_string())),
                    ),
                );
                serde_json::to_value(response).ok()
            }
        }
    }

    async fn handle_node_method(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        let params = params.unwrap_or(Value::Null);
        match method {
            "node/get_info" => {
                let agent_stats = self.inner.agent_registry.lock().unwrap().get_stats();
                Ok(json!({
                    "node_id": self.node_id(),
                    "address": self.ws_url(),
                    "exchange_public_key": self.routing_public_key(),
                    "peer_count": self.peer_count(),
                    "agents": agent_stats,
                    "dht_enabled": self.inner.dht.is_some(),
                    "privacy_enabled": self.inner.privacy.is_some(),
                }))
            }
            "node/list_agents" => {
                let registry = self.inner.agent_registry.lock().unwrap();
                let agents: Vec<Value> = registry
                    .list_agents(None, false, false)
                    .into_iter()
                    .filter_map(|a| serde_json::to_value(a).ok())
                    .collect();
                Ok(json!({ "agents": agents }))
            }
            "node/list_peers" => {
                let registry = self.inner.peers.lock().unwrap();
                let peers: Vec<Value> = registry
                    .list_peers()
                    .into_iter()
                    .filter_map(|p| serde_json::to_value(p).ok())
                    .collect();
                Ok(json!({ "peers": peers }))
            }
            "dht_find_node" => {
                let dht = self.dht_ref()?;
                let target = params
                    .get("target_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::invalid_params("missing 'target_id'"))?;
                Ok(dht.lock().unwrap().handle_find_node(target))
            }
            "dht_find_value" => {
                let dht = self.dht_ref()?;
                let key = params
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::invalid_params("missing 'key'"))?;
                Ok(dht.lock().unwrap().handle_find_value(key))
            }
            "dht_store" => {
                let dht = self.dht_ref()?;
                let key = params
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::invalid_params("missing 'key'"))?;
                let value = params
                    .get("value")
                    .cloned()
                    .ok_or_else(|| RpcError::invalid_params("missing 'value'"))?;
                let ttl = params
                    .get("ttl")
                    .and_then(Value::as_f64)
                    .unwrap_or(dht::DEFAULT_TTL);
                Ok(dht.lock().unwrap().handle_store(key, value, ttl))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn dht_ref(&self) -> Result<&Mutex<Dht>, RpcError> {
        self.inner
            .dht
            .as_ref()
            .ok_or_else(|| RpcError::method_not_found("dht (disabled)"))
    }

    // ── Gossip / discovery loops ──────────────────────────────────────────────

    fn self_peer_record(&self) -> Peer {
        let mut record = Peer::new(self.node_id(), self.ws_url());
        record.connected = true;
        record.exchange_public_key = Some(self.routing_public_key());
        record.agents = self.inner.agents.lock().unwrap().keys().cloned().collect();
        record
    }

    /// Fan one announcement out to every connected peer.
    pub fn gossip_once(&self) {
        let envelope = {
            let registry = self.inner.peers.lock().unwrap();
            let agents = self.inner.agent_registry.lock().unwrap();
            let tasks = self.inner.task_registry.lock().unwrap();
            self.inner.gossip.build_announcement(
                &self.self_peer_record(),
                &registry,
                &agents,
                &tasks,
            )
        };
        let Ok(value) = serde_json::to_value(&envelope) else {
            return;
        };
        let transports: Vec<Transport> = {
            let map = self.inner.transports.lock().unwrap();
            map.values().cloned().collect()
        };
        for transport in transports {
            // Gossip is droppable under backpressure; RPC traffic is not.
            let _ = transport.send_value_lossy(&value);
        }
    }

    async fn gossip_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.announce_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = interval.tick() => self.gossip_once(),
            }
        }
    }

    /// Periodic housekeeping: liveness sweep, DHT expiry, snapshot flush.
    async fn maintenance_loop(self) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let removed = self.inner.peers.lock().unwrap().prune_expired();
                    for peer in &removed {
                        let transport = self.inner.transports.lock().unwrap().remove(&peer.node_id);
                        if let Some(transport) = transport {
                            transport.close().await;
                        }
                        if let Some(dht) = &self.inner.dht {
                            dht.lock().unwrap().remove_node(&peer.node_id);
                        }
                    }
                    if let Some(dht) = &self.inner.dht {
                        dht.lock().unwrap().sweep_expired();
                    }
                    if let Err(e) = self.inner.peers.lock().unwrap().save() {
                        tracing::debug!("peer snapshot flush failed: {e}");
                    }
                }
            }
        }
    }

    fn start_mdns(&self, host: &str, port: u16) {
        let registry = self.clone();
        let on_peer = move |peer: Peer| {
            registry.inner.peers.lock().unwrap().add_peer(peer);
        };
        match MdnsDiscovery::start(
            &self.node_id(),
            &self.ws_url(),
            host,
            port,
            on_peer,
            self.inner.cancel.child_token(),
        ) {
            Ok(mdns) => *self.inner.mdns.lock().unwrap() = Some(mdns),
            Err(e) => tracing::warn!("mDNS unavailable: {e}"),
        }
    }

    async fn bootstrap_all(self) {
        for address in self.inner.bootstrap.addresses().to_vec() {
            match self.connect_to_peer(&address).await {
                Ok(node_id) => {
                    match self
                        .request_peer(&node_id, "node/list_peers", json!({}))
                        .await
                    {
                        Ok(response) => {
                            let result = response.get("result").cloned().unwrap_or(Value::Null);
                            let merged = {
                                let mut peers = self.inner.peers.lock().unwrap();
                                BootstrapDiscovery::merge_peer_list(
                                    &result,
                                    &self.node_id(),
                                    &mut peers,
                                )
                            };
                            tracing::info!(
                                bootstrap = %address,
                                merged,
                                "bootstrap peer list merged"
                            );
                        }
                        Err(e) => tracing::warn!("bootstrap peer list from {address}: {e}"),
                    }
                }
                Err(e) => tracing::warn!("bootstrap connect {address}: {e}"),
            }
        }
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────
    //
    // The task manager is the authoritative writer; every mutation re-stamps
    // the record into the task-registry CRDT for gossip.

    pub fn create_task(
        &self,
        title: &str,
        description: &str,
        assignee: Option<&str>,
        priority: u8,
        dependencies: Vec<String>,
        metadata: HashMap<String, Value>,
    ) -> Task {
        let task = self.inner.task_manager.lock().unwrap().create_task(
            title,
            description,
            assignee,
            priority,
            dependencies,
            metadata,
        );
        self.inner.task_registry.lock().unwrap().update_task(&task);
        task
    }

    pub fn assign_task(&self, task_id: &str, agent_id: &str) -> Result<Task, TaskError> {
        let task = self
            .inner
            .task_manager
            .lock()
            .unwrap()
            .assign_task(task_id, agent_id)?
            .clone();
        self.inner.task_registry.lock().unwrap().update_task(&task);
        Ok(task)
    }

    pub fn start_task(&self, task_id: &str) -> Result<Task, TaskError> {
        let task = self
            .inner
            .task_manager
            .lock()
            .unwrap()
            .start_task(task_id)?
            .clone();
        self.inner.task_registry.lock().unwrap().update_task(&task);
        Ok(task)
    }

    pub fn complete_task(&self, task_id: &str, result: Option<Value>) -> Result<Task, TaskError> {
        let task = self
            .inner
            .task_manager
            .lock()
            .unwrap()
            .complete_task(task_id, result)?
            .clone();
        self.inner.task_registry.lock().unwrap().update_task(&task);
        Ok(task)
    }

    pub fn fail_task(&self, task_id: &str, error: Option<&str>) -> Result<Task, TaskError> {
        let task = self
            .inner
            .task_manager
            .lock()
            .unwrap()
            .fail_task(task_id, error)?
            .clone();
        self.inner.task_registry.lock().unwrap().update_task(&task);
        Ok(task)
    }

    pub fn cancel_task(&self, task_id: &str) -> Result<Task, TaskError> {
        let task = self
            .inner
            .task_manager
            .lock()
            .unwrap()
            .cancel_task(task_id)?
            .clone();
        self.inner.task_registry.lock().unwrap().update_task(&task);
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.inner
            .task_manager
            .lock()
            .unwrap()
            .get_task(task_id)
            .cloned()
    }

    /// A task as replicated through the CRDT (possibly created elsewhere).
    pub fn get_replicated_task(&self, task_id: &str) -> Option<Task> {
        self.inner.task_registry.lock().unwrap().get_task(task_id)
    }

    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        assignee: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<Task> {
        self.inner
            .task_manager
            .lock()
            .unwrap()
            .list_tasks(status, assignee, limit)
            .into_iter()
            .cloned()
            .collect()
    }

    // ── DHT operations ────────────────────────────────────────────────────────

    pub async fn dht_store(&self, key: &str, value: Value, ttl: f64) -> Result<bool, P2pError> {
        let dht = self
            .inner
            .dht
            .as_ref()
            .ok_or_else(|| P2pError::Discovery("dht disabled".into()))?;
        Ok(dht::iterative_store(dht, self, key, value, ttl).await)
    }

    pub async fn dht_find_value(&self, key: &str) -> Result<Option<Value>, P2pError> {
        let dht = self
            .inner
            .dht
            .as_ref()
            .ok_or_else(|| P2pError::Discovery("dht disabled".into()))?;
        Ok(dht::iterative_find_value(dht, self, key).await)
    }

    pub async fn dht_find_node(&self, target: &str) -> Result<Vec<DhtNodeInfo>, P2pError> {
        let dht = self
            .inner
            .dht
            .as_ref()
            .ok_or_else(|| P2pError::Discovery("dht disabled".into()))?;
        Ok(dht::iterative_find_node(dht, self, target).await)
    }

    /// Drop a locally stored DHT value (test hook for expiry behavior).
    pub fn dht_remove_local(&self, key: &str) {
        if let Some(dht) = &self.inner.dht {
            dht.lock().unwrap().remove_local(key);
        }
    }
}

#[async_trait]
impl DhtRpc for DawnNode {
    async fn call(
        &self,
        node_id: &str,
        address: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, P2pError> {
        if self.existing_transport(node_id).is_none() && !address.is_empty() {
            // Make the contact dialable even when the peer registry has no
            // address for it yet.
            self.inner
                .peers
                .lock()
                .unwrap()
                .add_peer(Peer::new(node_id, address));
        }
        let response = self.request_peer(node_id, method, params).await?;
        if let Some(error) = response.get("error") {
            return Err(P2pError::Transport(format!("dht rpc error: {error}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn to_values<T: serde::Serialize>(items: Vec<T>) -> Vec<Value> {
    items
        .into_iter()
        .filter_map(|i| serde_json::to_value(i).ok())
        .collect()
}

fn load_or_create_routing_key(data_dir: Option<&Path>) -> Result<KeyExchange, P2pError> {
    let Some(dir) = data_dir else {
        return Ok(KeyExchange::generate());
    };
    let path = dir.join("vault/routing_key.key");
    if path.exists() {
        let raw = std::fs::read(&path)?;
        let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            P2pError::Io(format!(
                "routing key file '{}' has the wrong length; delete it to re-key",
                path.display()
            ))
        })?;
        return Ok(KeyExchange::from_private_key_bytes(bytes));
    }
    let key = KeyExchange::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_secret_file(&path, &key.private_key_bytes())?;
    Ok(key)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
//
// Full multi-node round-trips live in tests/node_tests.rs; these cover the
// pure routing logic.

#[cfg(test)]
mod tests {
    use super::*;

    const SELF_ID: &str = "aaaa";

    #[test]
    fn node_methods_route_to_node() {
        assert_eq!(
            parse_route(SELF_ID, "node/get_info"),
            Route::Node("node/get_info".into())
        );
        assert_eq!(
            parse_route(SELF_ID, "dht_find_node"),
            Route::Node("dht_find_node".into())
        );
    }

    #[test]
    fn bare_agent_method_routes_locally() {
        assert_eq!(
            parse_route(SELF_ID, "agent1/tools/call"),
            Route::LocalAgent {
                agent_id: "agent1".into(),
                sub: "tools/call".into()
            }
        );
    }

    #[test]
    fn own_prefix_routes_locally() {
        assert_eq!(
            parse_route(SELF_ID, "aaaa:agent1/tools/list"),
            Route::LocalAgent {
                agent_id: "agent1".into(),
                sub: "tools/list".into()
            }
        );
    }

    #[test]
    fn foreign_prefix_routes_remotely() {
        assert_eq!(
            parse_route(SELF_ID, "bbbb:agent1/resources/read"),
            Route::Remote {
                node_id: "bbbb".into(),
                agent_id: "agent1".into(),
                sub: "resources/read".into()
            }
        );
    }

    #[test]
    fn degenerate_methods_are_unknown() {
        assert_eq!(parse_route(SELF_ID, "no_slash"), Route::Unknown);
        assert_eq!(parse_route(SELF_ID, "/sub"), Route::Unknown);
        assert_eq!(parse_route(SELF_ID, "agent1/"), Route::Unknown);
        assert_eq!(parse_route(SELF_ID, ":agent/sub"), Route::Unknown);
    }

    #[tokio::test]
    async fn local_round_trip_through_handle_request() {
        let node = DawnNode::new(NodeIdentity::generate(), NodeConfig::default()).unwrap();
        let server = Arc::new(McpServer::new("test"));
        server.register_function("echo", "echo", None, |args| {
            Box::pin(async move { Ok(args.get("text").cloned().unwrap_or(Value::Null)) })
        });
        node.register_agent("agent1", server);

        let response = node
            .handle_request(json!({
                "jsonrpc": "2.0",
                "method": "agent1/tools/call",
                "params": {"name": "echo", "arguments": {"text": "hi"}},
                "id": 1,
            }))
            .await
            .unwrap();
        assert_eq!(response["result"]["content"][0]["text"], "hi");
        assert_eq!(response["result"]["isError"], false);
        assert_eq!(response["id"], 1);
    }

    #[tokio::test]
    async fn unknown_agent_is_32601() {
        let node = DawnNode::new(NodeIdentity::generate(), NodeConfig::default()).unwrap();
        let response = node
            .handle_request(json!({
                "jsonrpc": "2.0",
                "method": "ghost/tools/list",
                "id": 2,
            }))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn node_get_info_reports_identity() {
        let node = DawnNode::new(NodeIdentity::generate(), NodeConfig::default()).unwrap();
        let response = node
            .handle_request(json!({
                "jsonrpc": "2.0",
                "method": "node/get_info",
                "id": 3,
            }))
            .await
            .unwrap();
        assert_eq!(response["result"]["node_id"], node.node_id());
        assert_eq!(response["result"]["dht_enabled"], false);
    }

    #[tokio::test]
    async fn dht_methods_without_dht_are_32601() {
        let node = DawnNode::new(NodeIdentity::generate(), NodeConfig::default()).unwrap();
        let response = node
            .handle_request(json!({
                "jsonrpc": "2.0",
                "method": "dht_find_node",
                "params": {"target_id": "00"},
                "id": 4,
            }))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let node = DawnNode::new(NodeIdentity::generate(), NodeConfig::default()).unwrap();
        assert!(node
            .handle_request(json!({
                "jsonrpc": "2.0",
                "method": "node/get_info",
            }))
            .await
            .is_none());
    }

    #[test]
    fn task_mutations_stamp_the_crdt() {
        let node = DawnNode::new(NodeIdentity::generate(), NodeConfig::default()).unwrap();
        let task = node.create_task("t", "d", None, 5, vec![], HashMap::new());
        assert_eq!(
            node.get_replicated_task(&task.task_id).unwrap().status,
            TaskStatus::Open
        );
        node.assign_task(&task.task_id, "agent-a").unwrap();
        assert_eq!(
            node.get_replicated_task(&task.task_id).unwrap().status,
            TaskStatus::Assigned
        );
    }
}
