// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `dawn-p2p` — the peer-to-peer kernel of the dawn agent network.
//!
//! A [`DawnNode`] listens on a WebSocket address, discovers peers
//! (bootstrap, mDNS, gossip), keeps eventually-consistent agent and task
//! registries, participates in a Kademlia DHT, and routes every inbound
//! JSON-RPC request to a local agent, a local node method, or a remote peer
//! over authenticated encrypted sessions — optionally wrapped in the
//! padding/onion/timing privacy layer.
//!
//! ```text
//! frame on the wire
//!       │  Transport: handshake, verify, decrypt
//!       ▼
//! DawnNode event loop
//!       │  gossip?  private?  JSON-RPC?
//!       ▼
//! router: node/* | <node_id>:<agent>/<sub> | <agent>/<sub>
//!       │
//!       ▼
//! local McpServer  /  forwarded to peer (30 s timeout)
//! ```

pub mod config;
pub mod dht;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod node;
pub mod peers;
pub mod privacy;
pub mod transport;

pub use config::NodeConfig;
pub use dht::{Dht, DhtNodeInfo, DhtRpc, ALPHA, K};
pub use envelope::WireEnvelope;
pub use error::P2pError;
pub use node::DawnNode;
pub use peers::{Peer, PeerRegistry};
pub use privacy::{MessagePadder, OnionHop, OnionRouter, PrivacyConfig, PrivacyLayer};
pub use transport::{Role, Transport, TransportEvent};
