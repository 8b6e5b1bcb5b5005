// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Peer discovery: bootstrap nodes, local-network mDNS, and gossip.
//!
//! The three mechanisms cooperate and any of them can be disabled; all of
//! them funnel discovered peers into the [`PeerRegistry`](crate::peers::PeerRegistry).

pub mod bootstrap;
pub mod gossip;
pub mod mdns;

pub use bootstrap::BootstrapDiscovery;
pub use gossip::GossipDiscovery;
pub use mdns::MdnsDiscovery;
