// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;
use std::path::PathBuf;

/// dawn — decentralized peer-to-peer agent network node.
///
/// Starts a node that hosts local MCP agents, discovers peers, replicates
/// the network-wide agent and task registries, and routes JSON-RPC calls to
/// local or remote agents over authenticated encrypted WebSocket sessions.
#[derive(Parser, Debug)]
#[command(name = "dawn", version, about)]
pub struct Cli {
    /// Listen address. Port 0 asks the OS for a free port.
    ///
    /// Overridden by PROJECT_DAWN_HOST / PROJECT_DAWN_WS_PORT when set.
    #[arg(long, default_value = "ws://127.0.0.1:8000")]
    pub listen: String,

    /// Bootstrap peer addresses (comma-separated ws:// URLs).
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Participate in the Kademlia DHT.
    #[arg(long)]
    pub enable_dht: bool,

    /// Enable the privacy layer (message padding + timing obfuscation;
    /// onion framing engages when a route is supplied).
    #[arg(long)]
    pub enable_privacy: bool,

    /// Disable end-to-end session encryption (testing only; both sides of
    /// every connection must agree).
    #[arg(long)]
    pub plaintext: bool,

    /// Advertise and browse _projectdawn._tcp.local. on the local network.
    #[arg(long)]
    pub enable_mdns: bool,

    /// Node data directory (identity seed, peer snapshot). Defaults to the
    /// platform data dir; use --ephemeral to keep everything in memory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Do not persist any state (fresh identity on every run).
    #[arg(long)]
    pub ephemeral: bool,

    /// Log filter, e.g. "info" or "dawn_p2p=debug,info".
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
