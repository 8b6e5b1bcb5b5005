use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a full dawn node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listen address as a transport-scheme URL, e.g. `ws://127.0.0.1:8000`.
    /// Port 0 asks the OS for a free port.
    pub address: String,

    /// Directory for persisted state (identity seed, peer snapshot).
    /// `None` disables persistence entirely.
    pub data_dir: Option<PathBuf>,

    /// Bootstrap peer addresses contacted on startup.
    pub bootstrap_nodes: Vec<String>,

    /// End-to-end encrypt peer sessions (key-exchange handshake + AES-GCM).
    /// Both endpoints must agree; a mid-stream downgrade fails the connection.
    pub enable_encryption: bool,

    /// Wrap peer traffic in the privacy layer (padding + timing obfuscation,
    /// onion framing when a path is supplied — with no path configured the
    /// layer degrades to padding and timing only).
    pub enable_privacy: bool,

    /// Participate in the Kademlia DHT.
    pub enable_dht: bool,

    /// Advertise and browse `_projectdawn._tcp.local.` on the local network.
    pub enable_mdns: bool,

    /// A peer is alive iff `now − last_seen < peer_timeout`.
    pub peer_timeout: f64,

    /// Interval between gossip announcements.
    pub announce_interval: Duration,

    /// Alive peers shared per gossip announcement.
    pub max_peers_to_share: usize,

    /// Per-request timeout for outbound RPCs.
    pub request_timeout: Duration,

    /// How long to wait for the key-exchange handshake on a new connection.
    pub handshake_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "ws://127.0.0.1:8000".into(),
            data_dir: None,
            bootstrap_nodes: Vec::new(),
            enable_encryption: true,
            enable_privacy: false,
            enable_dht: false,
            enable_mdns: false,
            peer_timeout: 300.0,
            announce_interval: Duration::from_secs(60),
            max_peers_to_share: 10,
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Split `ws://host:port` into `(host, port)`.
    pub fn host_port(&self) -> Option<(String, u16)> {
        let rest = self
            .address
            .strip_prefix("ws://")
            .or_else(|| self.address.strip_prefix("wss://"))?;
        let rest = rest.split('/').next()?;
        let (host, port) = rest.rsplit_once(':')?;
        Some((host.to_string(), port.parse().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parses_ws_addresses() {
        let cfg = NodeConfig::new("ws://127.0.0.1:8000");
        assert_eq!(cfg.host_port(), Some(("127.0.0.1".into(), 8000)));
        let cfg = NodeConfig::new("wss://example.org:443/path");
        assert_eq!(cfg.host_port(), Some(("example.org".into(), 443)));
        assert_eq!(NodeConfig::new("not-a-url").host_port(), None);
    }
}
