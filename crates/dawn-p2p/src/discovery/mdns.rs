//! Local-network discovery over mDNS.
//!
//! Advertises a `_projectdawn._tcp.local.` service with TXT properties
//! `node_id` and `address`, and browses the same type, reporting every
//! resolved peer through a callback. Peers identify themselves via the TXT
//! record, so nothing is assumed about the interface the announcement
//! arrived on.
//!
//! mDNS is best-effort: any daemon error disables the mechanism with a
//! warning instead of failing node startup.

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio_util::sync::CancellationToken;

use crate::error::P2pError;
use crate::peers::Peer;

pub const SERVICE_TYPE: &str = "_projectdawn._tcp.local.";

pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MdnsDiscovery {
    /// Register this node's service and start browsing for others.
    ///
    /// `on_peer` is invoked for every resolved foreign service; the caller
    /// filters out its own announcement by node id.
    pub fn start<F>(
        node_id: &str,
        address: &str,
        host_ip: &str,
        port: u16,
        on_peer: F,
        cancel: CancellationToken,
    ) -> Result<Self, P2pError>
    where
        F: Fn(Peer) + Send + 'static,
    {
        let daemon = ServiceDaemon::new().map_err(|e| P2pError::Discovery(e.to_string()))?;

        // Short instance name; the full identity travels in TXT.
        let instance = format!("dawn-{}", &node_id[..node_id.len().min(12)]);
        let properties = [("node_id", node_id), ("address", address)];
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &format!("{instance}.local."),
            host_ip,
            port,
            &properties[..],
        )
        .map_err(|e| P2pError::Discovery(e.to_string()))?;
        let fullname = service.get_fullname().to_string();

        daemon
            .register(service)
            .map_err(|e| P2pError::Discovery(e.to_string()))?;

        let browser = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| P2pError::Discovery(e.to_string()))?;

        let own_node_id = node_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = browser.recv_async() => {
                        let Ok(event) = event else { break };
                        if let ServiceEvent::ServiceResolved(info) = event {
                            let Some(peer_id) = info.get_property_val_str("node_id") else {
                                continue;
                            };
                            if peer_id == own_node_id {
                                continue;
                            }
                            let Some(peer_addr) = info.get_property_val_str("address") else {
                                continue;
                            };
                            tracing::info!(
                                peer = %&peer_id[..peer_id.len().min(16)],
                                address = %peer_addr,
                                "discovered peer via mDNS"
                            );
                            on_peer(Peer::new(peer_id, peer_addr));
                        }
                    }
                }
            }
        });

        tracing::info!(service = %fullname, "mDNS discovery started");
        Ok(Self { daemon, fullname })
    }

    /// Unregister the service and shut the daemon down.
    pub fn stop(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
        tracing::info!("mDNS discovery stopped");
    }
}
