use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::types::{ClientId, ROUTING_CLIENT};
use crate::proxy::security::SecClient;

/// Static configuration of a routing proxy, filled in by the embedding
/// application. `new` gives the defaults for node-local routing.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// network name, used to derive the rendezvous base path
    pub network: String,
    /// this node's hostname, shared with other applications via CONFIG
    pub hostname: String,

    pub routing_host_id: ClientId,
    /// routing host on this node (rendezvous sockets) or remote (TCP)
    pub local_routing: bool,
    pub routing_host_address: IpAddr,
    pub routing_host_port: u16,

    /// coalescing window for REQUEST_SERVICE; zero sends each request as is
    pub request_debounce_time: Duration,

    pub keepalive_enabled: bool,
    pub keepalive_time: Duration,

    /// bounded wait for registration to settle during `stop`
    pub shutdown_timeout: Duration,

    pub security_enabled: bool,
    /// policy decisions are made by an external instance; suppresses the
    /// internal response-routing relaxation
    pub security_external: bool,
    /// whether commands relayed for remote clients may reach this application
    pub remote_access_allowed: bool,
    /// this application's own identity for policy checks
    pub own_sec_client: SecClient,

    pub base_path: PathBuf,
    pub max_message_size: usize,
}

impl ProxyConfig {
    pub fn new(network: &str) -> ProxyConfig {
        ProxyConfig {
            network: network.to_string(),
            hostname: "localhost".to_string(),
            routing_host_id: ROUTING_CLIENT,
            local_routing: true,
            routing_host_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            routing_host_port: 30490,
            request_debounce_time: Duration::from_millis(10),
            keepalive_enabled: false,
            keepalive_time: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            security_enabled: false,
            security_external: false,
            remote_access_allowed: true,
            own_sec_client: SecClient::Uds { uid: 0, gid: 0 },
            base_path: PathBuf::from("/tmp"),
            max_message_size: 256 * 1024,
        }
    }

    /// Filesystem rendezvous socket of a client on this node.
    pub fn rendezvous_path(&self, client: ClientId) -> PathBuf {
        self.base_path
            .join(&self.network)
            .join(format!("{:04x}", client))
    }
}
