use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::protocol::types::ClientId;
use crate::proxy::ProxyConfig;
use crate::transport::{BoxedStream, ConnectTarget};

/// Outbound channel to one peer proxy. Write-only: whatever the peer has to
/// say arrives on our receiver through the peer's own outbound channel.
pub struct LocalEndpoint {
    client: ClientId,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
}

impl LocalEndpoint {
    pub fn client(&self) -> ClientId {
        self.client
    }

    pub async fn send(&self, frame: &[u8]) -> bool {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => match w.write_all(frame).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(client = self.client, "send to peer failed: {}", e);
                    *writer = None;
                    false
                }
            },
            None => false,
        }
    }
}

/// Cache of outbound peer endpoints, resolved through the rendezvous path of
/// a node-local peer or the guest address the routing host announced.
pub struct EndpointManager {
    config: Arc<ProxyConfig>,
    endpoints: Mutex<FxHashMap<ClientId, Arc<LocalEndpoint>>>,
    guests: std::sync::Mutex<FxHashMap<ClientId, SocketAddr>>,
}

impl EndpointManager {
    pub fn new(config: Arc<ProxyConfig>) -> EndpointManager {
        EndpointManager {
            config,
            endpoints: Mutex::new(FxHashMap::default()),
            guests: std::sync::Mutex::new(FxHashMap::default()),
        }
    }

    /// Records where a guest client is reachable (from ROUTING_INFO entries
    /// carrying an address).
    pub fn add_guest(&self, client: ClientId, addr: SocketAddr) {
        self.guests.lock().unwrap().insert(client, addr);
    }

    pub async fn find_local(&self, client: ClientId) -> Option<Arc<LocalEndpoint>> {
        self.endpoints.lock().await.get(&client).cloned()
    }

    pub async fn find_or_create_local(&self, client: ClientId) -> Option<Arc<LocalEndpoint>> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(existing) = endpoints.get(&client) {
            return Some(existing.clone());
        }

        let target = if self.config.local_routing {
            ConnectTarget::Unix(self.config.rendezvous_path(client))
        } else {
            let addr = self.guests.lock().unwrap().get(&client).copied();
            match addr {
                Some(addr) => ConnectTarget::Tcp(addr),
                None => {
                    warn!(client, "no address known for peer, cannot connect");
                    return None;
                }
            }
        };

        match target.connect().await {
            Ok(connected) => {
                debug!(client, "connected to peer");
                let (read_half, write_half) = tokio::io::split(connected.stream);
                drop(read_half); // write-only channel
                let endpoint = Arc::new(LocalEndpoint {
                    client,
                    writer: Mutex::new(Some(write_half)),
                });
                endpoints.insert(client, endpoint.clone());
                Some(endpoint)
            }
            Err(e) => {
                warn!(client, "connecting to peer failed: {}", e);
                None
            }
        }
    }

    pub async fn remove_local(&self, client: ClientId) {
        if self.endpoints.lock().await.remove(&client).is_some() {
            debug!(client, "removed peer endpoint");
        }
    }

    pub async fn connected_clients(&self) -> Vec<ClientId> {
        self.endpoints.lock().await.keys().copied().collect()
    }

    pub async fn clear(&self) {
        self.endpoints.lock().await.clear();
        self.guests.lock().unwrap().clear();
    }
}
