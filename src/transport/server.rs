use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::io::ReadHalf;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::types::ClientId;
use crate::proxy::security::SecClient;
use crate::transport::{read_frame, BoxedStream, FrameHandler, FrameOrigin};

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// The proxy's server side: accepts inbound connections from peer proxies
/// (and from the routing host relaying on their behalf) and feeds their
/// frames to the dispatcher. Each accepted connection is bound to the client
/// id carried by its first frame; `disconnect_from` detaches one peer.
pub struct ProxyReceiver {
    listener: std::sync::Mutex<Option<Listener>>,
    rendezvous_path: Option<PathBuf>,
    local_port: u16,
    max_frame_size: usize,
    peers: Arc<std::sync::Mutex<FxHashMap<ClientId, Arc<Notify>>>>,
    stopped: Arc<AtomicBool>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProxyReceiver {
    /// Binds the filesystem rendezvous socket for an assigned client id.
    /// A stale socket file from a crashed predecessor is replaced.
    pub fn bind_local(path: PathBuf, max_frame_size: usize) -> anyhow::Result<Arc<ProxyReceiver>> {
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!("listening for peers at {:?}", path);
        Ok(Arc::new(ProxyReceiver {
            listener: std::sync::Mutex::new(Some(Listener::Unix(listener))),
            rendezvous_path: Some(path),
            local_port: 0,
            max_frame_size,
            peers: Default::default(),
            stopped: Arc::new(AtomicBool::new(false)),
            accept_task: std::sync::Mutex::new(None),
        }))
    }

    /// Binds an ephemeral TCP port; the port is announced to the routing host
    /// in REGISTER_APPLICATION.
    pub async fn bind_net(bind_addr: SocketAddr, max_frame_size: usize) -> anyhow::Result<Arc<ProxyReceiver>> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_port = listener.local_addr()?.port();
        info!("listening for peers on port {}", local_port);
        Ok(Arc::new(ProxyReceiver {
            listener: std::sync::Mutex::new(Some(Listener::Tcp(listener))),
            rendezvous_path: None,
            local_port,
            max_frame_size,
            peers: Default::default(),
            stopped: Arc::new(AtomicBool::new(false)),
            accept_task: std::sync::Mutex::new(None),
        }))
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn start(self: &Arc<Self>, handler: Arc<dyn FrameHandler>) {
        let Some(listener) = self.listener.lock().unwrap().take() else {
            return; // already started
        };
        let this = self.clone();
        let task = tokio::spawn(async move { this.accept_loop(listener, handler).await });
        *self.accept_task.lock().unwrap() = Some(task);
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener, handler: Arc<dyn FrameHandler>) {
        loop {
            let accepted = match &listener {
                Listener::Unix(l) => match l.accept().await {
                    Ok((stream, _)) => {
                        let sec_client = stream.peer_cred().ok().map(|cred| SecClient::Uds {
                            uid: cred.uid(),
                            gid: cred.gid(),
                        });
                        Some((Box::new(stream) as BoxedStream, sec_client, None))
                    }
                    Err(e) => {
                        warn!("accepting peer connection failed: {}", e);
                        None
                    }
                },
                Listener::Tcp(l) => match l.accept().await {
                    Ok((stream, remote)) => {
                        let sec_client = Some(SecClient::Net {
                            addr: remote.ip(),
                            port: remote.port(),
                        });
                        Some((Box::new(stream) as BoxedStream, sec_client, Some(remote)))
                    }
                    Err(e) => {
                        warn!("accepting peer connection failed: {}", e);
                        None
                    }
                },
            };
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            let Some((stream, sec_client, remote)) = accepted else {
                continue;
            };

            let peers = self.peers.clone();
            let stopped = self.stopped.clone();
            let handler = handler.clone();
            let max_frame_size = self.max_frame_size;
            tokio::spawn(async move {
                let (mut read_half, _write_half) = tokio::io::split(stream);
                peer_loop(
                    &mut read_half,
                    sec_client,
                    remote,
                    handler,
                    peers,
                    stopped,
                    max_frame_size,
                )
                .await;
            });
        }
    }

    /// Detaches the connection bound to `client`, if any.
    pub fn disconnect_from(&self, client: ClientId) {
        if let Some(shutdown) = self.peers.lock().unwrap().remove(&client) {
            debug!(client, "detaching peer connection");
            shutdown.notify_one();
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let peers = std::mem::take(&mut *self.peers.lock().unwrap());
        for shutdown in peers.values() {
            shutdown.notify_one();
        }
        if let Some(path) = &self.rendezvous_path {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("removing rendezvous socket {:?} failed: {}", path, e);
            }
        }
    }
}

async fn peer_loop(
    read_half: &mut ReadHalf<BoxedStream>,
    sec_client: Option<SecClient>,
    remote: Option<SocketAddr>,
    handler: Arc<dyn FrameHandler>,
    peers: Arc<std::sync::Mutex<FxHashMap<ClientId, Arc<Notify>>>>,
    stopped: Arc<AtomicBool>,
    max_frame_size: usize,
) {
    let shutdown = Arc::new(Notify::new());
    let mut bound_client: Option<ClientId> = None;

    loop {
        if stopped.load(Ordering::Acquire) {
            break;
        }
        let frame = tokio::select! {
            result = read_frame(read_half, max_frame_size) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!("peer connection broke: {}", e);
                    break;
                }
            },
            _ = shutdown.notified() => break,
        };

        if bound_client.is_none() && frame.len() >= 3 {
            let client = u16::from_le_bytes([frame[1], frame[2]]);
            debug!(client, "peer connection bound");
            bound_client = Some(client);
            peers.lock().unwrap().insert(client, shutdown.clone());
        }

        let origin = FrameOrigin {
            bound_client: bound_client.unwrap_or_default(),
            sec_client: sec_client.clone(),
            remote,
        };
        handler.on_frame(&frame, &origin).await;
    }

    if let Some(client) = bound_client {
        let mut peers = peers.lock().unwrap();
        if let Some(registered) = peers.get(&client) {
            if Arc::ptr_eq(registered, &shutdown) {
                peers.remove(&client);
            }
        }
    }
}
