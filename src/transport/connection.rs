use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::protocol::types::ClientId;
use crate::transport::{read_frame, BoxedStream, ConnectTarget, FrameHandler, FrameOrigin};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(100);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// The proxy's channel to the routing host. Owns a connect loop: every
/// established connection is announced via `on_connect`, frames the host
/// sends back are dispatched, and loss of the connection triggers
/// `on_disconnect` followed by a backed-off reconnect. `restart` tears down
/// the current connection so the loop runs again; `stop` ends it.
pub struct RoutingConnection {
    target: ConnectTarget,
    routing_host: ClientId,
    max_frame_size: usize,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    local_port: AtomicU16,
    stopped: AtomicBool,
    cycle: Notify,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RoutingConnection {
    pub fn new(
        target: ConnectTarget,
        routing_host: ClientId,
        max_frame_size: usize,
    ) -> Arc<RoutingConnection> {
        Arc::new(RoutingConnection {
            target,
            routing_host,
            max_frame_size,
            writer: Mutex::new(None),
            local_port: AtomicU16::new(0),
            stopped: AtomicBool::new(false),
            cycle: Notify::new(),
            task: std::sync::Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>, handler: Arc<dyn FrameHandler>) {
        let this = self.clone();
        let task = tokio::spawn(async move { this.run(handler).await });
        if let Some(prev) = self.task.lock().unwrap().replace(task) {
            prev.abort();
        }
    }

    async fn run(self: Arc<Self>, handler: Arc<dyn FrameHandler>) {
        let mut delay = INITIAL_RECONNECT_DELAY;
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            match self.target.connect().await {
                Ok(connected) => {
                    delay = INITIAL_RECONNECT_DELAY;
                    debug!("connected to routing host at {:?}", self.target);

                    let (mut read_half, write_half) = tokio::io::split(connected.stream);
                    self.local_port
                        .store(connected.local_port, Ordering::Release);
                    *self.writer.lock().await = Some(write_half);

                    handler.on_connect().await;

                    let origin = FrameOrigin {
                        bound_client: self.routing_host,
                        sec_client: connected.sec_client,
                        remote: connected.remote,
                    };
                    self.receive_loop(&mut read_half, &handler, &origin).await;

                    *self.writer.lock().await = None;
                    if self.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    handler.on_disconnect().await;
                }
                Err(e) => {
                    debug!("connecting to routing host failed: {}", e);
                }
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            sleep(delay).await;
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
        info!("routing host connection closed");
    }

    async fn receive_loop(
        &self,
        read_half: &mut ReadHalf<BoxedStream>,
        handler: &Arc<dyn FrameHandler>,
        origin: &FrameOrigin,
    ) {
        loop {
            tokio::select! {
                result = read_frame(read_half, self.max_frame_size) => {
                    match result {
                        Ok(Some(frame)) => handler.on_frame(&frame, origin).await,
                        Ok(None) => {
                            debug!("routing host closed the connection");
                            return;
                        }
                        Err(e) => {
                            warn!("receive from routing host failed: {}", e);
                            return;
                        }
                    }
                }
                _ = self.cycle.notified() => return,
            }
        }
    }

    /// local port of the current connection, 0 for rendezvous sockets
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Acquire)
    }

    pub async fn send(&self, frame: &[u8]) -> bool {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => match w.write_all(frame).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("send to routing host failed: {}", e);
                    *writer = None;
                    self.cycle.notify_one();
                    false
                }
            },
            None => false,
        }
    }

    /// Writes several frames back to back under one writer acquisition, so no
    /// other frame can interleave between them on the wire.
    pub async fn send_many(&self, frames: &[&[u8]]) -> bool {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                for frame in frames {
                    if let Err(e) = w.write_all(frame).await {
                        warn!("send to routing host failed: {}", e);
                        *writer = None;
                        self.cycle.notify_one();
                        return false;
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Drops the current connection; the connect loop establishes a fresh one.
    pub async fn restart(&self) {
        info!("restarting routing host connection");
        *self.writer.lock().await = None;
        self.cycle.notify_one();
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        *self.writer.lock().await = None;
        self.cycle.notify_one();
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}
