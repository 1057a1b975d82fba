//! Framed local channels between a proxy, its routing host and peer proxies.
//!
//! Frames are self-describing commands (see [`crate::protocol`]); the reader
//! peels one command envelope at a time off the stream. When routing is local
//! to the node the channel is a Unix domain socket at a filesystem rendezvous
//! path, otherwise a TCP connection to the routing host.

pub mod connection;
pub mod endpoints;
pub mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::protocol::types::{ClientId, COMMAND_HEADER_SIZE};
use crate::proxy::security::SecClient;

pub use connection::RoutingConnection;
pub use endpoints::{EndpointManager, LocalEndpoint};
pub use server::ProxyReceiver;

/// Identity of the far side of a channel, attached to every inbound frame for
/// the dispatcher's security gate.
#[derive(Debug, Clone)]
pub struct FrameOrigin {
    /// the client id bound to the connection the frame arrived on
    pub bound_client: ClientId,
    pub sec_client: Option<SecClient>,
    /// remote socket address for network channels
    pub remote: Option<SocketAddr>,
}

/// Callbacks out of the transport into the proxy core. Implementations hold a
/// weak back-reference to the proxy and bail out once it is gone.
#[async_trait::async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn on_connect(&self);
    async fn on_disconnect(&self);
    async fn on_frame(&self, frame: &[u8], origin: &FrameOrigin);
}

pub(crate) trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

pub(crate) type BoxedStream = Box<dyn RawStream>;

/// Where the sender connects to: the routing host's rendezvous socket on this
/// node, or its TCP command port on another one.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

pub(crate) struct ConnectedStream {
    pub stream: BoxedStream,
    pub sec_client: Option<SecClient>,
    pub remote: Option<SocketAddr>,
    pub local_port: u16,
}

impl ConnectTarget {
    pub(crate) async fn connect(&self) -> anyhow::Result<ConnectedStream> {
        match self {
            ConnectTarget::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                let sec_client = stream
                    .peer_cred()
                    .ok()
                    .map(|cred| SecClient::Uds {
                        uid: cred.uid(),
                        gid: cred.gid(),
                    });
                Ok(ConnectedStream {
                    stream: Box::new(stream),
                    sec_client,
                    remote: None,
                    local_port: 0,
                })
            }
            ConnectTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                let remote = stream.peer_addr()?;
                let local_port = stream.local_addr()?.port();
                Ok(ConnectedStream {
                    stream: Box::new(stream),
                    sec_client: Some(SecClient::Net {
                        addr: remote.ip(),
                        port: remote.port(),
                    }),
                    remote: Some(remote),
                    local_port,
                })
            }
        }
    }
}

/// Reads one complete command frame. `Ok(None)` is a clean end of stream at a
/// frame boundary; a stream ending mid-frame is an error.
pub(crate) async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
    max_frame_size: usize,
) -> anyhow::Result<Option<Vec<u8>>> {
    let mut header = [0u8; COMMAND_HEADER_SIZE];

    let n = reader.read(&mut header[..1]).await?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let payload_size =
        u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
    if COMMAND_HEADER_SIZE + payload_size > max_frame_size {
        return Err(anyhow!(
            "frame of {} bytes exceeds maximum of {}",
            COMMAND_HEADER_SIZE + payload_size,
            max_frame_size
        ));
    }

    let mut frame = vec![0u8; COMMAND_HEADER_SIZE + payload_size];
    frame[..COMMAND_HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[COMMAND_HEADER_SIZE..]).await?;
    Ok(Some(frame))
}
