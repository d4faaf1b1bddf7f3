//! Connections and the dialer that produces them.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a connection, used to tie log lines together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        // only uniqueness matters here
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A duplex byte stream to a server, plus what we know about the peer.
///
/// A connection is owned by exactly one [`Pipeline`](crate::pipeline::Pipeline) at a time, which
/// is also the only thing that ever closes it.
pub struct Connection<IO> {
    pub(crate) io: IO,
    id: ConnectionId,
    peer: Option<SocketAddr>,
}

impl<IO> fmt::Debug for Connection<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl<IO> Connection<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established byte stream.
    pub fn new(io: IO) -> Self {
        Connection {
            io,
            id: ConnectionId::next(),
            peer: None,
        }
    }

    /// Record the address of the remote end.
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

impl<IO> Connection<IO> {
    /// This connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The address of the remote end, if known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Take the byte stream back out.
    pub fn into_inner(self) -> IO {
        self.io
    }
}

/// Why a connection was handed back to its [`Dialer`].
#[derive(Debug)]
pub enum Release {
    /// The pipeline finished normally: drained, idle, shut down, or upgraded.
    Closed(crate::pipeline::Exit),
    /// The pipeline stopped because of an error.
    Broken(crate::Error),
}

/// Produces connections for an [`Endpoint`](crate::endpoint::Endpoint) and learns when they
/// go away.
pub trait Dialer: Send + Sync + 'static {
    /// The byte stream type of the connections this dialer produces.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// The future returned by [`dial`](Dialer::dial).
    type Future: Future<Output = io::Result<Connection<Self::Io>>> + Send + 'static;

    /// Establish a new connection.
    fn dial(&self) -> Self::Future;

    /// Called once a connection produced by this dialer has been closed.
    fn release(&self, id: ConnectionId, reason: &Release) {
        let _ = (id, reason);
    }
}

/// A [`Dialer`] that opens plain TCP connections to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: SocketAddr,
    nodelay: bool,
}

impl TcpDialer {
    /// Dial `addr`, with `TCP_NODELAY` enabled.
    pub fn new(addr: SocketAddr) -> Self {
        TcpDialer {
            addr,
            nodelay: true,
        }
    }

    /// Control `TCP_NODELAY` on new connections.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Dialer for TcpDialer {
    type Io = TcpStream;
    type Future = Pin<Box<dyn Future<Output = io::Result<Connection<TcpStream>>> + Send>>;

    fn dial(&self) -> Self::Future {
        let addr = self.addr;
        let nodelay = self.nodelay;
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(nodelay)?;
            let conn = Connection::new(stream).with_peer(addr);
            tracing::debug!(id = %conn.id(), peer = %addr, "connected");
            Ok(conn)
        })
    }

    fn release(&self, id: ConnectionId, reason: &Release) {
        tracing::debug!(%id, ?reason, "connection released");
    }
}
