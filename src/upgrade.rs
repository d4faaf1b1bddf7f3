//! Handing a connection over to another protocol after `101 Switching Protocols`.

use bytes::{Buf, Bytes};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::connection::ConnectionId;

/// The raw byte stream of a connection that has left HTTP behind.
///
/// The server may send the first bytes of the new protocol right behind the upgrade response, so
/// reads first return whatever had already been read off the connection before falling through
/// to the stream itself.
pub struct Upgraded<IO> {
    io: IO,
    read_buf: Bytes,
    id: ConnectionId,
}

impl<IO> fmt::Debug for Upgraded<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded")
            .field("id", &self.id)
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}

impl<IO> Upgraded<IO> {
    pub(crate) fn new(io: IO, read_buf: Bytes, id: ConnectionId) -> Self {
        Upgraded { io, read_buf, id }
    }

    /// The identifier of the connection this stream came from.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Split into the stream and the bytes that were read but not yet consumed.
    pub fn into_parts(self) -> (IO, Bytes) {
        (self.io, self.read_buf)
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for Upgraded<IO> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buf.has_remaining() {
            let n = std::cmp::min(buf.remaining(), self.read_buf.len());
            buf.put_slice(&self.read_buf[..n]);
            self.read_buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for Upgraded<IO> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Takes over a connection after the server agreed to switch protocols.
///
/// The returned value is what the caller receives as the response to the upgrade request, so an
/// implementation typically stores a session object (such as a
/// [`RawWebSocket`](crate::ws::RawWebSocket)) inside the response it was given.
pub trait Upgrade<IO, Res> {
    /// Build the caller's response from the upgrade response and the raw stream.
    fn upgrade(&mut self, response: Res, io: Upgraded<IO>) -> Res;
}

impl<IO, Res, F> Upgrade<IO, Res> for F
where
    F: FnMut(Res, Upgraded<IO>) -> Res,
{
    fn upgrade(&mut self, response: Res, io: Upgraded<IO>) -> Res {
        (self)(response, io)
    }
}
