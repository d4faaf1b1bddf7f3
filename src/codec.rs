//! The seam between the pipeline and the HTTP wire format.
//!
//! The pipeline never parses HTTP itself. It hands each request to a [`Codec`] to serialize, and
//! asks the same codec to carve complete responses out of the bytes read from the connection.

use bytes::BytesMut;
use std::io;

/// Which form of request target a request line should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTarget {
    /// `GET /path?query HTTP/1.1`, for talking to an origin server directly.
    Origin,
    /// `GET http://host/path?query HTTP/1.1`, for talking through a forward proxy.
    Absolute,
}

impl RequestTarget {
    pub(crate) fn for_proxy(over_proxy: bool) -> Self {
        if over_proxy {
            RequestTarget::Absolute
        } else {
            RequestTarget::Origin
        }
    }
}

/// Serializes requests and parses responses for one connection.
///
/// Each connection gets its own codec value, so a codec is free to keep parsing state between
/// calls to [`decode`](Codec::decode).
pub trait Codec<Req> {
    /// The response type produced by [`decode`](Codec::decode).
    type Response;

    /// Append the full wire form of `req` (request line, headers and body) to `dst`.
    ///
    /// An error here fails only this request; nothing of it is written.
    fn encode(&mut self, req: &Req, target: RequestTarget, dst: &mut BytesMut) -> io::Result<()>;

    /// Try to take one complete response off the front of `src`.
    ///
    /// Returns `Ok(None)` if more bytes are needed. Bytes belonging to the response must be
    /// removed from `src`, and bytes belonging to later responses must be left alone.
    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Response>>;

    /// Returns true if `res` switches the connection to another protocol.
    fn is_upgrade(&self, res: &Self::Response) -> bool {
        let _ = res;
        false
    }

    /// Returns true if `req` may switch the connection to another protocol.
    ///
    /// No further requests are written on the connection until the response to such a request
    /// has been read.
    fn is_upgrade_request(&self, req: &Req) -> bool {
        let _ = req;
        false
    }
}
