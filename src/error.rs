use std::{error, fmt, io};

/// An error that occurred while servicing a request.
///
/// The same type is used both for the result of an individual request (see
/// [`ResponseHandle`](crate::ResponseHandle)) and for the result of a
/// [`Pipeline`](crate::pipeline::Pipeline) as a whole.
#[non_exhaustive]
pub enum Error {
    /// The task queue has been closed and accepts no more requests.
    QueueClosed,

    /// The task queue is full and is configured to reject rather than wait.
    QueueFull,

    /// The request was written, but writing to the connection later failed.
    ///
    /// The request may or may not have been processed by the server.
    ConnectionReset,

    /// The request was written, but the connection closed before its response was read.
    ConnectionClosed,

    /// The underlying connection failed to send a request.
    BrokenTransportSend(io::Error),

    /// The underlying connection failed while attempting to receive a response.
    ///
    /// If `None`, the connection closed without error while there were pending requests.
    BrokenTransportRecv(Option<io::Error>),

    /// The request was cancelled, or the pipeline that owned it went away.
    Cancelled,

    /// The server asked to switch protocols, but no upgrade handler is configured.
    UpgradeUnsupported,

    /// The server sent a response the client was not expecting.
    Desynchronized,

    /// The request could not be serialized, or a response could not be parsed.
    Codec(io::Error),

    /// No connection could be established to carry the request.
    Connect(io::Error),
}

impl Error {
    /// Returns true if the request is known to never have reached the wire.
    ///
    /// Such requests can be submitted again, possibly to a different connection, without any
    /// idempotency guarantees from the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            *self,
            Error::QueueFull | Error::QueueClosed | Error::Connect(_)
        )
    }

    pub(crate) fn from_sink_error(e: io::Error) -> Self {
        Error::BrokenTransportSend(e)
    }

    pub(crate) fn from_stream_error(e: io::Error) -> Self {
        Error::BrokenTransportRecv(Some(e))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::QueueClosed => f.pad("task queue is closed"),
            Error::QueueFull => f.pad("task queue is full"),
            Error::ConnectionReset => f.pad("connection reset while request was in flight"),
            Error::ConnectionClosed => f.pad("connection closed before response was received"),
            Error::BrokenTransportSend(_) => f.pad("underlying transport failed to send a request"),
            Error::BrokenTransportRecv(Some(_)) => {
                f.pad("underlying transport failed while attempting to receive a response")
            }
            Error::BrokenTransportRecv(None) => f.pad("transport closed with in-flight requests"),
            Error::Cancelled => f.pad("request was cancelled"),
            Error::UpgradeUnsupported => f.pad("protocol upgrade is not supported"),
            Error::Desynchronized => f.pad("server sent a response the client did not expect"),
            Error::Codec(ref e) => write!(f, "codec error: {}", e),
            Error::Connect(ref e) => write!(f, "failed to connect: {}", e),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::QueueClosed => f.pad("QueueClosed"),
            Error::QueueFull => f.pad("QueueFull"),
            Error::ConnectionReset => f.pad("ConnectionReset"),
            Error::ConnectionClosed => f.pad("ConnectionClosed"),
            Error::BrokenTransportSend(ref se) => write!(f, "BrokenTransportSend({:?})", se),
            Error::BrokenTransportRecv(Some(ref se)) => write!(f, "BrokenTransportRecv({:?})", se),
            Error::BrokenTransportRecv(None) => f.pad("BrokenTransportRecv"),
            Error::Cancelled => f.pad("Cancelled"),
            Error::UpgradeUnsupported => f.pad("UpgradeUnsupported"),
            Error::Desynchronized => f.pad("Desynchronized"),
            Error::Codec(ref e) => write!(f, "Codec({:?})", e),
            Error::Connect(ref e) => write!(f, "Connect({:?})", e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::BrokenTransportSend(ref se) => Some(se),
            Error::BrokenTransportRecv(Some(ref se)) => Some(se),
            Error::Codec(ref e) | Error::Connect(ref e) => Some(e),
            _ => None,
        }
    }
}
