//! In a pipelined protocol, the server responds to client requests in the order they were sent.
//! HTTP/1.1 is the classic example: a client may write several requests on one connection before
//! reading any responses, and the responses come back in request order.
//!
//! A [`Pipeline`] owns one connection. It pulls [`RequestTask`](crate::RequestTask)s from a
//! shared [`TaskQueue`](crate::TaskQueue), writes them, and completes each task once its response
//! has been read. At most `pipeline_max_size` tasks are in flight at once, and the connection is
//! closed once it has been idle for the configured keep-alive time.
//!
//! Note: pipelining with the max number of in-flight requests set to 1 implies that for each
//! request, the response must be received before sending another request on the same connection.

mod client;
mod config;
mod correlator;
mod keep_alive;

pub use self::client::{Exit, Pipeline, PipelineHandle};
pub use self::config::{Builder, Config, NoUpgrade};
pub use self::keep_alive::KeepAliveState;
