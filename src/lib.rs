//! This crate provides the connection machinery of a pipelined HTTP/1.x client on top of
//! [Tokio](https://tokio.rs).
//!
//! # Pipelining
//!
//! HTTP/1.1 lets a client write several requests on one connection before reading any of the
//! responses, as long as it reads the responses back in the order the requests were written.
//! Doing so hides a round trip per request, but it also means that a single broken connection
//! takes several requests down with it, and that one slow response holds up all the ones behind
//! it. This crate takes care of the bookkeeping: which request each response belongs to, how many
//! requests may be outstanding, what happens to each request when a connection dies, and when an
//! idle connection should be let go. See the [`pipeline`] module for details.
//!
//! # Codecs
//!
//! The crate does not speak HTTP on the wire itself. Serializing requests and parsing responses is
//! left to a [`Codec`](codec::Codec), so the same machinery works with any HTTP/1.x
//! implementation (or any other strictly in-order request/response protocol).
//!
//! # Moving parts
//!
//! Callers wrap requests into [`RequestTask`]s and put them on a [`TaskQueue`]. Each
//! [`Pipeline`](pipeline::Pipeline) owns one connection and pulls tasks from the queue. An
//! [`Endpoint`](endpoint::Endpoint) ties these together: it owns a queue, dials connections as
//! work arrives, and keeps a bounded number of pipelines running. Connections whose server
//! switches protocols are handed off through [`upgrade`], for instance to a
//! [`RawWebSocket`](ws::RawWebSocket).
#![deny(missing_docs)]

mod error;
pub use self::error::Error;

pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod pipeline;
pub mod queue;
pub mod task;
pub mod upgrade;
pub mod ws;

pub use self::queue::{Overflow, TaskQueue};
pub use self::task::{RequestTask, ResponseHandle, TaskState};

// how many units of work a pipeline does in one poll before yielding to the runtime
const YIELD_EVERY: usize = 24;
