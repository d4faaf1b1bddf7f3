use super::Pipeline;
use crate::codec::Codec;
use crate::connection::Connection;
use crate::queue::TaskQueue;
use crate::upgrade::{Upgrade, Upgraded};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// The upgrade handler type of a pipeline that does not support protocol upgrades.
pub type NoUpgrade<IO, Res> = fn(Res, Upgraded<IO>) -> Res;

/// Settings for a single [`Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// How long a connection may sit with nothing in flight before it is closed.
    pub keep_alive: Duration,

    /// The maximum number of requests written to the connection whose responses have not yet
    /// been read. Must be at least 1.
    pub pipeline_max_size: usize,

    /// Whether the connection goes through a forward proxy, in which case request lines use the
    /// absolute form of the request target.
    pub over_proxy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            keep_alive: Duration::from_secs(5),
            pipeline_max_size: 20,
            over_proxy: false,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) {
        assert!(
            self.pipeline_max_size >= 1,
            "pipeline_max_size must be at least 1"
        );
    }
}

/// Builder for [`Pipeline`], used to configure keep-alive, pipelining depth and upgrade support.
///
/// # Defaults
///
/// By default a pipeline keeps idle connections for 5 seconds, allows 20 requests in flight,
/// talks to the origin directly, and fails upgrade responses with
/// [`Error::UpgradeUnsupported`](crate::Error::UpgradeUnsupported).
pub struct Builder<IO, Req, C, U>
where
    C: Codec<Req>,
{
    conn: Connection<IO>,
    queue: TaskQueue<Req, C::Response>,
    codec: C,
    upgrade: Option<U>,
    config: Config,
}

impl<IO, Req, C, U> fmt::Debug for Builder<IO, Req, C, U>
where
    C: Codec<Req>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("conn", &self.conn)
            .field("queue", &self.queue)
            .field("config", &self.config)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

impl<IO, Req, C> Builder<IO, Req, C, NoUpgrade<IO, C::Response>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    C: Codec<Req>,
{
    pub(crate) fn new(conn: Connection<IO>, queue: TaskQueue<Req, C::Response>, codec: C) -> Self {
        Builder {
            conn,
            queue,
            codec,
            upgrade: None,
            config: Config::default(),
        }
    }
}

impl<IO, Req, C, U> Builder<IO, Req, C, U>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    C: Codec<Req>,
    U: Upgrade<IO, C::Response>,
{
    /// Replace all settings at once.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set how long an idle connection is kept open.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Set the maximum number of requests in flight on the connection.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn pipeline_max_size(mut self, n: usize) -> Self {
        assert!(n >= 1, "pipeline_max_size must be at least 1");
        self.config.pipeline_max_size = n;
        self
    }

    /// Use absolute-form request targets, for talking through a forward proxy.
    pub fn over_proxy(mut self, over_proxy: bool) -> Self {
        self.config.over_proxy = over_proxy;
        self
    }

    /// Set the handler that takes over the connection when the server switches protocols.
    pub fn upgrade<U2>(self, upgrade: U2) -> Builder<IO, Req, C, U2>
    where
        U2: Upgrade<IO, C::Response>,
    {
        Builder {
            conn: self.conn,
            queue: self.queue,
            codec: self.codec,
            upgrade: Some(upgrade),
            config: self.config,
        }
    }

    /// Build a pipeline based on the configured items on the builder.
    pub fn build(self) -> Pipeline<IO, Req, C, U> {
        Pipeline::new_internal(self.conn, self.queue, self.codec, self.upgrade, self.config)
    }
}
