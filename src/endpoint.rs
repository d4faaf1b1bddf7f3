//! A set of pipelines to one server, fed from a single queue.

use crate::codec::Codec;
use crate::connection::{Connection, ConnectionId, Dialer, Release};
use crate::pipeline::{self, KeepAliveState, NoUpgrade, Pipeline, PipelineHandle};
use crate::queue::{Overflow, TaskQueue};
use crate::task::{RequestTask, ResponseHandle};
use crate::upgrade::Upgrade;
use crate::Error;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Notify;
use tower_service::Service;

/// Settings for an [`Endpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The maximum number of connections open (or being opened) at once.
    pub max_connections: usize,
    /// How many requests may wait for a connection.
    pub queue_capacity: usize,
    /// What to do with new requests when the queue is full.
    pub overflow: Overflow,
    /// How many times to try dialing before giving up. Must be at least 1.
    pub connect_attempts: usize,
    /// How long to wait between dial attempts.
    pub connect_retry_delay: Duration,
    /// How long a single dial attempt may take.
    pub connect_timeout: Option<Duration>,
    /// Settings for each connection's pipeline.
    pub pipeline: pipeline::Config,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_connections: 100,
            queue_capacity: 1024,
            overflow: Overflow::Wait,
            connect_attempts: 1,
            connect_retry_delay: Duration::from_millis(100),
            connect_timeout: Some(Duration::from_secs(5)),
            pipeline: pipeline::Config::default(),
        }
    }
}

/// A snapshot of an endpoint's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Connections successfully established so far.
    pub connections_opened: usize,
    /// Connections closed so far, for any reason.
    pub connections_closed: usize,
    /// Connections currently open or being dialed.
    pub live_connections: usize,
    /// Requests written and awaiting a response, across all connections.
    pub in_flight: usize,
    /// Requests waiting for a connection.
    pub queued: usize,
}

#[derive(Default)]
struct Conns {
    handles: HashMap<ConnectionId, PipelineHandle>,
    dialing: usize,
}

/// The type-erased part of an endpoint that knows how to open connections.
trait Dispatch: Send + Sync {
    fn ensure_connection(self: Arc<Self>);
    fn conns(&self) -> MutexGuard<'_, Conns>;
    fn counters(&self) -> &Counters;
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    idle: Notify,
}

struct Inner<D, Req, C, U>
where
    D: Dialer,
    C: Codec<Req>,
{
    dialer: D,
    queue: TaskQueue<Req, C::Response>,
    codec: Mutex<C>,
    upgrade: Option<Mutex<U>>,
    config: Config,
    conns: Mutex<Conns>,
    counters: Counters,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<D, Req, C, U> Inner<D, Req, C, U>
where
    D: Dialer,
    Req: Send + 'static,
    C: Codec<Req> + Clone + Send + 'static,
    C::Response: Send + 'static,
    U: Upgrade<D::Io, C::Response> + Clone + Send + 'static,
{
    async fn dial(&self) -> io::Result<Connection<D::Io>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let dial = self.dialer.dial();
            let result = match self.config.connect_timeout {
                Some(t) => match tokio::time::timeout(t, dial).await {
                    Ok(r) => r,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
                },
                None => dial.await,
            };

            match result {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < self.config.connect_attempts => {
                    tracing::debug!(attempt, error = %e, "dial failed; retrying");
                    tokio::time::sleep(self.config.connect_retry_delay).await;
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "dial failed; giving up");
                    return Err(e);
                }
            }
        }
    }

    async fn run_connection(self: Arc<Self>) {
        let conn = match self.dial().await {
            Ok(conn) => conn,
            Err(e) => return self.dial_failed(e).await,
        };

        let id = conn.id();
        let codec = lock(&self.codec).clone();
        let upgrade = self.upgrade.as_ref().map(|u| lock(u).clone());
        let pipeline = Pipeline::new_internal(
            conn,
            self.queue.clone(),
            codec,
            upgrade,
            self.config.pipeline.clone(),
        );

        {
            let mut conns = self.conns();
            conns.dialing -= 1;
            conns.handles.insert(id, pipeline.handle());
        }
        self.counters.opened.fetch_add(1, Ordering::Relaxed);

        let reason = match pipeline.await {
            Ok(exit) => Release::Closed(exit),
            Err(e) => Release::Broken(e),
        };
        tracing::debug!(%id, ?reason, "pipeline exited");

        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        self.conns().handles.remove(&id);
        self.dialer.release(id, &reason);
        self.counters.idle.notify_waiters();

        // tasks may have been resubmitted, or queued while we were closing
        self.ensure_connection();
    }

    async fn dial_failed(self: Arc<Self>, e: io::Error) {
        let orphaned = {
            let conns = self.conns();
            conns.handles.is_empty() && conns.dialing == 1
        };

        if orphaned {
            // nothing else can serve what's queued
            let backlog = self.queue.drain();
            tracing::debug!(failed = backlog.len(), error = %e, "no connection to the server");
            for task in backlog {
                task.fail(Error::Connect(io::Error::new(e.kind(), e.to_string())));
            }
            self.conns().dialing -= 1;
            self.counters.idle.notify_waiters();
            // only requests queued after the drain are left; they get a fresh attempt
            self.ensure_connection();
            return;
        }

        // the slot stays taken until the retry delay is up
        tokio::time::sleep(self.config.connect_retry_delay).await;
        self.conns().dialing -= 1;
        self.counters.idle.notify_waiters();
        self.ensure_connection();
    }
}

impl<D, Req, C, U> Dispatch for Inner<D, Req, C, U>
where
    D: Dialer,
    Req: Send + 'static,
    C: Codec<Req> + Clone + Send + 'static,
    C::Response: Send + 'static,
    U: Upgrade<D::Io, C::Response> + Clone + Send + 'static,
{
    fn ensure_connection(self: Arc<Self>) {
        let backlog = self.queue.live_len();
        if backlog == 0 {
            return;
        }

        let per = self.config.pipeline.pipeline_max_size;
        let mut conns = self.conns();
        let mut spare: usize = conns
            .handles
            .values()
            .filter(|h| matches!(h.keep_alive(), KeepAliveState::Armed | KeepAliveState::Active))
            .map(|h| per.saturating_sub(h.in_flight()))
            .sum::<usize>()
            + conns.dialing * per;

        while backlog > spare && conns.handles.len() + conns.dialing < self.config.max_connections {
            conns.dialing += 1;
            spare += per;
            tracing::trace!(backlog, dialing = conns.dialing, "opening another connection");
            tokio::spawn(self.clone().run_connection());
        }
    }

    fn conns(&self) -> MutexGuard<'_, Conns> {
        lock(&self.conns)
    }

    fn counters(&self) -> &Counters {
        &self.counters
    }
}

/// Builder for [`Endpoint`].
pub struct Builder<D, Req, C, U> {
    dialer: D,
    codec: C,
    upgrade: Option<U>,
    config: Config,
    _pd: PhantomData<fn(Req)>,
}

impl<D, Req, C, U> fmt::Debug for Builder<D, Req, C, U>
where
    D: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("dialer", &self.dialer)
            .field("config", &self.config)
            .finish()
    }
}

impl<D, Req, C, U> Builder<D, Req, C, U>
where
    D: Dialer,
    Req: Send + 'static,
    C: Codec<Req> + Clone + Send + 'static,
    C::Response: Send + 'static,
    U: Upgrade<D::Io, C::Response> + Clone + Send + 'static,
{
    /// Replace all settings at once.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.max_connections = n;
        self
    }

    /// Set how many requests may wait for a connection, and what happens beyond that.
    pub fn queue(mut self, capacity: usize, overflow: Overflow) -> Self {
        self.config.queue_capacity = capacity;
        self.config.overflow = overflow;
        self
    }

    /// Set how many times, and how far apart, dialing is attempted.
    pub fn connect_attempts(mut self, attempts: usize, retry_delay: Duration) -> Self {
        self.config.connect_attempts = attempts;
        self.config.connect_retry_delay = retry_delay;
        self
    }

    /// Set how long a single dial attempt may take. `None` waits indefinitely.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the settings used for each connection's pipeline.
    pub fn pipeline(mut self, config: pipeline::Config) -> Self {
        self.config.pipeline = config;
        self
    }

    /// Set the handler that takes over connections whose server switches protocols.
    pub fn upgrade<U2>(self, upgrade: U2) -> Builder<D, Req, C, U2>
    where
        U2: Upgrade<D::Io, C::Response> + Clone + Send + 'static,
    {
        Builder {
            dialer: self.dialer,
            codec: self.codec,
            upgrade: Some(upgrade),
            config: self.config,
            _pd: PhantomData,
        }
    }

    /// Build the endpoint. Connections are dialed lazily, as requests arrive.
    ///
    /// # Panics
    ///
    /// Panics if any of the limits is zero. Must be called from within a Tokio runtime before
    /// requests are sent.
    pub fn build(self) -> Endpoint<Req, C::Response> {
        assert!(self.config.max_connections >= 1, "max_connections must be at least 1");
        assert!(self.config.connect_attempts >= 1, "connect_attempts must be at least 1");
        self.config.pipeline.validate();

        let queue = TaskQueue::new(self.config.queue_capacity, self.config.overflow);
        let inner = Arc::new(Inner {
            dialer: self.dialer,
            queue: queue.clone(),
            codec: Mutex::new(self.codec),
            upgrade: self.upgrade.map(Mutex::new),
            config: self.config,
            conns: Mutex::new(Conns::default()),
            counters: Counters::default(),
        });

        Endpoint { queue, inner }
    }
}

/// Sends requests to one server over a bounded set of pipelined connections.
///
/// Requests wait in a shared [`TaskQueue`]; whichever connection has room picks them up. New
/// connections are dialed only when the queued requests exceed the free pipeline slots of the
/// connections already open, and connections close themselves once idle, so the number of
/// connections follows the load.
pub struct Endpoint<Req, Res> {
    queue: TaskQueue<Req, Res>,
    inner: Arc<dyn Dispatch>,
}

impl<Req, Res> Clone for Endpoint<Req, Res> {
    fn clone(&self) -> Self {
        Endpoint {
            queue: self.queue.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<Req, Res> fmt::Debug for Endpoint<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("queue", &self.queue)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<Req, Res> Endpoint<Req, Res> {
    /// Create a new builder with the provided dialer and codec.
    pub fn builder<D, C>(dialer: D, codec: C) -> Builder<D, Req, C, NoUpgrade<D::Io, Res>>
    where
        D: Dialer,
        C: Codec<Req, Response = Res>,
    {
        Builder {
            dialer,
            codec,
            upgrade: None,
            config: Config::default(),
            _pd: PhantomData,
        }
    }

    /// Queue `req` and return a handle to its eventual response.
    pub async fn execute(&self, req: Req) -> Result<ResponseHandle<Res>, Error> {
        let (task, handle) = RequestTask::new(req);
        tracing::trace!("issuing request");
        self.queue.enqueue(task).await?;
        self.inner.clone().ensure_connection();
        Ok(handle)
    }

    /// Queue `req` and wait for its response.
    pub async fn send(&self, req: Req) -> Result<Res, Error> {
        self.execute(req).await?.await
    }

    /// The queue requests wait in.
    pub fn queue(&self) -> &TaskQueue<Req, Res> {
        &self.queue
    }

    /// Stop accepting requests. Queued and in-flight requests still complete.
    pub fn close(&self) {
        self.queue.close();
        // make sure someone is around to drain what's left
        self.inner.clone().ensure_connection();
    }

    /// Wait until every connection has closed.
    pub async fn closed(&self) {
        loop {
            let idle = self.inner.counters().idle.notified();
            {
                let conns = self.inner.conns();
                if conns.handles.is_empty() && conns.dialing == 0 {
                    return;
                }
            }
            idle.await;
        }
    }

    /// The endpoint's current counters.
    pub fn stats(&self) -> Stats {
        let conns = self.inner.conns();
        let counters = self.inner.counters();
        Stats {
            connections_opened: counters.opened.load(Ordering::Relaxed),
            connections_closed: counters.closed.load(Ordering::Relaxed),
            live_connections: conns.handles.len() + conns.dialing,
            in_flight: conns.handles.values().map(PipelineHandle::in_flight).sum(),
            queued: self.queue.len(),
        }
    }
}

impl<Req, Res> Service<Req> for Endpoint<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    type Response = Res;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Res, Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        if self.queue.is_closed() {
            return Poll::Ready(Err(Error::QueueClosed));
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.send(req).await })
    }
}

impl<Req, Res> tower::load::Load for Endpoint<Req, Res> {
    type Metric = usize;

    fn load(&self) -> usize {
        let stats = self.stats();
        stats.queued + stats.in_flight
    }
}
