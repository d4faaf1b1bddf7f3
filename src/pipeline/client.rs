use super::config::{Builder, Config, NoUpgrade};
use super::correlator::Correlator;
use super::keep_alive::{KeepAlive, KeepAliveState};
use crate::codec::{Codec, RequestTarget};
use crate::connection::{Connection, ConnectionId};
use crate::queue::TaskQueue;
use crate::task::RequestTask;
use crate::upgrade::{Upgrade, Upgraded};
use crate::Error;
use bytes::{Buf, BytesMut};
use crossbeam::atomic::AtomicCell;
use futures_util::task::AtomicWaker;
use pin_project::pin_project;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const READ_CHUNK: usize = 8 * 1024;

/// Why a [`Pipeline`] stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The task queue was closed and every task taken from it was answered.
    Drained,
    /// The connection sat idle for the keep-alive duration.
    IdleTimeout,
    /// [`PipelineHandle::shutdown`] was called and in-flight requests finished.
    Shutdown,
    /// The connection was handed to an upgrade handler.
    Upgraded,
    /// The server closed the connection while nothing was in flight.
    ClosedByPeer,
}

/// State shared between a pipeline and its handles.
struct Control {
    id: ConnectionId,
    shutdown: AtomicBool,
    waker: AtomicWaker,
    in_flight: Arc<AtomicUsize>,
    keep_alive: Arc<AtomicCell<KeepAliveState>>,
}

/// A handle for observing and stopping a running [`Pipeline`].
#[derive(Clone)]
pub struct PipelineHandle {
    control: Arc<Control>,
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("id", &self.control.id)
            .field("in_flight", &self.in_flight())
            .field("keep_alive", &self.keep_alive())
            .finish()
    }
}

impl PipelineHandle {
    /// The connection this pipeline drives.
    pub fn id(&self) -> ConnectionId {
        self.control.id
    }

    /// The number of requests written whose responses have not been read yet.
    pub fn in_flight(&self) -> usize {
        self.control.in_flight.load(Ordering::Acquire)
    }

    /// The state of the pipeline's keep-alive timer.
    pub fn keep_alive(&self) -> KeepAliveState {
        self.control.keep_alive.load()
    }

    /// Stop taking new tasks, finish the ones in flight, then close the connection.
    pub fn shutdown(&self) {
        self.control.shutdown.store(true, Ordering::Release);
        self.control.waker.wake();
    }
}

/// Drives one connection through repeated, possibly overlapping, request/response cycles.
///
/// A pipeline is a future; spawn it onto a runtime and it will pull tasks from its
/// [`TaskQueue`] until the queue is closed, the connection idles out, the connection breaks, or
/// the connection is upgraded to another protocol.
///
/// However it ends, every task the pipeline took from the queue is accounted for: tasks that were
/// written are failed with [`Error::ConnectionReset`] or [`Error::ConnectionClosed`] if their
/// response never arrived, and tasks that were taken but never written are put back at the front
/// of the queue for another connection to pick up.
#[pin_project(project = PipelineProj)]
pub struct Pipeline<IO, Req, C, U>
where
    C: Codec<Req>,
{
    io: Option<IO>,
    queue: TaskQueue<Req, C::Response>,
    codec: C,
    upgrade: Option<U>,
    config: Config,

    write_buf: BytesMut,
    read_buf: BytesMut,
    needs_flush: bool,

    // taken from the queue, but the write buffer was still busy
    staged: Option<RequestTask<Req, C::Response>>,
    correlator: Correlator<C::Response>,
    #[pin]
    keep_alive: KeepAlive,
    control: Arc<Control>,

    // an upgrade request is in flight; nothing else may be written behind it
    barrier: bool,
    // no more tasks will be taken from the queue
    finish: Option<Exit>,
    span: tracing::Span,
}

impl<IO, Req, C, U> fmt::Debug for Pipeline<IO, Req, C, U>
where
    C: Codec<Req>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.control.id)
            .field("config", &self.config)
            .field("correlator", &self.correlator)
            .field("staged", &self.staged.is_some())
            .field("finish", &self.finish)
            .finish()
    }
}

impl<IO, Req, C> Pipeline<IO, Req, C, NoUpgrade<IO, C::Response>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    C: Codec<Req>,
{
    /// Construct a new [`Pipeline`] over `conn` with the default [`Config`] and no upgrade
    /// support.
    pub fn new(conn: Connection<IO>, queue: TaskQueue<Req, C::Response>, codec: C) -> Self {
        Self::builder(conn, queue, codec).build()
    }

    /// Create a new builder with the provided connection, queue and codec.
    pub fn builder(
        conn: Connection<IO>,
        queue: TaskQueue<Req, C::Response>,
        codec: C,
    ) -> Builder<IO, Req, C, NoUpgrade<IO, C::Response>> {
        Builder::new(conn, queue, codec)
    }
}

impl<IO, Req, C, U> Pipeline<IO, Req, C, U>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    C: Codec<Req>,
    U: Upgrade<IO, C::Response>,
{
    pub(crate) fn new_internal(
        conn: Connection<IO>,
        queue: TaskQueue<Req, C::Response>,
        codec: C,
        upgrade: Option<U>,
        config: Config,
    ) -> Self {
        config.validate();

        let id = conn.id();
        let span = tracing::debug_span!("pipeline", %id, peer = ?conn.peer());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let keep_alive = Arc::new(AtomicCell::new(KeepAliveState::Armed));
        let control = Arc::new(Control {
            id,
            shutdown: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            in_flight: in_flight.clone(),
            keep_alive: keep_alive.clone(),
        });

        Pipeline {
            io: Some(conn.into_inner()),
            queue,
            codec,
            upgrade,
            write_buf: BytesMut::new(),
            read_buf: BytesMut::new(),
            needs_flush: false,
            staged: None,
            correlator: Correlator::new(config.pipeline_max_size, in_flight),
            keep_alive: KeepAlive::new(config.keep_alive, keep_alive),
            control,
            config,
            barrier: false,
            finish: None,
            span,
        }
    }
}

impl<IO, Req, C, U> Pipeline<IO, Req, C, U>
where
    C: Codec<Req>,
{
    /// A handle for observing and stopping this pipeline once it has been spawned.
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            control: self.control.clone(),
        }
    }

    /// The connection this pipeline drives.
    pub fn id(&self) -> ConnectionId {
        self.control.id
    }
}

/// What the read side found, other than more responses.
enum Event<Res> {
    Eof,
    Upgrade(Res),
}

impl<'a, IO, Req, C, U> PipelineProj<'a, IO, Req, C, U>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    C: Codec<Req>,
    U: Upgrade<IO, C::Response>,
{
    fn io(&mut self) -> Pin<&mut IO> {
        Pin::new(
            self.io
                .as_mut()
                .expect("BUG: connection used after it was closed"),
        )
    }

    /// Number of tasks this pipeline holds: written ones plus the staged one.
    fn held(&self) -> usize {
        self.correlator.len() + self.staged.is_some() as usize
    }

    /// Serialize a task into the write buffer and start waiting for its response.
    fn start(&mut self, task: RequestTask<Req, C::Response>) {
        let _guard = task.span.enter();
        if !task.slot.mark_written() {
            tracing::trace!("request cancelled before it was written; dropping");
            return;
        }

        let target = RequestTarget::for_proxy(self.config.over_proxy);
        let mark = self.write_buf.len();
        if let Err(e) = self.codec.encode(&task.req, target, self.write_buf) {
            tracing::debug!(error = %e, "failed to encode request");
            self.write_buf.truncate(mark);
            drop(_guard);
            task.fail(Error::Codec(e));
            return;
        }

        if self.codec.is_upgrade_request(&task.req) {
            tracing::trace!("upgrade request; holding back later requests");
            *self.barrier = true;
        }
        tracing::trace!(bytes = self.write_buf.len() - mark, "request sent");
        drop(_guard);
        self.correlator.push(task);
    }

    /// Move bytes from the write buffer to the connection, and new tasks into the write buffer.
    fn poll_send(&mut self, cx: &mut Context<'_>, progress: &mut bool) -> Result<(), Error> {
        let mut dequeued = 0;
        loop {
            while !self.write_buf.is_empty() {
                let io = self
                    .io
                    .as_mut()
                    .expect("BUG: connection used after it was closed");
                let n = match Pin::new(io).poll_write(cx, &self.write_buf[..]) {
                    Poll::Ready(Ok(0)) => {
                        return Err(Error::from_sink_error(io::ErrorKind::WriteZero.into()))
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Err(Error::from_sink_error(e)),
                    Poll::Pending => break,
                };
                self.write_buf.advance(n);
                *self.needs_flush = true;
                *progress = true;
            }

            if self.write_buf.is_empty() {
                if let Some(task) = self.staged.take() {
                    self.start(task);
                    continue;
                }
            } else if self.staged.is_some() {
                break;
            }

            if self.finish.is_some()
                || *self.barrier
                || self.held() >= self.config.pipeline_max_size
            {
                break;
            }

            match self.queue.poll_dequeue(cx) {
                Poll::Ready(Some(task)) => {
                    self.keep_alive.as_mut().touch();
                    *progress = true;
                    if self.write_buf.is_empty() {
                        self.start(task);
                    } else {
                        *self.staged = Some(task);
                    }

                    // if we have run for a while without yielding, yield so we can make progress
                    dequeued += 1;
                    if dequeued == crate::YIELD_EVERY {
                        // we're forcing a yield, so need to ensure we get woken up again
                        cx.waker().wake_by_ref();
                        break;
                    }
                }
                Poll::Ready(None) => {
                    tracing::debug!("task queue closed and drained; finishing");
                    *self.finish = Some(Exit::Drained);
                    break;
                }
                Poll::Pending => break,
            }
        }

        if *self.needs_flush {
            // don't return on Pending since we have to check for responses too
            match self.io().poll_flush(cx) {
                Poll::Ready(Ok(())) => *self.needs_flush = false,
                Poll::Ready(Err(e)) => return Err(Error::from_sink_error(e)),
                Poll::Pending => {}
            }
        }

        Ok(())
    }

    /// Read and correlate as many responses as are available.
    fn poll_recv(
        &mut self,
        cx: &mut Context<'_>,
        progress: &mut bool,
    ) -> Result<Option<Event<C::Response>>, Error> {
        loop {
            while !self.read_buf.is_empty() {
                let response = match self.codec.decode(self.read_buf) {
                    Ok(Some(r)) => r,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "failed to parse response");
                        return Err(Error::Codec(e));
                    }
                };
                *progress = true;
                self.keep_alive.as_mut().touch();

                if self.codec.is_upgrade(&response) {
                    return Ok(Some(Event::Upgrade(response)));
                }

                self.correlator.complete(response)?;
                if self.correlator.is_empty() {
                    *self.barrier = false;
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut buf = ReadBuf::new(&mut chunk);
            match self.io().poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) if buf.filled().is_empty() => return Ok(Some(Event::Eof)),
                Poll::Ready(Ok(())) => {
                    self.read_buf.extend_from_slice(buf.filled());
                    *progress = true;
                }
                Poll::Ready(Err(e)) => return Err(Error::from_stream_error(e)),
                Poll::Pending => return Ok(None),
            }
        }
    }

    /// Tear everything down after a failure.
    ///
    /// Written tasks are failed with `task_error`, the staged task goes back to the queue, and
    /// the connection is dropped without a graceful shutdown.
    fn abort<F>(&mut self, error: Error, task_error: F) -> Error
    where
        F: FnMut() -> Error,
    {
        tracing::debug!(%error, in_flight = self.correlator.len(), "pipeline failed");
        self.correlator.fail_all(task_error);
        self.resubmit_staged();
        self.close();
        error
    }

    fn resubmit_staged(&mut self) {
        if let Some(task) = self.staged.take() {
            tracing::trace!(parent: &task.span, "request never written; resubmitting");
            self.queue.resubmit(task);
        }
    }

    fn close(&mut self) {
        if self.io.take().is_some() {
            tracing::trace!("connection closed");
        }
        self.keep_alive.closed();
    }

    fn upgrade(&mut self, response: C::Response) -> Result<Exit, Error> {
        let head = match self.correlator.pop() {
            Some(head) => head,
            None => return Err(self.abort(Error::Desynchronized, || Error::ConnectionClosed)),
        };

        // anything written after the upgrade request will never see a response
        self.correlator.fail_all(|| Error::ConnectionClosed);
        self.resubmit_staged();

        let handler = match self.upgrade.as_mut() {
            Some(handler) => handler,
            None => {
                tracing::debug!(parent: head.span(), "server switched protocols; no upgrade handler");
                head.complete(Err(Error::UpgradeUnsupported));
                self.close();
                return Err(Error::UpgradeUnsupported);
            }
        };

        let io = self
            .io
            .take()
            .expect("BUG: connection used after it was closed");
        let rest = self.read_buf.split().freeze();
        let upgraded = Upgraded::new(io, rest, self.control.id);
        tracing::debug!(parent: head.span(), "server switched protocols; handing off connection");
        let response = handler.upgrade(response, upgraded);
        head.complete(Ok(response));
        self.close();
        Ok(Exit::Upgraded)
    }

    fn poll_pipeline(&mut self, cx: &mut Context<'_>) -> Poll<Result<Exit, Error>> {
        let mut rounds = 0;
        loop {
            let mut progress = false;

            if self.finish.is_none() && self.control.shutdown.load(Ordering::Acquire) {
                tracing::debug!("shutdown requested; finishing");
                *self.finish = Some(Exit::Shutdown);
                self.resubmit_staged();
            }

            if let Err(e) = self.poll_send(cx, &mut progress) {
                return Poll::Ready(Err(self.abort(e, || Error::ConnectionReset)));
            }

            match self.poll_recv(cx, &mut progress) {
                Ok(None) => {}
                Ok(Some(Event::Upgrade(response))) => return Poll::Ready(self.upgrade(response)),
                Ok(Some(Event::Eof)) => {
                    if !self.correlator.is_empty() {
                        // the connection closed while we were waiting for a response!
                        let e = Error::BrokenTransportRecv(None);
                        return Poll::Ready(Err(self.abort(e, || Error::ConnectionClosed)));
                    }
                    tracing::debug!("server closed idle connection");
                    self.resubmit_staged();
                    self.close();
                    return Poll::Ready(Ok(Exit::ClosedByPeer));
                }
                Err(e) => return Poll::Ready(Err(self.abort(e, || Error::ConnectionClosed))),
            }

            if progress {
                rounds += 1;
                if rounds == crate::YIELD_EVERY {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                continue;
            }

            let held = self.held();
            if self.finish.is_none() && self.keep_alive.as_mut().poll_expired(cx, held).is_ready() {
                *self.finish = Some(Exit::IdleTimeout);
            }

            if let Some(exit) = *self.finish {
                if self.held() == 0 && self.write_buf.is_empty() {
                    // we're completely done once shutdown finishes!
                    if let Poll::Ready(r) = self.io().poll_shutdown(cx) {
                        if let Err(e) = r {
                            tracing::trace!(error = %e, "error shutting down connection");
                        }
                        self.close();
                        tracing::debug!(?exit, "pipeline finished");
                        return Poll::Ready(Ok(exit));
                    }
                }
            }

            // to get here, every source of work has returned Pending and registered us for a
            // wakeup, so the right thing for us to do is return Pending too!
            return Poll::Pending;
        }
    }
}

impl<IO, Req, C, U> Future for Pipeline<IO, Req, C, U>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    C: Codec<Req>,
    U: Upgrade<IO, C::Response>,
{
    type Output = Result<Exit, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        if this.io.is_none() {
            unreachable!("poll called after pipeline finished");
        }

        let span = this.span.clone();
        let _enter = span.enter();
        this.control.waker.register(cx.waker());
        this.poll_pipeline(cx)
    }
}
