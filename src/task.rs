//! Request tasks and the single-assignment slots their responses are delivered through.

use crate::Error;
use crossbeam::atomic::AtomicCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Where a [`RequestTask`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created or sitting in a queue; nothing has been written yet.
    Queued,
    /// The request has been handed to a connection and awaits its response.
    Written,
    /// The response slot has been filled.
    Completed,
    /// The caller gave up on the response.
    Cancelled,
}

/// An outgoing request together with the slot its response is delivered through.
///
/// Tasks are created with [`RequestTask::new`], which also returns the caller's
/// [`ResponseHandle`]. Whichever pipeline dequeues the task becomes responsible for completing
/// it.
pub struct RequestTask<Req, Res> {
    pub(crate) req: Req,
    pub(crate) span: tracing::Span,
    pub(crate) slot: ResponseSlot<Res>,
}

impl<Req, Res> fmt::Debug for RequestTask<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTask")
            .field("state", &self.slot.state())
            .field("span", &self.span)
            .finish()
    }
}

impl<Req, Res> RequestTask<Req, Res> {
    /// Wrap `req` into a task, capturing the current span.
    pub fn new(req: Req) -> (Self, ResponseHandle<Res>) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(AtomicCell::new(TaskState::Queued));
        let task = RequestTask {
            req,
            span: tracing::Span::current(),
            slot: ResponseSlot {
                tx: Some(tx),
                state: state.clone(),
            },
        };
        (task, ResponseHandle { rx, state })
    }

    /// The request this task carries.
    pub fn request(&self) -> &Req {
        &self.req
    }

    /// Returns true if the caller no longer wants the response.
    pub fn is_cancelled(&self) -> bool {
        self.slot.is_cancelled()
    }

    /// Fail the task without it ever reaching a connection.
    pub fn fail(mut self, e: Error) {
        self.slot.complete(Err(e));
    }
}

/// The write side of a task's response promise.
///
/// A slot may be completed at most once.
pub(crate) struct ResponseSlot<Res> {
    tx: Option<oneshot::Sender<Result<Res, Error>>>,
    state: Arc<AtomicCell<TaskState>>,
}

impl<Res> ResponseSlot<Res> {
    pub(crate) fn state(&self) -> TaskState {
        self.state.load()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        match self.tx {
            Some(ref tx) => tx.is_closed() || self.state.load() == TaskState::Cancelled,
            None => false,
        }
    }

    /// Record that the request is on the wire.
    ///
    /// Returns false if the caller cancelled in the meantime.
    pub(crate) fn mark_written(&self) -> bool {
        self.state
            .compare_exchange(TaskState::Queued, TaskState::Written)
            .is_ok()
    }

    /// Fill the slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot was already completed.
    pub(crate) fn complete(&mut self, result: Result<Res, Error>) {
        let tx = self
            .tx
            .take()
            .expect("BUG: response slot completed more than once");

        // a cancelled task stays cancelled; the result below is simply dropped
        let _ = self
            .state
            .compare_exchange(TaskState::Written, TaskState::Completed);
        let _ = self
            .state
            .compare_exchange(TaskState::Queued, TaskState::Completed);

        // ignore send failures
        // the caller may just no longer care about the response
        let _ = tx.send(result);
    }
}

/// The caller's side of a [`RequestTask`].
///
/// Resolves to the response once the task's pipeline has read it off the wire.
#[must_use = "futures do nothing unless polled"]
pub struct ResponseHandle<Res> {
    rx: oneshot::Receiver<Result<Res, Error>>,
    state: Arc<AtomicCell<TaskState>>,
}

impl<Res> fmt::Debug for ResponseHandle<Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("state", &self.state.load())
            .finish()
    }
}

impl<Res> ResponseHandle<Res> {
    /// Give up on the response.
    ///
    /// A task that has not been written yet will never be written. A task that is already in
    /// flight still has its response consumed from the connection, but the result is discarded.
    ///
    /// Returns false if the response had already been delivered.
    pub fn cancel(&self) -> bool {
        loop {
            let current = self.state.load();
            match current {
                TaskState::Completed => return false,
                TaskState::Cancelled => return true,
                TaskState::Queued | TaskState::Written => {
                    if self
                        .state
                        .compare_exchange(current, TaskState::Cancelled)
                        .is_ok()
                    {
                        tracing::trace!(was = ?current, "request cancelled");
                        return true;
                    }
                }
            }
        }
    }

    /// Where the task currently is in its lifecycle.
    pub fn state(&self) -> TaskState {
        self.state.load()
    }
}

impl<Res> Future for ResponseHandle<Res> {
    type Output = Result<Res, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.load() == TaskState::Cancelled {
            return Poll::Ready(Err(Error::Cancelled));
        }

        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(r)) => Poll::Ready(r),
            // the pipeline dropped the task without completing it
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
