use crate::task::{RequestTask, ResponseSlot};
use crate::Error;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{atomic, Arc};

/// A request that has been written and is waiting for its response.
///
/// # Drop
///
/// On `drop` this type decrements the pipeline's in-flight count. Dropping it without completing
/// it resolves the caller's handle as [`Error::Cancelled`].
pub(crate) struct InFlight<Res> {
    slot: ResponseSlot<Res>,
    span: tracing::Span,
    in_flight: Option<Arc<atomic::AtomicUsize>>,
}

impl<Res> fmt::Debug for InFlight<Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight").field("span", &self.span).finish()
    }
}

impl<Res> InFlight<Res> {
    fn release(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.fetch_sub(1, atomic::Ordering::AcqRel);
        }
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Deliver `result`, freeing this request's pipeline slot first.
    pub(crate) fn complete(mut self, result: Result<Res, Error>) {
        self.release();
        if self.slot.is_cancelled() {
            tracing::trace!(parent: &self.span, "response arrived for cancelled request; discarding");
        } else {
            tracing::trace!(parent: &self.span, ok = result.is_ok(), "response arrived; forwarding");
        }
        self.slot.complete(result);
    }
}

impl<Res> Drop for InFlight<Res> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Matches responses to requests by write order.
///
/// The n-th response read off a connection belongs to the n-th request written to it, so this is
/// just a FIFO of the requests that are still waiting.
pub(crate) struct Correlator<Res> {
    pending: VecDeque<InFlight<Res>>,
    in_flight: Arc<atomic::AtomicUsize>,
}

impl<Res> fmt::Debug for Correlator<Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending)
            .finish()
    }
}

impl<Res> Correlator<Res> {
    pub(crate) fn new(capacity: usize, in_flight: Arc<atomic::AtomicUsize>) -> Self {
        Correlator {
            pending: VecDeque::with_capacity(capacity),
            in_flight,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Start waiting for the response to a request that was just written.
    pub(crate) fn push<Req>(&mut self, task: RequestTask<Req, Res>) {
        let RequestTask { req, span, slot } = task;
        drop(req);
        self.in_flight.fetch_add(1, atomic::Ordering::AcqRel);
        self.pending.push_back(InFlight {
            slot,
            span,
            in_flight: Some(self.in_flight.clone()),
        });
    }

    /// Remove the oldest waiting request.
    pub(crate) fn pop(&mut self) -> Option<InFlight<Res>> {
        self.pending.pop_front()
    }

    /// Hand a freshly read response to the oldest waiting request.
    pub(crate) fn complete(&mut self, response: Res) -> Result<(), Error> {
        let head = self.pop().ok_or(Error::Desynchronized)?;
        head.complete(Ok(response));
        Ok(())
    }

    /// Fail every waiting request, oldest first.
    pub(crate) fn fail_all<F>(&mut self, mut error: F)
    where
        F: FnMut() -> Error,
    {
        let n = self.pending.len();
        if n != 0 {
            tracing::debug!(requests = n, "failing in-flight requests");
        }
        while let Some(p) = self.pending.pop_front() {
            p.complete(Err(error()));
        }
    }
}
