//! The queue that request tasks wait in until a pipeline picks them up.

use crate::task::RequestTask;
use crate::Error;
use futures_util::future::poll_fn;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

/// What [`TaskQueue::enqueue`] does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Wait until a pipeline makes room.
    Wait,
    /// Fail the request with [`Error::QueueFull`].
    Reject,
}

impl Default for Overflow {
    fn default() -> Self {
        Overflow::Wait
    }
}

struct State<Req, Res> {
    buf: VecDeque<RequestTask<Req, Res>>,
    closed: bool,
    rx_wakers: Vec<Waker>,
    tx_wakers: Vec<Waker>,
}

impl<Req, Res> Drop for State<Req, Res> {
    fn drop(&mut self) {
        for task in self.buf.drain(..) {
            task.fail(Error::QueueClosed);
        }
    }
}

struct Shared<Req, Res> {
    state: Mutex<State<Req, Res>>,
    capacity: usize,
    overflow: Overflow,
}

/// A bounded, multi-producer multi-consumer FIFO of [`RequestTask`]s.
///
/// Every task that goes in is handed to exactly one consumer, in order. Tasks cancelled while
/// queued are silently skipped. Closing the queue is terminal, but consumers still drain
/// whatever is left before they observe the close.
pub struct TaskQueue<Req, Res> {
    shared: Arc<Shared<Req, Res>>,
}

impl<Req, Res> Clone for TaskQueue<Req, Res> {
    fn clone(&self) -> Self {
        TaskQueue {
            shared: self.shared.clone(),
        }
    }
}

impl<Req, Res> fmt::Debug for TaskQueue<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TaskQueue")
            .field("len", &state.buf.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

fn register(wakers: &mut Vec<Waker>, waker: &Waker) {
    if !wakers.iter().any(|w| w.will_wake(waker)) {
        wakers.push(waker.clone());
    }
}

fn wake_all(wakers: Vec<Waker>) {
    for w in wakers {
        w.wake();
    }
}

impl<Req, Res> TaskQueue<Req, Res> {
    /// Construct a queue holding at most `capacity` tasks.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, overflow: Overflow) -> Self {
        assert!(capacity > 0, "task queue capacity must be at least 1");
        TaskQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buf: VecDeque::with_capacity(capacity),
                    closed: false,
                    rx_wakers: Vec::new(),
                    tx_wakers: Vec::new(),
                }),
                capacity,
                overflow,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<Req, Res>> {
        // a panic while holding the lock cannot leave the buffer half-updated
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The maximum number of tasks the queue holds.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// The number of tasks currently queued, including ones cancelled but not yet skipped.
    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    /// The number of queued tasks that have not been cancelled.
    pub fn live_len(&self) -> usize {
        self.lock().buf.iter().filter(|t| !t.is_cancelled()).count()
    }

    /// Take every live task currently queued, leaving the queue empty.
    pub fn drain(&self) -> Vec<RequestTask<Req, Res>> {
        let mut state = self.lock();
        let tasks = state.buf.drain(..).filter(|t| !t.is_cancelled()).collect();
        let wakers = std::mem::take(&mut state.tx_wakers);
        drop(state);
        wake_all(wakers);
        tasks
    }

    /// Returns true if no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.lock().buf.is_empty()
    }

    /// Returns true once [`close`](TaskQueue::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Add a task to the back of the queue.
    ///
    /// If the queue is full, this waits for room or fails with [`Error::QueueFull`], depending on
    /// the queue's [`Overflow`] policy. A task that is refused has its
    /// [`ResponseHandle`](crate::ResponseHandle) resolved with the same error.
    pub async fn enqueue(&self, task: RequestTask<Req, Res>) -> Result<(), Error> {
        let mut task = Some(task);
        poll_fn(|cx| self.poll_enqueue(Some(cx), &mut task)).await
    }

    /// Add a task to the back of the queue without waiting.
    pub fn try_enqueue(&self, task: RequestTask<Req, Res>) -> Result<(), Error> {
        let mut task = Some(task);
        match self.poll_enqueue(None, &mut task) {
            Poll::Ready(r) => r,
            Poll::Pending => unreachable!("enqueue without a context never waits"),
        }
    }

    fn poll_enqueue(
        &self,
        cx: Option<&mut Context<'_>>,
        task: &mut Option<RequestTask<Req, Res>>,
    ) -> Poll<Result<(), Error>> {
        let mut state = self.lock();

        if state.closed {
            if let Some(task) = task.take() {
                task.fail(Error::QueueClosed);
            }
            return Poll::Ready(Err(Error::QueueClosed));
        }

        if state.buf.len() >= self.shared.capacity {
            // cancelled tasks should not hold up live ones
            state.buf.retain(|t| !t.is_cancelled());
        }

        if state.buf.len() < self.shared.capacity {
            let task = task.take().expect("BUG: enqueue polled after completion");
            state.buf.push_back(task);
            let wakers = std::mem::take(&mut state.rx_wakers);
            drop(state);
            wake_all(wakers);
            return Poll::Ready(Ok(()));
        }

        match (self.shared.overflow, cx) {
            (Overflow::Wait, Some(cx)) => {
                register(&mut state.tx_wakers, cx.waker());
                Poll::Pending
            }
            _ => {
                tracing::debug!(capacity = self.shared.capacity, "task queue full; rejecting");
                if let Some(task) = task.take() {
                    task.fail(Error::QueueFull);
                }
                Poll::Ready(Err(Error::QueueFull))
            }
        }
    }

    /// Put a task that was dequeued but never written back at the front of the queue.
    ///
    /// This ignores the queue's capacity and works even after the queue has been closed, so
    /// that draining consumers still get to it.
    pub fn resubmit(&self, task: RequestTask<Req, Res>) {
        let mut state = self.lock();
        state.buf.push_front(task);
        let wakers = std::mem::take(&mut state.rx_wakers);
        drop(state);
        wake_all(wakers);
    }

    /// Wait for the next live task.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<RequestTask<Req, Res>> {
        poll_fn(|cx| self.poll_dequeue(cx)).await
    }

    /// Take the next live task if there is one, without waiting.
    pub fn try_dequeue(&self) -> Option<RequestTask<Req, Res>> {
        self.pop_live(&mut self.lock())
    }

    /// Poll for the next live task.
    ///
    /// `Ready(None)` is returned once the queue is closed and drained.
    pub fn poll_dequeue(&self, cx: &mut Context<'_>) -> Poll<Option<RequestTask<Req, Res>>> {
        let mut state = self.lock();
        if let Some(task) = self.pop_live(&mut state) {
            return Poll::Ready(Some(task));
        }
        if state.closed {
            return Poll::Ready(None);
        }
        register(&mut state.rx_wakers, cx.waker());
        Poll::Pending
    }

    fn pop_live(&self, state: &mut MutexGuard<'_, State<Req, Res>>) -> Option<RequestTask<Req, Res>> {
        while let Some(task) = state.buf.pop_front() {
            if task.is_cancelled() {
                let _guard = task.span.enter();
                tracing::trace!("skipping request cancelled while queued");
                continue;
            }

            // let producers know there's room now
            for w in state.tx_wakers.drain(..) {
                w.wake();
            }
            return Some(task);
        }
        None
    }

    /// Wait until the queue holds at least one task.
    ///
    /// Returns false if the queue is closed and empty instead.
    pub async fn wait_nonempty(&self) -> bool {
        poll_fn(|cx| {
            let mut state = self.lock();
            if !state.buf.is_empty() {
                return Poll::Ready(true);
            }
            if state.closed {
                return Poll::Ready(false);
            }
            register(&mut state.rx_wakers, cx.waker());
            Poll::Pending
        })
        .await
    }

    /// Close the queue.
    ///
    /// No new tasks are accepted. Tasks already queued are still handed out.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let rx = std::mem::take(&mut state.rx_wakers);
        let tx = std::mem::take(&mut state.tx_wakers);
        drop(state);
        tracing::debug!("task queue closed");
        wake_all(rx);
        wake_all(tx);
    }
}
