use crossbeam::atomic::AtomicCell;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Where a pipeline's keep-alive timer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveState {
    /// Nothing is in flight and the idle timer is running.
    Armed,
    /// Requests are in flight, or there was activity since the connection last went idle.
    Active,
    /// The idle timer fired; the connection is being closed.
    Closing,
    /// The connection is closed.
    Closed,
}

/// Closes connections that have sat idle for too long.
///
/// Never fires while requests are in flight.
#[pin_project]
pub(crate) struct KeepAlive {
    duration: Duration,
    #[pin]
    sleep: Sleep,
    state: Arc<AtomicCell<KeepAliveState>>,
}

impl KeepAlive {
    pub(crate) fn new(duration: Duration, state: Arc<AtomicCell<KeepAliveState>>) -> Self {
        state.store(KeepAliveState::Armed);
        KeepAlive {
            duration,
            sleep: tokio::time::sleep(duration),
            state,
        }
    }

    /// Record activity on the connection, pushing the idle deadline out.
    pub(crate) fn touch(self: Pin<&mut Self>) {
        let this = self.project();
        this.state.store(KeepAliveState::Active);
        this.sleep.reset(Instant::now() + *this.duration);
    }

    /// Resolves once the connection has been idle for the full keep-alive duration.
    pub(crate) fn poll_expired(self: Pin<&mut Self>, cx: &mut Context<'_>, in_flight: usize) -> Poll<()> {
        let this = self.project();
        match this.state.load() {
            KeepAliveState::Closing | KeepAliveState::Closed => return Poll::Ready(()),
            _ if in_flight != 0 => {
                this.state.store(KeepAliveState::Active);
                return Poll::Pending;
            }
            KeepAliveState::Active => this.state.store(KeepAliveState::Armed),
            KeepAliveState::Armed => {}
        }

        match this.sleep.poll(cx) {
            Poll::Ready(()) => {
                tracing::debug!(keep_alive = ?this.duration, "connection idle; closing");
                this.state.store(KeepAliveState::Closing);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }

    pub(crate) fn closed(&self) {
        self.state.store(KeepAliveState::Closed);
    }
}
