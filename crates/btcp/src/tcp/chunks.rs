//! Pull-style consumption of a socket's incoming bytes.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio_stream::Stream;

use super::socket::SocketShared;
use crate::error::{Result, SocketError};

/// A stream of the chunks received on a [`Socket`](super::Socket).
///
/// Obtained from [`Socket::chunks`](super::Socket::chunks). Each item is one
/// chunk as it was read from the transport; chunk boundaries carry no
/// meaning. The stream ends after the peer's end-of-stream, yields the
/// socket's error once if the transport fails, and ends without an item if
/// the socket is destroyed.
///
/// Only one pull may wait at a time per socket. Polling a second `Chunks`
/// while another is parked yields [`SocketError::ConsumerConflict`].
pub struct Chunks {
    shared: Arc<SocketShared>,
    waiter_id: u64,
    finished: bool,
}

impl Chunks {
    pub(crate) fn new(shared: Arc<SocketShared>) -> Self {
        static NEXT_WAITER: AtomicU64 = AtomicU64::new(1);
        Self {
            shared,
            waiter_id: NEXT_WAITER.fetch_add(1, Ordering::Relaxed),
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        // Lets the driver notice that the read queue is exhausted.
        self.shared.wake.notify_one();
    }
}

impl Stream for Chunks {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let this = &mut *self;
        let mut inner = this.shared.inner.lock();

        if let Some((owner, _)) = &inner.waiter
            && *owner != this.waiter_id
        {
            return Poll::Ready(Some(Err(SocketError::ConsumerConflict(
                "another pull is already waiting on this socket",
            ))));
        }

        if let Some(chunk) = inner.read_buffer.pop_front() {
            inner.waiter = None;
            let exhausted = inner.read_buffer.is_empty();
            drop(inner);
            if exhausted {
                this.shared.wake.notify_one();
            }
            return Poll::Ready(Some(Ok(chunk)));
        }

        if let Some(err) = inner.failure.take() {
            inner.waiter = None;
            drop(inner);
            this.finish();
            return Poll::Ready(Some(Err(err)));
        }

        if inner.destroyed || !inner.state.is_readable() {
            inner.waiter = None;
            drop(inner);
            this.finish();
            return Poll::Ready(None);
        }

        inner.waiter = Some((this.waiter_id, cx.waker().clone()));
        Poll::Pending
    }
}

impl Drop for Chunks {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        if matches!(&inner.waiter, Some((owner, _)) if *owner == self.waiter_id) {
            inner.waiter = None;
        }
    }
}

impl std::fmt::Debug for Chunks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunks")
            .field("socket", &self.shared.id)
            .field("finished", &self.finished)
            .finish()
    }
}
