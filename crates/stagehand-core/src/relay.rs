//! Single-producer/single-consumer queues between the control thread and the
//! audio thread.
//!
//! Both ends are wait-free. Sending never blocks: a full queue hands the
//! message back as [`QueueFull`] so the producer can retry or coalesce.
//! The receiver drains in enqueue order.

use crate::event::StatusEvent;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Rejected message returned by [`RelaySender::try_send`].
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("relay queue full")
    }
}

impl<T> std::error::Error for QueueFull<T> {}

impl<T> From<QueueFull<T>> for crate::Error {
    fn from(_: QueueFull<T>) -> Self {
        crate::Error::QueueFull
    }
}

/// Create a relay with room for `capacity` messages.
pub fn channel<T: Send>(capacity: usize) -> (RelaySender<T>, RelayReceiver<T>) {
    let (prod, cons) = HeapRb::<T>::new(capacity.max(1)).split();
    (RelaySender { prod }, RelayReceiver { cons })
}

pub struct RelaySender<T> {
    prod: HeapProd<T>,
}

impl<T> RelaySender<T> {
    #[inline]
    pub fn try_send(&mut self, msg: T) -> Result<(), QueueFull<T>> {
        self.prod.try_push(msg).map_err(QueueFull)
    }

    pub fn capacity(&self) -> usize {
        self.prod.capacity().get()
    }

    pub fn free_slots(&self) -> usize {
        self.prod.vacant_len()
    }
}

pub struct RelayReceiver<T> {
    cons: HeapCons<T>,
}

impl<T> RelayReceiver<T> {
    #[inline]
    pub fn try_recv(&mut self) -> Option<T> {
        self.cons.try_pop()
    }

    /// Apply `f` to every queued message in FIFO order. Returns the count.
    #[inline]
    pub fn drain<F: FnMut(T)>(&mut self, mut f: F) -> usize {
        let mut n = 0;
        while let Some(msg) = self.cons.try_pop() {
            f(msg);
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.cons.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.cons.is_empty()
    }
}

/// Audio-side producer of [`StatusEvent`]s.
///
/// Never blocks. When the control thread falls behind, events are dropped and
/// counted.
pub struct StatusSender {
    inner: RelaySender<StatusEvent>,
    dropped: Arc<AtomicU64>,
}

impl StatusSender {
    #[inline]
    pub fn post(&mut self, event: StatusEvent) {
        if self.inner.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Shared counter of events lost to a full queue.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

/// Status relay: audio-thread sender, control-thread receiver.
pub fn status_channel(capacity: usize) -> (StatusSender, RelayReceiver<StatusEvent>) {
    let (tx, rx) = channel(capacity);
    (
        StatusSender {
            inner: tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}
