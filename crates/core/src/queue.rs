use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

/// Result of attempting to enqueue.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::{bounded, SendOutcome};
///
/// let (tx, _rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// assert_eq!(tx.send(2), SendOutcome::Full);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Value was accepted.
    Ok,
    /// Queue is full.
    Full,
    /// Queue is closed.
    Closed,
}

/// Result of attempting to dequeue.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::{SyncQueue, RecvOutcome};
///
/// let queue = SyncQueue::<u8>::new();
/// assert!(matches!(queue.try_recv(), RecvOutcome::Empty));
/// queue.close();
/// assert!(matches!(queue.try_recv(), RecvOutcome::Closed));
/// ```
#[derive(Debug)]
pub enum RecvOutcome<T> {
    /// Received value.
    Data(T),
    /// Queue has been closed and drained.
    Closed,
    /// Queue currently empty.
    Empty,
}

/// Unbounded FIFO shared between many producers and one consumer.
///
/// Producers never block. The consumer can poll with [`SyncQueue::pop_head`]
/// or park on [`SyncQueue::wait_non_empty`] until an item arrives or the queue
/// is woken for shutdown. Closing the queue rejects further pushes but leaves
/// queued items available to drain.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::SyncQueue;
///
/// let queue = SyncQueue::new();
/// queue.push(1u32);
/// queue.push(2u32);
/// assert_eq!(queue.pop_head(), Some(1));
/// assert_eq!(queue.pop_head(), Some(2));
/// assert!(queue.is_empty());
/// ```
pub struct SyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append to the tail and wake every waiter.
    ///
    /// Returns `SendOutcome::Closed` (dropping `value`) once the queue is closed.
    pub fn push(&self, value: T) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        let mut items = self.items.lock();
        items.push_back(value);
        drop(items);
        self.ready.notify_all();
        SendOutcome::Ok
    }

    /// Remove the head item without blocking.
    pub fn pop_head(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Like [`SyncQueue::pop_head`] but distinguishes a closed, drained queue.
    pub fn try_recv(&self) -> RecvOutcome<T> {
        match self.pop_head() {
            Some(value) => RecvOutcome::Data(value),
            None if self.is_closed() => RecvOutcome::Closed,
            None => RecvOutcome::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Block until the queue holds an item, `stop` returns true, or the queue
    /// is closed. `stop` is re-evaluated after every wakeup, so flag-based
    /// shutdown must be followed by [`SyncQueue::wake_all`].
    pub fn wait_non_empty(&self, stop: impl Fn() -> bool) {
        let mut items = self.items.lock();
        while items.is_empty() && !stop() && !self.is_closed() {
            self.ready.wait(&mut items);
        }
    }

    /// Bounded variant of [`SyncQueue::wait_non_empty`]. Returns `true` when
    /// the queue is non-empty on return.
    pub fn wait_non_empty_for(&self, timeout: Duration) -> bool {
        let mut items = self.items.lock();
        if items.is_empty() && !self.is_closed() {
            let _ = self.ready.wait_for(&mut items, timeout);
        }
        !items.is_empty()
    }

    /// Wake every parked waiter so it can re-check its stop condition.
    pub fn wake_all(&self) {
        // Taking the lock orders the wakeup after any concurrent predicate check.
        let _guard = self.items.lock();
        self.ready.notify_all();
    }

    /// Reject further pushes and wake every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remove every queued item, returning them in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }
}

/// Bounded sender handle.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::{bounded, SendOutcome};
///
/// let (tx, _rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// ```
#[derive(Clone)]
pub struct BoundedTx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedTx<T> {
    /// Attempt to send without blocking.
    pub fn send(&self, value: T) -> SendOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        self.inner
            .queue
            .push(value)
            .map(|_| SendOutcome::Ok)
            .unwrap_or(SendOutcome::Full)
    }

    /// Close the queue to further sends.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Bounded receiver handle.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::{bounded, RecvOutcome};
///
/// let (_tx, rx) = bounded::<u8>(1);
/// assert!(matches!(rx.recv(), RecvOutcome::Empty));
/// ```
#[derive(Clone)]
pub struct BoundedRx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedRx<T> {
    /// Attempt to receive without blocking.
    pub fn recv(&self) -> RecvOutcome<T> {
        match self.inner.queue.pop() {
            Some(value) => RecvOutcome::Data(value),
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    RecvOutcome::Closed
                } else {
                    RecvOutcome::Empty
                }
            }
        }
    }

    /// Mark the queue as closed; senders will see `Closed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

struct QueueInner<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
}

/// Create a bounded lock-free queue with the given capacity.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::{bounded, RecvOutcome, SendOutcome};
///
/// let (tx, rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// assert!(matches!(rx.recv(), RecvOutcome::Data(1)));
/// ```
pub fn bounded<T>(capacity: usize) -> (BoundedTx<T>, BoundedRx<T>) {
    let inner = Arc::new(QueueInner {
        queue: ArrayQueue::new(capacity.max(1)),
        closed: AtomicBool::new(false),
    });
    (
        BoundedTx {
            inner: inner.clone(),
        },
        BoundedRx { inner },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn fifo_order_is_preserved() {
        let queue = SyncQueue::new();
        for i in 0..16 {
            queue.push(i);
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.pop_head()).collect();
        assert_eq!(drained, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn closed_queue_rejects_push_but_drains() {
        let queue = SyncQueue::new();
        queue.push(7);
        queue.close();
        assert_eq!(queue.push(8), SendOutcome::Closed);
        assert!(matches!(queue.try_recv(), RecvOutcome::Data(7)));
        assert!(matches!(queue.try_recv(), RecvOutcome::Closed));
    }

    #[test]
    fn waiter_wakes_on_push() {
        let queue = Arc::new(SyncQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                queue.wait_non_empty(|| false);
                queue.pop_head()
            })
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(42u8);
        assert_eq!(consumer.join().ok().flatten(), Some(42));
    }

    #[test]
    fn waiter_wakes_on_stop_flag() {
        let queue = Arc::new(SyncQueue::<u8>::new());
        let stop = Arc::new(AtomicBool::new(false));
        let consumer = {
            let queue = queue.clone();
            let stop = stop.clone();
            thread::spawn(move || queue.wait_non_empty(|| stop.load(Ordering::Acquire)))
        };
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);
        queue.wake_all();
        assert!(consumer.join().is_ok());
    }

    #[test]
    fn timed_wait_returns_when_empty() {
        let queue = SyncQueue::<u8>::new();
        let started = Instant::now();
        assert!(!queue.wait_non_empty_for(Duration::from_millis(5)));
        assert!(started.elapsed() >= Duration::from_millis(4));
    }
}
