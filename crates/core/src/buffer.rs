use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{sync::Arc, time::Duration};

use crate::{format::MediaFormat, metrics::PoolCounters};

/// Metadata associated with a frame.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::{FourCc, FrameMeta, MediaFormat, Resolution};
///
/// let res = Resolution::new(640, 480).unwrap();
/// let fmt = MediaFormat::new(FourCc::new(*b"GREY"), res);
/// let meta = FrameMeta::new(fmt, 3, 123);
/// assert_eq!(meta.sequence, 3);
/// assert_eq!(meta.timestamp, 123);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Format describing layout and resolution.
    pub format: MediaFormat,
    /// Device sequence number.
    pub sequence: u64,
    /// Capture timestamp in microseconds (device clock).
    pub timestamp: u64,
}

impl FrameMeta {
    pub fn new(format: MediaFormat, sequence: u64, timestamp: u64) -> Self {
        Self {
            format,
            sequence,
            timestamp,
        }
    }
}

/// Index of a slot inside a [`FramePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex(pub usize);

/// Errors raised by [`FramePool`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("unable to grow frame slot to {requested} bytes")]
    MemAlloc { requested: usize },
    #[error("slot {0} does not exist in this pool")]
    InvalidSlot(usize),
}

/// Fixed ring of reusable frame slots.
///
/// Each slot owns a byte buffer that grows to fit the largest frame it has
/// held and is never shrunk. A slot is either free or holds exactly one frame
/// in flight: the controller claims it when a frame completes and the callback
/// dispatcher releases it once the user callback has returned.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::FramePool;
///
/// let pool = FramePool::new(2, 0).unwrap();
/// let a = pool.claim(16).unwrap().unwrap();
/// let b = pool.claim(16).unwrap().unwrap();
/// assert!(pool.claim(16).unwrap().is_none());
/// pool.release(a);
/// pool.release(b);
/// assert_eq!(pool.count_free(), 2);
/// ```
pub struct FramePool {
    slots: Box<[Mutex<Vec<u8>>]>,
    state: Mutex<PoolState>,
    all_free: Condvar,
    metrics: Arc<PoolCounters>,
}

struct PoolState {
    in_use: Vec<bool>,
    free: usize,
    next: usize,
}

impl FramePool {
    /// Create `count` slots, each preallocated to `initial_bytes`.
    pub fn new(count: usize, initial_bytes: usize) -> Result<Self, PoolError> {
        let count = count.max(1);
        let metrics = Arc::new(PoolCounters::default());
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let mut buf = Vec::new();
            if initial_bytes > 0 {
                buf.try_reserve_exact(initial_bytes)
                    .map_err(|_| PoolError::MemAlloc {
                        requested: initial_bytes,
                    })?;
                metrics.record_growth();
            }
            slots.push(Mutex::new(buf));
        }
        Ok(Self {
            slots: slots.into_boxed_slice(),
            state: Mutex::new(PoolState {
                in_use: vec![false; count],
                free: count,
                next: 0,
            }),
            all_free: Condvar::new(),
            metrics,
        })
    }

    /// Number of slots; fixed for the lifetime of the pool.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Claim the next free slot, growing it to hold at least `min_size` bytes.
    ///
    /// Returns `Ok(None)` when every slot is in flight. The claimed slot's
    /// contents are cleared; callers write the frame with [`FramePool::fill`].
    pub fn claim(&self, min_size: usize) -> Result<Option<SlotIndex>, PoolError> {
        let index = {
            let mut state = self.state.lock();
            if state.free == 0 {
                self.metrics.record_exhausted();
                return Ok(None);
            }
            let count = state.in_use.len();
            let start = state.next;
            let Some(index) = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&candidate| !state.in_use[candidate])
            else {
                self.metrics.record_exhausted();
                return Ok(None);
            };
            state.in_use[index] = true;
            state.free -= 1;
            state.next = (index + 1) % count;
            index
        };

        let mut slot = self.slots[index].lock();
        slot.clear();
        if slot.capacity() < min_size {
            if slot.try_reserve_exact(min_size).is_err() {
                self.metrics.record_alloc_failure();
                drop(slot);
                self.release(SlotIndex(index));
                return Err(PoolError::MemAlloc {
                    requested: min_size,
                });
            }
            self.metrics.record_growth();
        }
        self.metrics.record_claim();
        Ok(Some(SlotIndex(index)))
    }

    /// Mark a slot free. Releasing an already-free slot is a no-op.
    pub fn release(&self, index: SlotIndex) {
        let mut state = self.state.lock();
        let Some(flag) = state.in_use.get_mut(index.0) else {
            return;
        };
        if !*flag {
            return;
        }
        *flag = false;
        state.free += 1;
        if state.free == state.in_use.len() {
            self.all_free.notify_all();
        }
    }

    pub fn count_free(&self) -> usize {
        self.state.lock().free
    }

    pub fn is_in_use(&self, index: SlotIndex) -> bool {
        self.state
            .lock()
            .in_use
            .get(index.0)
            .copied()
            .unwrap_or(false)
    }

    /// Block until every slot is free.
    pub fn wait_all_free(&self) {
        let mut state = self.state.lock();
        while state.free < state.in_use.len() {
            self.all_free.wait(&mut state);
        }
    }

    /// Bounded variant of [`FramePool::wait_all_free`]; returns whether the
    /// pool drained before `timeout`.
    pub fn wait_all_free_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.free < state.in_use.len() {
            if self.all_free.wait_until(&mut state, deadline).timed_out() {
                return state.free == state.in_use.len();
            }
        }
        true
    }

    /// Lock a slot's bytes.
    pub fn slot(&self, index: SlotIndex) -> Result<MutexGuard<'_, Vec<u8>>, PoolError> {
        self.slots
            .get(index.0)
            .map(|slot| slot.lock())
            .ok_or(PoolError::InvalidSlot(index.0))
    }

    /// Copy `data` into a claimed slot, growing it if needed.
    pub fn fill(&self, index: SlotIndex, data: &[u8]) -> Result<usize, PoolError> {
        let mut slot = self.slot(index)?;
        slot.clear();
        if slot.capacity() < data.len() {
            slot.try_reserve_exact(data.len()).map_err(|_| {
                self.metrics.record_alloc_failure();
                PoolError::MemAlloc {
                    requested: data.len(),
                }
            })?;
            self.metrics.record_growth();
        }
        slot.extend_from_slice(data);
        Ok(data.len())
    }

    /// Allocated capacity of a slot in bytes.
    pub fn slot_capacity(&self, index: SlotIndex) -> usize {
        self.slots
            .get(index.0)
            .map(|slot| slot.lock().capacity())
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> FramePoolMetrics {
        FramePoolMetrics(self.metrics.clone())
    }
}

/// Observability for frame pool behaviour.
///
/// # Example
/// ```rust
/// use oacam_core::prelude::FramePool;
///
/// let pool = FramePool::new(1, 0).unwrap();
/// let metrics = pool.metrics();
/// let _slot = pool.claim(8).unwrap();
/// assert!(pool.claim(8).unwrap().is_none());
/// assert_eq!(metrics.claims(), 1);
/// assert_eq!(metrics.exhausted(), 1);
/// ```
#[derive(Clone)]
pub struct FramePoolMetrics(Arc<PoolCounters>);

impl FramePoolMetrics {
    /// Successful claims.
    pub fn claims(&self) -> u64 {
        self.0.claims()
    }

    /// Claims refused because every slot was in flight.
    pub fn exhausted(&self) -> u64 {
        self.0.exhausted()
    }

    /// Slot allocations and growths.
    pub fn allocations(&self) -> u64 {
        self.0.growths()
    }

    /// Growths refused by the allocator.
    pub fn alloc_failures(&self) -> u64 {
        self.0.alloc_failures()
    }
}
