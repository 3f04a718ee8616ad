use std::sync::atomic::{AtomicU64, Ordering};

/// Counters the frame pool bumps on every claim.
///
/// # Example
/// ```rust
/// use oacam_core::metrics::PoolCounters;
///
/// let counters = PoolCounters::default();
/// counters.record_claim();
/// counters.record_exhausted();
/// assert_eq!(counters.claims(), 1);
/// assert_eq!(counters.exhausted(), 1);
/// ```
#[derive(Debug, Default)]
pub struct PoolCounters {
    claims: AtomicU64,
    exhausted: AtomicU64,
    growths: AtomicU64,
    alloc_failures: AtomicU64,
}

impl PoolCounters {
    pub fn record_claim(&self) {
        self.claims.fetch_add(1, Ordering::Relaxed);
    }

    /// A claim found no free slot.
    pub fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// A slot was allocated or grown.
    pub fn record_growth(&self) {
        self.growths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alloc_failure(&self) {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn claims(&self) -> u64 {
        self.claims.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn growths(&self) -> u64 {
        self.growths.load(Ordering::Relaxed)
    }

    pub fn alloc_failures(&self) -> u64 {
        self.alloc_failures.load(Ordering::Relaxed)
    }
}
