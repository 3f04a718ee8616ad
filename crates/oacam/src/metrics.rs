use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const DEFAULT_WINDOW: usize = 120;

/// Rolling timings of one session stage, such as user callback execution.
///
/// Clones share the same window.
///
/// # Example
/// ```rust
/// use oacam::prelude::StageMetrics;
///
/// let metrics = StageMetrics::default();
/// metrics.record(std::time::Duration::from_millis(5));
/// assert_eq!(metrics.total_samples(), 1);
/// ```
#[derive(Default, Clone)]
pub struct StageMetrics {
    window: Arc<Mutex<Window>>,
}

struct Window {
    samples: VecDeque<(Instant, Duration)>,
    capacity: usize,
    total: u64,
    last: Option<Duration>,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            samples: VecDeque::with_capacity(DEFAULT_WINDOW),
            capacity: DEFAULT_WINDOW,
            total: 0,
            last: None,
        }
    }
}

impl Window {
    fn trim(&mut self) {
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

impl StageMetrics {
    pub fn record(&self, duration: Duration) {
        let mut window = self.window.lock();
        window.total += 1;
        window.last = Some(duration);
        window.samples.push_back((Instant::now(), duration));
        window.trim();
    }

    /// Keep only the latest `size` samples (at least one).
    pub fn set_window_size(&self, size: usize) {
        let mut window = self.window.lock();
        window.capacity = size.max(1);
        window.trim();
    }

    /// Samples recorded since the session opened.
    pub fn total_samples(&self) -> u64 {
        self.window.lock().total
    }

    pub fn avg_millis(&self) -> Option<f64> {
        let window = self.window.lock();
        let count = u32::try_from(window.samples.len()).ok().filter(|n| *n > 0)?;
        let sum: Duration = window.samples.iter().map(|(_, d)| *d).sum();
        Some(millis(sum / count))
    }

    pub fn max_millis(&self) -> Option<f64> {
        let window = self.window.lock();
        window.samples.iter().map(|(_, d)| *d).max().map(millis)
    }

    pub fn last_millis(&self) -> Option<f64> {
        self.window.lock().last.map(millis)
    }

    /// Samples per second across the current window.
    pub fn fps(&self) -> Option<f64> {
        let window = self.window.lock();
        let (first, _) = window.samples.front()?;
        let (last, _) = window.samples.back()?;
        let span = last.saturating_duration_since(*first).as_secs_f64();
        (window.samples.len() > 1 && span > 0.0).then(|| window.samples.len() as f64 / span)
    }
}

/// Event counters shared by the controller and callback threads.
#[derive(Default)]
pub(crate) struct SessionCounters {
    pub(crate) frames_delivered: AtomicU64,
    pub(crate) exposures_delivered: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) poll_errors: AtomicU64,
    pub(crate) commands_executed: AtomicU64,
    pub(crate) commands_ignored: AtomicU64,
    pub(crate) callback_panics: AtomicU64,
}

impl SessionCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionStats {
            frames_delivered: load(&self.frames_delivered),
            exposures_delivered: load(&self.exposures_delivered),
            frames_dropped: load(&self.frames_dropped),
            poll_errors: load(&self.poll_errors),
            commands_executed: load(&self.commands_executed),
            commands_ignored: load(&self.commands_ignored),
            callback_panics: load(&self.callback_panics),
        }
    }
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionStats {
    /// Streaming frames handed to the frame callback.
    pub frames_delivered: u64,
    /// Single exposures handed to their callback.
    pub exposures_delivered: u64,
    /// Frames discarded because no pool slot was free or none could grow.
    pub frames_dropped: u64,
    /// Failed frame or exposure polls.
    pub poll_errors: u64,
    /// Commands the controller executed, successfully or not.
    pub commands_executed: u64,
    /// Commands answered with `Ignored`.
    pub commands_ignored: u64,
    /// Callbacks that panicked.
    pub callback_panics: u64,
}
