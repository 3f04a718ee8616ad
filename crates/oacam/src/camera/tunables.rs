use std::time::Duration;

use oacam_capture::prelude::*;

/// Default number of frame slots (and device buffers) per session.
pub const DEFAULT_BUFFER_COUNT: usize = 8;
/// Default preallocation per frame slot; slots grow on demand.
pub const DEFAULT_SLOT_BYTES: usize = 0;
/// Default ceiling on one streaming poll, so queued commands are serviced promptly.
pub const DEFAULT_POLL_CEILING: Duration = Duration::from_millis(1);
/// Largest poll ceiling accepted; longer values are clamped.
pub const MAX_POLL_CEILING: Duration = Duration::from_secs(1);
/// Default poll wait when neither frame interval nor exposure time is known.
pub const DEFAULT_POLL_FALLBACK: Duration = Duration::from_micros(100);

/// Per-session tunables passed to [`Camera::open`](crate::camera::Camera::open).
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use oacam::prelude::*;
///
/// let tunables = SessionTunables::default()
///     .buffer_count(4)
///     .command_timeout(Some(Duration::from_secs(2)))
///     .preferred_formats(vec![FourCc::new(*b"GREY")]);
/// assert_eq!(tunables.buffer_count, 4);
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionTunables {
    /// Frame slots in the pool; also the device buffer count requested.
    pub buffer_count: usize,
    /// Bytes preallocated in each slot at open.
    pub initial_slot_bytes: usize,
    /// Upper bound on a single streaming poll.
    pub poll_ceiling: Duration,
    /// Poll wait used when nothing better is known.
    pub poll_fallback: Duration,
    /// How long synchronous callers wait for the controller; `None` waits forever.
    pub command_timeout: Option<Duration>,
    /// Pixel formats to negotiate, most preferred first. Empty picks the
    /// device's first native format.
    pub preferred_formats: Vec<FourCc>,
    /// Initial resolution; `None` picks the largest advertised mode.
    pub resolution: Option<Resolution>,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            initial_slot_bytes: DEFAULT_SLOT_BYTES,
            poll_ceiling: DEFAULT_POLL_CEILING,
            poll_fallback: DEFAULT_POLL_FALLBACK,
            command_timeout: None,
            preferred_formats: Vec::new(),
            resolution: None,
        }
    }
}

impl SessionTunables {
    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn initial_slot_bytes(mut self, bytes: usize) -> Self {
        self.initial_slot_bytes = bytes;
        self
    }

    pub fn poll_limits(mut self, fallback: Duration, ceiling: Duration) -> Self {
        self.poll_fallback = fallback;
        self.poll_ceiling = ceiling;
        self
    }

    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn preferred_formats(mut self, formats: Vec<FourCc>) -> Self {
        self.preferred_formats = formats;
        self
    }

    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub(crate) fn sanitized(self) -> Self {
        let ceiling = if self.poll_ceiling.is_zero() {
            DEFAULT_POLL_CEILING
        } else {
            self.poll_ceiling.min(MAX_POLL_CEILING)
        };
        Self {
            buffer_count: self.buffer_count.max(1),
            poll_ceiling: ceiling,
            poll_fallback: self.poll_fallback.min(ceiling),
            ..self
        }
    }
}
