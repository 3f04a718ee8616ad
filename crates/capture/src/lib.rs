#![doc = include_str!("../README.md")]

use std::time::Duration;

use smallvec::SmallVec;

use oacam_core::prelude::*;

/// Errors reported by a device backend.
///
/// The session layer maps these onto its own error type; backends never see
/// session state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Device I/O failed.
    #[error("device i/o failed: {0}")]
    Io(String),
    /// Operation or control not available on this device.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Value rejected by the device as out of range.
    #[error("value out of range")]
    InvalidRange,
    /// Device is in a state that forbids the request (e.g. one-shot while streaming).
    #[error("device busy")]
    Busy,
    /// No preferred pixel format is offered by the device.
    #[error("no usable pixel format")]
    NoFormat,
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(err.to_string())
    }
}

/// What a backend is able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities {
    /// Continuous frame streaming.
    pub streaming: bool,
    /// Triggered single exposures.
    pub one_shot: bool,
    /// The device honours a frame interval; when false the poll wait falls
    /// back to the exposure-time control.
    pub frame_rates: bool,
}

/// A pixel format the backend can deliver.
///
/// # Example
/// ```rust
/// use oacam_capture::prelude::*;
///
/// let native = FormatInfo::native(FourCc::new(*b"YUYV"));
/// let emulated = FormatInfo::emulated(FourCc::new(*b"RGB3"));
/// assert!(!native.emulated);
/// assert!(emulated.emulated);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FormatInfo {
    pub code: FourCc,
    /// Produced by software conversion rather than by the sensor.
    pub emulated: bool,
}

impl FormatInfo {
    pub fn native(code: FourCc) -> Self {
        Self {
            code,
            emulated: false,
        }
    }

    pub fn emulated(code: FourCc) -> Self {
        Self {
            code,
            emulated: true,
        }
    }
}

/// One advertised capture mode (format + resolution, with its frame intervals).
///
/// # Example
/// ```rust
/// use oacam_capture::prelude::*;
///
/// let res = Resolution::new(320, 240).unwrap();
/// let format = MediaFormat::new(FourCc::new(*b"GREY"), res);
/// let mode = Mode {
///     format,
///     intervals: smallvec::smallvec![Interval::new(1, 30).unwrap()],
/// };
/// assert!(mode.supports(Interval::new(1, 30).unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mode {
    pub format: MediaFormat,
    /// Supported frame intervals; empty when the device does not enumerate them.
    pub intervals: SmallVec<[Interval; 4]>,
}

impl Mode {
    pub fn supports(&self, interval: Interval) -> bool {
        self.intervals.is_empty() || self.intervals.contains(&interval)
    }
}

/// Configuration handed to [`CameraBackend::start_capture`] and
/// [`CameraBackend::trigger_one_shot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub format: MediaFormat,
    /// Requested frame interval; `None` leaves the device default.
    pub interval: Option<Interval>,
    /// Number of device buffers to request.
    pub buffer_count: usize,
}

/// Opaque handle to a device buffer, returned to the backend via
/// [`CameraBackend::requeue`] once the frame it carried has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferToken(pub u64);

/// A completed frame still held in device memory.
///
/// `data` borrows the backend, so the frame must be copied out before the
/// backend is used again.
#[derive(Debug)]
pub struct ReadyFrame<'a> {
    pub data: &'a [u8],
    pub meta: FrameMeta,
    pub token: BufferToken,
}

/// Progress of a triggered single exposure.
#[derive(Debug)]
pub enum OneShotEvent<'a> {
    /// Still exposing.
    Pending,
    /// Exposure finished and produced a frame.
    Completed(ReadyFrame<'a>),
    /// Device gave up on the exposure.
    Aborted,
}

/// Adapter over one camera family.
///
/// A backend is owned by exactly one controller thread for its whole life;
/// none of its methods are called concurrently.
///
/// # Example
/// ```rust
/// use oacam_capture::prelude::*;
///
/// let camera = VirtualCamera::new(Resolution::new(64, 48).unwrap());
/// let chosen = camera
///     .negotiate_format(&[FourCc::new(*b"RGB3"), FourCc::new(*b"GREY")])
///     .unwrap();
/// assert_eq!(chosen, FourCc::new(*b"GREY"));
/// ```
pub trait CameraBackend: Send {
    /// Short human-readable device name.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Controls the device supports. Unsupported controls are absent.
    fn query_controls(&self) -> Vec<ControlMeta>;

    /// Pixel formats the device delivers.
    fn formats(&self) -> Vec<FormatInfo>;

    /// Capture modes the device advertises.
    fn modes(&self) -> Vec<Mode> {
        Vec::new()
    }

    /// Frame interval the device is configured for right now, if it reports one.
    fn current_interval(&self) -> Option<Interval> {
        None
    }

    /// Pick the first of `preferred` the device supports, trying native
    /// formats before emulated ones.
    fn negotiate_format(&self, preferred: &[FourCc]) -> Result<FourCc, BackendError> {
        let formats = self.formats();
        for emulated in [false, true] {
            if let Some(code) = preferred.iter().copied().find(|code| {
                formats
                    .iter()
                    .any(|f| f.code == *code && f.emulated == emulated)
            }) {
                return Ok(code);
            }
        }
        Err(BackendError::NoFormat)
    }

    fn get_control(&mut self, id: ControlId) -> Result<ControlValue, BackendError>;

    fn set_control(&mut self, id: ControlId, value: &ControlValue) -> Result<(), BackendError>;

    /// Label of entry `index` of a menu control.
    fn menu_item_label(&mut self, id: ControlId, index: u32) -> Result<String, BackendError> {
        let controls = self.query_controls();
        let meta = controls
            .iter()
            .find(|meta| meta.id == id)
            .ok_or_else(|| BackendError::Unsupported(format!("control {id}")))?;
        meta.menu_label(index)
            .map(str::to_owned)
            .ok_or(BackendError::InvalidRange)
    }

    /// Configure the device and begin streaming into its buffers.
    fn start_capture(&mut self, config: &StreamConfig) -> Result<(), BackendError>;

    /// Stop streaming. Does not return until every device buffer is reclaimed.
    fn stop_capture(&mut self) -> Result<(), BackendError>;

    /// Wait at most `wait` for the next completed frame.
    fn poll_frame(&mut self, wait: Duration) -> Result<Option<ReadyFrame<'_>>, BackendError>;

    /// Hand a device buffer back for refilling.
    fn requeue(&mut self, token: BufferToken) -> Result<(), BackendError>;

    /// Begin a single exposure using `config`.
    fn trigger_one_shot(&mut self, _config: &StreamConfig) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("single exposures".into()))
    }

    /// Wait at most `wait` for the triggered exposure to progress.
    fn poll_one_shot(&mut self, _wait: Duration) -> Result<OneShotEvent<'_>, BackendError> {
        Err(BackendError::Unsupported("single exposures".into()))
    }

    /// Cancel a triggered exposure. A no-op when nothing is exposing.
    fn abort_one_shot(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Bytes per pixel for the packed formats the crate knows; 1 otherwise.
///
/// # Example
/// ```rust
/// use oacam_capture::prelude::*;
///
/// assert_eq!(bytes_per_pixel(FourCc::new(*b"YUYV")), 2);
/// assert_eq!(bytes_per_pixel(FourCc::new(*b"RGB3")), 3);
/// ```
pub fn bytes_per_pixel(code: FourCc) -> usize {
    match &code.bytes() {
        b"YUYV" | b"UYVY" | b"Y16 " | b"RG16" | b"BG16" | b"GR16" | b"GB16" => 2,
        b"RGB3" | b"BGR3" | b"RG24" => 3,
        b"RGBA" | b"BGRA" | b"RGB0" | b"BGR0" => 4,
        _ => 1,
    }
}

/// Size of one uncompressed frame of `format`, saturating at `usize::MAX`.
pub fn frame_len(format: &MediaFormat) -> usize {
    format
        .resolution
        .pixels()
        .saturating_mul(bytes_per_pixel(format.code))
}

pub mod virtual_backend;

pub mod prelude {
    pub use crate::{
        BackendError, BufferToken, CameraBackend, Capabilities, FormatInfo, Mode, OneShotEvent,
        ReadyFrame, StreamConfig, bytes_per_pixel, frame_len,
        virtual_backend::{DeviceCall, Pacing, VirtualCamera, VirtualProbe},
    };
    pub use oacam_core::prelude::*;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn negotiate_prefers_native_over_earlier_emulated() {
        let camera = VirtualCamera::new(Resolution::new(8, 8).unwrap()).with_formats(vec![
            FormatInfo::emulated(FourCc::new(*b"RGB3")),
            FormatInfo::native(FourCc::new(*b"YUYV")),
        ]);
        let chosen = camera
            .negotiate_format(&[FourCc::new(*b"RGB3"), FourCc::new(*b"YUYV")])
            .unwrap();
        assert_eq!(chosen, FourCc::new(*b"YUYV"));
    }

    #[test]
    fn negotiate_falls_back_to_emulated() {
        let camera = VirtualCamera::new(Resolution::new(8, 8).unwrap()).with_formats(vec![
            FormatInfo::emulated(FourCc::new(*b"RGB3")),
        ]);
        assert_eq!(
            camera.negotiate_format(&[FourCc::new(*b"RGB3")]),
            Ok(FourCc::new(*b"RGB3"))
        );
        assert_eq!(
            camera.negotiate_format(&[FourCc::new(*b"MJPG")]),
            Err(BackendError::NoFormat)
        );
    }
}
