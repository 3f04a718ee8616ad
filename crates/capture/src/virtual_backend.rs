//! Virtual camera that emits patterned frames, either free-running or on demand.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use oacam_core::prelude::*;

use crate::{
    BackendError, BufferToken, CameraBackend, Capabilities, FormatInfo, Mode, OneShotEvent,
    ReadyFrame, StreamConfig, frame_len,
};

/// Control ids exposed by [`VirtualCamera`]; they reuse V4L2 numbering.
pub mod ids {
    use oacam_core::prelude::ControlId;

    pub const GAIN: ControlId = ControlId(0x0098_0913);
    pub const HFLIP: ControlId = ControlId(0x0098_0914);
    pub const EXPOSURE_ABSOLUTE: ControlId = ControlId(0x009a_0902);
    pub const WHITE_BALANCE_PRESET: ControlId = ControlId(0x009a_0914);
    /// Only honoured while frames are flowing.
    pub const TIMESTAMP_OVERLAY: ControlId = ControlId(0x00f0_0001);
}

/// How frames and exposures become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// A frame every `interval`, and exposures complete after the configured delay.
    FreeRun(Duration),
    /// Frames and exposure completions only when a [`VirtualProbe`] releases them.
    Manual,
}

/// Device-visible operation recorded by a [`VirtualCamera`].
///
/// Frame polls are not recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    Start(StreamConfig),
    Stop,
    GetControl(ControlId),
    SetControl(ControlId, ControlValue),
    Requeue(BufferToken),
    Trigger(StreamConfig),
    AbortOneShot,
}

#[derive(Default)]
struct ProbeState {
    calls: Vec<DeviceCall>,
    pending_frames: usize,
    one_shot_ready: bool,
    one_shot_device_abort: bool,
    fail_polls: usize,
}

/// Shared view into a [`VirtualCamera`] after it has been moved into a session.
///
/// # Example
/// ```rust
/// use oacam_capture::prelude::*;
///
/// let camera = VirtualCamera::new(Resolution::new(4, 4).unwrap()).with_pacing(Pacing::Manual);
/// let probe = camera.probe();
/// probe.emit_frames(2);
/// assert_eq!(probe.pending_frames(), 2);
/// ```
#[derive(Clone, Default)]
pub struct VirtualProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl VirtualProbe {
    /// Make `count` more frames available to a manually paced camera.
    pub fn emit_frames(&self, count: usize) {
        self.state.lock().pending_frames += count;
    }

    pub fn pending_frames(&self) -> usize {
        self.state.lock().pending_frames
    }

    /// Finish the current exposure of a manually paced camera.
    pub fn complete_one_shot(&self) {
        self.state.lock().one_shot_ready = true;
    }

    /// Make the device report the current exposure as aborted.
    pub fn abort_one_shot_from_device(&self) {
        self.state.lock().one_shot_device_abort = true;
    }

    /// Fail the next `count` frame polls with an I/O error.
    pub fn fail_polls(&self, count: usize) {
        self.state.lock().fail_polls += count;
    }

    /// Every recorded device call, oldest first.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn start_count(&self) -> usize {
        self.count(|c| matches!(c, DeviceCall::Start(_)))
    }

    pub fn stop_count(&self) -> usize {
        self.count(|c| matches!(c, DeviceCall::Stop))
    }

    pub fn requeued(&self) -> Vec<BufferToken> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                DeviceCall::Requeue(token) => Some(*token),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: DeviceCall) {
        self.state.lock().calls.push(call);
    }
}

struct ActiveStream {
    config: StreamConfig,
    next_due: Instant,
    sequence: u64,
    queued: usize,
    outstanding: HashSet<u64>,
}

struct Exposure {
    config: StreamConfig,
    ready_at: Instant,
}

/// Camera that produces frames filled with `sequence % 256`.
///
/// Defaults: one native `GREY` format, a 30 fps free-running pace, a small
/// control set (gain, exposure, flip, white balance menu and a streaming-only
/// overlay toggle) and 10 ms exposures.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use oacam_capture::prelude::*;
///
/// let mut camera = VirtualCamera::new(Resolution::new(4, 4).unwrap()).with_pacing(Pacing::Manual);
/// let probe = camera.probe();
/// let format = MediaFormat::new(FourCc::new(*b"GREY"), Resolution::new(4, 4).unwrap());
/// camera
///     .start_capture(&StreamConfig { format, interval: None, buffer_count: 2 })
///     .unwrap();
/// probe.emit_frames(1);
/// let frame = camera.poll_frame(Duration::from_millis(1)).unwrap().unwrap();
/// assert_eq!(frame.data.len(), 16);
/// ```
pub struct VirtualCamera {
    name: String,
    resolution: Resolution,
    formats: Vec<FormatInfo>,
    controls: Vec<ControlMeta>,
    values: HashMap<ControlId, ControlValue>,
    pacing: Pacing,
    exposure_delay: Duration,
    frame_rates: bool,
    device_buffers: Option<usize>,
    stream: Option<ActiveStream>,
    exposure: Option<Exposure>,
    scratch: Vec<u8>,
    probe: VirtualProbe,
}

impl VirtualCamera {
    pub fn new(resolution: Resolution) -> Self {
        let controls = default_controls();
        let values = controls
            .iter()
            .map(|meta| (meta.id, meta.default.clone()))
            .collect();
        Self {
            name: "virtual".into(),
            resolution,
            formats: vec![FormatInfo::native(FourCc::new(*b"GREY"))],
            controls,
            values,
            pacing: Pacing::FreeRun(Duration::from_micros(33_333)),
            exposure_delay: Duration::from_millis(10),
            frame_rates: true,
            device_buffers: None,
            stream: None,
            exposure: None,
            scratch: Vec::new(),
            probe: VirtualProbe::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_formats(mut self, formats: Vec<FormatInfo>) -> Self {
        self.formats = formats;
        self
    }

    /// Replace the control set; values reset to each control's default.
    pub fn with_controls(mut self, controls: Vec<ControlMeta>) -> Self {
        self.values = controls
            .iter()
            .map(|meta| (meta.id, meta.default.clone()))
            .collect();
        self.controls = controls;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_exposure_delay(mut self, delay: Duration) -> Self {
        self.exposure_delay = delay;
        self
    }

    /// Whether the camera claims frame-interval support.
    pub fn with_frame_rates(mut self, supported: bool) -> Self {
        self.frame_rates = supported;
        self
    }

    /// Allocate `count` device buffers regardless of the count requested at
    /// stream start.
    pub fn with_device_buffers(mut self, count: usize) -> Self {
        self.device_buffers = Some(count);
        self
    }

    pub fn probe(&self) -> VirtualProbe {
        self.probe.clone()
    }

    fn fill_scratch(&mut self, format: &MediaFormat, sequence: u64) -> Result<(), BackendError> {
        let len = frame_len(format);
        self.scratch.clear();
        self.scratch
            .try_reserve(len)
            .map_err(|_| BackendError::Io("out of memory".into()))?;
        self.scratch.resize(len, (sequence % 256) as u8);
        Ok(())
    }

    /// Whether a streamed frame is ready now, sleeping up to `wait` for one.
    fn frame_due(&mut self, wait: Duration) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        match self.pacing {
            Pacing::Manual => {
                let mut state = self.probe.state.lock();
                if state.pending_frames > 0 {
                    state.pending_frames -= 1;
                    return true;
                }
                drop(state);
                thread::sleep(wait);
                false
            }
            Pacing::FreeRun(interval) => {
                let now = Instant::now();
                if now < stream.next_due {
                    let remaining = stream.next_due - now;
                    if remaining > wait {
                        thread::sleep(wait);
                        return false;
                    }
                    thread::sleep(remaining);
                }
                stream.next_due += interval;
                true
            }
        }
    }

    fn exposure_ready(&self, exposure: &Exposure, wait: Duration) -> bool {
        match self.pacing {
            Pacing::Manual => {
                let mut state = self.probe.state.lock();
                if state.one_shot_ready {
                    state.one_shot_ready = false;
                    return true;
                }
                drop(state);
                thread::sleep(wait);
                false
            }
            Pacing::FreeRun(_) => {
                let now = Instant::now();
                if now >= exposure.ready_at {
                    return true;
                }
                let remaining = exposure.ready_at - now;
                thread::sleep(remaining.min(wait));
                Instant::now() >= exposure.ready_at
            }
        }
    }
}

impl CameraBackend for VirtualCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            one_shot: true,
            frame_rates: self.frame_rates,
        }
    }

    fn query_controls(&self) -> Vec<ControlMeta> {
        self.controls.clone()
    }

    fn formats(&self) -> Vec<FormatInfo> {
        self.formats.clone()
    }

    fn modes(&self) -> Vec<Mode> {
        self.formats
            .iter()
            .map(|info| Mode {
                format: MediaFormat::new(info.code, self.resolution),
                intervals: smallvec::smallvec![],
            })
            .collect()
    }

    fn current_interval(&self) -> Option<Interval> {
        match self.pacing {
            Pacing::FreeRun(interval) if self.frame_rates => {
                Interval::new(u32::try_from(interval.as_micros()).ok()?, 1_000_000)
            }
            _ => None,
        }
    }

    fn get_control(&mut self, id: ControlId) -> Result<ControlValue, BackendError> {
        self.probe.record(DeviceCall::GetControl(id));
        self.values
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::Unsupported(format!("control {id}")))
    }

    fn set_control(&mut self, id: ControlId, value: &ControlValue) -> Result<(), BackendError> {
        self.probe.record(DeviceCall::SetControl(id, value.clone()));
        let meta = self
            .controls
            .iter()
            .find(|meta| meta.id == id)
            .ok_or_else(|| BackendError::Unsupported(format!("control {id}")))?;
        if !meta.validate(value) {
            return Err(BackendError::InvalidRange);
        }
        self.values.insert(id, value.clone());
        Ok(())
    }

    fn start_capture(&mut self, config: &StreamConfig) -> Result<(), BackendError> {
        if self.exposure.is_some() {
            return Err(BackendError::Busy);
        }
        self.probe.record(DeviceCall::Start(*config));
        let first_due = match self.pacing {
            Pacing::FreeRun(interval) => Instant::now() + interval,
            Pacing::Manual => Instant::now(),
        };
        self.stream = Some(ActiveStream {
            config: *config,
            next_due: first_due,
            sequence: 0,
            queued: self.device_buffers.unwrap_or(config.buffer_count).max(1),
            outstanding: HashSet::new(),
        });
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), BackendError> {
        self.probe.record(DeviceCall::Stop);
        self.stream = None;
        Ok(())
    }

    fn poll_frame(&mut self, wait: Duration) -> Result<Option<ReadyFrame<'_>>, BackendError> {
        {
            let mut state = self.probe.state.lock();
            if state.fail_polls > 0 {
                state.fail_polls -= 1;
                return Err(BackendError::Io("injected poll failure".into()));
            }
        }
        let Some(stream) = self.stream.as_ref() else {
            return Ok(None);
        };
        if stream.queued == 0 {
            // Every device buffer is waiting to be requeued.
            thread::sleep(wait);
            return Ok(None);
        }
        if !self.frame_due(wait) {
            return Ok(None);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let sequence = stream.sequence;
        stream.sequence += 1;
        stream.queued -= 1;
        stream.outstanding.insert(sequence);
        let format = stream.config.format;
        self.fill_scratch(&format, sequence)?;
        let timestamp = sequence.saturating_mul(
            stream_interval(&self.pacing).as_micros().min(u64::MAX as u128) as u64,
        );
        Ok(Some(ReadyFrame {
            data: &self.scratch,
            meta: FrameMeta::new(format, sequence, timestamp),
            token: BufferToken(sequence),
        }))
    }

    fn requeue(&mut self, token: BufferToken) -> Result<(), BackendError> {
        self.probe.record(DeviceCall::Requeue(token));
        if let Some(stream) = self.stream.as_mut()
            && stream.outstanding.remove(&token.0)
        {
            stream.queued += 1;
        }
        Ok(())
    }

    fn trigger_one_shot(&mut self, config: &StreamConfig) -> Result<(), BackendError> {
        if self.stream.is_some() {
            return Err(BackendError::Busy);
        }
        self.probe.record(DeviceCall::Trigger(*config));
        {
            let mut state = self.probe.state.lock();
            state.one_shot_ready = false;
            state.one_shot_device_abort = false;
        }
        self.exposure = Some(Exposure {
            config: *config,
            ready_at: Instant::now() + self.exposure_delay,
        });
        Ok(())
    }

    fn poll_one_shot(&mut self, wait: Duration) -> Result<OneShotEvent<'_>, BackendError> {
        let Some(exposure) = self.exposure.take() else {
            return Ok(OneShotEvent::Pending);
        };
        if std::mem::take(&mut self.probe.state.lock().one_shot_device_abort) {
            return Ok(OneShotEvent::Aborted);
        }
        if !self.exposure_ready(&exposure, wait) {
            self.exposure = Some(exposure);
            return Ok(OneShotEvent::Pending);
        }
        let format = exposure.config.format;
        self.fill_scratch(&format, 0)?;
        Ok(OneShotEvent::Completed(ReadyFrame {
            data: &self.scratch,
            meta: FrameMeta::new(format, 0, 0),
            token: BufferToken(0),
        }))
    }

    fn abort_one_shot(&mut self) -> Result<(), BackendError> {
        if self.exposure.take().is_some() {
            self.probe.record(DeviceCall::AbortOneShot);
        }
        Ok(())
    }
}

fn stream_interval(pacing: &Pacing) -> Duration {
    match pacing {
        Pacing::FreeRun(interval) => *interval,
        Pacing::Manual => Duration::ZERO,
    }
}

fn default_controls() -> Vec<ControlMeta> {
    vec![
        ControlMeta {
            id: ids::GAIN,
            name: "Gain".into(),
            kind: ControlKind::Int,
            access: Access::ReadWrite,
            min: ControlValue::Int(0),
            max: ControlValue::Int(100),
            default: ControlValue::Int(10),
            step: Some(ControlValue::Int(1)),
            menu: None,
            flags: ControlFlags::default(),
        },
        ControlMeta {
            id: ids::EXPOSURE_ABSOLUTE,
            name: "Exposure (Absolute)".into(),
            kind: ControlKind::Int64,
            access: Access::ReadWrite,
            min: ControlValue::Int64(1),
            max: ControlValue::Int64(60_000_000),
            default: ControlValue::Int64(10_000),
            step: Some(ControlValue::Int64(1)),
            menu: None,
            flags: ControlFlags {
                settable_before_streaming: true,
                exposure_unit_us: Some(1),
            },
        },
        ControlMeta {
            id: ids::HFLIP,
            name: "Horizontal Flip".into(),
            kind: ControlKind::Bool,
            access: Access::ReadWrite,
            min: ControlValue::Bool(false),
            max: ControlValue::Bool(true),
            default: ControlValue::Bool(false),
            step: None,
            menu: None,
            flags: ControlFlags::default(),
        },
        ControlMeta {
            id: ids::WHITE_BALANCE_PRESET,
            name: "White Balance, Auto & Preset".into(),
            kind: ControlKind::Menu,
            access: Access::ReadWrite,
            min: ControlValue::Uint(0),
            max: ControlValue::Uint(2),
            default: ControlValue::Uint(0),
            step: None,
            menu: Some(vec!["Manual".into(), "Auto".into(), "Daylight".into()]),
            flags: ControlFlags::default(),
        },
        ControlMeta {
            id: ids::TIMESTAMP_OVERLAY,
            name: "Timestamp Overlay".into(),
            kind: ControlKind::Bool,
            access: Access::ReadWrite,
            min: ControlValue::Bool(false),
            max: ControlValue::Bool(true),
            default: ControlValue::Bool(false),
            step: None,
            menu: None,
            flags: ControlFlags {
                settable_before_streaming: false,
                exposure_unit_us: None,
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_run_pacing_is_the_reported_interval() {
        let res = Resolution::new(2, 2).unwrap();
        let paced = VirtualCamera::new(res).with_pacing(Pacing::FreeRun(Duration::from_millis(5)));
        assert_eq!(
            paced.current_interval().map(|iv| iv.as_duration()),
            Some(Duration::from_millis(5))
        );
        assert_eq!(
            VirtualCamera::new(res).with_pacing(Pacing::Manual).current_interval(),
            None
        );
        assert_eq!(
            VirtualCamera::new(res).with_frame_rates(false).current_interval(),
            None
        );
    }

    fn grey(w: u32, h: u32) -> StreamConfig {
        StreamConfig {
            format: MediaFormat::new(FourCc::new(*b"GREY"), Resolution::new(w, h).unwrap()),
            interval: None,
            buffer_count: 2,
        }
    }

    #[test]
    fn manual_frames_carry_sequence_pattern() {
        let mut camera =
            VirtualCamera::new(Resolution::new(2, 2).unwrap()).with_pacing(Pacing::Manual);
        let probe = camera.probe();
        camera.start_capture(&grey(2, 2)).unwrap();
        assert!(camera.poll_frame(Duration::ZERO).unwrap().is_none());
        probe.emit_frames(2);
        let first = camera.poll_frame(Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.data, &[0, 0, 0, 0]);
        let second = camera.poll_frame(Duration::ZERO).unwrap().unwrap();
        assert_eq!(second.meta.sequence, 1);
        assert_eq!(second.data, &[1, 1, 1, 1]);
    }

    #[test]
    fn device_starves_until_requeue() {
        let mut camera =
            VirtualCamera::new(Resolution::new(1, 1).unwrap()).with_pacing(Pacing::Manual);
        let probe = camera.probe();
        camera.start_capture(&grey(1, 1)).unwrap();
        probe.emit_frames(3);
        let a = camera.poll_frame(Duration::ZERO).unwrap().unwrap().token;
        let _b = camera.poll_frame(Duration::ZERO).unwrap().unwrap().token;
        assert!(camera.poll_frame(Duration::ZERO).unwrap().is_none());
        camera.requeue(a).unwrap();
        assert!(camera.poll_frame(Duration::ZERO).unwrap().is_some());
        assert_eq!(probe.requeued(), vec![a]);
    }

    #[test]
    fn set_control_validates_range() {
        let mut camera = VirtualCamera::new(Resolution::new(1, 1).unwrap());
        assert_eq!(
            camera.set_control(ids::GAIN, &ControlValue::Int(1000)),
            Err(BackendError::InvalidRange)
        );
        camera.set_control(ids::GAIN, &ControlValue::Int(42)).unwrap();
        assert_eq!(camera.get_control(ids::GAIN), Ok(ControlValue::Int(42)));
    }

    #[test]
    fn one_shot_rejected_while_streaming() {
        let mut camera = VirtualCamera::new(Resolution::new(1, 1).unwrap());
        camera.start_capture(&grey(1, 1)).unwrap();
        assert_eq!(camera.trigger_one_shot(&grey(1, 1)), Err(BackendError::Busy));
    }

    #[test]
    fn manual_one_shot_completes_on_demand() {
        let mut camera =
            VirtualCamera::new(Resolution::new(1, 1).unwrap()).with_pacing(Pacing::Manual);
        let probe = camera.probe();
        camera.trigger_one_shot(&grey(1, 1)).unwrap();
        assert!(matches!(
            camera.poll_one_shot(Duration::ZERO).unwrap(),
            OneShotEvent::Pending
        ));
        probe.complete_one_shot();
        assert!(matches!(
            camera.poll_one_shot(Duration::ZERO).unwrap(),
            OneShotEvent::Completed(_)
        ));
        assert!(matches!(
            camera.poll_one_shot(Duration::ZERO).unwrap(),
            OneShotEvent::Pending
        ));
    }

    #[test]
    fn menu_labels_come_from_metadata() {
        let mut camera = VirtualCamera::new(Resolution::new(1, 1).unwrap());
        assert_eq!(
            camera.menu_item_label(ids::WHITE_BALANCE_PRESET, 2).unwrap(),
            "Daylight"
        );
        assert_eq!(
            camera.menu_item_label(ids::WHITE_BALANCE_PRESET, 5),
            Err(BackendError::InvalidRange)
        );
    }
}
