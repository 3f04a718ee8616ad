#![doc = include_str!("../README.md")]
use smallvec::smallvec;
use std::panic::catch_unwind;
use std::time::Duration;

use oacam_capture::prelude::*;
use v4l::control::Control;
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::{
    buffer::Type, capability::Flags, format::FourCC, framesize::FrameSizeEnum, prelude::*,
    video::Capture,
};

/// `V4L2_CID_EXPOSURE_ABSOLUTE`, counted in 100 µs units.
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

fn read_node_name(path: &std::path::Path) -> Option<String> {
    let node = path.file_name()?.to_string_lossy();
    let sysfs = format!("/sys/class/video4linux/{node}/name");
    std::fs::read_to_string(sysfs)
        .ok()
        .map(|s| s.trim().to_string())
}

/// Capture-capable V4L2 node and what it advertises.
pub struct V4l2DeviceInfo {
    pub path: String,
    pub name: Option<String>,
    pub card: String,
    pub driver: String,
    pub bus_info: String,
    pub formats: Vec<FormatInfo>,
    pub modes: Vec<Mode>,
    pub controls: Vec<ControlMeta>,
}

/// Probe devices and return (devices, errors) for observability.
pub fn probe_devices() -> (Vec<V4l2DeviceInfo>, Vec<String>) {
    let mut devices = Vec::new();
    let mut errors = Vec::new();
    for dev in v4l::context::enum_devices() {
        match build_info(dev.path()) {
            Ok(info) => devices.push(info),
            Err(e) => errors.push(format!("{}: {e}", dev.path().display())),
        };
    }
    (devices, errors)
}

fn build_info(path: &std::path::Path) -> Result<V4l2DeviceInfo, Box<dyn std::error::Error>> {
    let dev = Device::with_path(path)?;
    let caps = dev.query_caps()?;
    let node_name = read_node_name(path);

    if !(caps.capabilities.contains(Flags::VIDEO_CAPTURE)
        || caps.capabilities.contains(Flags::VIDEO_CAPTURE_MPLANE))
    {
        return Err("not a capture device".into());
    }
    let name_lc = node_name
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if name_lc.contains("metadata") || name_lc.contains("stats") {
        return Err("filtered non-camera node".into());
    }

    let (formats, modes) = describe_formats(&dev);
    let controls = describe_controls(&dev);

    Ok(V4l2DeviceInfo {
        path: path.display().to_string(),
        name: node_name,
        card: caps.card,
        driver: caps.driver,
        bus_info: caps.bus,
        formats,
        modes,
        controls,
    })
}

/// Formats and modes, tolerating drivers that fail part of the enumeration.
fn describe_formats(dev: &Device) -> (Vec<FormatInfo>, Vec<Mode>) {
    let mut formats = Vec::new();
    let mut modes = Vec::new();
    for fmt in dev.enum_formats().unwrap_or_default() {
        let code = FourCc::from(u32::from_le_bytes(fmt.fourcc.repr));
        let emulated = fmt
            .flags
            .contains(v4l::format::description::Flags::EMULATED);
        formats.push(FormatInfo { code, emulated });

        let Ok(framesizes) = dev.enum_framesizes(fmt.fourcc) else {
            continue;
        };
        for size in framesizes {
            let (width, height) = match size.size {
                FrameSizeEnum::Discrete(fs) => (fs.width, fs.height),
                FrameSizeEnum::Stepwise(step) => (step.max_width, step.max_height),
            };
            let Some(res) = Resolution::new(width, height) else {
                continue;
            };
            let mut intervals = smallvec![];
            for iv in dev
                .enum_frameintervals(fmt.fourcc, width, height)
                .unwrap_or_default()
            {
                if let v4l::frameinterval::FrameIntervalEnum::Discrete(discrete) = iv.interval
                    && let Some(interval) = Interval::new(discrete.numerator, discrete.denominator)
                {
                    intervals.push(interval);
                }
            }
            modes.push(Mode {
                format: MediaFormat::new(code, res),
                intervals,
            });
        }
    }
    (formats, modes)
}

fn describe_controls(dev: &Device) -> Vec<ControlMeta> {
    // The v4l crate panics on control types it does not know; treat that
    // like a device without controls.
    match catch_unwind(|| dev.query_controls()) {
        Ok(Ok(ctrls)) => ctrls
            .into_iter()
            .filter_map(|ctrl| map_control(ctrl).ok())
            .collect(),
        Ok(Err(_)) | Err(_) => Vec::new(),
    }
}

fn map_control(ctrl: v4l::control::Description) -> Result<ControlMeta, Box<dyn std::error::Error>> {
    use v4l::control::Type::*;
    let id = ControlId(ctrl.id);
    let (kind, min, max, default, step) = match ctrl.typ {
        Integer => (
            ControlKind::Int,
            ControlValue::Int(ctrl.minimum as i32),
            ControlValue::Int(ctrl.maximum as i32),
            ControlValue::Int(ctrl.default as i32),
            Some(ControlValue::Int(ctrl.step as i32)),
        ),
        Integer64 => (
            ControlKind::Int64,
            ControlValue::Int64(ctrl.minimum),
            ControlValue::Int64(ctrl.maximum),
            ControlValue::Int64(ctrl.default),
            Some(ControlValue::Int64(ctrl.step as i64)),
        ),
        Boolean => (
            ControlKind::Bool,
            ControlValue::Bool(ctrl.minimum != 0),
            ControlValue::Bool(ctrl.maximum != 0),
            ControlValue::Bool(ctrl.default != 0),
            None,
        ),
        Menu | IntegerMenu => (
            if matches!(ctrl.typ, Menu) {
                ControlKind::Menu
            } else {
                ControlKind::IntMenu
            },
            ControlValue::Uint(ctrl.minimum as u32),
            ControlValue::Uint(ctrl.maximum as u32),
            ControlValue::Uint(ctrl.default as u32),
            None,
        ),
        Bitmask => (
            ControlKind::Uint,
            ControlValue::Uint(ctrl.minimum as u32),
            ControlValue::Uint(ctrl.maximum as u32),
            ControlValue::Uint(ctrl.default as u32),
            None,
        ),
        Button => (
            ControlKind::Button,
            ControlValue::None,
            ControlValue::None,
            ControlValue::None,
            None,
        ),
        _ => return Err("unsupported control type".into()),
    };

    let access = if ctrl.flags.contains(v4l::control::Flags::READ_ONLY) {
        Access::ReadOnly
    } else if ctrl.flags.contains(v4l::control::Flags::WRITE_ONLY) {
        Access::WriteOnly
    } else {
        Access::ReadWrite
    };

    // Menu indices may be sparse; keep the list dense so index lookups line up.
    let menu = ctrl.items.map(|items| {
        let len = (ctrl.maximum.max(0) as usize).saturating_add(1);
        let mut labels = vec![String::new(); len];
        for (index, item) in items {
            if let Some(slot) = labels.get_mut(index as usize) {
                *slot = item.to_string();
            }
        }
        labels
    });

    Ok(ControlMeta {
        id,
        name: ctrl.name,
        kind,
        access,
        min,
        max,
        default,
        step,
        menu,
        flags: ControlFlags {
            // V4L2 drivers only take control traffic while streaming.
            settable_before_streaming: false,
            exposure_unit_us: (ctrl.id == CID_EXPOSURE_ABSOLUTE).then_some(100),
        },
    })
}

fn to_v4l_value(value: &ControlValue) -> v4l::control::Value {
    use v4l::control::Value;
    match value {
        ControlValue::None => Value::None,
        ControlValue::Bool(v) => Value::Boolean(*v),
        ControlValue::Int(v) => Value::Integer(*v as i64),
        ControlValue::Int64(v) => Value::Integer(*v),
        ControlValue::Uint(v) => Value::Integer(*v as i64),
        ControlValue::Float(v) => Value::Integer(v.round() as i64),
    }
}

fn from_v4l_value(
    kind: ControlKind,
    value: v4l::control::Value,
) -> Result<ControlValue, BackendError> {
    use v4l::control::Value;
    match (kind, value) {
        (ControlKind::Int64, Value::Integer(v)) => Ok(ControlValue::Int64(v)),
        (ControlKind::Menu | ControlKind::IntMenu | ControlKind::Uint, Value::Integer(v)) => {
            Ok(ControlValue::Uint(v as u32))
        }
        (ControlKind::Bool, Value::Integer(v)) => Ok(ControlValue::Bool(v != 0)),
        (_, Value::Integer(v)) => Ok(ControlValue::Int(v as i32)),
        (_, Value::Boolean(v)) => Ok(ControlValue::Bool(v)),
        (_, Value::None) => Ok(ControlValue::None),
        _ => Err(BackendError::Unsupported("control value type".into())),
    }
}

/// `poll(2)` timeout for a wait: whole milliseconds, rounded up so sub-millisecond
/// waits still sleep, and small enough for the `c_int` the v4l stream stores.
fn poll_timeout(wait: Duration) -> Duration {
    let millis = wait.as_micros().div_ceil(1000).clamp(1, i32::MAX as u128);
    Duration::from_millis(millis as u64)
}

/// V4L2 camera driven through memory-mapped streaming I/O.
///
/// Frames are copied out of the mapped buffer by the session before the next
/// poll; the mmap stream re-queues a buffer when the following one is
/// dequeued, so [`CameraBackend::requeue`] has nothing left to do.
pub struct V4l2Camera {
    path: String,
    name: String,
    dev: Device,
    formats: Vec<FormatInfo>,
    modes: Vec<Mode>,
    controls: Vec<ControlMeta>,
    stream: Option<Stream<'static>>,
    format: Option<MediaFormat>,
}

impl V4l2Camera {
    /// Open the node at `path` and read its formats and controls.
    pub fn open(path: &str) -> Result<Self, BackendError> {
        let dev = Device::with_path(path)?;
        let caps = dev.query_caps()?;
        let (formats, modes) = describe_formats(&dev);
        let controls = describe_controls(&dev);
        tracing::debug!(path, card = %caps.card, controls = controls.len(), "opened v4l2 camera");
        Ok(Self {
            path: path.to_string(),
            name: caps.card,
            dev,
            formats,
            modes,
            controls,
            stream: None,
            format: None,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn control_kind(&self, id: ControlId) -> ControlKind {
        self.controls
            .iter()
            .find(|meta| meta.id == id)
            .map(|meta| meta.kind)
            .unwrap_or(ControlKind::Int)
    }
}

impl CameraBackend for V4l2Camera {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            one_shot: false,
            frame_rates: self.modes.iter().any(|mode| !mode.intervals.is_empty()),
        }
    }

    fn query_controls(&self) -> Vec<ControlMeta> {
        self.controls.clone()
    }

    fn formats(&self) -> Vec<FormatInfo> {
        self.formats.clone()
    }

    fn modes(&self) -> Vec<Mode> {
        self.modes.clone()
    }

    fn current_interval(&self) -> Option<Interval> {
        let params = self.dev.params().ok()?;
        Interval::new(params.interval.numerator, params.interval.denominator)
    }

    fn get_control(&mut self, id: ControlId) -> Result<ControlValue, BackendError> {
        let ctrl = self.dev.control(id.0)?;
        from_v4l_value(self.control_kind(id), ctrl.value)
    }

    fn set_control(&mut self, id: ControlId, value: &ControlValue) -> Result<(), BackendError> {
        let ctrl = Control {
            id: id.0,
            value: to_v4l_value(value),
        };
        self.dev.set_control(ctrl)?;
        Ok(())
    }

    fn start_capture(&mut self, config: &StreamConfig) -> Result<(), BackendError> {
        if self.stream.is_some() {
            return Err(BackendError::Busy);
        }
        let repr = config.format.code.to_u32().to_le_bytes();
        let mut fmt = self.dev.format()?;
        fmt.width = config.format.resolution.width.get();
        fmt.height = config.format.resolution.height.get();
        fmt.fourcc = FourCC::new(&repr);
        let applied = self.dev.set_format(&fmt)?;

        if let Some(iv) = config.interval {
            let mut params = self.dev.params()?;
            params.interval.numerator = iv.numerator.get();
            params.interval.denominator = iv.denominator.get();
            self.dev.set_params(&params)?;
        }

        let buffers = config.buffer_count.max(2) as u32;
        let mut stream = Stream::with_buffers(&self.dev, Type::VideoCapture, buffers)?;
        stream.start()?;
        // The driver may round the geometry; report what it actually delivers.
        let delivered = Resolution::new(applied.width, applied.height)
            .map(|res| MediaFormat::new(config.format.code, res))
            .unwrap_or(config.format);
        tracing::debug!(
            path = %self.path,
            format = %delivered.code,
            resolution = %delivered.resolution,
            buffers,
            "v4l2 stream on"
        );
        self.format = Some(delivered);
        self.stream = Some(stream);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), BackendError> {
        if let Some(mut stream) = self.stream.take() {
            stream.stop()?;
            // Dropping the stream unmaps and releases every device buffer.
            drop(stream);
        }
        self.format = None;
        Ok(())
    }

    fn poll_frame(&mut self, wait: Duration) -> Result<Option<ReadyFrame<'_>>, BackendError> {
        let Some(format) = self.format else {
            return Ok(None);
        };
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        stream.set_timeout(poll_timeout(wait));
        match stream.next() {
            Ok((buf, meta)) => {
                let bytes_used = (meta.bytesused as usize).min(buf.len());
                let timestamp = Duration::from(meta.timestamp)
                    .as_micros()
                    .min(u64::MAX as u128) as u64;
                let sequence = meta.sequence as u64;
                Ok(Some(ReadyFrame {
                    data: &buf[..bytes_used],
                    meta: FrameMeta::new(format, sequence, timestamp),
                    token: BufferToken(sequence),
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn requeue(&mut self, _token: BufferToken) -> Result<(), BackendError> {
        Ok(())
    }
}

pub mod prelude {
    pub use crate::{V4l2Camera, V4l2DeviceInfo, probe_devices};
    pub use oacam_capture::prelude::*;
}

#[cfg(test)]
mod tests {
    use super::*;
    use v4l::control::Value;

    #[test]
    fn values_map_by_declared_kind() {
        assert_eq!(
            from_v4l_value(ControlKind::Int64, Value::Integer(5_000_000)),
            Ok(ControlValue::Int64(5_000_000))
        );
        assert_eq!(
            from_v4l_value(ControlKind::Menu, Value::Integer(2)),
            Ok(ControlValue::Uint(2))
        );
        assert_eq!(
            from_v4l_value(ControlKind::Bool, Value::Integer(1)),
            Ok(ControlValue::Bool(true))
        );
        assert_eq!(
            from_v4l_value(ControlKind::Int, Value::Integer(-4)),
            Ok(ControlValue::Int(-4))
        );
    }

    #[test]
    fn poll_timeouts_round_up_to_whole_milliseconds() {
        assert_eq!(poll_timeout(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(poll_timeout(Duration::from_micros(100)), Duration::from_millis(1));
        assert_eq!(poll_timeout(Duration::from_micros(1_500)), Duration::from_millis(2));
        assert_eq!(poll_timeout(Duration::from_millis(40)), Duration::from_millis(40));
        assert_eq!(
            poll_timeout(Duration::MAX),
            Duration::from_millis(i32::MAX as u64)
        );
    }

    #[test]
    fn outgoing_values_widen_to_integer() {
        assert!(matches!(
            to_v4l_value(&ControlValue::Uint(3)),
            Value::Integer(3)
        ));
        assert!(matches!(
            to_v4l_value(&ControlValue::Bool(true)),
            Value::Boolean(true)
        ));
    }
}
