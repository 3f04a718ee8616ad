#![doc = include_str!("../README.md")]

#[cfg(feature = "v4l2")]
use std::panic::{AssertUnwindSafe, catch_unwind};

pub use oacam_capture as capture;
pub use oacam_core as core;
#[cfg(feature = "v4l2")]
pub use oacam_v4l2 as v4l2;

pub use thiserror;

pub mod camera;
mod metrics;

use camera::{Camera, CameraError, SessionTunables};
use oacam_capture::prelude::*;

/// Known backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BackendKind {
    V4l2,
    Virtual,
}

/// How to reach a probed device again when opening it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum DeviceHandle {
    V4l2 { path: String },
    Virtual { width: u32, height: u32 },
}

impl DeviceHandle {
    pub fn kind(&self) -> BackendKind {
        match self {
            DeviceHandle::V4l2 { .. } => BackendKind::V4l2,
            DeviceHandle::Virtual { .. } => BackendKind::Virtual,
        }
    }
}

/// A camera found by [`probe_all`], not yet opened.
///
/// # Example
/// ```rust
/// use oacam::prelude::*;
///
/// let device = ProbedDevice::virtual_camera(Resolution::new(32, 24).unwrap());
/// let camera = device.open(SessionTunables::default())?;
/// assert!(!camera.is_streaming());
/// # Ok::<(), CameraError>(())
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbedDevice {
    pub name: String,
    pub handle: DeviceHandle,
    pub formats: Vec<FormatInfo>,
    pub modes: Vec<Mode>,
    pub properties: Vec<(String, String)>,
}

impl ProbedDevice {
    /// Descriptor for a [`VirtualCamera`] with default settings.
    pub fn virtual_camera(resolution: Resolution) -> Self {
        let camera = VirtualCamera::new(resolution);
        Self {
            name: camera.name().to_owned(),
            handle: DeviceHandle::Virtual {
                width: resolution.width.get(),
                height: resolution.height.get(),
            },
            formats: camera.formats(),
            modes: camera.modes(),
            properties: Vec::new(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.handle.kind()
    }

    /// Open a session on this device.
    pub fn open(&self, tunables: SessionTunables) -> Result<Camera, CameraError> {
        match &self.handle {
            #[cfg(feature = "v4l2")]
            DeviceHandle::V4l2 { path } => {
                Camera::open(oacam_v4l2::V4l2Camera::open(path)?, tunables)
            }
            #[cfg(not(feature = "v4l2"))]
            DeviceHandle::V4l2 { .. } => {
                Err(CameraError::Unsupported("built without v4l2 support".into()))
            }
            DeviceHandle::Virtual { width, height } => {
                let resolution = Resolution::new(*width, *height).ok_or_else(|| {
                    CameraError::Unsupported(format!("resolution {width}x{height}"))
                })?;
                Camera::open(VirtualCamera::new(resolution), tunables)
            }
        }
    }
}

/// Devices found plus the reasons other nodes were skipped.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbeResult {
    pub devices: Vec<ProbedDevice>,
    pub errors: Vec<String>,
}

pub fn probe_all() -> Vec<ProbedDevice> {
    probe_all_with_errors().devices
}

pub fn probe_all_with_errors() -> ProbeResult {
    #[allow(unused_mut)]
    let mut result = ProbeResult::default();

    #[cfg(feature = "v4l2")]
    {
        let (devices, errors) = match catch_unwind(AssertUnwindSafe(oacam_v4l2::probe_devices)) {
            Ok(res) => res,
            Err(_) => (Vec::new(), vec!["v4l2 probe panicked".to_string()]),
        };
        result.errors.extend(errors);
        for dev in devices {
            let mut properties = vec![
                ("driver".to_string(), dev.driver),
                ("bus_info".to_string(), dev.bus_info),
                ("controls".to_string(), dev.controls.len().to_string()),
            ];
            if let Some(node) = dev.name {
                properties.push(("node_name".to_string(), node));
            }
            result.devices.push(ProbedDevice {
                name: dev.card,
                handle: DeviceHandle::V4l2 { path: dev.path },
                formats: dev.formats,
                modes: dev.modes,
                properties,
            });
        }
    }
    tracing::debug!(
        devices = result.devices.len(),
        skipped = result.errors.len(),
        "probe finished"
    );
    result
}

pub mod prelude {
    pub use crate::camera::{
        Camera, CameraError, FrameCallback, FrameView, RunMode, SessionTunables,
    };
    pub use crate::metrics::{SessionStats, StageMetrics};
    pub use crate::{
        BackendKind, DeviceHandle, ProbeResult, ProbedDevice, probe_all, probe_all_with_errors,
    };
    pub use oacam_capture::prelude::*;
}
