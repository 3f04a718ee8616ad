use oacam_capture::prelude::*;

/// Errors returned by [`Camera`](crate::camera::Camera) operations.
///
/// # Example
/// ```rust
/// use oacam::prelude::*;
///
/// let err = CameraError::InvalidControl(ControlId(7));
/// assert_eq!(err.code(), "invalid_control");
/// assert!(!err.retryable());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("command is not valid in the current run mode")]
    InvalidCommand,
    #[error("control {0} is not supported by this camera")]
    InvalidControl(ControlId),
    #[error("control {id} expects a {expected:?} value, got {found}")]
    InvalidControlType {
        id: ControlId,
        expected: ControlKind,
        found: &'static str,
    },
    #[error("value for control {0} is outside its range")]
    OutOfRange(ControlId),
    #[error("command ignored until streaming starts")]
    Ignored,
    #[error("unable to allocate frame memory")]
    MemAlloc,
    #[error("no usable pixel format")]
    NoFormat,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("device busy")]
    Busy,
    #[error("device i/o failed: {0}")]
    Io(String),
    #[error("timed out waiting for the controller")]
    Timeout,
    #[error("camera session is closed")]
    SessionClosed,
    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl CameraError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            CameraError::InvalidCommand => "invalid_command",
            CameraError::InvalidControl(_) => "invalid_control",
            CameraError::InvalidControlType { .. } => "invalid_control_type",
            CameraError::OutOfRange(_) => "out_of_range",
            CameraError::Ignored => "ignored",
            CameraError::MemAlloc => "mem_alloc",
            CameraError::NoFormat => "no_format",
            CameraError::Unsupported(_) => "unsupported",
            CameraError::Busy => "busy",
            CameraError::Io(_) => "io_error",
            CameraError::Timeout => "timeout",
            CameraError::SessionClosed => "session_closed",
            CameraError::ThreadSpawn { .. } => "thread_spawn",
        }
    }

    /// Whether the error may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CameraError::Busy | CameraError::Io(_) | CameraError::Timeout | CameraError::Ignored
        )
    }
}

impl From<BackendError> for CameraError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Io(msg) => CameraError::Io(msg),
            BackendError::Unsupported(msg) => CameraError::Unsupported(msg),
            BackendError::InvalidRange => CameraError::Io("device rejected value".into()),
            BackendError::Busy => CameraError::Busy,
            BackendError::NoFormat => CameraError::NoFormat,
        }
    }
}

impl From<ControlCheckError> for CameraError {
    fn from(err: ControlCheckError) -> Self {
        match err {
            ControlCheckError::Unknown(id) => CameraError::InvalidControl(id),
            ControlCheckError::WrongType {
                id,
                expected,
                found,
            } => CameraError::InvalidControlType {
                id,
                expected,
                found,
            },
            ControlCheckError::OutOfRange(id) => CameraError::OutOfRange(id),
        }
    }
}

impl From<PoolError> for CameraError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::MemAlloc { .. } => CameraError::MemAlloc,
            PoolError::InvalidSlot(index) => CameraError::Io(format!("frame slot {index} missing")),
        }
    }
}
