use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Instant;

use oacam_capture::prelude::*;

use super::error::CameraError;

/// Borrowed view of a delivered frame.
///
/// The bytes belong to a pool slot that is recycled as soon as the callback
/// returns; copy anything that must outlive the call.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub meta: FrameMeta,
}

impl FrameView<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// User frame callback, run on the callback dispatcher thread.
///
/// It must not issue synchronous camera commands that wait on buffer
/// teardown (`stop_streaming`, or reconfiguring while streaming); use
/// `dont_wait` control writes instead.
pub type FrameCallback = Arc<dyn Fn(FrameView<'_>) + Send + Sync>;

pub(crate) enum CommandKind {
    GetControl(ControlId),
    SetControl(ControlId, ControlValue),
    GetMenuItem(ControlId, u32),
    SetResolution(Resolution),
    SetFrameInterval(Interval),
    SetFrameFormat(FourCc),
    StartStreaming(FrameCallback),
    StopStreaming,
    StartExposure {
        start_at: Instant,
        callback: FrameCallback,
    },
    AbortExposure,
}

impl CommandKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            CommandKind::GetControl(_) => "get_control",
            CommandKind::SetControl(..) => "set_control",
            CommandKind::GetMenuItem(..) => "get_menu_item",
            CommandKind::SetResolution(_) => "set_resolution",
            CommandKind::SetFrameInterval(_) => "set_frame_interval",
            CommandKind::SetFrameFormat(_) => "set_frame_format",
            CommandKind::StartStreaming(_) => "start_streaming",
            CommandKind::StopStreaming => "stop_streaming",
            CommandKind::StartExposure { .. } => "start_exposure",
            CommandKind::AbortExposure => "abort_exposure",
        }
    }
}

/// Successful command outcome.
#[derive(Debug, PartialEq)]
pub(crate) enum Reply {
    Done,
    Value(ControlValue),
    Label(String),
}

pub(crate) type CommandResult = Result<Reply, CameraError>;

/// One queued operation. Synchronous commands carry a reply channel that the
/// controller completes exactly once; detached commands carry none.
pub(crate) struct Command {
    pub(crate) kind: CommandKind,
    reply: Option<Sender<CommandResult>>,
}

impl Command {
    pub(crate) fn new(kind: CommandKind, reply: Option<Sender<CommandResult>>) -> Self {
        Self { kind, reply }
    }

    /// Split into the operation and its completion handle.
    pub(crate) fn into_parts(self) -> (CommandKind, Completion) {
        (self.kind, Completion(self.reply))
    }
}

/// Completion side of a command.
pub(crate) struct Completion(Option<Sender<CommandResult>>);

impl Completion {
    /// Deliver the outcome. A caller that gave up waiting is not an error.
    pub(crate) fn complete(self, result: CommandResult) {
        if let Some(reply) = self.0 {
            let _ = reply.send(result);
        }
    }
}
