//! Camera session: command queue, controller thread and callback dispatcher.
//!
//! A [`Camera`] owns two worker threads. The controller thread owns the
//! device backend and is the only thread that talks to hardware; it drains
//! queued commands, polls frames while streaming and drives single exposures.
//! The callback thread runs user callbacks on copies of completed frames held
//! in a fixed pool of slots, then hands each slot and its device buffer back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use oacam_capture::prelude::*;

use crate::metrics::{SessionCounters, StageMetrics};

mod command;
mod controller;
mod dispatcher;
mod error;
mod handle;
mod tunables;

pub use command::{FrameCallback, FrameView};
pub use error::CameraError;
pub use handle::Camera;
pub use tunables::{
    DEFAULT_BUFFER_COUNT, DEFAULT_POLL_CEILING, DEFAULT_POLL_FALLBACK, DEFAULT_SLOT_BYTES,
    MAX_POLL_CEILING, SessionTunables,
};

use command::Command;

/// Controller run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunMode {
    Idle,
    Streaming,
    /// Exposure requested; the trigger waits for its start time.
    ExposurePending,
    /// Trigger issued; waiting for the device to finish.
    ExposureInProgress,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallbackKind {
    StreamFrame,
    Exposure,
}

/// A completed frame waiting for the callback thread. The frame bytes live in
/// pool slot `slot`, which stays claimed until the callback has returned.
pub(crate) struct CallbackEntry {
    pub(crate) kind: CallbackKind,
    pub(crate) callback: FrameCallback,
    pub(crate) slot: SlotIndex,
    pub(crate) len: usize,
    pub(crate) meta: FrameMeta,
    pub(crate) token: BufferToken,
    /// Stream generation the device buffer belongs to.
    pub(crate) generation: u64,
    pub(crate) queued_at: Instant,
}

pub(crate) struct SessionState {
    pub(crate) mode: RunMode,
    /// Bumped on every capture start so buffers from an earlier stream are
    /// never requeued into a later one.
    pub(crate) generation: u64,
}

/// State shared by the handle and both worker threads.
pub(crate) struct Shared {
    pub(crate) commands: SyncQueue<Command>,
    pub(crate) callbacks: SyncQueue<CallbackEntry>,
    pub(crate) pool: FramePool,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) stop_controller: AtomicBool,
    pub(crate) stop_callbacks: AtomicBool,
    pub(crate) controls: ControlTable,
    pub(crate) counters: SessionCounters,
    pub(crate) callback_metrics: StageMetrics,
}

impl Shared {
    pub(crate) fn new(pool: FramePool, controls: ControlTable) -> Self {
        Self {
            commands: SyncQueue::new(),
            callbacks: SyncQueue::new(),
            pool,
            state: Mutex::new(SessionState {
                mode: RunMode::Idle,
                generation: 0,
            }),
            stop_controller: AtomicBool::new(false),
            stop_callbacks: AtomicBool::new(false),
            controls,
            counters: SessionCounters::default(),
            callback_metrics: StageMetrics::default(),
        }
    }

    pub(crate) fn mode(&self) -> RunMode {
        self.state.lock().mode
    }

    pub(crate) fn set_mode(&self, mode: RunMode) {
        self.state.lock().mode = mode;
    }

    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Whether buffers of `generation` may still go back to the device.
    pub(crate) fn accepts_returns(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.mode == RunMode::Streaming && state.generation == generation
    }

    pub(crate) fn controller_stopping(&self) -> bool {
        self.stop_controller.load(Ordering::Acquire)
    }

    pub(crate) fn callbacks_stopping(&self) -> bool {
        self.stop_callbacks.load(Ordering::Acquire)
    }
}
