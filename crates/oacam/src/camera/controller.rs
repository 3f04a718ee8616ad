use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use oacam_capture::prelude::*;

use super::command::{CommandKind, CommandResult, FrameCallback, Reply};
use super::{CallbackEntry, CallbackKind, CameraError, RunMode, SessionTunables, Shared};
use crate::metrics::SessionCounters;

/// How often a stop waiting on the callback thread re-checks for shutdown.
const DRAIN_RECHECK: Duration = Duration::from_millis(10);

/// Wait budget for one streaming poll.
///
/// Uses the frame interval when the device honours one, the exposure time
/// when it does not, and `fallback` otherwise; never exceeds `ceiling`.
pub(crate) fn poll_budget(
    interval: Option<Interval>,
    frame_rates: bool,
    exposure: Option<Duration>,
    fallback: Duration,
    ceiling: Duration,
) -> Duration {
    let wait = match (interval, exposure) {
        (Some(interval), _) if frame_rates => interval.as_duration(),
        (_, Some(exposure)) if !frame_rates => exposure,
        _ => fallback,
    };
    wait.min(ceiling)
}

/// Device configuration the controller applies on the next capture start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CaptureSettings {
    pub(crate) format: FourCc,
    pub(crate) resolution: Resolution,
    pub(crate) interval: Option<Interval>,
}

struct PendingExposure {
    start_at: Instant,
    callback: FrameCallback,
}

/// Owner of the device backend; runs on the `oacam-controller` thread.
pub(crate) struct Controller {
    shared: Arc<Shared>,
    backend: Box<dyn CameraBackend>,
    returns: BoundedRx<(u64, BufferToken)>,
    capabilities: Capabilities,
    settings: CaptureSettings,
    tunables: SessionTunables,
    exposure_time: Option<Duration>,
    frame_callback: Option<FrameCallback>,
    exposure: Option<PendingExposure>,
}

impl Controller {
    pub(crate) fn new(
        shared: Arc<Shared>,
        backend: Box<dyn CameraBackend>,
        returns: BoundedRx<(u64, BufferToken)>,
        settings: CaptureSettings,
        tunables: SessionTunables,
    ) -> Self {
        let capabilities = backend.capabilities();
        let exposure_time = shared
            .controls
            .exposure_control()
            .and_then(|meta| meta.exposure_duration(&meta.default));
        Self {
            shared,
            backend,
            returns,
            capabilities,
            settings,
            tunables,
            exposure_time,
            frame_callback: None,
            exposure: None,
        }
    }

    pub(crate) fn run(mut self) {
        debug!(backend = self.backend.name(), "controller started");
        loop {
            if self.shared.controller_stopping() {
                let last = self.shared.mode();
                self.shared.set_mode(RunMode::ShuttingDown);
                self.release_device(last);
                break;
            }
            if self.shared.mode() == RunMode::Idle {
                let shared = &self.shared;
                shared
                    .commands
                    .wait_non_empty(|| shared.controller_stopping());
                if shared.controller_stopping() {
                    continue;
                }
            }
            self.requeue_returned();
            self.drain_commands();
            match self.shared.mode() {
                RunMode::Streaming => self.poll_stream(),
                RunMode::ExposurePending => self.advance_pending_exposure(),
                RunMode::ExposureInProgress => self.poll_exposure(),
                RunMode::Idle | RunMode::ShuttingDown => {}
            }
        }
        debug!(backend = self.backend.name(), "controller exiting");
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.shared.commands.pop_head() {
            let (kind, completion) = command.into_parts();
            let name = kind.name();
            let result = self.execute(kind);
            SessionCounters::bump(&self.shared.counters.commands_executed);
            match &result {
                Ok(_) => trace!(command = name, "command completed"),
                Err(CameraError::Ignored) => {
                    SessionCounters::bump(&self.shared.counters.commands_ignored);
                    debug!(command = name, "command ignored until streaming");
                }
                Err(err) => debug!(command = name, error = %err, "command failed"),
            }
            completion.complete(result);
        }
    }

    fn execute(&mut self, kind: CommandKind) -> CommandResult {
        match kind {
            CommandKind::GetControl(id) => {
                self.gate_control(id)?;
                self.backend
                    .get_control(id)
                    .map(Reply::Value)
                    .map_err(|err| control_error(id, err))
            }
            CommandKind::SetControl(id, value) => {
                self.gate_control(id)?;
                self.backend
                    .set_control(id, &value)
                    .map_err(|err| control_error(id, err))?;
                if let Some(meta) = self.shared.controls.get(id)
                    && let Some(exposure) = meta.exposure_duration(&value)
                {
                    self.exposure_time = Some(exposure);
                }
                Ok(Reply::Done)
            }
            CommandKind::GetMenuItem(id, index) => self
                .backend
                .menu_item_label(id, index)
                .map(Reply::Label)
                .map_err(|err| control_error(id, err)),
            CommandKind::SetResolution(resolution) => {
                self.settings.resolution = resolution;
                self.reconfigure()
            }
            CommandKind::SetFrameInterval(interval) => {
                self.settings.interval = Some(interval);
                self.reconfigure()
            }
            CommandKind::SetFrameFormat(code) => {
                self.settings.format = code;
                self.reconfigure()
            }
            CommandKind::StartStreaming(callback) => self.start_streaming(callback),
            CommandKind::StopStreaming => self.stop_streaming(),
            CommandKind::StartExposure { start_at, callback } => {
                self.start_exposure(start_at, callback)
            }
            CommandKind::AbortExposure => self.abort_exposure(),
        }
    }

    /// Ignore traffic to controls the device only accepts while streaming.
    fn gate_control(&self, id: ControlId) -> Result<(), CameraError> {
        let meta = self
            .shared
            .controls
            .get(id)
            .ok_or(CameraError::InvalidControl(id))?;
        if !meta.flags.settable_before_streaming && self.shared.mode() != RunMode::Streaming {
            return Err(CameraError::Ignored);
        }
        Ok(())
    }

    fn stream_config(&self, buffer_count: usize) -> StreamConfig {
        StreamConfig {
            format: MediaFormat::new(self.settings.format, self.settings.resolution),
            interval: self
                .settings
                .interval
                .filter(|_| self.capabilities.frame_rates),
            buffer_count,
        }
    }

    fn start_streaming(&mut self, callback: FrameCallback) -> CommandResult {
        if self.shared.mode() != RunMode::Idle {
            return Err(CameraError::InvalidCommand);
        }
        if !self.capabilities.streaming {
            return Err(CameraError::Unsupported("streaming".into()));
        }
        self.frame_callback = Some(callback);
        if let Err(err) = self.begin_capture() {
            self.frame_callback = None;
            return Err(err);
        }
        Ok(Reply::Done)
    }

    fn stop_streaming(&mut self) -> CommandResult {
        if self.shared.mode() != RunMode::Streaming {
            return Err(CameraError::InvalidCommand);
        }
        let stopped = self.halt_capture();
        self.frame_callback = None;
        stopped.map(|_| Reply::Done)
    }

    /// Apply changed settings. Idle sessions only record them; a streaming
    /// session is stopped, drained and restarted.
    fn reconfigure(&mut self) -> CommandResult {
        if self.shared.mode() != RunMode::Streaming {
            return Ok(Reply::Done);
        }
        debug!(
            format = %self.settings.format,
            resolution = %self.settings.resolution,
            "restarting capture with new settings"
        );
        self.halt_capture()?;
        self.begin_capture()?;
        Ok(Reply::Done)
    }

    fn begin_capture(&mut self) -> Result<(), CameraError> {
        let config = self.stream_config(self.tunables.buffer_count);
        self.backend.start_capture(&config)?;
        let mut state = self.shared.state.lock();
        state.generation += 1;
        state.mode = RunMode::Streaming;
        debug!(
            generation = state.generation,
            format = %config.format.code,
            resolution = %config.format.resolution,
            "streaming started"
        );
        Ok(())
    }

    /// Leave streaming mode, stop the device and wait until every claimed
    /// slot has been through its callback.
    fn halt_capture(&mut self) -> Result<(), CameraError> {
        self.shared.set_mode(RunMode::Idle);
        let stopped = self.backend.stop_capture();
        if let Err(err) = &stopped {
            error!(error = %err, "device failed to stop capture");
        }
        while !self.shared.pool.wait_all_free_for(DRAIN_RECHECK) {
            if self.shared.callbacks_stopping() {
                warn!("callback thread stopped before frame slots drained");
                break;
            }
        }
        // Tokens returned during the drain belong to the stopped stream.
        while let RecvOutcome::Data(_) = self.returns.recv() {}
        debug!("streaming stopped");
        stopped.map_err(CameraError::from)
    }

    /// Leave the device quiet on shutdown. Slots are not drained here; the
    /// callback thread is already stopping.
    fn release_device(&mut self, last: RunMode) {
        let released = match last {
            RunMode::Streaming => self.backend.stop_capture(),
            RunMode::ExposureInProgress => self.backend.abort_one_shot(),
            _ => Ok(()),
        };
        if let Err(err) = released {
            error!(error = %err, mode = ?last, "device failed to release on shutdown");
        }
        self.frame_callback = None;
        self.exposure = None;
    }

    fn requeue_returned(&mut self) {
        while let RecvOutcome::Data((generation, token)) = self.returns.recv() {
            if !self.shared.accepts_returns(generation) {
                continue;
            }
            if let Err(err) = self.backend.requeue(token) {
                warn!(error = %err, token = token.0, "failed to requeue device buffer");
            }
        }
    }

    fn poll_stream(&mut self) {
        let Some(callback) = self.frame_callback.clone() else {
            return;
        };
        let wait = poll_budget(
            self.settings.interval,
            self.capabilities.frame_rates,
            self.exposure_time,
            self.tunables.poll_fallback,
            self.tunables.poll_ceiling,
        );
        let generation = self.shared.generation();
        let shared = &*self.shared;
        let token = match self.backend.poll_frame(wait) {
            Ok(None) => return,
            Ok(Some(frame)) => {
                let sequence = frame.meta.sequence;
                match stage_frame(shared, &frame, CallbackKind::StreamFrame, callback, generation) {
                    Ok(true) => return,
                    Ok(false) => warn!(sequence, "no free frame slot, dropping frame"),
                    Err(err) => warn!(sequence, error = %err, "dropping frame"),
                }
                SessionCounters::bump(&shared.counters.frames_dropped);
                frame.token
            }
            Err(err) => {
                SessionCounters::bump(&shared.counters.poll_errors);
                warn!(error = %err, "frame poll failed");
                return;
            }
        };
        // Dropped frames are never replayed; the buffer goes straight back.
        if let Err(err) = self.backend.requeue(token) {
            warn!(error = %err, token = token.0, "failed to requeue dropped buffer");
        }
    }

    fn start_exposure(&mut self, start_at: Instant, callback: FrameCallback) -> CommandResult {
        if !self.capabilities.one_shot {
            return Err(CameraError::Unsupported("single exposures".into()));
        }
        if self.shared.mode() != RunMode::Idle {
            return Err(CameraError::InvalidCommand);
        }
        self.exposure = Some(PendingExposure { start_at, callback });
        self.shared.set_mode(RunMode::ExposurePending);
        debug!("exposure scheduled");
        Ok(Reply::Done)
    }

    fn abort_exposure(&mut self) -> CommandResult {
        match self.shared.mode() {
            RunMode::ExposurePending => {}
            RunMode::ExposureInProgress => {
                if let Err(err) = self.backend.abort_one_shot() {
                    warn!(error = %err, "device failed to abort exposure");
                }
            }
            _ => return Err(CameraError::InvalidCommand),
        }
        self.exposure = None;
        self.shared.set_mode(RunMode::Idle);
        debug!("exposure aborted");
        Ok(Reply::Done)
    }

    fn advance_pending_exposure(&mut self) {
        let Some(start_at) = self.exposure.as_ref().map(|exposure| exposure.start_at) else {
            self.shared.set_mode(RunMode::Idle);
            return;
        };
        let now = Instant::now();
        if now < start_at {
            // New commands and shutdown both wake this wait.
            self.shared.commands.wait_non_empty_for(start_at - now);
            return;
        }
        let config = self.stream_config(1);
        match self.backend.trigger_one_shot(&config) {
            Ok(()) => {
                self.shared.set_mode(RunMode::ExposureInProgress);
                debug!("exposure triggered");
            }
            Err(err) => {
                SessionCounters::bump(&self.shared.counters.poll_errors);
                warn!(error = %err, "exposure trigger failed");
                self.exposure = None;
                self.shared.set_mode(RunMode::Idle);
            }
        }
    }

    fn poll_exposure(&mut self) {
        let shared = &*self.shared;
        match self.backend.poll_one_shot(self.tunables.poll_ceiling) {
            Ok(OneShotEvent::Pending) => return,
            Ok(OneShotEvent::Completed(frame)) => {
                if let Some(exposure) = self.exposure.take() {
                    let kind = CallbackKind::Exposure;
                    match stage_frame(shared, &frame, kind, exposure.callback, 0) {
                        Ok(true) => debug!("exposure completed"),
                        Ok(false) => {
                            SessionCounters::bump(&shared.counters.frames_dropped);
                            warn!("no free frame slot, dropping exposure");
                        }
                        Err(err) => {
                            SessionCounters::bump(&shared.counters.frames_dropped);
                            warn!(error = %err, "dropping exposure");
                        }
                    }
                }
            }
            Ok(OneShotEvent::Aborted) => {
                warn!("device aborted exposure");
                self.exposure = None;
            }
            Err(err) => {
                SessionCounters::bump(&shared.counters.poll_errors);
                warn!(error = %err, "exposure poll failed, abandoning exposure");
                self.exposure = None;
            }
        }
        shared.set_mode(RunMode::Idle);
    }
}

/// Copy `frame` into a free pool slot and queue it for the callback thread.
///
/// Returns `Ok(false)` when every slot is in use.
fn stage_frame(
    shared: &Shared,
    frame: &ReadyFrame<'_>,
    kind: CallbackKind,
    callback: FrameCallback,
    generation: u64,
) -> Result<bool, CameraError> {
    // Slots hold a whole uncompressed frame so compressed sizes do not regrow them.
    let capacity = frame.data.len().max(frame_len(&frame.meta.format));
    let Some(slot) = shared.pool.claim(capacity)? else {
        return Ok(false);
    };
    let len = match shared.pool.fill(slot, frame.data) {
        Ok(len) => len,
        Err(err) => {
            shared.pool.release(slot);
            return Err(err.into());
        }
    };
    let entry = CallbackEntry {
        kind,
        callback,
        slot,
        len,
        meta: frame.meta,
        token: frame.token,
        generation,
        queued_at: Instant::now(),
    };
    if shared.callbacks.push(entry) == SendOutcome::Closed {
        shared.pool.release(slot);
        return Err(CameraError::SessionClosed);
    }
    trace!(slot = slot.0, len, sequence = frame.meta.sequence, "frame queued for callback");
    Ok(true)
}

fn control_error(id: ControlId, err: BackendError) -> CameraError {
    match err {
        BackendError::InvalidRange => CameraError::OutOfRange(id),
        BackendError::Unsupported(_) => CameraError::InvalidControl(id),
        other => other.into(),
    }
}
