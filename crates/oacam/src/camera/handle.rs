use std::sync::atomic::Ordering;
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use oacam_capture::prelude::*;

use super::command::{Command, CommandKind, FrameCallback, FrameView, Reply};
use super::controller::{CaptureSettings, Controller};
use super::dispatcher::Dispatcher;
use super::{CameraError, RunMode, SessionTunables, Shared};
use crate::metrics::{SessionStats, StageMetrics};

const CONTROLLER_THREAD: &str = "oacam-controller";
const CALLBACK_THREAD: &str = "oacam-callback";

/// An open camera session.
///
/// Opening a camera moves its backend onto a dedicated controller thread and
/// starts a second thread that runs frame callbacks. Every operation is
/// queued to the controller; synchronous calls block until it has run.
/// Dropping the handle stops and joins both threads but does not stop an
/// active stream or exposure first.
///
/// # Example
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use oacam::prelude::*;
///
/// let backend = VirtualCamera::new(Resolution::new(8, 8).unwrap()).with_pacing(Pacing::Manual);
/// let probe = backend.probe();
/// let camera = Camera::open(backend, SessionTunables::default())?;
///
/// let frames = Arc::new(AtomicUsize::new(0));
/// let seen = frames.clone();
/// camera.start_streaming(move |frame: FrameView<'_>| {
///     assert_eq!(frame.len(), 64);
///     seen.fetch_add(1, Ordering::SeqCst);
/// })?;
/// probe.emit_frames(1);
/// while frames.load(Ordering::SeqCst) == 0 {
///     std::thread::yield_now();
/// }
/// camera.stop_streaming()?;
/// camera.close();
/// # Ok::<(), CameraError>(())
/// ```
pub struct Camera {
    name: String,
    shared: Arc<Shared>,
    capabilities: Capabilities,
    formats: Vec<FormatInfo>,
    modes: Vec<Mode>,
    command_timeout: Option<Duration>,
    controller: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Camera {
    /// Open a session over `backend`.
    ///
    /// Queries the control table, negotiates the pixel format, allocates the
    /// frame pool and spawns both worker threads.
    pub fn open(
        backend: impl CameraBackend + 'static,
        tunables: SessionTunables,
    ) -> Result<Self, CameraError> {
        Self::open_boxed(Box::new(backend), tunables)
    }

    /// [`Camera::open`] for an already boxed backend.
    pub fn open_boxed(
        backend: Box<dyn CameraBackend>,
        tunables: SessionTunables,
    ) -> Result<Self, CameraError> {
        let tunables = tunables.sanitized();
        let controls: ControlTable = backend.query_controls().into_iter().collect();
        let formats = backend.formats();
        let modes = backend.modes();
        let format = select_format(backend.as_ref(), &formats, &tunables.preferred_formats)?;
        let resolution = tunables
            .resolution
            .or_else(|| largest_resolution(&modes, format))
            .or_else(|| Resolution::new(640, 480))
            .ok_or(CameraError::NoFormat)?;
        let pool = FramePool::new(tunables.buffer_count, tunables.initial_slot_bytes)?;
        let shared = Arc::new(Shared::new(pool, controls));
        let (return_tx, return_rx) = bounded(tunables.buffer_count.saturating_mul(2));

        let mut camera = Camera {
            name: backend.name().to_owned(),
            shared: shared.clone(),
            capabilities: backend.capabilities(),
            formats,
            modes,
            command_timeout: tunables.command_timeout,
            controller: None,
            dispatcher: None,
        };
        // Start from the rate the device already runs at so polls wait a frame period.
        let interval = camera
            .capabilities
            .frame_rates
            .then(|| backend.current_interval())
            .flatten();
        let settings = CaptureSettings {
            format,
            resolution,
            interval,
        };
        let controller = Controller::new(shared.clone(), backend, return_rx, settings, tunables);
        let dispatcher = Dispatcher::new(shared, return_tx);
        // On failure `camera` drops here and joins whatever already started.
        camera.dispatcher = Some(spawn_worker(CALLBACK_THREAD, move || dispatcher.run())?);
        camera.controller = Some(spawn_worker(CONTROLLER_THREAD, move || controller.run())?);
        info!(
            camera = %camera.name,
            format = %format,
            resolution = %resolution,
            controls = camera.shared.controls.len(),
            "camera opened"
        );
        Ok(camera)
    }

    /// Backend-reported device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn formats(&self) -> &[FormatInfo] {
        &self.formats
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    /// Control table queried when the session was opened.
    pub fn controls(&self) -> &ControlTable {
        &self.shared.controls
    }

    /// Write a control.
    ///
    /// The id, value type, range and write access are checked on the calling
    /// thread before anything is queued. With `dont_wait` the write is queued
    /// and this returns at once; a failure is then only logged.
    pub fn set_control(
        &self,
        id: ControlId,
        value: ControlValue,
        dont_wait: bool,
    ) -> Result<(), CameraError> {
        let meta = self.shared.controls.check_range(id, &value)?;
        if !meta.access.writable() {
            return Err(CameraError::Unsupported(format!("control {id} is read-only")));
        }
        let kind = CommandKind::SetControl(id, value);
        if dont_wait {
            return self.enqueue(Command::new(kind, None));
        }
        self.submit(kind).map(|_| ())
    }

    /// Read a control's current value from the device.
    pub fn read_control(&self, id: ControlId) -> Result<ControlValue, CameraError> {
        let meta = self
            .shared
            .controls
            .get(id)
            .ok_or(CameraError::InvalidControl(id))?;
        if !meta.access.readable() {
            return Err(CameraError::Unsupported(format!("control {id} is write-only")));
        }
        match self.submit(CommandKind::GetControl(id))? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Range, step, default and menu of a control. No device I/O.
    pub fn control_range(&self, id: ControlId) -> Result<ControlMeta, CameraError> {
        self.shared
            .controls
            .get(id)
            .cloned()
            .ok_or(CameraError::InvalidControl(id))
    }

    /// Check `value` against the control's type and range without writing it.
    pub fn test_control(&self, id: ControlId, value: &ControlValue) -> Result<(), CameraError> {
        self.shared.controls.check_range(id, value)?;
        Ok(())
    }

    /// Label of entry `index` of a menu control.
    pub fn menu_item_label(&self, id: ControlId, index: u32) -> Result<String, CameraError> {
        let meta = self
            .shared
            .controls
            .get(id)
            .ok_or(CameraError::InvalidControl(id))?;
        if !matches!(meta.kind, ControlKind::Menu | ControlKind::IntMenu) {
            return Err(CameraError::Unsupported(format!("control {id} is not a menu")));
        }
        match self.submit(CommandKind::GetMenuItem(id, index))? {
            Reply::Label(label) => Ok(label),
            other => Err(unexpected(other)),
        }
    }

    /// Change the capture resolution. While streaming, capture is restarted
    /// with the new size before this returns.
    pub fn set_resolution(&self, width: u32, height: u32) -> Result<(), CameraError> {
        let resolution = Resolution::new(width, height)
            .ok_or_else(|| CameraError::Unsupported(format!("resolution {width}x{height}")))?;
        self.submit(CommandKind::SetResolution(resolution))
            .map(|_| ())
    }

    /// Change the frame interval (`numerator / denominator` seconds per frame).
    pub fn set_frame_interval(&self, numerator: u32, denominator: u32) -> Result<(), CameraError> {
        if !self.capabilities.frame_rates {
            return Err(CameraError::Unsupported("frame intervals".into()));
        }
        let interval = Interval::new(numerator, denominator).ok_or_else(|| {
            CameraError::Unsupported(format!("frame interval {numerator}/{denominator}"))
        })?;
        self.submit(CommandKind::SetFrameInterval(interval))
            .map(|_| ())
    }

    /// Switch to another advertised pixel format.
    pub fn set_frame_format(&self, code: FourCc) -> Result<(), CameraError> {
        if !self.formats.iter().any(|info| info.code == code) {
            return Err(CameraError::Unsupported(format!("pixel format {code}")));
        }
        self.submit(CommandKind::SetFrameFormat(code)).map(|_| ())
    }

    /// Begin streaming; `callback` runs on the callback thread for every frame.
    ///
    /// The callback must not call [`Camera::stop_streaming`]: stopping waits
    /// for the callback thread to hand back every frame slot.
    pub fn start_streaming<F>(&self, callback: F) -> Result<(), CameraError>
    where
        F: Fn(FrameView<'_>) + Send + Sync + 'static,
    {
        let callback: FrameCallback = Arc::new(callback);
        self.submit(CommandKind::StartStreaming(callback))
            .map(|_| ())
    }

    /// Stop streaming. Returns once every delivered frame's callback has
    /// finished and all frame slots are free again.
    pub fn stop_streaming(&self) -> Result<(), CameraError> {
        self.submit(CommandKind::StopStreaming).map(|_| ())
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.mode() == RunMode::Streaming
    }

    pub fn run_mode(&self) -> RunMode {
        self.shared.mode()
    }

    /// Schedule a single exposure to be triggered at `start_at`.
    pub fn start_exposure<F>(&self, start_at: Instant, callback: F) -> Result<(), CameraError>
    where
        F: Fn(FrameView<'_>) + Send + Sync + 'static,
    {
        let callback: FrameCallback = Arc::new(callback);
        self.submit(CommandKind::StartExposure { start_at, callback })
            .map(|_| ())
    }

    /// Cancel the scheduled or running exposure; its frame is never delivered.
    ///
    /// Fails with [`CameraError::InvalidCommand`] when no exposure is active,
    /// including when it already completed.
    pub fn abort_exposure(&self) -> Result<(), CameraError> {
        self.submit(CommandKind::AbortExposure).map(|_| ())
    }

    /// Snapshot of the session counters.
    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Timing of user callbacks.
    pub fn callback_metrics(&self) -> StageMetrics {
        self.shared.callback_metrics.clone()
    }

    pub fn pool_metrics(&self) -> FramePoolMetrics {
        self.shared.pool.metrics()
    }

    pub fn slot_count(&self) -> usize {
        self.shared.pool.len()
    }

    pub fn free_slots(&self) -> usize {
        self.shared.pool.count_free()
    }

    /// Stop both worker threads and release the device.
    pub fn close(mut self) {
        self.teardown_in_place();
    }

    /// Async wrapper for [`Camera::set_control`].
    #[cfg(feature = "async")]
    pub async fn set_control_async(
        &self,
        id: ControlId,
        value: ControlValue,
    ) -> Result<(), CameraError> {
        tokio::task::block_in_place(|| self.set_control(id, value, false))
    }

    /// Async wrapper for [`Camera::read_control`].
    #[cfg(feature = "async")]
    pub async fn read_control_async(&self, id: ControlId) -> Result<ControlValue, CameraError> {
        tokio::task::block_in_place(|| self.read_control(id))
    }

    /// Async wrapper for [`Camera::stop_streaming`].
    #[cfg(feature = "async")]
    pub async fn stop_streaming_async(&self) -> Result<(), CameraError> {
        tokio::task::block_in_place(|| self.stop_streaming())
    }

    fn enqueue(&self, command: Command) -> Result<(), CameraError> {
        match self.shared.commands.push(command) {
            SendOutcome::Ok => Ok(()),
            SendOutcome::Full | SendOutcome::Closed => Err(CameraError::SessionClosed),
        }
    }

    /// Queue `kind` and wait for the controller's reply. A timed-out command
    /// stays queued and still runs.
    fn submit(&self, kind: CommandKind) -> Result<Reply, CameraError> {
        let (tx, rx) = mpsc::channel();
        self.enqueue(Command::new(kind, Some(tx)))?;
        match self.command_timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|err| match err {
                mpsc::RecvTimeoutError::Timeout => CameraError::Timeout,
                mpsc::RecvTimeoutError::Disconnected => CameraError::SessionClosed,
            })?,
            None => rx.recv().map_err(|_| CameraError::SessionClosed)?,
        }
    }

    fn teardown_in_place(&mut self) {
        if self.controller.is_none() && self.dispatcher.is_none() {
            return;
        }
        let mode = self.shared.mode();
        if mode != RunMode::Idle {
            debug!(?mode, "closing camera that is still active");
        }
        self.shared.stop_controller.store(true, Ordering::Release);
        self.shared.stop_callbacks.store(true, Ordering::Release);
        self.shared.commands.close();
        self.shared.callbacks.close();
        let workers = [
            (CONTROLLER_THREAD, self.controller.take()),
            (CALLBACK_THREAD, self.dispatcher.take()),
        ];
        for (name, worker) in workers {
            if let Some(handle) = worker
                && handle.join().is_err()
            {
                error!(thread = name, "worker thread panicked");
            }
        }
        for command in self.shared.commands.drain() {
            let (_, completion) = command.into_parts();
            completion.complete(Err(CameraError::SessionClosed));
        }
        debug!(camera = %self.name, "camera closed");
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.teardown_in_place();
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("name", &self.name)
            .field("mode", &self.shared.mode())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

fn spawn_worker(
    name: &'static str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, CameraError> {
    thread::Builder::new()
        .name(name.into())
        .spawn(body)
        .map_err(|source| CameraError::ThreadSpawn { name, source })
}

/// With no preference, take the first native format (or the first at all).
fn select_format(
    backend: &dyn CameraBackend,
    formats: &[FormatInfo],
    preferred: &[FourCc],
) -> Result<FourCc, CameraError> {
    if !preferred.is_empty() {
        return Ok(backend.negotiate_format(preferred)?);
    }
    formats
        .iter()
        .find(|info| !info.emulated)
        .or_else(|| formats.first())
        .map(|info| info.code)
        .ok_or(CameraError::NoFormat)
}

fn largest_resolution(modes: &[Mode], format: FourCc) -> Option<Resolution> {
    modes
        .iter()
        .filter(|mode| mode.format.code == format)
        .map(|mode| mode.format.resolution)
        .max_by_key(Resolution::pixels)
}

fn unexpected(reply: Reply) -> CameraError {
    CameraError::Io(format!("controller sent unexpected reply {reply:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modes(list: &[(&[u8; 4], u32, u32)]) -> Vec<Mode> {
        list.iter()
            .map(|(code, w, h)| Mode {
                format: MediaFormat::new(FourCc::new(**code), Resolution::new(*w, *h).unwrap()),
                intervals: smallvec::smallvec![],
            })
            .collect()
    }

    #[test]
    fn largest_resolution_is_per_format() {
        let modes = modes(&[(b"GREY", 320, 240), (b"GREY", 1280, 960), (b"YUYV", 1920, 1080)]);
        assert_eq!(
            largest_resolution(&modes, FourCc::new(*b"GREY")),
            Resolution::new(1280, 960)
        );
        assert_eq!(largest_resolution(&modes, FourCc::new(*b"MJPG")), None);
    }

    #[test]
    fn default_format_skips_emulated() {
        let backend = VirtualCamera::new(Resolution::new(4, 4).unwrap());
        let formats = [
            FormatInfo::emulated(FourCc::new(*b"RGB3")),
            FormatInfo::native(FourCc::new(*b"YUYV")),
        ];
        assert_eq!(
            select_format(&backend, &formats, &[]).unwrap(),
            FourCc::new(*b"YUYV")
        );
        assert!(matches!(
            select_format(&backend, &[], &[]),
            Err(CameraError::NoFormat)
        ));
    }
}
