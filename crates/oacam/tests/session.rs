use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use oacam::capture::virtual_backend::ids;
use oacam::prelude::*;
use proptest::prelude::*;

const SETTLE: Duration = Duration::from_millis(30);
const PATIENCE: Duration = Duration::from_secs(5);

fn res(width: u32, height: u32) -> Resolution {
    Resolution::new(width, height).unwrap()
}

fn manual_backend() -> VirtualCamera {
    VirtualCamera::new(res(4, 4)).with_pacing(Pacing::Manual)
}

fn open(backend: VirtualCamera, slots: usize) -> Camera {
    Camera::open(backend, SessionTunables::default().buffer_count(slots)).unwrap()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(FrameView<'_>) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    (count, move |_frame: FrameView<'_>| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
}

/// Virtual camera that records every poll wait and can inflate one frame's
/// declared format past what any slot can hold.
struct Instrumented {
    inner: VirtualCamera,
    waits: Arc<Mutex<Vec<Duration>>>,
    oversized: Option<u64>,
}

impl Instrumented {
    fn new(inner: VirtualCamera) -> Self {
        Self {
            inner,
            waits: Arc::default(),
            oversized: None,
        }
    }

    fn oversize(mut self, sequence: u64) -> Self {
        self.oversized = Some(sequence);
        self
    }
}

impl CameraBackend for Instrumented {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn query_controls(&self) -> Vec<ControlMeta> {
        self.inner.query_controls()
    }

    fn formats(&self) -> Vec<FormatInfo> {
        self.inner.formats()
    }

    fn modes(&self) -> Vec<Mode> {
        self.inner.modes()
    }

    fn current_interval(&self) -> Option<Interval> {
        self.inner.current_interval()
    }

    fn get_control(&mut self, id: ControlId) -> Result<ControlValue, BackendError> {
        self.inner.get_control(id)
    }

    fn set_control(&mut self, id: ControlId, value: &ControlValue) -> Result<(), BackendError> {
        self.inner.set_control(id, value)
    }

    fn start_capture(&mut self, config: &StreamConfig) -> Result<(), BackendError> {
        self.inner.start_capture(config)
    }

    fn stop_capture(&mut self) -> Result<(), BackendError> {
        self.inner.stop_capture()
    }

    fn poll_frame(&mut self, wait: Duration) -> Result<Option<ReadyFrame<'_>>, BackendError> {
        self.waits.lock().unwrap().push(wait);
        let oversized = self.oversized;
        let Some(frame) = self.inner.poll_frame(wait)? else {
            return Ok(None);
        };
        if Some(frame.meta.sequence) != oversized {
            return Ok(Some(frame));
        }
        let format = MediaFormat::new(FourCc::new(*b"RGBA"), res(u32::MAX, u32::MAX));
        Ok(Some(ReadyFrame {
            meta: FrameMeta { format, ..frame.meta },
            ..frame
        }))
    }

    fn requeue(&mut self, token: BufferToken) -> Result<(), BackendError> {
        self.inner.requeue(token)
    }
}

fn starts_and_stops(probe: &VirtualProbe) -> Vec<DeviceCall> {
    probe
        .calls()
        .into_iter()
        .filter(|call| matches!(call, DeviceCall::Start(_) | DeviceCall::Stop))
        .collect()
}

fn known_id() -> impl Strategy<Value = ControlId> {
    prop_oneof![
        prop::sample::select(vec![
            ids::GAIN,
            ids::HFLIP,
            ids::EXPOSURE_ABSOLUTE,
            ids::WHITE_BALANCE_PRESET,
            ids::TIMESTAMP_OVERLAY,
        ]),
        any::<u32>().prop_map(ControlId),
    ]
}

fn any_value() -> impl Strategy<Value = ControlValue> {
    prop_oneof![
        Just(ControlValue::None),
        any::<bool>().prop_map(ControlValue::Bool),
        (-200i32..200).prop_map(ControlValue::Int),
        (-200i64..100_000).prop_map(ControlValue::Int64),
        (0u32..10).prop_map(ControlValue::Uint),
        (-10.0f32..10.0).prop_map(ControlValue::Float),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn control_errors_follow_the_control_table(
        ops in prop::collection::vec((known_id(), prop::option::of(any_value())), 1..10)
    ) {
        let camera = open(manual_backend(), 2);
        for (id, value) in ops {
            let meta = camera.controls().get(id).cloned();
            match value {
                Some(value) => {
                    let result = camera.set_control(id, value.clone(), false);
                    let expected = match meta {
                        None => {
                            matches!(result, Err(CameraError::InvalidControl(got)) if got == id)
                        }
                        Some(meta) if !meta.kind.accepts(&value) => matches!(
                            result,
                            Err(CameraError::InvalidControlType { id: got, .. }) if got == id
                        ),
                        Some(_) => !matches!(
                            result,
                            Err(CameraError::InvalidControl(_) | CameraError::InvalidControlType { .. })
                        ),
                    };
                    prop_assert!(expected, "set {:?} on {:?} gave {:?}", value, id, result);
                }
                None => {
                    let result = camera.read_control(id);
                    let unknown = matches!(result, Err(CameraError::InvalidControl(_)));
                    prop_assert_eq!(unknown, meta.is_none());
                }
            }
        }
        camera.close();
    }
}

#[test]
fn second_start_is_rejected_and_stream_continues() {
    let camera = open(manual_backend(), 2);
    camera.start_streaming(|_| {}).unwrap();
    let again = camera.start_streaming(|_| {});
    assert!(matches!(again, Err(CameraError::InvalidCommand)));
    assert_eq!(camera.run_mode(), RunMode::Streaming);
    assert!(camera.is_streaming());
    camera.stop_streaming().unwrap();
    assert!(matches!(
        camera.stop_streaming(),
        Err(CameraError::InvalidCommand)
    ));
}

#[test]
fn stop_returns_every_slot_to_the_pool() {
    let backend = manual_backend();
    let probe = backend.probe();
    let camera = open(backend, 3);
    let delivered = Arc::new(AtomicUsize::new(0));
    let seen = delivered.clone();
    camera
        .start_streaming(move |_frame| {
            thread::sleep(Duration::from_millis(3));
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    probe.emit_frames(6);
    assert!(wait_until(PATIENCE, || delivered.load(Ordering::SeqCst) >= 1));
    camera.stop_streaming().unwrap();
    assert_eq!(camera.free_slots(), camera.slot_count());
    assert_eq!(camera.run_mode(), RunMode::Idle);
    let stats = camera.stats();
    assert_eq!(stats.frames_delivered as usize, delivered.load(Ordering::SeqCst));
}

#[test]
fn written_values_read_back() {
    let camera = open(manual_backend(), 2);
    let writes = [
        (ids::GAIN, ControlValue::Int(42)),
        (ids::EXPOSURE_ABSOLUTE, ControlValue::Int64(20_000)),
        (ids::HFLIP, ControlValue::Bool(true)),
        (ids::WHITE_BALANCE_PRESET, ControlValue::Uint(2)),
    ];
    for (id, value) in writes {
        camera.set_control(id, value.clone(), false).unwrap();
        assert_eq!(camera.read_control(id).unwrap(), value);
    }
    assert_eq!(
        camera.menu_item_label(ids::WHITE_BALANCE_PRESET, 2).unwrap(),
        "Daylight"
    );
    assert!(matches!(
        camera.menu_item_label(ids::WHITE_BALANCE_PRESET, 9),
        Err(CameraError::OutOfRange(_))
    ));
    assert!(matches!(
        camera.set_control(ids::GAIN, ControlValue::Int(1000), false),
        Err(CameraError::OutOfRange(_))
    ));
    assert!(camera.test_control(ids::GAIN, &ControlValue::Int(99)).is_ok());
    let range = camera.control_range(ids::GAIN).unwrap();
    assert_eq!(range.max, ControlValue::Int(100));
}

#[test]
fn detached_writes_keep_command_order() {
    let camera = open(manual_backend(), 2);
    for gain in 1..=5 {
        camera.set_control(ids::GAIN, ControlValue::Int(gain), true).unwrap();
    }
    assert_eq!(camera.read_control(ids::GAIN).unwrap(), ControlValue::Int(5));
}

#[test]
fn streaming_only_controls_are_ignored_while_idle() {
    let backend = manual_backend();
    let probe = backend.probe();
    let camera = open(backend, 2);
    let overlay = ControlValue::Bool(true);
    assert!(matches!(
        camera.set_control(ids::TIMESTAMP_OVERLAY, overlay.clone(), false),
        Err(CameraError::Ignored)
    ));
    assert!(matches!(
        camera.read_control(ids::TIMESTAMP_OVERLAY),
        Err(CameraError::Ignored)
    ));
    assert_eq!(probe.count(|call| matches!(call, DeviceCall::SetControl(..))), 0);
    assert_eq!(camera.stats().commands_ignored, 2);

    camera.start_streaming(|_| {}).unwrap();
    camera.set_control(ids::TIMESTAMP_OVERLAY, overlay.clone(), false).unwrap();
    assert_eq!(camera.read_control(ids::TIMESTAMP_OVERLAY).unwrap(), overlay);
    camera.stop_streaming().unwrap();
}

#[test]
fn abort_before_trigger_never_touches_device() {
    let backend = manual_backend();
    let probe = backend.probe();
    let camera = open(backend, 2);
    let (count, callback) = counter();
    camera
        .start_exposure(Instant::now() + Duration::from_secs(30), callback)
        .unwrap();
    assert_eq!(camera.run_mode(), RunMode::ExposurePending);
    assert!(matches!(
        camera.start_exposure(Instant::now(), |_| {}),
        Err(CameraError::InvalidCommand)
    ));
    camera.abort_exposure().unwrap();
    assert_eq!(camera.run_mode(), RunMode::Idle);
    thread::sleep(SETTLE);
    assert_eq!(probe.count(|call| matches!(call, DeviceCall::Trigger(_))), 0);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn aborted_exposure_is_never_delivered() {
    let backend = manual_backend();
    let probe = backend.probe();
    let camera = open(backend, 2);
    let (count, callback) = counter();
    camera.start_exposure(Instant::now(), callback).unwrap();
    assert!(wait_until(PATIENCE, || {
        camera.run_mode() == RunMode::ExposureInProgress
    }));
    camera.abort_exposure().unwrap();
    // The device finishes anyway; the result must be discarded.
    probe.complete_one_shot();
    thread::sleep(SETTLE);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(probe.count(|call| matches!(call, DeviceCall::AbortOneShot)), 1);
    assert_eq!(camera.run_mode(), RunMode::Idle);
}

#[test]
fn abort_after_completion_is_invalid_and_frame_arrives_once() {
    let backend = manual_backend();
    let probe = backend.probe();
    let camera = open(backend, 2);
    let (count, callback) = counter();
    camera.start_exposure(Instant::now(), callback).unwrap();
    assert!(wait_until(PATIENCE, || {
        camera.run_mode() == RunMode::ExposureInProgress
    }));
    probe.complete_one_shot();
    assert!(wait_until(PATIENCE, || count.load(Ordering::SeqCst) == 1));
    assert!(matches!(
        camera.abort_exposure(),
        Err(CameraError::InvalidCommand)
    ));
    thread::sleep(SETTLE);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(camera.stats().exposures_delivered, 1);
}

#[test]
fn abort_race_against_asynchronous_completion() {
    let backend = VirtualCamera::new(res(4, 4)).with_exposure_delay(Duration::from_millis(2));
    let camera = open(backend, 2);
    for delay_us in [0u64, 250, 500, 1000, 1500, 2000, 2500, 4000] {
        let (count, callback) = counter();
        camera.start_exposure(Instant::now(), callback).unwrap();
        thread::sleep(Duration::from_micros(delay_us));
        match camera.abort_exposure() {
            Ok(()) => {
                thread::sleep(SETTLE);
                let delivered = count.load(Ordering::SeqCst);
                assert_eq!(delivered, 0, "delivered after abort ({delay_us}us)");
            }
            Err(CameraError::InvalidCommand) => {
                assert!(wait_until(PATIENCE, || count.load(Ordering::SeqCst) == 1));
                thread::sleep(SETTLE);
                assert_eq!(count.load(Ordering::SeqCst), 1);
            }
            Err(other) => panic!("unexpected abort result: {other}"),
        }
        assert!(wait_until(PATIENCE, || camera.run_mode() == RunMode::Idle));
    }
}

#[test]
fn frames_without_a_free_slot_are_dropped_not_replayed() {
    let backend = manual_backend().with_device_buffers(3);
    let probe = backend.probe();
    let camera = open(backend, 2);

    let release = Arc::new(AtomicBool::new(false));
    let sequences = Arc::new(Mutex::new(Vec::new()));
    let gate = release.clone();
    let seen = sequences.clone();
    camera
        .start_streaming(move |frame: FrameView<'_>| {
            seen.lock().unwrap().push(frame.meta.sequence);
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

    probe.emit_frames(3);
    assert!(wait_until(PATIENCE, || camera.stats().frames_dropped == 1));
    assert_eq!(probe.pending_frames(), 0);
    // The dropped buffer goes straight back to the device.
    assert!(wait_until(PATIENCE, || probe.requeued() == vec![BufferToken(2)]));
    assert!(wait_until(PATIENCE, || sequences.lock().unwrap().len() == 1));

    release.store(true, Ordering::SeqCst);
    assert!(wait_until(PATIENCE, || sequences.lock().unwrap().len() == 2));
    thread::sleep(SETTLE);
    assert_eq!(*sequences.lock().unwrap(), vec![0, 1]);

    probe.emit_frames(1);
    assert!(wait_until(PATIENCE, || sequences.lock().unwrap().len() == 3));
    assert_eq!(*sequences.lock().unwrap(), vec![0, 1, 3]);

    assert!(wait_until(PATIENCE, || camera.stats().frames_delivered == 3));
    assert_eq!(camera.stats().frames_dropped, 1);
    camera.stop_streaming().unwrap();
    assert_eq!(camera.free_slots(), 2);
}

#[test]
fn resolution_change_while_idle_does_not_touch_device() {
    let backend = manual_backend();
    let probe = backend.probe();
    let camera = open(backend, 2);
    probe.clear_calls();
    camera.set_resolution(640, 480).unwrap();
    assert!(probe.calls().is_empty());

    camera.start_streaming(|_| {}).unwrap();
    match probe.calls().as_slice() {
        [DeviceCall::Start(config)] => assert_eq!(config.format.resolution, res(640, 480)),
        other => panic!("unexpected device calls {other:?}"),
    }
    camera.stop_streaming().unwrap();
}

#[test]
fn resolution_change_while_streaming_restarts_capture() {
    let backend = manual_backend();
    let probe = backend.probe();
    let camera = open(backend, 2);
    let lengths = Arc::new(Mutex::new(Vec::new()));
    let seen = lengths.clone();
    camera
        .start_streaming(move |frame: FrameView<'_>| seen.lock().unwrap().push(frame.len()))
        .unwrap();
    probe.clear_calls();

    camera.set_resolution(32, 24).unwrap();
    let calls = starts_and_stops(&probe);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], DeviceCall::Stop);
    match &calls[1] {
        DeviceCall::Start(config) => assert_eq!(config.format.resolution, res(32, 24)),
        other => panic!("expected restart, got {other:?}"),
    }
    assert!(camera.is_streaming());

    probe.emit_frames(1);
    assert!(wait_until(PATIENCE, || !lengths.lock().unwrap().is_empty()));
    assert_eq!(lengths.lock().unwrap()[0], 32 * 24);
    camera.stop_streaming().unwrap();
}

#[test]
fn format_and_interval_changes_are_validated() {
    let backend = manual_backend()
        .with_formats(vec![
            FormatInfo::native(FourCc::new(*b"GREY")),
            FormatInfo::native(FourCc::new(*b"YUYV")),
        ])
        .with_frame_rates(false);
    let probe = backend.probe();
    let camera = open(backend, 2);
    assert!(matches!(
        camera.set_frame_format(FourCc::new(*b"MJPG")),
        Err(CameraError::Unsupported(_))
    ));
    assert!(matches!(
        camera.set_frame_interval(1, 30),
        Err(CameraError::Unsupported(_))
    ));
    camera.set_frame_format(FourCc::new(*b"YUYV")).unwrap();
    camera.start_streaming(|_| {}).unwrap();
    match starts_and_stops(&probe).as_slice() {
        [DeviceCall::Start(config)] => {
            assert_eq!(config.format.code, FourCc::new(*b"YUYV"));
            assert_eq!(config.interval, None);
        }
        other => panic!("unexpected device calls {other:?}"),
    }
    camera.stop_streaming().unwrap();
}

#[test]
fn poll_failures_do_not_stop_streaming() {
    let backend = manual_backend();
    let probe = backend.probe();
    let camera = open(backend, 2);
    let (count, callback) = counter();
    camera.start_streaming(callback).unwrap();
    probe.fail_polls(3);
    assert!(wait_until(PATIENCE, || camera.stats().poll_errors == 3));
    probe.emit_frames(1);
    assert!(wait_until(PATIENCE, || count.load(Ordering::SeqCst) == 1));
    assert!(camera.is_streaming());
    camera.stop_streaming().unwrap();
}

#[test]
fn panicking_callback_does_not_leak_slots() {
    let backend = manual_backend();
    let probe = backend.probe();
    let camera = open(backend, 2);
    camera
        .start_streaming(|frame: FrameView<'_>| {
            if frame.meta.sequence == 0 {
                panic!("callback failure");
            }
        })
        .unwrap();
    probe.emit_frames(2);
    assert!(wait_until(PATIENCE, || camera.stats().frames_delivered == 2));
    assert_eq!(camera.stats().callback_panics, 1);
    camera.stop_streaming().unwrap();
    assert_eq!(camera.free_slots(), camera.slot_count());
}

#[test]
fn close_while_exposure_pending_joins_promptly() {
    let camera = open(manual_backend(), 2);
    camera
        .start_exposure(Instant::now() + Duration::from_secs(60), |_| {})
        .unwrap();
    assert_eq!(camera.run_mode(), RunMode::ExposurePending);

    let (done_tx, done_rx) = mpsc::channel();
    let closer = thread::spawn(move || {
        camera.close();
        let _ = done_tx.send(());
    });
    assert!(
        done_rx.recv_timeout(Duration::from_secs(2)).is_ok(),
        "close did not join the worker threads"
    );
    closer.join().unwrap();
}

#[test]
fn dropping_a_streaming_camera_joins_threads() {
    let backend =
        VirtualCamera::new(res(4, 4)).with_pacing(Pacing::FreeRun(Duration::from_millis(1)));
    let probe = backend.probe();
    let camera = open(backend, 2);
    let (count, callback) = counter();
    camera.start_streaming(callback).unwrap();
    assert!(wait_until(PATIENCE, || count.load(Ordering::SeqCst) > 2));
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        drop(camera);
        let _ = done_tx.send(());
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok());
    assert!(matches!(
        starts_and_stops(&probe).last(),
        Some(DeviceCall::Stop)
    ));
}

#[test]
fn timed_out_commands_surface_as_timeout() {
    let backend = manual_backend();
    let probe = backend.probe();
    let camera = Camera::open(
        backend,
        SessionTunables::default()
            .buffer_count(1)
            .command_timeout(Some(Duration::from_millis(50))),
    )
    .unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let gate = release.clone();
    camera
        .start_streaming(move |_frame| {
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
    probe.emit_frames(1);
    assert!(wait_until(PATIENCE, || camera.free_slots() == 0));
    // Stopping waits for the blocked callback, so the caller gives up first.
    assert!(matches!(camera.stop_streaming(), Err(CameraError::Timeout)));
    release.store(true, Ordering::SeqCst);
    assert!(wait_until(PATIENCE, || camera.free_slots() == 1));
    assert_eq!(camera.run_mode(), RunMode::Idle);
}

#[test]
fn streaming_polls_wait_for_the_device_frame_period() {
    let backend = Instrumented::new(
        VirtualCamera::new(res(4, 4)).with_pacing(Pacing::FreeRun(Duration::from_millis(5))),
    );
    let waits = backend.waits.clone();
    let camera = Camera::open(
        backend,
        SessionTunables::default()
            .buffer_count(4)
            .poll_limits(Duration::from_micros(100), Duration::from_millis(50)),
    )
    .unwrap();
    let (count, callback) = counter();
    camera.start_streaming(callback).unwrap();
    assert!(wait_until(PATIENCE, || count.load(Ordering::SeqCst) >= 3));
    camera.stop_streaming().unwrap();

    let waits = waits.lock().unwrap();
    assert!(!waits.is_empty());
    assert!(
        waits.iter().all(|wait| *wait == Duration::from_millis(5)),
        "poll waits: {waits:?}"
    );
}

#[test]
fn frames_without_memory_are_dropped_and_streaming_continues() {
    let inner = manual_backend();
    let probe = inner.probe();
    let camera = Camera::open(
        Instrumented::new(inner).oversize(0),
        SessionTunables::default().buffer_count(2),
    )
    .unwrap();
    let (count, callback) = counter();
    camera.start_streaming(callback).unwrap();

    probe.emit_frames(2);
    assert!(wait_until(PATIENCE, || count.load(Ordering::SeqCst) == 1));
    assert!(wait_until(PATIENCE, || probe.requeued().contains(&BufferToken(0))));
    assert_eq!(camera.stats().frames_dropped, 1);
    assert_eq!(camera.pool_metrics().alloc_failures(), 1);
    assert!(camera.is_streaming());

    probe.emit_frames(1);
    assert!(wait_until(PATIENCE, || count.load(Ordering::SeqCst) == 2));
    camera.stop_streaming().unwrap();
    assert_eq!(camera.free_slots(), 2);
    assert_eq!(camera.stats().frames_dropped, 1);
}
