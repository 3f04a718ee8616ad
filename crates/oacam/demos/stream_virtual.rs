use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use oacam::capture::virtual_backend::ids;
use oacam::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), CameraError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .init();

    let backend = VirtualCamera::new(Resolution::new(640, 360).unwrap())
        .with_pacing(Pacing::FreeRun(Duration::from_millis(20)));
    let camera = Camera::open(backend, SessionTunables::default().buffer_count(4))?;
    println!(
        "opened {} with {} controls, {} frame slots",
        camera.name(),
        camera.controls().len(),
        camera.slot_count()
    );

    let gain = camera.control_range(ids::GAIN)?;
    println!("gain range {:?}..={:?} default {:?}", gain.min, gain.max, gain.default);
    camera.set_control(ids::GAIN, ControlValue::Int(40), false)?;
    println!("gain now {:?}", camera.read_control(ids::GAIN)?);

    let frames = Arc::new(AtomicU64::new(0));
    let seen = frames.clone();
    camera.start_streaming(move |frame: FrameView<'_>| {
        let n = seen.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 10 == 0 {
            println!(
                "#{n:03} seq={} ts={}us len={} first_byte={}",
                frame.meta.sequence,
                frame.meta.timestamp,
                frame.len(),
                frame.data.first().copied().unwrap_or_default()
            );
        }
    })?;

    std::thread::sleep(Duration::from_millis(500));
    // Restarts capture at the new size without leaving streaming mode.
    camera.set_resolution(320, 180)?;
    std::thread::sleep(Duration::from_millis(500));
    camera.stop_streaming()?;

    let done = Arc::new(AtomicU64::new(0));
    let flag = done.clone();
    camera.start_exposure(Instant::now() + Duration::from_millis(50), move |frame| {
        println!("exposure delivered {} bytes", frame.len());
        flag.store(1, Ordering::Release);
    })?;
    while done.load(Ordering::Acquire) == 0 {
        std::thread::sleep(Duration::from_millis(5));
    }

    let stats = camera.stats();
    let callbacks = camera.callback_metrics();
    println!(
        "frames={} dropped={} poll_errors={} callback_avg_ms={:.3?} fps={:.1?}",
        stats.frames_delivered,
        stats.frames_dropped,
        stats.poll_errors,
        callbacks.avg_millis(),
        callbacks.fps()
    );
    camera.close();
    Ok(())
}
