use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use oacam::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if !cfg!(feature = "v4l2") {
        println!("Enable the `v4l2` feature to run this example.");
        return Ok(());
    }
    let probe = probe_all_with_errors();
    for err in &probe.errors {
        println!("skipped {err}");
    }
    if probe.devices.is_empty() {
        println!("no capture devices found");
        return Ok(());
    }

    println!("found {} device(s):", probe.devices.len());
    for (idx, dev) in probe.devices.iter().enumerate() {
        let formats: Vec<String> = dev.formats.iter().map(|f| f.code.to_string()).collect();
        println!(
            "- [{idx}] {} {:?} formats={formats:?} modes={}",
            dev.name,
            dev.handle,
            dev.modes.len()
        );
    }

    let tunables = SessionTunables::default()
        .preferred_formats(vec![FourCc::new(*b"YUYV"), FourCc::new(*b"GREY")])
        .command_timeout(Some(Duration::from_secs(5)));
    let camera = probe.devices[0].open(tunables)?;
    println!("controls:");
    for ctrl in camera.controls().iter() {
        println!("  - {} ({}) {:?}", ctrl.name, ctrl.id, ctrl.kind);
    }

    let frames = Arc::new(AtomicU64::new(0));
    let seen = frames.clone();
    camera.start_streaming(move |frame: FrameView<'_>| {
        let n = seen.fetch_add(1, Ordering::Relaxed) + 1;
        println!("#{n:03} seq={} len={}", frame.meta.sequence, frame.len());
    })?;
    while frames.load(Ordering::Relaxed) < 30 {
        std::thread::sleep(Duration::from_millis(10));
    }
    camera.stop_streaming()?;
    println!("{:?}", camera.stats());
    camera.close();
    Ok(())
}
