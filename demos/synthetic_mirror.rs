use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fbmirror::hw::{DmaMemory, PanelModel, SimulatedBus, WireTap};
use fbmirror::{
    DmaBackend, MirrorConfig, MirrorHandle, PanelProfile, PolledBackend, ShutdownSignal,
    TestPattern, TransferBackend, TransferMode,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let run_duration = Duration::from_secs(
        std::env::args()
            .nth(1)
            .map(|raw| raw.parse::<u64>())
            .transpose()
            .context("run time must be a whole number of seconds")?
            .unwrap_or(5),
    );

    let config = MirrorConfig::from_env().context("invalid FBMIRROR_* configuration")?;
    let panel = PanelProfile::ili9341();
    let (width, height) = (panel.width, panel.height);

    let tap = WireTap::with_panel(PanelModel::new(width, height, panel.bus_is_16_bits_wide));
    let staging_bytes = match config.dma.staging_bytes {
        0 => 2 * config.queue_bytes_for(&panel),
        bytes => bytes,
    };
    let bus = SimulatedBus::new(DmaMemory::new(config.dma.control_blocks, staging_bytes), tap.clone());
    let shutdown = ShutdownSignal::new();
    let backend: Box<dyn TransferBackend> = match config.transfer_mode {
        TransferMode::Polled => Box::new(PolledBackend::new(bus, panel.bus_is_16_bits_wide)),
        TransferMode::Dma | TransferMode::DmaAllTasks => Box::new(
            DmaBackend::new(bus, &config, &panel, &shutdown).context("failed to set up DMA")?,
        ),
    };

    let source = TestPattern::new(width, height, 30).with_bar(24, 6);
    let handle = MirrorHandle::start(Box::new(source), backend, panel, config, &shutdown)
        .context("failed to start mirroring")?;

    println!("Mirroring a {width}x{height} test pattern for {run_duration:?}...");
    let start = Instant::now();
    while start.elapsed() < run_duration && handle.is_running() {
        std::thread::sleep(Duration::from_secs(1));
        let snap = handle.stats();
        println!(
            "  {:.1} fps shown, {} frames ({} interlaced, {} skipped), {} spans, {} KiB, {} wasted polls",
            snap.displayed_fps,
            snap.frames_submitted,
            snap.interlaced_frames,
            snap.frames_skipped,
            snap.spans_submitted,
            snap.bytes_submitted / 1024,
            snap.wasted_polls,
        );
    }

    handle.stop();
    if let Err(error) = handle.join() {
        eprintln!("mirroring failed: {error}");
        std::process::exit(1);
    }

    let (written, clipped) = tap
        .with_panel_model(|panel| (panel.pixels_written(), panel.pixels_clipped()))
        .unwrap_or_default();
    println!("Panel received {written} pixels ({clipped} clipped).");
    Ok(())
}
