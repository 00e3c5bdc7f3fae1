/// Replay a WAV recording through the loudness pipeline
/// Prints the calibrated level of every frame and marks sustained events
use anyhow::{Context, Result};
use std::path::PathBuf;
use suraksha::detector::{Detection, DisplayLatch, ThresholdDetector};
use suraksha::level::LevelEstimator;
use suraksha::sampler::{FrameSource, WavSource};
use suraksha::MonitorConfig;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let wav = args
        .next()
        .map(PathBuf::from)
        .context("Usage: replay <file.wav> [config.json]")?;
    let config_path = args.next().map(PathBuf::from);
    let config = MonitorConfig::load(config_path.as_deref())?;

    let mut source = WavSource::open(&wav, config.samples_per_frame())
        .with_context(|| format!("Failed to open {}", wav.display()))?;
    let estimator = LevelEstimator::new(config.gain_multiplier, config.db_offset);
    let mut detector = ThresholdDetector::new(config.threshold_db, config.required_consecutive_frames);
    let mut latch = DisplayLatch::new(config.threshold_db);

    println!("🎧 Replaying {} ({} frames)", wav.display(), source.remaining_frames());
    println!(
        "Threshold {:.1} dB, {} consecutive frames of {} ms",
        config.threshold_db, config.required_consecutive_frames, config.sampling_interval_ms
    );
    println!();

    let mut frame_index = 0u64;
    let mut sustained_events = 0;
    let mut peak_db = 0.0f32;

    while let Some(frame) = source.read_frame()? {
        let db = estimator.estimate(&frame);
        peak_db = peak_db.max(db);
        let latched = latch.update(db);
        let detection = detector.push(db);
        let at_ms = frame_index * config.sampling_interval_ms;

        let bar = "█".repeat((db / 5.0).clamp(0.0, 30.0) as usize);
        println!(
            "{:>7.2}s {:>6.1} dB {} {}",
            at_ms as f64 / 1000.0,
            db,
            if latched { "🔴" } else { "  " },
            bar
        );

        if let Detection::Sustained = detection {
            sustained_events += 1;
            println!("🚨 SUSTAINED NOISE #{} at {:.2}s", sustained_events, at_ms as f64 / 1000.0);
        }
        frame_index += 1;
    }

    println!();
    println!(
        "{} frames, peak {:.1} dB, {} sustained event(s)",
        frame_index, peak_db, sustained_events
    );
    Ok(())
}
