//! Audio sampling
//!
//! A [`FrameSource`] yields raw amplitude frames. A [`ThreadSampler`] runs
//! one on a dedicated OS thread and pushes [`AudioFrame`]s into a tokio
//! channel, so blocking device reads never stall the runtime.

use crate::events::AudioFrame;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Audio input unavailable: {0}")]
    Unavailable(String),

    #[error("Audio read failed: {0}")]
    Read(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Producer of amplitude frames, samples normalized to [-1, 1]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the input is exhausted.
    fn read_frame(&mut self) -> Result<Option<Vec<f32>>, SamplerError>;

    /// Whether `read_frame` itself blocks for one sampling interval.
    /// Non-realtime sources are paced by the sampler thread.
    fn is_realtime(&self) -> bool {
        false
    }
}

/// Opens a fresh source each time sampling starts
pub type SourceFactory =
    Arc<dyn Fn() -> Result<Box<dyn FrameSource>, SamplerError> + Send + Sync>;

/// Start/stop seam used by the monitor
pub trait Sampler: Send {
    /// Begin delivering frames to `frames`. Replaces any running capture.
    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<(), SamplerError>;

    /// Stop capture. The audio source is released before this returns.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Frames decoded from a WAV file, mixed down to mono
pub struct WavSource {
    samples: Vec<f32>,
    position: usize,
    samples_per_frame: usize,
}

impl WavSource {
    pub fn open(path: &Path, samples_per_frame: usize) -> Result<Self, SamplerError> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
        };

        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|c| c.iter().sum::<f32>() / c.len() as f32)
                .collect()
        };

        info!(
            "Opened {} ({} Hz, {} ch, {} samples)",
            path.display(),
            spec.sample_rate,
            spec.channels,
            samples.len()
        );
        Ok(Self::from_samples(samples, samples_per_frame))
    }

    pub fn from_samples(samples: Vec<f32>, samples_per_frame: usize) -> Self {
        Self {
            samples,
            position: 0,
            samples_per_frame: samples_per_frame.max(1),
        }
    }

    pub fn remaining_frames(&self) -> usize {
        (self.samples.len() - self.position).div_ceil(self.samples_per_frame)
    }
}

impl FrameSource for WavSource {
    fn read_frame(&mut self) -> Result<Option<Vec<f32>>, SamplerError> {
        if self.position >= self.samples.len() {
            return Ok(None);
        }
        let end = (self.position + self.samples_per_frame).min(self.samples.len());
        let frame = self.samples[self.position..end].to_vec();
        self.position = end;
        Ok(Some(frame))
    }
}

/// Preset frames, optionally ending in a read error
pub struct ScriptedSource {
    frames: VecDeque<Result<Vec<f32>, String>>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Vec<f32>>) -> Self {
        Self {
            frames: frames.into_iter().map(Ok).collect(),
        }
    }

    /// `count` frames of constant amplitude
    pub fn constant(amplitude: f32, frame_len: usize, count: usize) -> Self {
        Self::new(vec![vec![amplitude; frame_len]; count])
    }

    pub fn then_fail(mut self, reason: impl Into<String>) -> Self {
        self.frames.push_back(Err(reason.into()));
        self
    }
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Option<Vec<f32>>, SamplerError> {
        match self.frames.pop_front() {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(reason)) => Err(SamplerError::Read(reason)),
            None => Ok(None),
        }
    }
}

/// Default PulseAudio source, 16-bit mono
#[cfg(feature = "pulse")]
pub struct PulseSource {
    simple: libpulse_simple_binding::Simple,
    buffer: Vec<u8>,
}

#[cfg(feature = "pulse")]
impl PulseSource {
    pub fn open(app_name: &str, sample_rate: u32, samples_per_frame: usize) -> Result<Self, SamplerError> {
        use libpulse_binding::sample::{Format, Spec};
        use libpulse_binding::stream::Direction;

        let spec = Spec {
            format: Format::S16le,
            channels: 1,
            rate: sample_rate,
        };
        if !spec.is_valid() {
            return Err(SamplerError::Unavailable(format!("invalid sample spec {:?}", spec)));
        }
        let simple = libpulse_simple_binding::Simple::new(
            None,
            app_name,
            Direction::Record,
            None,
            "loudness monitor",
            &spec,
            None,
            None,
        )
        .map_err(|e| SamplerError::Unavailable(e.to_string()))?;

        info!("PulseAudio capture opened at {} Hz", sample_rate);
        Ok(Self {
            simple,
            buffer: vec![0u8; samples_per_frame.max(1) * 2],
        })
    }
}

#[cfg(feature = "pulse")]
impl FrameSource for PulseSource {
    fn read_frame(&mut self) -> Result<Option<Vec<f32>>, SamplerError> {
        self.simple
            .read(&mut self.buffer)
            .map_err(|e| SamplerError::Read(e.to_string()))?;
        let pcm: Vec<i16> = self
            .buffer
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(Some(crate::level::pcm_to_f32(&pcm)))
    }

    fn is_realtime(&self) -> bool {
        true
    }
}

struct Worker {
    /// Dropped to wake the thread and ask it to exit
    shutdown: std_mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

/// Runs a [`FrameSource`] on its own thread
///
/// `stop` waits for the thread, so the source (and any device it holds) is
/// released by the time it returns.
pub struct ThreadSampler {
    factory: SourceFactory,
    interval: Duration,
    worker: Option<Worker>,
}

impl ThreadSampler {
    pub fn new(factory: SourceFactory, interval: Duration) -> Self {
        Self {
            factory,
            interval,
            worker: None,
        }
    }
}

impl Sampler for ThreadSampler {
    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<(), SamplerError> {
        self.stop();

        let source = (self.factory)()?;
        let (shutdown, shutdown_rx) = std_mpsc::channel();
        let interval = self.interval;

        let handle = std::thread::Builder::new()
            .name("sampler".to_string())
            .spawn(move || run_source(source, interval, frames, shutdown_rx))
            .map_err(|e| SamplerError::Unavailable(e.to_string()))?;

        debug!("Sampler thread started");
        self.worker = Some(Worker { shutdown, handle });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(Worker { shutdown, handle }) = self.worker.take() {
            drop(shutdown);
            // Bounded by one in-flight read
            if handle.join().is_err() {
                error!("Sampler thread panicked");
            }
            debug!("Sampler stopped, audio source released");
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for ThreadSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True once the owner asked the thread to exit.
fn shutdown_requested(shutdown: &std_mpsc::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(std_mpsc::TryRecvError::Empty))
}

/// Sleep up to `timeout`, returning early (true) on shutdown.
fn wait_for_shutdown(shutdown: &std_mpsc::Receiver<()>, timeout: Duration) -> bool {
    !matches!(
        shutdown.recv_timeout(timeout),
        Err(std_mpsc::RecvTimeoutError::Timeout)
    )
}

fn run_source(
    mut source: Box<dyn FrameSource>,
    interval: Duration,
    frames: mpsc::Sender<AudioFrame>,
    shutdown: std_mpsc::Receiver<()>,
) {
    let paced = !source.is_realtime();

    'capture: while !shutdown_requested(&shutdown) {
        let mut frame = match source.read_frame() {
            Ok(Some(samples)) => AudioFrame::new(samples),
            Ok(None) => {
                info!("Audio input exhausted");
                break;
            }
            Err(e) => {
                error!("Sampler stopped: {}", e);
                break;
            }
        };

        // Never block on a full channel: the owner may be joining us
        loop {
            match frames.try_send(frame) {
                Ok(()) => break,
                Err(mpsc::error::TrySendError::Full(pending)) => {
                    frame = pending;
                    if wait_for_shutdown(&shutdown, interval) {
                        break 'capture;
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break 'capture,
            }
        }

        if paced && wait_for_shutdown(&shutdown, interval) {
            break;
        }
    }

    drop(source);
    debug!("Sampler thread exiting");
}
