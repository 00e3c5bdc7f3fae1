//! Loudness estimation
//!
//! Turns a raw amplitude frame into a calibrated, decibel-like scalar:
//! gain, RMS, `20·log10(rms) + offset`, clamped at zero.

use crate::events::{AudioFrame, LoudnessSample};

/// Converts raw frames into calibrated levels. Stateless.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelEstimator {
    gain: f32,
    offset_db: f32,
}

impl Default for LevelEstimator {
    fn default() -> Self {
        Self::new(50.0, 100.0)
    }
}

impl LevelEstimator {
    pub fn new(gain: f32, offset_db: f32) -> Self {
        debug_assert!(gain > 0.0, "gain must be positive");
        Self { gain, offset_db }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Calibrated level of a frame of samples in [-1, 1].
    ///
    /// Silence (and an empty frame) maps to `0.0`, never `-inf`.
    pub fn estimate(&self, frame: &[f32]) -> f32 {
        let rms = rms(frame.iter().map(|&s| s * self.gain));
        self.to_db(rms)
    }

    /// Same as [`estimate`](Self::estimate) for 16-bit PCM.
    pub fn estimate_pcm(&self, pcm: &[i16]) -> f32 {
        let rms = rms(pcm.iter().map(|&s| (s as f32 / 32768.0) * self.gain));
        self.to_db(rms)
    }

    /// Build the sample record the detector consumes.
    pub fn sample(&self, frame: &AudioFrame) -> LoudnessSample {
        LoudnessSample {
            timestamp: frame.timestamp,
            raw_amplitude: rms(frame.samples.iter().copied()),
            calibrated_db: self.estimate(&frame.samples),
        }
    }

    fn to_db(&self, rms: f32) -> f32 {
        if rms <= 0.0 || !rms.is_finite() {
            return 0.0;
        }
        let db = 20.0 * rms.log10() + self.offset_db;
        if db.is_nan() || db < 0.0 {
            0.0
        } else {
            db
        }
    }
}

fn rms(samples: impl ExactSizeIterator<Item = f32>) -> f32 {
    let n = samples.len();
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = samples.map(|s| (s as f64) * (s as f64)).sum();
    (sum / n as f64).sqrt() as f32
}

/// Convert 16-bit PCM into normalized float samples
pub fn pcm_to_f32(pcm: &[i16]) -> Vec<f32> {
    pcm.iter().map(|&s| s as f32 / 32768.0).collect()
}
