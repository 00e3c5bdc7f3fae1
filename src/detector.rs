//! Trigger debounce and display latch
//!
//! Two independent smoothing mechanisms over the calibrated level:
//!
//! - [`ThresholdDetector`] decides when the emergency countdown starts. It
//!   needs `required_consecutive_frames` loud frames in a row, fires once, and
//!   starts counting again from zero. Any quiet frame resets the run.
//! - [`DisplayLatch`] only smooths the on-screen "loud" indicator. It holds
//!   while the level stays within 5 dB below the threshold and never feeds the
//!   state machine.

use tracing::debug;

/// Band below the threshold in which the display latch holds
pub const DISPLAY_HYSTERESIS_DB: f32 = 5.0;

/// Debounce state, owned by the detector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionState {
    pub consecutive_loud_frames: u32,
    /// True only on the frame that completed a run
    pub is_sustained: bool,
}

/// Outcome of feeding one level into the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Quiet,
    /// Loud, run in progress
    Loud { run: u32 },
    /// Run completed; counter has been reset
    Sustained,
}

/// Consecutive-frame debounce with edge-triggered output
#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    threshold_db: f32,
    required_consecutive_frames: u32,
    state: DetectionState,
}

impl ThresholdDetector {
    pub fn new(threshold_db: f32, required_consecutive_frames: u32) -> Self {
        debug_assert!(required_consecutive_frames > 0);
        Self {
            threshold_db,
            required_consecutive_frames: required_consecutive_frames.max(1),
            state: DetectionState::default(),
        }
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }

    /// Runtime threshold change; the current run is kept.
    pub fn set_threshold(&mut self, threshold_db: f32) {
        self.threshold_db = threshold_db;
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = DetectionState::default();
    }

    /// Feed one calibrated level.
    pub fn push(&mut self, calibrated_db: f32) -> Detection {
        if calibrated_db >= self.threshold_db {
            self.state.consecutive_loud_frames += 1;
            if self.state.consecutive_loud_frames >= self.required_consecutive_frames {
                debug!(
                    run = self.state.consecutive_loud_frames,
                    db = calibrated_db,
                    "Sustained loud condition"
                );
                self.state = DetectionState {
                    consecutive_loud_frames: 0,
                    is_sustained: true,
                };
                return Detection::Sustained;
            }
            self.state.is_sustained = false;
            Detection::Loud {
                run: self.state.consecutive_loud_frames,
            }
        } else {
            self.state = DetectionState::default();
            Detection::Quiet
        }
    }
}

/// UI-only hysteresis latch
#[derive(Debug, Clone)]
pub struct DisplayLatch {
    threshold_db: f32,
    latched: bool,
}

impl DisplayLatch {
    pub fn new(threshold_db: f32) -> Self {
        Self {
            threshold_db,
            latched: false,
        }
    }

    pub fn set_threshold(&mut self, threshold_db: f32) {
        self.threshold_db = threshold_db;
    }

    pub fn update(&mut self, calibrated_db: f32) -> bool {
        self.latched = calibrated_db > self.threshold_db
            || (self.latched && calibrated_db > self.threshold_db - DISPLAY_HYSTERESIS_DB);
        self.latched
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    pub fn reset(&mut self) {
        self.latched = false;
    }
}
