//! Event and message types shared between the sampler, the monitor and callers

use crate::incident::IncidentId;
use crate::location::Coordinates;
use std::time::Instant;

/// Raw amplitude frame produced by the sampler (samples in [-1, 1])
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub timestamp: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            timestamp: Instant::now(),
        }
    }
}

/// One calibrated reading, consumed once by the detector
#[derive(Debug, Clone, Copy)]
pub struct LoudnessSample {
    pub timestamp: Instant,
    /// RMS of the frame before gain
    pub raw_amplitude: f32,
    pub calibrated_db: f32,
}

/// Lifecycle notifications broadcast by the monitor
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    MonitoringStarted,
    MonitoringStopped,
    /// Sustained noise detected, countdown running
    Warning { countdown_seconds: u32 },
    CountdownTick { remaining: u32 },
    /// User cancelled the countdown
    Cancelled,
    Triggered { manual: bool },
    Sent {
        incident_id: IncidentId,
        contacts_attempted: usize,
        contacts_failed: usize,
    },
    Failed { reason: String },
    Resolved { incident_id: IncidentId },
    /// Resolve call failed; the incident stays open
    ResolveFailed { reason: String },
    LocationUpdated(Coordinates),
    /// Audio input could not be opened or died
    SamplerUnavailable { reason: String },
    Dismissed,
}
