//! Emergency session state machine
//!
//! Pure transition table: every input is a [`SessionEvent`], every side
//! effect the transition asks for is queued as an [`Effect`] and handed to
//! the caller through [`EmergencyStateMachine::drain_effects`]. Nothing here
//! touches a clock, a channel or the network.

use crate::events::LifecycleEvent;
use crate::incident::IncidentId;
use crate::location::Coordinates;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Decibel level recorded when no reading is available (manual SOS from idle)
pub const FALLBACK_DECIBEL_LEVEL: f32 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Monitoring,
    /// Countdown running
    Warning,
    /// Dispatch in flight
    Triggered,
    Sent,
    Failed,
    Resolved,
}

/// The one session of this device
#[derive(Debug, Clone, PartialEq)]
pub struct EmergencySession {
    pub status: SessionStatus,
    pub countdown_remaining: u32,
    pub trigger_is_manual: bool,
    pub last_known_location: Option<Coordinates>,
    pub incident_id: Option<IncidentId>,
    pub last_db: f32,
    pub last_error: Option<String>,
    /// Bumped whenever a countdown starts or ends
    pub generation: u64,
    pub resolving: bool,
}

impl Default for EmergencySession {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            countdown_remaining: 0,
            trigger_is_manual: false,
            last_known_location: None,
            incident_id: None,
            last_db: 0.0,
            last_error: None,
            generation: 0,
            resolving: false,
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StartMonitoring,
    StopMonitoring,
    /// Latest calibrated reading
    Level { db: f32 },
    /// Detector reported sustained noise
    Sustained { db: f32 },
    /// Countdown tick of the countdown tagged `generation`
    Tick { generation: u64 },
    Cancel,
    ManualSos,
    DispatchSucceeded {
        incident_id: IncidentId,
        contacts_attempted: usize,
        contacts_failed: usize,
    },
    DispatchFailed { reason: String },
    Retry,
    MarkSafe,
    ResolveSucceeded,
    ResolveFailed { reason: String },
    Dismiss,
    LocationUpdated(Coordinates),
}

/// Work requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartSampling,
    StopSampling,
    ResetDetector,
    StartCountdown { generation: u64, seconds: u32 },
    StopCountdown,
    Dispatch {
        manual: bool,
        decibel_level: f32,
        last_known_location: Option<Coordinates>,
    },
    Resolve { incident_id: IncidentId },
    StartLocationWatch,
    StopLocationWatch,
    Emit(LifecycleEvent),
}

/// Whether an event changed the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored,
}

pub struct EmergencyStateMachine {
    session: EmergencySession,
    countdown_seconds: u32,
    /// Effects queue (drained after each event)
    effects: Vec<Effect>,
}

impl EmergencyStateMachine {
    pub fn new(countdown_seconds: u32) -> Self {
        Self {
            session: EmergencySession::default(),
            countdown_seconds: countdown_seconds.max(1),
            effects: Vec::new(),
        }
    }

    pub fn session(&self) -> &EmergencySession {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Apply one event. Events that are not valid in the current state leave
    /// the session untouched and queue no effects.
    pub fn on_event(&mut self, event: SessionEvent) -> Transition {
        use SessionEvent as E;
        use SessionStatus as S;

        match (self.session.status, event) {
            // ===== MONITORING LIFECYCLE =====
            (S::Idle, E::StartMonitoring) => {
                info!("🎙️ Monitoring started");
                self.session.status = S::Monitoring;
                self.effects.push(Effect::StartSampling);
                self.effects.push(Effect::ResetDetector);
                self.emit(LifecycleEvent::MonitoringStarted);
            }

            (S::Monitoring | S::Warning, E::StopMonitoring) => {
                if self.session.status == S::Warning {
                    self.end_countdown();
                }
                info!("Monitoring stopped");
                self.clear();
                self.effects.push(Effect::StopSampling);
                self.emit(LifecycleEvent::MonitoringStopped);
            }

            (S::Monitoring | S::Warning, E::Level { db }) => {
                self.session.last_db = db;
            }

            // ===== DETECTION =====
            (S::Monitoring, E::Sustained { db }) => {
                self.session.last_db = db;
                self.session.generation += 1;
                self.session.countdown_remaining = self.countdown_seconds;
                self.session.status = S::Warning;
                warn!(
                    db,
                    countdown = self.countdown_seconds,
                    "⚠️ Sustained noise detected, countdown started"
                );
                self.effects.push(Effect::StartCountdown {
                    generation: self.session.generation,
                    seconds: self.countdown_seconds,
                });
                self.emit(LifecycleEvent::Warning {
                    countdown_seconds: self.countdown_seconds,
                });
            }

            // ===== COUNTDOWN =====
            (S::Warning, E::Tick { generation }) if generation == self.session.generation => {
                debug_assert!(self.session.countdown_remaining > 0);
                self.session.countdown_remaining = self.session.countdown_remaining.saturating_sub(1);
                let remaining = self.session.countdown_remaining;
                self.emit(LifecycleEvent::CountdownTick { remaining });
                if remaining == 0 {
                    self.end_countdown();
                    self.trigger(false);
                }
            }

            (S::Warning, E::Cancel) => {
                self.end_countdown();
                self.session.status = S::Monitoring;
                info!("Countdown cancelled by user");
                self.effects.push(Effect::ResetDetector);
                self.emit(LifecycleEvent::Cancelled);
            }

            // ===== MANUAL SOS =====
            (S::Idle | S::Monitoring | S::Warning, E::ManualSos) => {
                if self.session.status == S::Warning {
                    self.end_countdown();
                }
                self.trigger(true);
            }

            // ===== DISPATCH =====
            (
                S::Triggered,
                E::DispatchSucceeded {
                    incident_id,
                    contacts_attempted,
                    contacts_failed,
                },
            ) => {
                info!(incident = %incident_id, contacts_attempted, contacts_failed, "Alert sent");
                self.session.status = S::Sent;
                self.session.incident_id = Some(incident_id.clone());
                self.session.last_error = None;
                self.emit(LifecycleEvent::Sent {
                    incident_id,
                    contacts_attempted,
                    contacts_failed,
                });
            }

            (S::Triggered, E::DispatchFailed { reason }) => {
                warn!("Alert dispatch failed: {}", reason);
                self.session.status = S::Failed;
                self.session.last_error = Some(reason.clone());
                self.effects.push(Effect::StopLocationWatch);
                self.emit(LifecycleEvent::Failed { reason });
            }

            (S::Failed, E::Retry) => {
                info!("Retrying alert dispatch");
                let manual = self.session.trigger_is_manual;
                self.trigger(manual);
            }

            // ===== RESOLUTION =====
            (S::Sent, E::MarkSafe) if !self.session.resolving => {
                let Some(incident_id) = self.session.incident_id.clone() else {
                    debug_assert!(false, "Sent session without an incident id");
                    return Transition::Ignored;
                };
                self.session.resolving = true;
                self.effects.push(Effect::Resolve { incident_id });
            }

            (S::Sent, E::ResolveSucceeded) if self.session.resolving => {
                self.session.resolving = false;
                self.session.status = S::Resolved;
                self.session.last_error = None;
                self.effects.push(Effect::StopSampling);
                self.effects.push(Effect::StopLocationWatch);
                if let Some(incident_id) = self.session.incident_id.clone() {
                    info!(incident = %incident_id, "✅ Incident resolved");
                    self.emit(LifecycleEvent::Resolved { incident_id });
                }
            }

            (S::Sent, E::ResolveFailed { reason }) if self.session.resolving => {
                warn!("Could not resolve incident: {}", reason);
                self.session.resolving = false;
                self.session.last_error = Some(reason.clone());
                self.emit(LifecycleEvent::ResolveFailed { reason });
            }

            (S::Resolved | S::Failed, E::Dismiss) => {
                self.clear();
                self.effects.push(Effect::StopSampling);
                self.effects.push(Effect::StopLocationWatch);
                self.emit(LifecycleEvent::Dismissed);
            }

            // ===== LOCATION =====
            (_, E::LocationUpdated(coords)) => {
                self.session.last_known_location = Some(coords);
                self.emit(LifecycleEvent::LocationUpdated(coords));
            }

            (status, event) => {
                debug!(?status, ?event, "Ignoring event");
                return Transition::Ignored;
            }
        }
        Transition::Applied
    }

    fn trigger(&mut self, manual: bool) {
        self.session.status = SessionStatus::Triggered;
        self.session.trigger_is_manual = manual;
        self.session.incident_id = None;
        self.session.last_error = None;

        let decibel_level = if self.session.last_db > 0.0 {
            self.session.last_db
        } else {
            FALLBACK_DECIBEL_LEVEL
        };
        warn!(manual, db = decibel_level, "🚨 Emergency triggered");
        self.effects.push(Effect::StartLocationWatch);
        self.effects.push(Effect::Dispatch {
            manual,
            decibel_level,
            last_known_location: self.session.last_known_location,
        });
        self.emit(LifecycleEvent::Triggered { manual });
    }

    /// Invalidate the running countdown; ticks still in flight no longer match.
    fn end_countdown(&mut self) {
        self.session.generation += 1;
        self.session.countdown_remaining = 0;
        self.effects.push(Effect::StopCountdown);
    }

    fn clear(&mut self) {
        let generation = self.session.generation;
        let last_known_location = self.session.last_known_location;
        self.session = EmergencySession {
            generation,
            last_known_location,
            ..EmergencySession::default()
        };
    }

    fn emit(&mut self, event: LifecycleEvent) {
        self.effects.push(Effect::Emit(event));
    }
}
