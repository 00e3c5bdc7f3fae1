//! Suraksha - loudness-triggered emergency alerts
//!
//! Samples microphone loudness, detects sustained noise and, after a
//! cancellable countdown, creates an incident and alerts the user's
//! emergency contacts and nearby community members.

#![forbid(unsafe_code)]

/// Collaborator services kept in memory, with optional JSON persistence
pub mod backend;
pub mod config;
/// Debounced threshold detection and the display latch
pub mod detector;
/// Incident creation and alert fan-out
pub mod dispatcher;
pub mod events;
pub mod incident;
/// Frame to decibel conversion
pub mod level;
pub mod location;
/// Task owning the emergency session
pub mod monitor;
pub mod notify;
/// Audio frame sources and the sampler thread
pub mod sampler;
pub mod services;
pub mod session;

pub use config::MonitorConfig;
pub use dispatcher::{AlertDispatcher, DispatchConfig};
pub use events::LifecycleEvent;
pub use monitor::{Monitor, MonitorHandle, MonitorSnapshot};
pub use session::{SessionStatus, Transition};
