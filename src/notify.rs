//! Notification sending and alert message composition

use crate::location::Coordinates;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NotifyError {
    #[error("Delivery to {address} failed: {reason}")]
    Delivery { address: String, reason: String },

    #[error("Delivery to {0} timed out")]
    Timeout(String),
}

/// Outbound message channel (email, SMS gateway, ...)
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Rendered alert, identical for every recipient of one dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
}

impl AlertMessage {
    pub fn emergency(
        owner_name: &str,
        decibel_level: f32,
        location: Option<&Coordinates>,
        at: DateTime<Utc>,
    ) -> Self {
        let subject = format!("EMERGENCY: Help {}!", owner_name);

        let mut body = String::new();
        body.push_str("EMERGENCY ALERT\n\n");
        body.push_str(&format!("{} has triggered an emergency alert!\n", owner_name));
        body.push_str(&format!("Decibel Level: {:.1} dB\n", decibel_level));
        match location {
            Some(loc) => {
                body.push_str(&format!("Location: {}\n", loc.map_link()));
                body.push_str(&format!(
                    "Coordinates: {}, {} (Accuracy: {:.0}m)\n",
                    loc.latitude, loc.longitude, loc.accuracy_meters
                ));
            }
            None => body.push_str("Location: unavailable\n"),
        }
        body.push_str(&format!("Time: {}\n", at.format("%Y-%m-%d %H:%M:%S UTC")));

        Self { subject, body }
    }

    /// Variant sent to nearby community members
    pub fn community(owner_name: &str, distance_meters: f64, location: &Coordinates) -> Self {
        Self {
            subject: format!("Someone near you needs help: {}", owner_name),
            body: format!(
                "{} triggered an emergency alert about {:.1} km from you.\nLocation: {}\n",
                owner_name,
                distance_meters / 1000.0,
                location.map_link()
            ),
        }
    }
}

/// Writes alerts to the log instead of delivering them
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        if address.trim().is_empty() {
            warn!("Refusing to send alert without an address");
            return Err(NotifyError::Delivery {
                address: address.to_string(),
                reason: "empty address".to_string(),
            });
        }
        info!(to = address, subject, "📨 Alert delivered");
        for line in body.lines() {
            info!(to = address, "    {}", line);
        }
        Ok(())
    }
}
