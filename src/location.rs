//! Device positioning collaborator
//!
//! The engine never blocks on location: every lookup goes through
//! [`locate_with_timeout`], which turns denial, timeouts and hardware errors
//! into `None`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MIN_WATCH_CADENCE: Duration = Duration::from_millis(100);

/// Immutable position snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    pub captured_at: DateTime<Utc>,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64, accuracy_meters: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters,
            captured_at: Utc::now(),
        }
    }

    pub fn map_link(&self) -> String {
        format!(
            "https://www.google.com/maps?q={},{}",
            self.latitude, self.longitude
        )
    }

    /// Great-circle distance in meters
    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location request timed out")]
    Timeout,

    #[error("Positioning hardware error: {0}")]
    Hardware(String),
}

/// Source of device position
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> Result<Coordinates, LocationError>;
}

/// One-shot fix bounded by `timeout`; failures degrade to `None`.
pub async fn locate_with_timeout(
    provider: &dyn LocationProvider,
    timeout: Duration,
) -> Option<Coordinates> {
    match tokio::time::timeout(timeout, provider.current_location()).await {
        Ok(Ok(coords)) => Some(coords),
        Ok(Err(e)) => {
            warn!("Location unavailable: {}", e);
            None
        }
        Err(_) => {
            warn!("Location request timed out after {}ms", timeout.as_millis());
            None
        }
    }
}

/// Continuous location updates; stops when dropped
pub struct LocationWatch {
    handle: JoinHandle<()>,
}

impl LocationWatch {
    /// Poll `provider` every `cadence` and forward each fix to `tx`.
    pub fn spawn(
        provider: Arc<dyn LocationProvider>,
        cadence: Duration,
        timeout: Duration,
        tx: mpsc::UnboundedSender<Coordinates>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence.max(MIN_WATCH_CADENCE));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(coords) = locate_with_timeout(provider.as_ref(), timeout).await {
                    debug!(lat = coords.latitude, lng = coords.longitude, "Location watch update");
                    if tx.send(coords).is_err() {
                        break;
                    }
                }
            }
        });
        Self { handle }
    }

}

impl Drop for LocationWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Static position, e.g. a configured home address
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation {
    latitude: f64,
    longitude: f64,
    accuracy_meters: f64,
}

impl FixedLocation {
    pub fn new(latitude: f64, longitude: f64, accuracy_meters: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters,
        }
    }
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> Result<Coordinates, LocationError> {
        Ok(Coordinates::new(self.latitude, self.longitude, self.accuracy_meters))
    }
}

/// Provider for devices without positioning access
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocation;

#[async_trait]
impl LocationProvider for NoLocation {
    async fn current_location(&self) -> Result<Coordinates, LocationError> {
        Err(LocationError::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NeverAnswers;

    #[async_trait]
    impl LocationProvider for NeverAnswers {
        async fn current_location(&self) -> Result<Coordinates, LocationError> {
            std::future::pending().await
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl LocationProvider for Counting {
        async fn current_location(&self) -> Result<Coordinates, LocationError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Coordinates::new(10.0 + n as f64, 20.0, 5.0))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_to_none() {
        let started = tokio::time::Instant::now();
        let loc = locate_with_timeout(&NeverAnswers, Duration::from_secs(15)).await;
        assert!(loc.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_permission_denied_degrades_to_none() {
        assert!(locate_with_timeout(&NoLocation, Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_fixed_location() {
        let loc = locate_with_timeout(&FixedLocation::new(28.6, 77.2, 12.0), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(loc.latitude, 28.6);
        assert_eq!(loc.accuracy_meters, 12.0);
        assert_eq!(loc.map_link(), "https://www.google.com/maps?q=28.6,77.2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_streams_until_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let provider = Arc::new(Counting(AtomicUsize::new(0)));
        let watch = LocationWatch::spawn(
            provider.clone(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            tx,
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.latitude, 10.0);
        assert_eq!(second.latitude, 11.0);

        drop(watch);
        // Sender lives in the aborted task; the channel closes once it is gone
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cadence_is_clamped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watch = LocationWatch::spawn(
            Arc::new(Counting(AtomicUsize::new(0))),
            Duration::ZERO,
            Duration::from_secs(1),
            tx,
        );
        assert_eq!(rx.recv().await.unwrap().latitude, 10.0);
        assert_eq!(rx.recv().await.unwrap().latitude, 11.0);
    }

    #[test]
    fn test_distance() {
        let a = Coordinates::new(0.0, 0.0, 1.0);
        let b = Coordinates::new(0.0, 1.0, 1.0);
        let d = a.distance_to(&b);
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
    }
}
