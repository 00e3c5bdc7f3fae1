//! Incident records as persisted by the incident store

use crate::location::Coordinates;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(String);

impl IncidentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IncidentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a registered user (incident owner or community member)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Triggered,
    Resolved,
}

/// Persisted location layout
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IncidentLocation {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
}

impl From<&Coordinates> for IncidentLocation {
    fn from(c: &Coordinates) -> Self {
        Self {
            lat: c.latitude,
            lng: c.longitude,
            accuracy: c.accuracy_meters,
        }
    }
}

/// One emergency, from trigger to resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRecord {
    pub id: IncidentId,
    pub owner_id: OwnerId,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// `None` when no position could be obtained at trigger time
    pub location: Option<IncidentLocation>,
    pub decibel_level: f32,
    pub status: IncidentStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub contacts_notified: bool,
    #[serde(default)]
    pub notified_community: Vec<OwnerId>,
}

impl IncidentRecord {
    pub fn new(owner_id: OwnerId, decibel_level: f32, location: Option<&Coordinates>) -> Self {
        Self {
            id: IncidentId::generate(),
            owner_id,
            created_at: Utc::now(),
            location: location.map(IncidentLocation::from),
            decibel_level,
            status: IncidentStatus::Triggered,
            resolved_at: None,
            contacts_notified: false,
            notified_community: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == IncidentStatus::Resolved
    }

    /// Mark resolved; a second call keeps the first resolution time.
    pub fn resolve(&mut self) {
        if self.is_resolved() {
            return;
        }
        let now = Utc::now();
        self.status = IncidentStatus::Resolved;
        // Clock steps must not produce a resolution before creation
        self.resolved_at = Some(now.max(self.created_at));
    }
}
