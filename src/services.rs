//! Contracts of the external services the engine consumes
//!
//! Persistence, the contact list and the community lookup all sit behind a
//! session credential. Implementations live elsewhere (see
//! [`crate::backend::MemoryBackend`]); the engine only sees these traits.

use crate::incident::{IncidentId, IncidentRecord, OwnerId};
use crate::location::Coordinates;
use async_trait::async_trait;
use std::fmt;

/// Opaque bearer token carried by every authenticated call
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

// Tokens stay out of logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Error type for collaborator calls
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("Unauthenticated")]
    Unauthenticated,

    #[error("Token invalid")]
    InvalidToken,

    #[error("Incident {0} not found")]
    NotFound(IncidentId),

    #[error("Request timed out")]
    Timeout,

    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl ServiceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthenticated | Self::InvalidToken)
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Resolve the credential of a call, rejecting a missing one.
pub fn require(credential: Option<&Credential>) -> ServiceResult<&Credential> {
    credential.ok_or(ServiceError::Unauthenticated)
}

/// Emergency contact as stored in the user's profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub phone: Option<String>,
    pub email: String,
}

impl Contact {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: None,
            email: email.into(),
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Address notifications are sent to, if any
    pub fn address(&self) -> Option<&str> {
        let email = self.email.trim();
        (!email.is_empty()).then_some(email)
    }
}

/// Another registered user near the incident
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: OwnerId,
    pub name: String,
    pub email: String,
    pub distance_meters: f64,
}

/// Incident persistence
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn create_incident(
        &self,
        credential: &Credential,
        decibel_level: f32,
        location: Option<&Coordinates>,
    ) -> ServiceResult<IncidentRecord>;

    /// Record whether contacts were alerted and which community members were reached
    async fn mark_notified(
        &self,
        credential: &Credential,
        id: &IncidentId,
        contacts_notified: bool,
        notified_community: &[OwnerId],
    ) -> ServiceResult<IncidentRecord>;

    async fn resolve_incident(
        &self,
        credential: &Credential,
        id: &IncidentId,
    ) -> ServiceResult<IncidentRecord>;

    /// Most recent first
    async fn list_incidents(&self, credential: &Credential) -> ServiceResult<Vec<IncidentRecord>>;
}

/// Contact list of the session owner
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn contacts(&self, credential: &Credential) -> ServiceResult<Vec<Contact>>;

    /// Display name used in alert messages
    async fn owner_name(&self, credential: &Credential) -> ServiceResult<String>;
}

/// Lookup of other users around a position
#[async_trait]
pub trait CommunityDirectory: Send + Sync {
    async fn nearby_members(
        &self,
        credential: &Credential,
        around: &Coordinates,
    ) -> ServiceResult<Vec<Member>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_address() {
        assert_eq!(Contact::new("Asha", " asha@example.com ").address(), Some("asha@example.com"));
        assert_eq!(Contact::new("Ravi", "").with_phone("+91 98").address(), None);
    }

    #[test]
    fn test_credential_debug_hides_token() {
        let cred = Credential::bearer("secret-token");
        assert!(!format!("{cred:?}").contains("secret"));
        assert_eq!(cred.token(), "secret-token");
    }

    #[test]
    fn test_require_rejects_missing() {
        assert_eq!(require(None).unwrap_err(), ServiceError::Unauthenticated);
        assert!(ServiceError::InvalidToken.is_auth());
        assert!(!ServiceError::Timeout.is_auth());
    }
}
