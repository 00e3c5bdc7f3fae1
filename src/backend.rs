//! In-process implementation of the collaborator services
//!
//! Holds users, their contacts and the incident history in memory. When
//! opened with a path, the incident history is loaded from and written back
//! to a JSON file after every change.

use crate::incident::{IncidentId, IncidentRecord, OwnerId};
use crate::location::Coordinates;
use crate::services::{
    CommunityDirectory, Contact, ContactDirectory, Credential, IncidentStore, Member,
    ServiceError, ServiceResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Registered user known to the backend
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: OwnerId,
    pub name: String,
    pub email: String,
    pub contacts: Vec<Contact>,
    /// Last synced position, used by the community lookup
    pub location: Option<Coordinates>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: OwnerId::new(id),
            name: name.into(),
            email: email.into(),
            contacts: Vec::new(),
            location: None,
        }
    }

    pub fn with_contact(mut self, contact: Contact) -> Self {
        self.contacts.push(contact);
        self
    }

    pub fn at(mut self, location: Coordinates) -> Self {
        self.location = Some(location);
        self
    }
}

#[derive(Default)]
struct Inner {
    /// token -> user id
    sessions: HashMap<String, OwnerId>,
    users: HashMap<OwnerId, UserProfile>,
    incidents: Vec<IncidentRecord>,
}

impl Inner {
    fn owner(&self, credential: &Credential) -> ServiceResult<&UserProfile> {
        if credential.token().trim().is_empty() {
            return Err(ServiceError::Unauthenticated);
        }
        self.sessions
            .get(credential.token())
            .and_then(|id| self.users.get(id))
            .ok_or(ServiceError::InvalidToken)
    }

    fn owned_incident_mut(
        &mut self,
        owner: &OwnerId,
        id: &IncidentId,
    ) -> ServiceResult<&mut IncidentRecord> {
        self.incidents
            .iter_mut()
            .find(|i| &i.id == id && &i.owner_id == owner)
            .ok_or_else(|| ServiceError::NotFound(id.clone()))
    }
}

/// Users, contacts and incidents behind one lock
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    snapshot_path: Option<PathBuf>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            snapshot_path: None,
        }
    }

    /// Backend whose incident history persists to `path`.
    pub async fn open(path: &Path) -> ServiceResult<Self> {
        let incidents = match tokio::fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str::<Vec<IncidentRecord>>(&text)
                .map_err(|e| ServiceError::Persistence(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(ServiceError::Persistence(format!("{}: {}", path.display(), e)));
            }
        };
        info!("Loaded {} incidents from {}", incidents.len(), path.display());
        Ok(Self {
            inner: Mutex::new(Inner {
                incidents,
                ..Inner::default()
            }),
            snapshot_path: Some(path.to_path_buf()),
        })
    }

    /// Register a user and issue `token` as its session credential.
    pub async fn register(&self, user: UserProfile, token: &str) -> Credential {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(token.to_string(), user.id.clone());
        debug!(user = %user.id, "Registered user");
        inner.users.insert(user.id.clone(), user);
        Credential::bearer(token)
    }

    async fn persist(&self, incidents: &[IncidentRecord]) -> ServiceResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(incidents)
            .map_err(|e| ServiceError::Persistence(e.to_string()))?;
        tokio::fs::write(path, text)
            .await
            .map_err(|e| ServiceError::Persistence(format!("{}: {}", path.display(), e)))
    }
}

#[async_trait]
impl IncidentStore for MemoryBackend {
    async fn create_incident(
        &self,
        credential: &Credential,
        decibel_level: f32,
        location: Option<&Coordinates>,
    ) -> ServiceResult<IncidentRecord> {
        let mut inner = self.inner.lock().await;
        let owner = inner.owner(credential)?.id.clone();
        let record = IncidentRecord::new(owner, decibel_level, location);
        inner.incidents.push(record.clone());
        self.persist(&inner.incidents).await?;
        info!(incident = %record.id, owner = %record.owner_id, "Incident logged");
        Ok(record)
    }

    async fn mark_notified(
        &self,
        credential: &Credential,
        id: &IncidentId,
        contacts_notified: bool,
        notified_community: &[OwnerId],
    ) -> ServiceResult<IncidentRecord> {
        let mut inner = self.inner.lock().await;
        let owner = inner.owner(credential)?.id.clone();
        let record = inner.owned_incident_mut(&owner, id)?;
        record.contacts_notified |= contacts_notified;
        for member in notified_community {
            if !record.notified_community.contains(member) {
                record.notified_community.push(member.clone());
            }
        }
        let record = record.clone();
        self.persist(&inner.incidents).await?;
        Ok(record)
    }

    async fn resolve_incident(
        &self,
        credential: &Credential,
        id: &IncidentId,
    ) -> ServiceResult<IncidentRecord> {
        let mut inner = self.inner.lock().await;
        let owner = inner.owner(credential)?.id.clone();
        let record = inner.owned_incident_mut(&owner, id)?;
        record.resolve();
        let record = record.clone();
        self.persist(&inner.incidents).await?;
        info!(incident = %record.id, "Incident resolved");
        Ok(record)
    }

    async fn list_incidents(&self, credential: &Credential) -> ServiceResult<Vec<IncidentRecord>> {
        let inner = self.inner.lock().await;
        let owner = inner.owner(credential)?.id.clone();
        let mut history: Vec<IncidentRecord> = inner
            .incidents
            .iter()
            .filter(|i| i.owner_id == owner)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(history)
    }
}

#[async_trait]
impl ContactDirectory for MemoryBackend {
    async fn contacts(&self, credential: &Credential) -> ServiceResult<Vec<Contact>> {
        let inner = self.inner.lock().await;
        Ok(inner.owner(credential)?.contacts.clone())
    }

    async fn owner_name(&self, credential: &Credential) -> ServiceResult<String> {
        let inner = self.inner.lock().await;
        Ok(inner.owner(credential)?.name.clone())
    }
}

#[async_trait]
impl CommunityDirectory for MemoryBackend {
    async fn nearby_members(
        &self,
        credential: &Credential,
        around: &Coordinates,
    ) -> ServiceResult<Vec<Member>> {
        let inner = self.inner.lock().await;
        let owner = inner.owner(credential)?.id.clone();
        let mut members: Vec<Member> = inner
            .users
            .values()
            .filter(|u| u.id != owner)
            .filter_map(|u| {
                u.location.as_ref().map(|loc| Member {
                    id: u.id.clone(),
                    name: u.name.clone(),
                    email: u.email.clone(),
                    distance_meters: around.distance_to(loc),
                })
            })
            .collect();
        members.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
        Ok(members)
    }
}
