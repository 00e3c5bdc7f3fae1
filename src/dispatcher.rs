//! Alert dispatch: incident creation and notification fan-out
//!
//! A dispatch either fails as a whole (the incident could not be created, or
//! the credential was rejected) or succeeds with a [`DispatchReport`] that
//! lists what happened to every recipient. Individual send failures never
//! fail the dispatch.

use crate::config::MonitorConfig;
use crate::incident::{IncidentId, IncidentRecord, OwnerId};
use crate::location::{locate_with_timeout, Coordinates, LocationProvider};
use crate::notify::{AlertMessage, NotifyError, Notifier};
use crate::services::{
    require, CommunityDirectory, Contact, ContactDirectory, Credential, IncidentStore, Member,
    ServiceError,
};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Error type for a dispatch that could not create its incident
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Authentication failed: {0}")]
    Authentication(ServiceError),

    #[error("Incident could not be persisted: {0}")]
    Persistence(ServiceError),
}

impl From<ServiceError> for DispatchError {
    fn from(e: ServiceError) -> Self {
        if e.is_auth() {
            DispatchError::Authentication(e)
        } else {
            DispatchError::Persistence(e)
        }
    }
}

/// What the state machine hands over when it enters Triggered
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub credential: Option<Credential>,
    pub decibel_level: f32,
    pub manual: bool,
    /// Fallback when a fresh fix cannot be obtained in time
    pub last_known_location: Option<Coordinates>,
}

/// Result of one send attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ContactOutcome {
    pub name: String,
    pub address: String,
    pub result: Result<(), NotifyError>,
}

impl ContactOutcome {
    pub fn delivered(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub incident: IncidentRecord,
    pub location: Option<Coordinates>,
    pub contacts: Vec<ContactOutcome>,
    /// Community members that were reached
    pub community: Vec<OwnerId>,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.contacts.len()
    }

    pub fn failed(&self) -> usize {
        self.contacts.iter().filter(|c| !c.delivered()).count()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub location_timeout: Duration,
    pub send_timeout: Duration,
    pub notify_community: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

impl From<&MonitorConfig> for DispatchConfig {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            location_timeout: cfg.location_timeout(),
            send_timeout: cfg.send_timeout(),
            notify_community: cfg.notify_community,
        }
    }
}

/// Creates incidents and fans alerts out to contacts and nearby members
pub struct AlertDispatcher {
    config: DispatchConfig,
    store: Arc<dyn IncidentStore>,
    contacts: Arc<dyn ContactDirectory>,
    community: Option<Arc<dyn CommunityDirectory>>,
    notifier: Arc<dyn Notifier>,
    location: Arc<dyn LocationProvider>,
}

impl AlertDispatcher {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn IncidentStore>,
        contacts: Arc<dyn ContactDirectory>,
        notifier: Arc<dyn Notifier>,
        location: Arc<dyn LocationProvider>,
    ) -> Self {
        Self {
            config,
            store,
            contacts,
            community: None,
            notifier,
            location,
        }
    }

    pub fn with_community(mut self, community: Arc<dyn CommunityDirectory>) -> Self {
        self.community = Some(community);
        self
    }

    pub fn location_provider(&self) -> &Arc<dyn LocationProvider> {
        &self.location
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReport, DispatchError> {
        let credential = require(request.credential.as_ref())?;

        // 1. Location, best effort
        let location = locate_with_timeout(self.location.as_ref(), self.config.location_timeout)
            .await
            .or(request.last_known_location);
        if location.is_none() {
            warn!("Dispatching without a location");
        }

        // 2. Incident record
        let mut incident = self
            .store
            .create_incident(credential, request.decibel_level, location.as_ref())
            .await
            .map_err(|e| {
                error!("Failed to create incident: {}", e);
                DispatchError::from(e)
            })?;
        info!(
            incident = %incident.id,
            manual = request.manual,
            db = request.decibel_level,
            "🚨 Incident created"
        );

        // 3. Contacts and sender name; failures here only shrink the fan-out
        let owner_name = match self.contacts.owner_name(credential).await {
            Ok(name) => name,
            Err(e) => {
                warn!("Could not fetch owner name: {}", e);
                "A Suraksha user".to_string()
            }
        };
        let contacts = match self.contacts.contacts(credential).await {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!(incident = %incident.id, "Could not fetch contacts: {}", e);
                Vec::new()
            }
        };

        // 4. Fan-out
        let message = AlertMessage::emergency(
            &owner_name,
            request.decibel_level,
            location.as_ref(),
            incident.created_at,
        );
        let outcomes = self.notify_contacts(&contacts, &message).await;

        // 5. Community, best effort
        let community = match (&self.community, &location) {
            (Some(directory), Some(loc)) if self.config.notify_community => {
                self.notify_community(directory.as_ref(), credential, &owner_name, loc)
                    .await
            }
            _ => Vec::new(),
        };

        // Attempted, not delivered: a non-empty recipient list is enough
        let contacts_notified = !outcomes.is_empty();
        if contacts_notified || !community.is_empty() {
            match self
                .store
                .mark_notified(credential, &incident.id, contacts_notified, &community)
                .await
            {
                Ok(updated) => incident = updated,
                Err(e) => {
                    error!(incident = %incident.id, "Failed to record notification status: {}", e);
                }
            }
        }

        let report = DispatchReport {
            incident,
            location,
            contacts: outcomes,
            community,
        };
        info!(
            incident = %report.incident.id,
            attempted = report.attempted(),
            failed = report.failed(),
            community = report.community.len(),
            "Dispatch complete"
        );
        Ok(report)
    }

    /// Close an incident owned by the credential's user.
    pub async fn resolve(
        &self,
        credential: Option<&Credential>,
        incident_id: &IncidentId,
    ) -> Result<IncidentRecord, DispatchError> {
        let credential = require(credential)?;
        let record = self.store.resolve_incident(credential, incident_id).await?;
        Ok(record)
    }

    pub async fn history(&self, credential: Option<&Credential>) -> Result<Vec<IncidentRecord>, DispatchError> {
        let credential = require(credential)?;
        Ok(self.store.list_incidents(credential).await?)
    }

    async fn notify_contacts(&self, contacts: &[Contact], message: &AlertMessage) -> Vec<ContactOutcome> {
        let sends = contacts.iter().filter_map(|contact| {
            let address = contact.address()?.to_string();
            Some(async move {
                let result = self.send_bounded(&address, message).await;
                if let Err(e) = &result {
                    warn!(contact = %contact.name, "Alert not delivered: {}", e);
                }
                ContactOutcome {
                    name: contact.name.clone(),
                    address,
                    result,
                }
            })
        });
        join_all(sends).await
    }

    async fn notify_community(
        &self,
        directory: &dyn CommunityDirectory,
        credential: &Credential,
        owner_name: &str,
        location: &Coordinates,
    ) -> Vec<OwnerId> {
        let members = match directory.nearby_members(credential, location).await {
            Ok(members) => members,
            Err(e) => {
                warn!("Community lookup failed: {}", e);
                return Vec::new();
            }
        };

        let sends = members.iter().filter(|m| !m.email.trim().is_empty()).map(|member: &Member| async move {
            let message = AlertMessage::community(owner_name, member.distance_meters, location);
            self.send_bounded(&member.email, &message)
                .await
                .ok()
                .map(|_| member.id.clone())
        });
        join_all(sends).await.into_iter().flatten().collect()
    }

    async fn send_bounded(&self, address: &str, message: &AlertMessage) -> Result<(), NotifyError> {
        match tokio::time::timeout(
            self.config.send_timeout,
            self.notifier.send(address, &message.subject, &message.body),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(address.to_string())),
        }
    }
}
