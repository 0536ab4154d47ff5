//! Persistence interface used by the poller, plus an in-memory implementation

use crate::errors::{PollerError, Result};
use crate::incident::{ActiveIncident, Incident, IncidentId, IncidentStatus, NewIncident};
use crate::metrics::MetricPoint;
use crate::service::{Service, ServiceId};
use crate::severity::Severity;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::debug;

/// Storage for services, incidents and metric points.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Enabled services with `since_last_update_secs` filled in at read time.
    async fn list_enabled_services(&self) -> Result<Vec<Service>>;

    /// Persist the new severity and downtime; also refreshes the update time.
    async fn update_service(&self, id: ServiceId, severity: Severity, downtime_secs: u64) -> Result<()>;

    /// The service's open or watching incident, if any.
    async fn find_active_incident(&self, service_id: ServiceId) -> Result<Option<ActiveIncident>>;

    async fn create_incident(&self, service_id: ServiceId, incident: &NewIncident) -> Result<IncidentId>;

    /// Move an incident to `status`, replacing its message when one is given.
    async fn update_incident_status(
        &self,
        incident_id: IncidentId,
        status: IncidentStatus,
        message: Option<&str>,
    ) -> Result<()>;

    async fn insert_metric_point(&self, point: &MetricPoint) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredService {
    service: Service,
    updated_at: DateTime<Utc>,
}

/// Repository kept in process memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    services: RwLock<Vec<StoredService>>,
    incidents: RwLock<Vec<Incident>>,
    points: RwLock<Vec<MetricPoint>>,
    failing: RwLock<HashSet<ServiceId>>,
    incident_failures: RwLock<HashSet<ServiceId>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_services(services: Vec<Service>) -> Self {
        let now = Utc::now();
        Self {
            services: RwLock::new(
                services
                    .into_iter()
                    .map(|service| StoredService {
                        updated_at: now - Duration::seconds(service.since_last_update_secs as i64),
                        service,
                    })
                    .collect(),
            ),
            ..Self::default()
        }
    }

    /// Pretend `secs` seconds of wall-clock time passed for every record.
    pub async fn advance(&self, secs: u64) {
        let delta = Duration::seconds(secs as i64);

        for stored in self.services.write().await.iter_mut() {
            stored.updated_at -= delta;
        }

        for incident in self.incidents.write().await.iter_mut() {
            incident.created_at -= delta;
            incident.updated_at -= delta;
        }
    }

    /// Make every write touching this service fail.
    pub async fn fail_writes_for(&self, service_id: ServiceId) {
        self.failing.write().await.insert(service_id);
    }

    /// Make the next incident creation for this service fail once.
    pub async fn fail_next_incident_for(&self, service_id: ServiceId) {
        self.incident_failures.write().await.insert(service_id);
    }

    pub async fn service(&self, id: ServiceId) -> Option<Service> {
        self.services
            .read()
            .await
            .iter()
            .find(|stored| stored.service.id == id)
            .map(|stored| stored.service.clone())
    }

    pub async fn incidents_for(&self, service_id: ServiceId) -> Vec<Incident> {
        self.incidents
            .read()
            .await
            .iter()
            .filter(|incident| incident.service_id == service_id)
            .cloned()
            .collect()
    }

    pub async fn metric_points(&self) -> Vec<MetricPoint> {
        self.points.read().await.clone()
    }

    async fn ensure_writable(&self, service_id: ServiceId) -> Result<()> {
        if self.failing.read().await.contains(&service_id) {
            return Err(PollerError::Repository(format!(
                "writes for service {} are failing",
                service_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn list_enabled_services(&self) -> Result<Vec<Service>> {
        let now = Utc::now();

        Ok(self
            .services
            .read()
            .await
            .iter()
            .filter(|stored| stored.service.enabled)
            .map(|stored| Service {
                since_last_update_secs: (now - stored.updated_at).num_seconds().max(0) as u64,
                ..stored.service.clone()
            })
            .collect())
    }

    async fn update_service(&self, id: ServiceId, severity: Severity, downtime_secs: u64) -> Result<()> {
        self.ensure_writable(id).await?;

        let mut services = self.services.write().await;
        let stored = services
            .iter_mut()
            .find(|stored| stored.service.id == id)
            .ok_or_else(|| PollerError::Repository(format!("unknown service {}", id)))?;

        stored.service.severity = severity;
        stored.service.downtime_secs = downtime_secs;
        stored.updated_at = Utc::now();

        debug!(service_id = id, %severity, downtime_secs, "Stored service state");
        Ok(())
    }

    async fn find_active_incident(&self, service_id: ServiceId) -> Result<Option<ActiveIncident>> {
        let now = Utc::now();

        Ok(self
            .incidents
            .read()
            .await
            .iter()
            .filter(|incident| incident.service_id == service_id && incident.status.is_active())
            .max_by_key(|incident| incident.updated_at)
            .map(|incident| ActiveIncident {
                id: incident.id,
                status: incident.status,
                secs_since_update: (now - incident.updated_at).num_seconds().max(0) as u64,
            }))
    }

    async fn create_incident(&self, service_id: ServiceId, incident: &NewIncident) -> Result<IncidentId> {
        self.ensure_writable(service_id).await?;

        if self.incident_failures.write().await.remove(&service_id) {
            return Err(PollerError::Repository(format!(
                "incident insert for service {} rejected",
                service_id
            )));
        }

        let mut incidents = self.incidents.write().await;
        if incidents
            .iter()
            .any(|existing| existing.service_id == service_id && existing.status.is_active())
        {
            return Err(PollerError::Repository(format!(
                "service {} already has an active incident",
                service_id
            )));
        }

        let id = incidents.len() as IncidentId + 1;
        let now = Utc::now();
        incidents.push(Incident {
            id,
            service_id,
            title: incident.title.clone(),
            message: incident.message.clone(),
            visible: incident.visible,
            status: IncidentStatus::Open,
            created_at: now,
            updated_at: now,
        });

        Ok(id)
    }

    async fn update_incident_status(
        &self,
        incident_id: IncidentId,
        status: IncidentStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let service_id = self
            .incidents
            .read()
            .await
            .iter()
            .find(|incident| incident.id == incident_id)
            .map(|incident| incident.service_id)
            .ok_or_else(|| PollerError::Repository(format!("unknown incident {}", incident_id)))?;
        self.ensure_writable(service_id).await?;

        let mut incidents = self.incidents.write().await;
        if let Some(incident) = incidents.iter_mut().find(|incident| incident.id == incident_id) {
            incident.status = status;
            incident.updated_at = Utc::now();
            if let Some(message) = message {
                incident.message = message.to_string();
            }
        }

        Ok(())
    }

    async fn insert_metric_point(&self, point: &MetricPoint) -> Result<()> {
        self.points.write().await.push(*point);
        Ok(())
    }
}
