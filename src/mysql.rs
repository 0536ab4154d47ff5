//! Repository over the status page's MySQL schema
//!
//! Tables used: `components`, `incidents` and `metric_points`. Metric
//! categories and availability modes are not stored there, so they are
//! resolved once per row while services are loaded.

use crate::errors::{PollerError, Result};
use crate::incident::{ActiveIncident, IncidentId, IncidentStatus, NewIncident};
use crate::metrics::MetricPoint;
use crate::repository::Repository;
use crate::service::{AvailabilityMode, CategoryRules, MetricCategory, Service, ServiceId, host_of};
use crate::severity::Severity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use tracing::{debug, warn};

const SERVICE_COLUMNS: &str = "\
    CAST(id AS SIGNED) AS id, name, link, \
    CAST(status AS SIGNED) AS status, \
    CAST(COALESCE(downtime, 0) AS SIGNED) AS downtime, \
    CAST(COALESCE(TIMESTAMPDIFF(SECOND, updated_at, NOW()), 0) AS SIGNED) AS since_update";

const ACTIVE_INCIDENT_COLUMNS: &str = "\
    CAST(id AS SIGNED) AS id, \
    CAST(status AS SIGNED) AS status, \
    CAST(COALESCE(TIMESTAMPDIFF(SECOND, updated_at, NOW()), 0) AS SIGNED) AS since_update";

/// Ids of the three metric series in the `metrics` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricIds {
    pub fleet: i64,
    pub website: i64,
    pub primary_service: i64,
}

impl Default for MetricIds {
    fn default() -> Self {
        Self {
            fleet: 1,
            website: 2,
            primary_service: 3,
        }
    }
}

impl MetricIds {
    pub fn id_for(&self, category: MetricCategory) -> i64 {
        match category {
            MetricCategory::FleetLatency => self.fleet,
            MetricCategory::PrimaryWebsiteLatency => self.website,
            MetricCategory::PrimaryServiceLatency => self.primary_service,
        }
    }
}

/// Tags applied to services as they are read from the database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionRules {
    pub categories: CategoryRules,

    /// Hosts that report availability by timing out
    pub inverted_hosts: Vec<String>,

    pub metric_ids: MetricIds,
}

impl IngestionRules {
    pub fn availability_for(&self, link: &str) -> AvailabilityMode {
        let host = host_of(link);
        if self
            .inverted_hosts
            .iter()
            .any(|inverted| inverted.eq_ignore_ascii_case(&host))
        {
            AvailabilityMode::Inverted
        } else {
            AvailabilityMode::Normal
        }
    }

    /// Build a `Service` from the raw column values of one component.
    pub fn service_from_columns(
        &self,
        id: ServiceId,
        name: String,
        link: String,
        status: i64,
        downtime: i64,
        since_update: i64,
    ) -> Service {
        let severity = Severity::from_code(status).unwrap_or_else(|| {
            warn!(service_id = id, status, "Unknown component status, treating as operational");
            Severity::Operational
        });

        Service {
            category: self.categories.resolve(&name),
            availability: self.availability_for(&link),
            id,
            name,
            link,
            enabled: true,
            severity,
            downtime_secs: downtime.max(0) as u64,
            since_last_update_secs: since_update.max(0) as u64,
        }
    }
}

pub struct MySqlRepository {
    pool: MySqlPool,
    rules: IngestionRules,
}

impl MySqlRepository {
    pub async fn connect(database_url: &str, rules: IngestionRules) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool, rules })
    }

    pub fn from_pool(pool: MySqlPool, rules: IngestionRules) -> Self {
        Self { pool, rules }
    }

    fn service_from_row(&self, row: &MySqlRow) -> Result<Service> {
        Ok(self.rules.service_from_columns(
            row.try_get("id")?,
            row.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
            row.try_get::<Option<String>, _>("link")?.unwrap_or_default(),
            row.try_get("status")?,
            row.try_get("downtime")?,
            row.try_get("since_update")?,
        ))
    }
}

#[async_trait]
impl Repository for MySqlRepository {
    async fn list_enabled_services(&self) -> Result<Vec<Service>> {
        let query = format!("SELECT {SERVICE_COLUMNS} FROM components WHERE enabled = 1 ORDER BY id");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(|row| self.service_from_row(row)).collect()
    }

    async fn update_service(&self, id: ServiceId, severity: Severity, downtime_secs: u64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE components SET status = ?, downtime = ?, updated_at = NOW() WHERE id = ?",
        )
        .bind(severity.code())
        .bind(i64::try_from(downtime_secs).unwrap_or(i64::MAX))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PollerError::Repository(format!("unknown service {}", id)));
        }

        debug!(service_id = id, %severity, downtime_secs, "Stored service state");
        Ok(())
    }

    async fn find_active_incident(&self, service_id: ServiceId) -> Result<Option<ActiveIncident>> {
        let query = format!(
            "SELECT {ACTIVE_INCIDENT_COLUMNS} FROM incidents \
             WHERE component_id = ? AND status IN (?, ?) \
             ORDER BY updated_at DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(service_id)
            .bind(IncidentStatus::Open.code())
            .bind(IncidentStatus::Watching.code())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_code: i64 = row.try_get("status")?;
        let status = IncidentStatus::from_code(status_code).ok_or_else(|| {
            PollerError::Repository(format!("unexpected incident status {}", status_code))
        })?;
        let since_update: i64 = row.try_get("since_update")?;

        Ok(Some(ActiveIncident {
            id: row.try_get("id")?,
            status,
            secs_since_update: since_update.max(0) as u64,
        }))
    }

    async fn create_incident(&self, service_id: ServiceId, incident: &NewIncident) -> Result<IncidentId> {
        let result = sqlx::query(
            "INSERT INTO incidents (component_id, name, status, visible, message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, NOW(), NOW())",
        )
        .bind(service_id)
        .bind(&incident.title)
        .bind(IncidentStatus::Open.code())
        .bind(incident.visible)
        .bind(&incident.message)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_id() as IncidentId)
    }

    async fn update_incident_status(
        &self,
        incident_id: IncidentId,
        status: IncidentStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let query = match message {
            Some(message) => sqlx::query(
                "UPDATE incidents SET status = ?, message = ?, updated_at = NOW() WHERE id = ?",
            )
            .bind(status.code())
            .bind(message)
            .bind(incident_id),
            None => sqlx::query("UPDATE incidents SET status = ?, updated_at = NOW() WHERE id = ?")
                .bind(status.code())
                .bind(incident_id),
        };

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(PollerError::Repository(format!("unknown incident {}", incident_id)));
        }

        Ok(())
    }

    async fn insert_metric_point(&self, point: &MetricPoint) -> Result<()> {
        sqlx::query(
            "INSERT INTO metric_points (metric_id, value, created_at, updated_at) \
             VALUES (?, ?, NOW(), NOW())",
        )
        .bind(self.rules.metric_ids.id_for(point.category))
        .bind(point.value_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
