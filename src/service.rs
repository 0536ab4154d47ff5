//! Monitored services and the per-service tags resolved at ingestion

use crate::severity::Severity;
use serde::{Deserialize, Serialize};

pub type ServiceId = i64;

/// How a reachability check maps onto availability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityMode {
    /// Available when the target answers.
    #[default]
    Normal,
    /// Available when the target times out. Used for access-restricted hosts
    /// that silently drop traffic while they are up.
    Inverted,
}

/// Response-time series a service contributes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricCategory {
    FleetLatency,
    PrimaryWebsiteLatency,
    PrimaryServiceLatency,
}

impl MetricCategory {
    pub const ALL: [MetricCategory; 3] = [
        MetricCategory::FleetLatency,
        MetricCategory::PrimaryWebsiteLatency,
        MetricCategory::PrimaryServiceLatency,
    ];
}

impl std::fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricCategory::FleetLatency => write!(f, "fleet_latency"),
            MetricCategory::PrimaryWebsiteLatency => write!(f, "primary_website_latency"),
            MetricCategory::PrimaryServiceLatency => write!(f, "primary_service_latency"),
        }
    }
}

/// Naming convention used to tag services with a metric category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRules {
    /// Display-name prefix shared by every fleet member
    pub fleet_prefix: String,

    /// Exact display name of the primary website
    pub website_name: String,

    /// Exact display name of the primary service
    pub primary_service_name: String,
}

impl Default for CategoryRules {
    fn default() -> Self {
        Self {
            fleet_prefix: "Webseed".to_string(),
            website_name: "Website".to_string(),
            primary_service_name: "Public Universe".to_string(),
        }
    }
}

impl CategoryRules {
    pub fn resolve(&self, display_name: &str) -> Option<MetricCategory> {
        if !self.fleet_prefix.is_empty() && display_name.starts_with(&self.fleet_prefix) {
            Some(MetricCategory::FleetLatency)
        } else if display_name == self.website_name {
            Some(MetricCategory::PrimaryWebsiteLatency)
        } else if display_name == self.primary_service_name {
            Some(MetricCategory::PrimaryServiceLatency)
        } else {
            None
        }
    }
}

/// A monitored endpoint as read at the start of a cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub link: String,
    pub enabled: bool,
    pub severity: Severity,
    pub downtime_secs: u64,

    /// Seconds since the service record was last written, as of the read
    pub since_last_update_secs: u64,

    pub category: Option<MetricCategory>,
    pub availability: AvailabilityMode,
}

impl Service {
    pub fn new(id: ServiceId, name: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            link: link.into(),
            enabled: true,
            severity: Severity::Operational,
            downtime_secs: 0,
            since_last_update_secs: 0,
            category: None,
            availability: AvailabilityMode::Normal,
        }
    }

    pub fn with_category(mut self, category: MetricCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_availability(mut self, availability: AvailabilityMode) -> Self {
        self.availability = availability;
        self
    }

    pub fn with_severity(mut self, severity: Severity, downtime_secs: u64) -> Self {
        self.severity = severity;
        self.downtime_secs = downtime_secs;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Host part of the service link, without scheme, port or path.
    pub fn host(&self) -> String {
        host_of(&self.link)
    }
}

/// Extract the host from an address that may or may not carry a scheme.
pub fn host_of(link: &str) -> String {
    let trimmed = link.trim();

    if let Ok(url) = reqwest::Url::parse(trimmed) {
        if let Some(host) = url.host_str() {
            return host.to_string();
        }
    }

    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);

    without_scheme
        .split(['/', ':', '?'])
        .next()
        .unwrap_or_default()
        .to_string()
}
