//! Status Page Poller Library
//!
//! This library polls a fleet of network services, classifies their health,
//! keeps one customer-visible incident per outage and records per-cycle
//! response time metrics for a public status page.

pub mod config;
pub mod downtime;
pub mod errors;
pub mod incident;
pub mod metrics;
pub mod mysql;
pub mod poller;
pub mod probe;
pub mod repository;
pub mod service;
pub mod severity;

pub use config::Config;
pub use errors::{PollerError, Result};
pub use incident::{ActiveIncident, Incident, IncidentAction, IncidentStatus, NewIncident};
pub use metrics::{MetricPoint, MetricsAggregator};
pub use poller::{CycleReport, StatusPoller};
pub use probe::{Probe, ProbeResult};
pub use repository::{InMemoryRepository, Repository};
pub use service::{AvailabilityMode, MetricCategory, Service};
pub use severity::Severity;
