//! Incident lifecycle and the transition rules driven by severity changes
//!
//! An incident is opened when a service leaves `Operational`, moves to
//! `Watching` when it recovers, and is only `Resolved` once it has stayed
//! operational for the whole cooldown window. A relapse while watching
//! reopens the same incident instead of creating a new one.

use crate::severity::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type IncidentId = i64;

/// Default watch window before a recovered incident is resolved.
pub const DEFAULT_COOLDOWN_SECS: u64 = 600;

pub const UNAVAILABLE_MESSAGE: &str = "The service is currently not available.";
pub const RESOLVED_MESSAGE: &str = "The issue has been resolved and the service is now available.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IncidentStatus {
    Open,
    Watching,
    Resolved,
}

impl IncidentStatus {
    /// Numeric status used by the status page schema.
    pub fn code(self) -> i64 {
        match self {
            IncidentStatus::Open => 2,
            IncidentStatus::Watching => 3,
            IncidentStatus::Resolved => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            2 => Some(IncidentStatus::Open),
            3 => Some(IncidentStatus::Watching),
            4 => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }

    /// Open and watching incidents count against the one-per-service limit.
    pub fn is_active(self) -> bool {
        matches!(self, IncidentStatus::Open | IncidentStatus::Watching)
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentStatus::Open => write!(f, "open"),
            IncidentStatus::Watching => write!(f, "watching"),
            IncidentStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// A customer-visible incident record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub service_id: i64,
    pub title: String,
    pub message: String,
    pub visible: bool,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The view of a service's open or watching incident needed by `evaluate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveIncident {
    pub id: IncidentId,
    pub status: IncidentStatus,
    pub secs_since_update: u64,
}

/// Fields for inserting a new incident.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewIncident {
    pub title: String,
    pub message: String,
    pub visible: bool,
}

impl NewIncident {
    /// Build the incident announced when a service leaves `Operational`.
    ///
    /// `observed` is the probe latency for performance issues and the
    /// downtime otherwise.
    pub fn identified(severity: Severity, observed: f64) -> Self {
        let message = if severity == Severity::PerformanceIssue {
            format!("The service is currently responding slowly: {:.2}s.", observed)
        } else {
            UNAVAILABLE_MESSAGE.to_string()
        };

        Self {
            title: format!("Identified: {}", severity.display_name()),
            message,
            visible: true,
        }
    }
}

/// The single incident mutation decided for one probe.
#[derive(Clone, Debug, PartialEq)]
pub enum IncidentAction {
    Open(NewIncident),
    Watch { incident_id: IncidentId },
    Resolve { incident_id: IncidentId, message: String },
    Reopen { incident_id: IncidentId },
}

/// Decide which incident mutation, if any, a severity change calls for.
///
/// Rules are checked in order and at most one fires:
/// 1. leaving `Operational` with no active incident opens one
/// 2. returning to `Operational` moves the open incident to watching
/// 3. staying `Operational` for `cooldown_secs` resolves a watched incident
/// 4. leaving `Operational` while watching reopens the incident
pub fn evaluate(
    new: Severity,
    previous: Severity,
    active: Option<&ActiveIncident>,
    observed: f64,
    cooldown_secs: u64,
) -> Option<IncidentAction> {
    let watching = active.filter(|incident| incident.status == IncidentStatus::Watching);

    if !new.is_operational() && previous.is_operational() && active.is_none() {
        return Some(IncidentAction::Open(NewIncident::identified(new, observed)));
    }

    if new.is_operational() && !previous.is_operational() {
        return active
            .filter(|incident| incident.status == IncidentStatus::Open)
            .map(|incident| IncidentAction::Watch { incident_id: incident.id });
    }

    if new.is_operational() && previous.is_operational() {
        return watching
            .filter(|incident| incident.secs_since_update >= cooldown_secs)
            .map(|incident| IncidentAction::Resolve {
                incident_id: incident.id,
                message: RESOLVED_MESSAGE.to_string(),
            });
    }

    watching.map(|incident| IncidentAction::Reopen { incident_id: incident.id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(status: IncidentStatus, secs_since_update: u64) -> ActiveIncident {
        ActiveIncident {
            id: 7,
            status,
            secs_since_update,
        }
    }

    #[test]
    fn test_outage_opens_incident() {
        let action = evaluate(
            Severity::MajorOutage,
            Severity::Operational,
            None,
            301.0,
            DEFAULT_COOLDOWN_SECS,
        );

        match action {
            Some(IncidentAction::Open(incident)) => {
                assert_eq!(incident.title, "Identified: Major Outage");
                assert_eq!(incident.message, UNAVAILABLE_MESSAGE);
                assert!(incident.visible);
            }
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[test]
    fn test_performance_issue_message_has_latency() {
        let action = evaluate(
            Severity::PerformanceIssue,
            Severity::Operational,
            None,
            8.456,
            DEFAULT_COOLDOWN_SECS,
        );

        assert_eq!(
            action,
            Some(IncidentAction::Open(NewIncident {
                title: "Identified: Performance Issue".to_string(),
                message: "The service is currently responding slowly: 8.46s.".to_string(),
                visible: true,
            }))
        );
    }

    #[test]
    fn test_no_duplicate_while_open() {
        let open = active(IncidentStatus::Open, 30);
        assert_eq!(
            evaluate(Severity::MajorOutage, Severity::MajorOutage, Some(&open), 400.0, 600),
            None
        );
        // severity escalates without a detour through operational
        assert_eq!(
            evaluate(Severity::MajorOutage, Severity::PartialOutage, Some(&open), 301.0, 600),
            None
        );
        // stale operational status with an open incident still does not duplicate
        assert_eq!(
            evaluate(Severity::PartialOutage, Severity::Operational, Some(&open), 120.0, 600),
            None
        );
    }

    #[test]
    fn test_recovery_enters_cooldown() {
        let open = active(IncidentStatus::Open, 30);
        assert_eq!(
            evaluate(Severity::Operational, Severity::MajorOutage, Some(&open), 0.0, 600),
            Some(IncidentAction::Watch { incident_id: 7 })
        );
    }

    #[test]
    fn test_recovery_without_incident_does_nothing() {
        assert_eq!(
            evaluate(Severity::Operational, Severity::PartialOutage, None, 0.0, 600),
            None
        );
    }

    #[test]
    fn test_resolve_waits_for_cooldown() {
        let early = active(IncidentStatus::Watching, 599);
        assert_eq!(
            evaluate(Severity::Operational, Severity::Operational, Some(&early), 0.0, 600),
            None
        );

        let due = active(IncidentStatus::Watching, 600);
        assert_eq!(
            evaluate(Severity::Operational, Severity::Operational, Some(&due), 0.0, 600),
            Some(IncidentAction::Resolve {
                incident_id: 7,
                message: RESOLVED_MESSAGE.to_string(),
            })
        );
    }

    #[test]
    fn test_open_incident_is_not_resolved_by_steady_operational() {
        let open = active(IncidentStatus::Open, 10_000);
        assert_eq!(
            evaluate(Severity::Operational, Severity::Operational, Some(&open), 0.0, 600),
            None
        );
    }

    #[test]
    fn test_relapse_reopens_watched_incident() {
        let watching = active(IncidentStatus::Watching, 120);
        assert_eq!(
            evaluate(Severity::MajorOutage, Severity::Operational, Some(&watching), 400.0, 600),
            Some(IncidentAction::Reopen { incident_id: 7 })
        );
        assert_eq!(
            evaluate(
                Severity::PerformanceIssue,
                Severity::Operational,
                Some(&watching),
                9.0,
                600
            ),
            Some(IncidentAction::Reopen { incident_id: 7 })
        );
    }

    #[test]
    fn test_steady_state_without_incident() {
        assert_eq!(
            evaluate(Severity::Operational, Severity::Operational, None, 0.0, 600),
            None
        );
        assert_eq!(
            evaluate(Severity::MajorOutage, Severity::MajorOutage, None, 900.0, 600),
            None
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(IncidentStatus::Open.code(), 2);
        assert_eq!(IncidentStatus::Watching.code(), 3);
        assert_eq!(IncidentStatus::Resolved.code(), 4);
        assert_eq!(IncidentStatus::from_code(1), None);
        assert!(IncidentStatus::Watching.is_active());
        assert!(!IncidentStatus::Resolved.is_active());
    }
}
