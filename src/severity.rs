//! Service severity levels and the downtime/latency classifier

use serde::{Deserialize, Serialize};

/// Downtime (seconds) at which a service is considered partially out.
pub const PARTIAL_OUTAGE_AFTER_SECS: u64 = 120;

/// Downtime (seconds) above which a service is considered majorly out.
pub const MAJOR_OUTAGE_AFTER_SECS: u64 = 300;

/// Latency (seconds) at or above which a reachable service has performance issues.
pub const SLOW_RESPONSE_SECS: f64 = 8.0;

/// Health level of a service, ordered for display and threshold purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Operational,
    PerformanceIssue,
    PartialOutage,
    MajorOutage,
}

impl Severity {
    /// Numeric status used by the status page schema.
    pub fn code(self) -> i64 {
        match self {
            Severity::Operational => 1,
            Severity::PerformanceIssue => 2,
            Severity::PartialOutage => 3,
            Severity::MajorOutage => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Severity::Operational),
            2 => Some(Severity::PerformanceIssue),
            3 => Some(Severity::PartialOutage),
            4 => Some(Severity::MajorOutage),
            _ => None,
        }
    }

    /// Human readable name shown in incident titles.
    pub fn display_name(self) -> &'static str {
        match self {
            Severity::Operational => "Operational",
            Severity::PerformanceIssue => "Performance Issue",
            Severity::PartialOutage => "Partial Outage",
            Severity::MajorOutage => "Major Outage",
        }
    }

    pub fn is_operational(self) -> bool {
        self == Severity::Operational
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Severity implied by accumulated downtime alone.
pub fn by_downtime(downtime_secs: u64) -> Severity {
    if downtime_secs < PARTIAL_OUTAGE_AFTER_SECS {
        Severity::Operational
    } else if downtime_secs <= MAJOR_OUTAGE_AFTER_SECS {
        Severity::PartialOutage
    } else {
        Severity::MajorOutage
    }
}

/// Classify a service from its downtime and the latest probe.
///
/// A reachable service answering in `SLOW_RESPONSE_SECS` or more is a
/// `PerformanceIssue` regardless of downtime; the caller is expected to
/// reset downtime to zero in that case.
pub fn classify(downtime_secs: u64, available: bool, latency_secs: f64) -> Severity {
    if available && latency_secs >= SLOW_RESPONSE_SECS {
        return Severity::PerformanceIssue;
    }

    by_downtime(downtime_secs)
}
