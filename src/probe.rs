//! Service probes: HTTP status checks and fping reachability checks

use crate::errors::{PollerError, Result};
use crate::service::{AvailabilityMode, Service};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Normalized outcome of checking one service once.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub available: bool,
    pub latency_secs: f64,
}

impl ProbeResult {
    pub fn up(latency_secs: f64) -> Self {
        Self {
            available: true,
            latency_secs,
        }
    }

    pub fn down(latency_secs: f64) -> Self {
        Self {
            available: false,
            latency_secs,
        }
    }
}

/// A single reachability/latency measurement of one service.
///
/// Unreachable services are an `Ok` result with `available == false`; an
/// `Err` means the probe itself could not produce an answer.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, service: &Service) -> Result<ProbeResult>;
}

/// HEAD request against the service link.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(http_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("status_poller/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(PollerError::Http)?;

        Ok(Self {
            client,
            timeout: http_timeout,
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, service: &Service) -> Result<ProbeResult> {
        let started = Instant::now();

        let result = match timeout(self.timeout, self.client.head(&service.link).send()).await {
            // any answer counts, the status page only tracks reachability
            Ok(Ok(response)) => {
                debug!(service = %service.name, status = %response.status(), "HTTP probe answered");
                ProbeResult::up(started.elapsed().as_secs_f64())
            }
            Ok(Err(e)) => {
                debug!(service = %service.name, error = %e, "HTTP probe failed");
                ProbeResult::down(started.elapsed().as_secs_f64())
            }
            Err(_) => {
                debug!(service = %service.name, "HTTP probe timed out");
                ProbeResult::down(self.timeout.as_secs_f64())
            }
        };

        Ok(result)
    }
}

/// Counters from the `-s` summary printed by fping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FpingSummary {
    pub alive: u32,
    pub timeouts: u32,
    pub elapsed_secs: f64,
}

impl FpingSummary {
    /// Parse the summary block, using the last one if several are present.
    pub fn parse(output: &str) -> Result<Self> {
        static ALIVE: OnceLock<Regex> = OnceLock::new();
        static TIMEOUTS: OnceLock<Regex> = OnceLock::new();
        static ELAPSED: OnceLock<Regex> = OnceLock::new();

        let alive = ALIVE.get_or_init(|| Regex::new(r"(?m)^\s*(\d+)\s+alive\s*$").unwrap());
        let timeouts = TIMEOUTS.get_or_init(|| {
            Regex::new(r"(?m)^\s*(\d+)\s+timeouts \(waiting for response\)\s*$").unwrap()
        });
        let elapsed = ELAPSED.get_or_init(|| {
            Regex::new(r"(?m)^\s*([0-9]+(?:\.[0-9]+)?)\s+sec \(elapsed real time\)\s*$").unwrap()
        });

        Ok(Self {
            alive: last_capture(alive, output, "alive")?,
            timeouts: last_capture(timeouts, output, "timeouts")?,
            elapsed_secs: last_capture(elapsed, output, "elapsed real time")?,
        })
    }

    pub fn available(&self, mode: AvailabilityMode) -> bool {
        match mode {
            AvailabilityMode::Normal => self.alive >= 1,
            AvailabilityMode::Inverted => self.timeouts >= 1,
        }
    }
}

fn last_capture<T: std::str::FromStr>(pattern: &Regex, output: &str, field: &str) -> Result<T> {
    pattern
        .captures_iter(output)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| PollerError::ProbeOutput(format!("missing '{}' counter in fping summary", field)))
}

/// Reachability check through the fping binary.
#[derive(Debug, Clone)]
pub struct PingProbe {
    command: String,
    timeout: Duration,
}

impl PingProbe {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

/// Hosts are passed as a single argument; reject anything that could be
/// read as an option or that is not a plain host name.
fn is_safe_host(host: &str) -> bool {
    !host.is_empty()
        && !host.starts_with('-')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' || c == ':')
}

#[async_trait]
impl Probe for PingProbe {
    async fn probe(&self, service: &Service) -> Result<ProbeResult> {
        let host = service.host();
        if !is_safe_host(&host) {
            return Err(PollerError::ProbeOutput(format!("refusing to ping host '{}'", host)));
        }

        let timeout_ms = self.timeout.as_millis().to_string();
        let mut command = Command::new(&self.command);
        command
            .args(["-c", "1", "-s", "-t", timeout_ms.as_str(), host.as_str()])
            .kill_on_drop(true);

        // fping exits non-zero for unreachable hosts; only the summary matters
        let output = timeout(self.timeout + Duration::from_secs(5), command.output())
            .await
            .map_err(|_| PollerError::ProbeOutput(format!("{} did not finish for {}", self.command, host)))??;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let summary = FpingSummary::parse(&text)?;
        let available = summary.available(service.availability);

        debug!(
            service = %service.name,
            host = %host,
            alive = summary.alive,
            timeouts = summary.timeouts,
            available,
            "Reachability probe finished"
        );

        Ok(ProbeResult {
            available,
            latency_secs: summary.elapsed_secs,
        })
    }
}

/// Routes services on the internal network to the reachability probe and
/// everything else to the HTTP probe.
pub struct FleetProbe {
    internal_suffix: String,
    http: Box<dyn Probe>,
    reachability: Box<dyn Probe>,
}

impl FleetProbe {
    pub fn new(
        internal_suffix: impl Into<String>,
        http: Box<dyn Probe>,
        reachability: Box<dyn Probe>,
    ) -> Self {
        Self {
            internal_suffix: internal_suffix.into().to_lowercase(),
            http,
            reachability,
        }
    }

    pub fn uses_reachability(&self, service: &Service) -> bool {
        !self.internal_suffix.is_empty()
            && service.host().to_lowercase().ends_with(&self.internal_suffix)
    }
}

#[async_trait]
impl Probe for FleetProbe {
    async fn probe(&self, service: &Service) -> Result<ProbeResult> {
        if self.uses_reachability(service) {
            self.reachability.probe(service).await
        } else {
            self.http.probe(service).await
        }
    }
}
