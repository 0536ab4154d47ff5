//! Poll cycle orchestration
//!
//! One cycle reads every enabled service, probes them (bounded concurrency),
//! feeds each result through downtime accumulation, classification and the
//! incident rules, persists the outcome per service and finally flushes the
//! cycle's latency averages as metric points.

use crate::config::Config;
use crate::downtime::accumulate;
use crate::errors::{PollerError, Result};
use crate::incident::{IncidentAction, IncidentStatus, evaluate};
use crate::metrics::{MetricPoint, MetricsAggregator};
use crate::mysql::MySqlRepository;
use crate::probe::{FleetProbe, HttpProbe, PingProbe, Probe};
use crate::repository::Repository;
use crate::service::Service;
use crate::severity::{Severity, classify};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Outcome of one polling cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub services: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub incidents_opened: usize,
    pub incidents_watching: usize,
    pub incidents_resolved: usize,
    pub incidents_reopened: usize,
    pub metric_points: Vec<MetricPoint>,
    pub duration_ms: u64,
}

impl CycleReport {
    fn record_action(&mut self, action: &IncidentAction) {
        match action {
            IncidentAction::Open(_) => self.incidents_opened += 1,
            IncidentAction::Watch { .. } => self.incidents_watching += 1,
            IncidentAction::Resolve { .. } => self.incidents_resolved += 1,
            IncidentAction::Reopen { .. } => self.incidents_reopened += 1,
        }
    }
}

/// Cancellation for a single cycle: an external shutdown flag or the deadline.
struct CycleCancel {
    shutdown: watch::Receiver<bool>,
    deadline: Instant,
}

impl CycleCancel {
    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow() || Instant::now() >= self.deadline
    }

    async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        let signalled = async move { shutdown.wait_for(|stop| *stop).await.is_ok() };

        tokio::select! {
            _ = sleep_until(self.deadline) => {}
            stopped = signalled => {
                // a dropped sender never cancels; only the deadline remains
                if !stopped {
                    sleep_until(self.deadline).await;
                }
            }
        }
    }
}

/// Polls the service fleet and maintains incidents and metrics.
pub struct StatusPoller {
    config: Config,
    repository: Arc<dyn Repository>,
    probe: Arc<dyn Probe>,
}

impl StatusPoller {
    pub fn new(config: Config, repository: Arc<dyn Repository>, probe: Arc<dyn Probe>) -> Self {
        Self {
            config,
            repository,
            probe,
        }
    }

    /// Wire the database repository and the fleet probe from configuration.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate().map_err(PollerError::Config)?;

        let database_url = config
            .database_url
            .clone()
            .ok_or_else(|| PollerError::Config("database_url must be set".to_string()))?;
        let repository = MySqlRepository::connect(&database_url, config.ingestion_rules()).await?;

        let probe = FleetProbe::new(
            config.internal_suffix.clone(),
            Box::new(HttpProbe::new(config.http_timeout)?),
            Box::new(PingProbe::new(config.ping_command.clone(), config.ping_timeout)),
        );

        Ok(Self::new(config, Arc::new(repository), Arc::new(probe)))
    }

    /// Run cycles on the configured interval until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            max_concurrent_probes = self.config.max_concurrent_probes,
            "Starting status poller"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed, stopping poller");
                        break;
                    }
                    if !*shutdown.borrow() {
                        continue;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle(shutdown.clone()).await {
                Ok(report) => info!(
                    cycle_id = %report.cycle_id,
                    services = report.services,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    cancelled = report.cancelled,
                    incidents_opened = report.incidents_opened,
                    incidents_resolved = report.incidents_resolved,
                    duration_ms = report.duration_ms,
                    "Cycle finished"
                ),
                Err(e) => error!("Cycle failed: {}", e),
            }
        }

        info!("Status poller stopped");
        Ok(())
    }

    /// Run one full pass over the enabled services plus one metrics flush.
    ///
    /// Only reading the service list can fail the whole cycle; every other
    /// failure is confined to the service it happened for.
    #[instrument(skip_all, fields(cycle_id = tracing::field::Empty))]
    pub async fn run_cycle(&self, shutdown: watch::Receiver<bool>) -> Result<CycleReport> {
        let started = Instant::now();
        let cancel = CycleCancel {
            shutdown,
            deadline: started + self.config.cycle_deadline,
        };

        let mut report = CycleReport {
            cycle_id: Uuid::new_v4().to_string(),
            ..CycleReport::default()
        };
        tracing::Span::current().record("cycle_id", report.cycle_id.as_str());

        let services = self.repository.list_enabled_services().await?;
        report.services = services.len();
        debug!("Polling {} services", services.len());

        let aggregator = Mutex::new(
            MetricsAggregator::new().with_empty_points(self.config.emit_empty_metrics),
        );

        let enabled: Vec<Service> = services.into_iter().filter(|service| service.enabled).collect();

        let cancel = &cancel;
        let aggregator_ref = &aggregator;
        let outcomes: Vec<(Service, Result<Option<IncidentAction>>)> = stream::iter(enabled)
            .map(|service| async move {
                let result = self.process_service(&service, started, cancel, aggregator_ref).await;
                (service, result)
            })
            .buffer_unordered(self.config.max_concurrent_probes.max(1))
            .collect()
            .await;

        for (service, outcome) in outcomes {
            match outcome {
                Ok(action) => {
                    report.succeeded += 1;
                    if let Some(action) = action {
                        report.record_action(&action);
                    }
                }
                Err(PollerError::Cancelled) => {
                    report.cancelled += 1;
                    debug!(service_id = service.id, service = %service.name, "Skipped, cycle cancelled");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        service_id = service.id,
                        service = %service.name,
                        "Service skipped this cycle: {}",
                        e
                    );
                }
            }
        }

        if report.cancelled > 0 {
            warn!(cancelled = report.cancelled, "Cycle cancelled before all services were probed");
        }

        let points = aggregator.into_inner().flush();
        for point in points {
            match self.repository.insert_metric_point(&point).await {
                Ok(()) => report.metric_points.push(point),
                Err(e) => error!(category = %point.category, "Failed to store metric point: {}", e),
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Probe one service and persist everything that follows from the result.
    #[instrument(skip_all, fields(service_id = service.id, service = %service.name))]
    async fn process_service(
        &self,
        service: &Service,
        cycle_started: Instant,
        cancel: &CycleCancel,
        aggregator: &Mutex<MetricsAggregator>,
    ) -> Result<Option<IncidentAction>> {
        if cancel.is_cancelled() {
            return Err(PollerError::Cancelled);
        }

        // a finished probe wins over cancellation so its result is kept
        let probe = tokio::select! {
            biased;
            result = self.probe.probe(service) => result?,
            _ = cancel.cancelled() => return Err(PollerError::Cancelled),
        };

        if probe.available {
            if let Some(category) = service.category {
                aggregator.lock().await.observe(category, probe.latency_secs);
            }
        }

        let elapsed_in_cycle = cycle_started.elapsed().as_secs();
        let downtime = accumulate(
            probe.available,
            service.downtime_secs,
            service.since_last_update_secs,
            elapsed_in_cycle,
        );
        let severity = classify(downtime, probe.available, probe.latency_secs);

        let (downtime, observed) = if severity == Severity::PerformanceIssue {
            (0, probe.latency_secs)
        } else {
            (downtime, downtime as f64)
        };

        let incident = self.reconcile_incident(service, severity, observed).await;

        // an unrecorded transition keeps the stored severity so it is evaluated again next cycle
        let stored_severity = if incident.is_ok() { severity } else { service.severity };
        let stored = self
            .repository
            .update_service(service.id, stored_severity, downtime)
            .await;

        let action = incident?;
        stored?;

        if severity != service.severity {
            info!(
                previous = %service.severity,
                %severity,
                downtime_secs = downtime,
                latency_secs = probe.latency_secs,
                "Service severity changed"
            );
        } else {
            debug!(%severity, downtime_secs = downtime, available = probe.available, "Service checked");
        }

        Ok(action)
    }

    async fn reconcile_incident(
        &self,
        service: &Service,
        severity: Severity,
        observed: f64,
    ) -> Result<Option<IncidentAction>> {
        let active = self.repository.find_active_incident(service.id).await?;
        let action = evaluate(
            severity,
            service.severity,
            active.as_ref(),
            observed,
            self.config.cooldown_secs,
        );

        if let Some(action) = &action {
            self.apply_incident_action(service, action).await?;
        }

        Ok(action)
    }

    async fn apply_incident_action(&self, service: &Service, action: &IncidentAction) -> Result<()> {
        match action {
            IncidentAction::Open(incident) => {
                let incident_id = self.repository.create_incident(service.id, incident).await?;
                info!(incident_id, title = %incident.title, "Opened incident");
            }
            IncidentAction::Watch { incident_id } => {
                self.repository
                    .update_incident_status(*incident_id, IncidentStatus::Watching, None)
                    .await?;
                info!(incident_id, "Service recovered, watching incident");
            }
            IncidentAction::Resolve { incident_id, message } => {
                self.repository
                    .update_incident_status(*incident_id, IncidentStatus::Resolved, Some(message.as_str()))
                    .await?;
                info!(incident_id, "Resolved incident after cooldown");
            }
            IncidentAction::Reopen { incident_id } => {
                self.repository
                    .update_incident_status(*incident_id, IncidentStatus::Open, None)
                    .await?;
                warn!(incident_id, "Service relapsed during cooldown, reopened incident");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeResult;
    use crate::repository::InMemoryRepository;
    use crate::service::{MetricCategory, ServiceId};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Probe answering from a per-service script; unknown services are down.
    #[derive(Default)]
    struct ScriptedProbe {
        results: std::sync::Mutex<HashMap<ServiceId, Result<ProbeResult>>>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn set(&self, id: ServiceId, result: Result<ProbeResult>) {
            self.results.lock().unwrap().insert(id, result);
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, service: &Service) -> Result<ProbeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            match self.results.lock().unwrap().remove(&service.id) {
                Some(result) => result,
                None => Ok(ProbeResult::down(0.0)),
            }
        }
    }

    fn config() -> Config {
        Config {
            database_url: Some("mysql://localhost/status".to_string()),
            ..Config::default()
        }
    }

    /// Shutdown receiver whose sender is already gone; only deadlines cancel.
    fn idle() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn test_healthy_website_cycle() {
        let repo = Arc::new(InMemoryRepository::with_services(vec![
            Service::new(1, "Website", "https://example.com")
                .with_category(MetricCategory::PrimaryWebsiteLatency),
        ]));
        let probe = Arc::new(ScriptedProbe::default());
        probe.set(1, Ok(ProbeResult::up(0.05)));

        let poller = StatusPoller::new(config(), repo.clone(), probe);
        let report = poller.run_cycle(idle()).await.unwrap();

        assert_eq!(report.services, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.incidents_opened, 0);

        let service = repo.service(1).await.unwrap();
        assert_eq!(service.severity, Severity::Operational);
        assert_eq!(service.downtime_secs, 0);
        assert!(repo.incidents_for(1).await.is_empty());

        let points = repo.metric_points().await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].category, MetricCategory::PrimaryWebsiteLatency);
        assert!((points[0].value_ms - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_downtime_bridges_time_since_last_update() {
        let mut service = Service::new(1, "Forums", "https://forums.example.com");
        service.since_last_update_secs = 130;
        let repo = Arc::new(InMemoryRepository::with_services(vec![service]));
        let probe = Arc::new(ScriptedProbe::default());
        probe.set(1, Ok(ProbeResult::down(10.0)));

        let poller = StatusPoller::new(config(), repo.clone(), probe);
        let report = poller.run_cycle(idle()).await.unwrap();

        let stored = repo.service(1).await.unwrap();
        assert!(stored.downtime_secs >= 130);
        assert_eq!(stored.severity, Severity::PartialOutage);
        assert_eq!(report.incidents_opened, 1);

        let incidents = repo.incidents_for(1).await;
        assert_eq!(incidents[0].title, "Identified: Partial Outage");
        assert_eq!(incidents[0].status, IncidentStatus::Open);
    }

    #[tokio::test]
    async fn test_slow_response_resets_downtime() {
        let repo = Arc::new(InMemoryRepository::with_services(vec![
            Service::new(1, "Website", "https://example.com").with_severity(Severity::Operational, 0),
        ]));
        let probe = Arc::new(ScriptedProbe::default());
        probe.set(1, Ok(ProbeResult::up(9.25)));

        let poller = StatusPoller::new(config(), repo.clone(), probe);
        poller.run_cycle(idle()).await.unwrap();

        let stored = repo.service(1).await.unwrap();
        assert_eq!(stored.severity, Severity::PerformanceIssue);
        assert_eq!(stored.downtime_secs, 0);

        let incidents = repo.incidents_for(1).await;
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].message, "The service is currently responding slowly: 9.25s.");
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_service() {
        let repo = Arc::new(InMemoryRepository::with_services(vec![
            Service::new(1, "Webseed 1", "https://1.webseed.example.com")
                .with_category(MetricCategory::FleetLatency),
            Service::new(2, "Public Universe", "http://public.universe.example.com"),
            Service::new(3, "Webseed 2", "https://2.webseed.example.com")
                .with_category(MetricCategory::FleetLatency),
        ]));
        repo.fail_writes_for(3).await;

        let probe = Arc::new(ScriptedProbe::default());
        probe.set(1, Ok(ProbeResult::up(0.1)));
        probe.set(2, Err(PollerError::ProbeOutput("truncated".to_string())));
        probe.set(3, Ok(ProbeResult::up(0.3)));

        let poller = StatusPoller::new(config(), repo.clone(), probe);
        let report = poller.run_cycle(idle()).await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);

        // the probe for service 3 succeeded even though its write failed
        let fleet = report
            .metric_points
            .iter()
            .find(|point| point.category == MetricCategory::FleetLatency)
            .unwrap();
        assert!((fleet.value_ms - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_remaining_probes() {
        let repo = Arc::new(InMemoryRepository::with_services(vec![
            Service::new(1, "Website", "https://example.com"),
            Service::new(2, "Forums", "https://forums.example.com"),
        ]));
        let probe = Arc::new(ScriptedProbe::default());
        let (tx, rx) = watch::channel(true);

        let poller = StatusPoller::new(config(), repo.clone(), probe);
        let report = poller.run_cycle(rx).await.unwrap();
        drop(tx);

        assert_eq!(report.cancelled, 2);
        assert_eq!(report.succeeded, 0);
        assert!(repo.incidents_for(1).await.is_empty());
        assert!(repo.metric_points().await.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_abandons_slow_probes() {
        let repo = Arc::new(InMemoryRepository::with_services(vec![Service::new(
            1,
            "Website",
            "https://example.com",
        )]));
        let probe = Arc::new(ScriptedProbe {
            delay: Some(Duration::from_secs(5)),
            ..ScriptedProbe::default()
        });

        let config = Config {
            cycle_deadline: Duration::from_millis(50),
            ..config()
        };
        let poller = StatusPoller::new(config, repo.clone(), probe);
        let report = poller.run_cycle(idle()).await.unwrap();

        assert_eq!(report.cancelled, 1);
        assert!(report.duration_ms < 5000);
        assert_eq!(repo.service(1).await.unwrap().downtime_secs, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let repo = Arc::new(InMemoryRepository::new());
        let poller = StatusPoller::new(config(), repo, Arc::new(ScriptedProbe::default()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { poller.run(rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_failed_incident_write_is_retried_next_cycle() {
        let mut service = Service::new(1, "Website", "https://example.com");
        service.since_last_update_secs = 301;
        let repo = Arc::new(InMemoryRepository::with_services(vec![service]));
        repo.fail_next_incident_for(1).await;
        let probe = Arc::new(ScriptedProbe::default());

        let poller = StatusPoller::new(config(), repo.clone(), probe);
        let report = poller.run_cycle(idle()).await.unwrap();
        assert_eq!(report.failed, 1);

        // downtime is still recorded, the severity change waits for its incident
        let stored = repo.service(1).await.unwrap();
        assert!(stored.downtime_secs >= 301);
        assert_eq!(stored.severity, Severity::Operational);
        assert!(repo.incidents_for(1).await.is_empty());

        repo.advance(60).await;
        let report = poller.run_cycle(idle()).await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.incidents_opened, 1);

        let stored = repo.service(1).await.unwrap();
        assert_eq!(stored.severity, Severity::MajorOutage);
        let incidents = repo.incidents_for(1).await;
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].status, IncidentStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_downtime_includes_time_spent_in_cycle() {
        let repo = Arc::new(InMemoryRepository::with_services(vec![
            Service::new(1, "Forums", "https://forums.example.com"),
            Service::new(2, "Launcher", "https://launcher.example.com"),
        ]));
        let probe = Arc::new(ScriptedProbe {
            delay: Some(Duration::from_secs(30)),
            ..ScriptedProbe::default()
        });

        let config = Config {
            max_concurrent_probes: 1,
            ..config()
        };
        let poller = StatusPoller::new(config, repo.clone(), probe);
        let report = poller.run_cycle(idle()).await.unwrap();
        assert_eq!(report.succeeded, 2);

        assert_eq!(repo.service(1).await.unwrap().downtime_secs, 30);
        assert_eq!(repo.service(2).await.unwrap().downtime_secs, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ignores_shutdown_updates_without_stop() {
        let repo = Arc::new(InMemoryRepository::with_services(vec![Service::new(
            1,
            "Website",
            "https://example.com",
        )]));
        let probe = Arc::new(ScriptedProbe::default());
        let poller = StatusPoller::new(config(), repo, probe.clone());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { poller.run(rx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        assert!(matches!(handle.await, Ok(Ok(()))));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }
}
