//! Configuration management for the status poller

use crate::incident::DEFAULT_COOLDOWN_SECS;
use crate::mysql::{IngestionRules, MetricIds};
use crate::service::CategoryRules;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// MySQL connection string of the status page database
    pub database_url: Option<String>,

    /// Delay between the start of two polling cycles
    pub poll_interval: Duration,

    /// Ceiling for a single HTTP probe
    pub http_timeout: Duration,

    /// Per-target timeout handed to the reachability tool
    pub ping_timeout: Duration,

    /// Reachability tool binary
    pub ping_command: String,

    /// Services whose host ends with this suffix are pinged instead of fetched
    pub internal_suffix: String,

    /// Hosts whose reachability check is interpreted inverted
    pub inverted_hosts: Vec<String>,

    /// How long a recovered incident is watched before it is resolved
    pub cooldown_secs: u64,

    /// Upper bound for one whole cycle
    pub cycle_deadline: Duration,

    /// Probes running at the same time within a cycle
    pub max_concurrent_probes: usize,

    /// Emit zero points for metric categories without observations
    pub emit_empty_metrics: bool,

    /// Naming convention mapping services to metric series
    pub categories: CategoryRules,

    /// Metric series ids in the status page schema
    pub metric_ids: MetricIds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            poll_interval: Duration::from_secs(60),
            http_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_millis(5000),
            ping_command: "fping".to_string(),
            internal_suffix: ".universe.robertsspaceindustries.com".to_string(),
            inverted_hosts: vec!["ptu.universe.robertsspaceindustries.com".to_string()],
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            cycle_deadline: Duration::from_secs(300),
            max_concurrent_probes: 8,
            emit_empty_metrics: false,
            categories: CategoryRules::default(),
            metric_ids: MetricIds::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(database_url) = lookup("DATABASE_URL") {
            config.database_url = Some(database_url);
        }

        if let Some(seconds) = lookup("POLL_INTERVAL_SECONDS").and_then(|v| v.parse::<u64>().ok()) {
            config.poll_interval = Duration::from_secs(seconds);
        }

        if let Some(seconds) = lookup("HTTP_TIMEOUT_SECONDS").and_then(|v| v.parse::<u64>().ok()) {
            config.http_timeout = Duration::from_secs(seconds);
        }

        if let Some(millis) = lookup("PING_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.ping_timeout = Duration::from_millis(millis);
        }

        if let Some(command) = lookup("PING_COMMAND") {
            config.ping_command = command;
        }

        if let Some(suffix) = lookup("INTERNAL_SUFFIX") {
            config.internal_suffix = suffix;
        }

        if let Some(hosts) = lookup("INVERTED_HOSTS") {
            config.inverted_hosts = hosts
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(seconds) = lookup("COOLDOWN_SECONDS").and_then(|v| v.parse().ok()) {
            config.cooldown_secs = seconds;
        }

        if let Some(seconds) = lookup("CYCLE_DEADLINE_SECONDS").and_then(|v| v.parse::<u64>().ok()) {
            config.cycle_deadline = Duration::from_secs(seconds);
        }

        if let Some(limit) = lookup("MAX_CONCURRENT_PROBES").and_then(|v| v.parse().ok()) {
            config.max_concurrent_probes = limit;
        }

        if let Some(emit) = lookup("EMIT_EMPTY_METRICS") {
            config.emit_empty_metrics = emit.to_lowercase() == "true";
        }

        if let Some(prefix) = lookup("FLEET_PREFIX") {
            config.categories.fleet_prefix = prefix;
        }

        if let Some(name) = lookup("WEBSITE_NAME") {
            config.categories.website_name = name;
        }

        if let Some(name) = lookup("PRIMARY_SERVICE_NAME") {
            config.categories.primary_service_name = name;
        }

        if let Some(id) = lookup("FLEET_METRIC_ID").and_then(|v| v.parse().ok()) {
            config.metric_ids.fleet = id;
        }

        if let Some(id) = lookup("WEBSITE_METRIC_ID").and_then(|v| v.parse().ok()) {
            config.metric_ids.website = id;
        }

        if let Some(id) = lookup("PRIMARY_SERVICE_METRIC_ID").and_then(|v| v.parse().ok()) {
            config.metric_ids.primary_service = id;
        }

        config
    }

    /// Tags the database repository applies while loading services
    pub fn ingestion_rules(&self) -> IngestionRules {
        IngestionRules {
            categories: self.categories.clone(),
            inverted_hosts: self.inverted_hosts.clone(),
            metric_ids: self.metric_ids,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        match &self.database_url {
            Some(url) if !url.is_empty() => {}
            _ => return Err("database_url must be set".to_string()),
        }

        if self.poll_interval.is_zero() {
            return Err("poll_interval must be greater than 0".to_string());
        }

        if self.http_timeout.is_zero() {
            return Err("http_timeout must be greater than 0".to_string());
        }

        if self.ping_timeout.is_zero() {
            return Err("ping_timeout must be greater than 0".to_string());
        }

        if self.ping_command.is_empty() {
            return Err("ping_command cannot be empty".to_string());
        }

        if self.cycle_deadline.is_zero() {
            return Err("cycle_deadline must be greater than 0".to_string());
        }

        if self.max_concurrent_probes == 0 {
            return Err("max_concurrent_probes must be greater than 0".to_string());
        }

        if self.categories.website_name.is_empty() || self.categories.primary_service_name.is_empty() {
            return Err("metric category names cannot be empty".to_string());
        }

        Ok(())
    }
}
