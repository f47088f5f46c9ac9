//! Core data models for the container monitor

use crate::docker::types::ContainerInspect;
use crate::history::{History, Sample};
use crate::metrics::MetricsUpdate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const LABEL_PROJECT: &str = "com.docker.compose.project";
const LABEL_PROJECT_DIR: &str = "com.docker.compose.project.working_dir";
const LABEL_SERVICE: &str = "com.docker.compose.service";
const LABEL_CONTAINER_NUMBER: &str = "com.docker.compose.container-number";

/// Lifecycle state of a tracked workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadState {
    /// Discovered but not yet inspected
    #[default]
    Unknown,
    Running,
    /// A stop command was issued
    Stopping,
    /// A restart command is in flight
    Restarting,
    /// Terminal, the record is being removed
    Stopped,
}

/// Health status reported by the container's own health check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// The container defines no health check, or it was not read yet
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    /// Map the inspected health section to a state
    pub fn from_inspect(inspect: &ContainerInspect) -> Self {
        match inspect.state.as_ref().and_then(|state| state.health.as_ref()) {
            Some(health) if health.status == "healthy" => HealthState::Healthy,
            Some(_) => HealthState::Unhealthy,
            None => HealthState::Unknown,
        }
    }
}

/// Orchestration labels identifying membership in a multi-container project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeLabels {
    pub project: Option<String>,
    pub project_dir: Option<String>,
    pub service: Option<String>,
    pub container_number: Option<i64>,
}

impl ComposeLabels {
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        let non_empty = |key: &str| labels.get(key).filter(|value| !value.is_empty()).cloned();

        Self {
            project: non_empty(LABEL_PROJECT),
            project_dir: non_empty(LABEL_PROJECT_DIR),
            service: non_empty(LABEL_SERVICE),
            container_number: labels
                .get(LABEL_CONTAINER_NUMBER)
                .and_then(|value| value.trim().parse().ok()),
        }
    }
}

/// Human readable name for a workload.
///
/// Priority: `service-number`, then `service`, then the workload name
/// without its leading `/`, then the first 8 characters of the ID.
pub fn alternative_name(labels: &ComposeLabels, name: &str, id: &str) -> String {
    match (&labels.service, labels.container_number) {
        (Some(service), Some(number)) if number > 0 => format!("{service}-{number}"),
        (Some(service), _) => service.clone(),
        _ => {
            let name = name.trim_start_matches('/');
            if name.is_empty() {
                id.chars().take(8).collect()
            } else {
                name.to_string()
            }
        }
    }
}

/// Parse `KEY=VALUE` strings, splitting on the first `=`.
/// Entries without `=` are skipped.
pub fn parse_env(vars: &[String]) -> BTreeMap<String, String> {
    vars.iter()
        .filter_map(|var| var.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// What the stream reader has to follow up on after recording a frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// First frame with a real reading for this record
    pub first_seen: bool,
    /// The last health check is older than the configured interval
    pub health_stale: bool,
    /// No processes left while Running or Stopping, the workload may have
    /// exited without a stop event
    pub suspect_stopped: bool,
}

impl IngestOutcome {
    pub fn needs_inspection(&self) -> bool {
        self.first_seen || self.health_stale
    }
}

/// Everything known about one tracked workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub id: String,
    pub state: WorkloadState,
    /// Start time in unix seconds
    pub created: i64,
    pub name: String,
    pub alternative_name: String,
    pub image: String,
    pub compose: ComposeLabels,
    pub env_vars: BTreeMap<String, String>,

    /// Read time of the last frame, 0 before the first one
    pub last_updated: f64,
    pub cpu_percent: f64,
    pub cpu_percent_history: History,
    pub cpu_throttled_percent: f64,
    pub cpu_throttled_history: History,
    pub memory: u64,
    pub memory_limit: u64,
    pub memory_history: History,
    pub memory_percent: f64,
    pub memory_percent_history: History,
    pub network_rx: u64,
    pub network_rx_history: History,
    pub network_tx: u64,
    pub network_tx_history: History,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,

    pub health: HealthState,
    /// Frame time of the last health check, 0 before the first one
    pub health_updated: f64,
}

impl WorkloadRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let alternative_name = alternative_name(&ComposeLabels::default(), "", &id);

        Self {
            id,
            state: WorkloadState::Unknown,
            created: 0,
            name: String::new(),
            alternative_name,
            image: String::new(),
            compose: ComposeLabels::default(),
            env_vars: BTreeMap::new(),
            last_updated: 0.0,
            cpu_percent: 0.0,
            cpu_percent_history: History::new(),
            cpu_throttled_percent: 0.0,
            cpu_throttled_history: History::new(),
            memory: 0,
            memory_limit: 0,
            memory_history: History::new(),
            memory_percent: 0.0,
            memory_percent_history: History::new(),
            network_rx: 0,
            network_rx_history: History::new(),
            network_tx: 0,
            network_tx_history: History::new(),
            block_read: 0,
            block_write: 0,
            pids: 0,
            health: HealthState::Unknown,
            health_updated: 0.0,
        }
    }

    /// Fill identity and orchestration metadata from the first inspection
    pub fn apply_inspect(&mut self, inspect: &ContainerInspect) {
        self.name = inspect.name.trim_start_matches('/').to_string();
        self.image = inspect.image.clone();

        if let Some(started) = inspect
            .state
            .as_ref()
            .and_then(|state| chrono::DateTime::parse_from_rfc3339(&state.started_at).ok())
        {
            self.created = started.timestamp();
        }

        if let Some(labels) = inspect
            .config
            .as_ref()
            .and_then(|config| config.labels.as_ref())
        {
            self.compose = ComposeLabels::from_labels(labels);
        }

        self.alternative_name = alternative_name(&self.compose, &self.name, &self.id);
        self.state = WorkloadState::Running;
    }

    /// Refresh health, and environment on the first observation
    pub fn apply_health_check(&mut self, inspect: &ContainerInspect, capture_env: bool) {
        if capture_env {
            if let Some(env) = inspect.config.as_ref().and_then(|config| config.env.as_ref()) {
                self.env_vars = parse_env(env);
            }
        }
        self.health = HealthState::from_inspect(inspect);
        self.health_updated = self.last_updated;
    }

    /// Record the metrics of one frame and append one sample per history
    pub fn record_metrics(
        &mut self,
        update: &MetricsUpdate,
        health_check_interval_secs: f64,
    ) -> IngestOutcome {
        let first_seen = self.last_updated == 0.0;
        let timestamp = update.timestamp;

        let (rx_delta, tx_delta) = if first_seen {
            (0, 0)
        } else {
            (
                update.network_rx.saturating_sub(self.network_rx),
                update.network_tx.saturating_sub(self.network_tx),
            )
        };

        self.last_updated = timestamp;
        self.cpu_percent = update.cpu_percent;
        self.cpu_percent_history.add(Sample::new(timestamp, update.cpu_percent));
        self.cpu_throttled_percent = update.cpu_throttled_percent;
        self.cpu_throttled_history
            .add(Sample::new(timestamp, update.cpu_throttled_percent));
        self.memory = update.memory;
        self.memory_limit = update.memory_limit;
        self.memory_history.add(Sample::new(timestamp, update.memory as f64));
        self.memory_percent = update.memory_percent;
        self.memory_percent_history
            .add(Sample::new(timestamp, update.memory_percent));
        self.network_rx = update.network_rx;
        self.network_tx = update.network_tx;
        self.network_rx_history.add(Sample::new(timestamp, rx_delta as f64));
        self.network_tx_history.add(Sample::new(timestamp, tx_delta as f64));
        self.block_read = update.block_read;
        self.block_write = update.block_write;
        self.pids = update.pids;

        IngestOutcome {
            first_seen,
            health_stale: timestamp - self.health_updated > health_check_interval_secs,
            suspect_stopped: matches!(
                self.state,
                WorkloadState::Running | WorkloadState::Stopping
            ) && self.pids == 0,
        }
    }
}
