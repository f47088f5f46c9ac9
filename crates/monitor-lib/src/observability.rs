//! Observability infrastructure for the container monitor
//!
//! Provides:
//! - Prometheus metrics (tracked workloads, ingested frames, stream errors, ingest latency)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for per-frame ingest latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MonitorMetricsInner> = OnceLock::new();

struct MonitorMetricsInner {
    workloads_tracked: IntGauge,
    frames_ingested: IntCounter,
    decode_errors: IntCounter,
    stream_timeouts: IntCounter,
    stream_open_failures: IntCounter,
    supervisor_restarts: IntCounter,
    commands: IntCounterVec,
    ingest_latency_seconds: Histogram,
}

impl MonitorMetricsInner {
    fn new() -> Self {
        Self {
            workloads_tracked: register_int_gauge!(
                "container_monitor_workloads_tracked",
                "Number of workloads currently tracked"
            )
            .expect("Failed to register workloads_tracked"),

            frames_ingested: register_int_counter!(
                "container_monitor_frames_ingested_total",
                "Total number of stats frames recorded"
            )
            .expect("Failed to register frames_ingested"),

            decode_errors: register_int_counter!(
                "container_monitor_decode_errors_total",
                "Total number of malformed frames skipped"
            )
            .expect("Failed to register decode_errors"),

            stream_timeouts: register_int_counter!(
                "container_monitor_stream_timeouts_total",
                "Total number of stats streams that went quiet past the watchdog timeout"
            )
            .expect("Failed to register stream_timeouts"),

            stream_open_failures: register_int_counter!(
                "container_monitor_stream_open_failures_total",
                "Stats streams that could not be opened; the workload stays tracked without readings"
            )
            .expect("Failed to register stream_open_failures"),

            supervisor_restarts: register_int_counter!(
                "container_monitor_supervisor_restarts_total",
                "Total number of pipeline restarts after a control plane failure"
            )
            .expect("Failed to register supervisor_restarts"),

            commands: register_int_counter_vec!(
                "container_monitor_commands_total",
                "Stop and restart commands issued, by command and outcome",
                &["command", "outcome"]
            )
            .expect("Failed to register commands"),

            ingest_latency_seconds: register_histogram!(
                "container_monitor_ingest_latency_seconds",
                "Time spent recording one stats frame",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register ingest_latency_seconds"),
        }
    }
}

/// Monitor metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct MonitorMetrics {
    inner: &'static MonitorMetricsInner,
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MonitorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorMetrics").finish_non_exhaustive()
    }
}

impl MonitorMetrics {
    /// Create a metrics handle, registering the metrics on first call
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new),
        }
    }

    pub fn set_workloads_tracked(&self, count: usize) {
        self.inner.workloads_tracked.set(count as i64);
    }

    pub fn inc_frames_ingested(&self) {
        self.inner.frames_ingested.inc();
    }

    pub fn inc_decode_errors(&self) {
        self.inner.decode_errors.inc();
    }

    pub fn inc_stream_timeouts(&self) {
        self.inner.stream_timeouts.inc();
    }

    pub fn inc_stream_open_failures(&self) {
        self.inner.stream_open_failures.inc();
    }

    pub fn stream_open_failures(&self) -> u64 {
        self.inner.stream_open_failures.get()
    }

    pub fn inc_supervisor_restarts(&self) {
        self.inner.supervisor_restarts.inc();
    }

    /// Count a stop or restart command by whether the control plane accepted it
    pub fn inc_command(&self, command: &str, success: bool) {
        let outcome = if success { "ok" } else { "error" };
        self.inner
            .commands
            .with_label_values(&[command, outcome])
            .inc();
    }

    pub fn observe_ingest_latency(&self, elapsed: Duration) {
        self.inner.ingest_latency_seconds.observe(elapsed.as_secs_f64());
    }
}

/// Structured logger for monitor lifecycle events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new("unknown")
    }
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log monitor startup
    pub fn log_startup(&self, version: &str, docker_host: &str) {
        info!(
            event = "monitor_started",
            node = %self.node_name,
            monitor_version = %version,
            docker_host = %docker_host,
            "Container monitor started"
        );
    }

    /// Log the start of a stats stream for a newly tracked workload
    pub fn log_workload_followed(&self, container_id: &str, name: &str, alternative_name: &str) {
        info!(
            event = "workload_followed",
            node = %self.node_name,
            container_id = %container_id,
            name = %name,
            alternative_name = %alternative_name,
            "Following workload"
        );
    }

    /// Log the removal of a workload that reached the stopped state
    pub fn log_workload_stopped(&self, container_id: &str, name: &str, reason: &str) {
        info!(
            event = "workload_stopped",
            node = %self.node_name,
            container_id = %container_id,
            name = %name,
            reason = %reason,
            "Workload stopped"
        );
    }

    /// Log a pipeline restart after a failed cycle
    pub fn log_supervisor_retry(&self, error: &str, delay: Duration) {
        warn!(
            event = "supervisor_retry",
            node = %self.node_name,
            error = %error,
            retry_in_secs = delay.as_secs_f64(),
            "Monitoring cycle ended, restarting"
        );
    }

    /// Log monitor shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "monitor_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Container monitor shutting down"
        );
    }
}
