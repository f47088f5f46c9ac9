//! Top-level supervision loop
//!
//! One cycle wires the event watcher, the admission queue and a periodic
//! ping together. When the control plane goes away the cycle ends, all state
//! is dropped and a new cycle starts after a fixed delay.

use super::bus::{UpdateBus, DEFAULT_BUS_CAPACITY};
use super::events::EventWatcher;
use super::registry::{AdmissionQueue, WorkloadRegistry};
use crate::docker::{ControlPlane, DockerError, PingInfo, StreamError};
use crate::health::{components, HealthRegistry};
use crate::observability::{MonitorMetrics, StructuredLogger};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Timing of the per-workload stream readers
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Pause after a malformed frame (default: 100 ms)
    pub decode_backoff: Duration,
    /// Quiet time after which a stream is reported (default: 2 seconds)
    pub watchdog_timeout: Duration,
    /// Age at which the health status is inspected again (default: 5 seconds)
    pub health_check_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            decode_backoff: Duration::from_millis(100),
            watchdog_timeout: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(5),
        }
    }
}

/// Configuration for the supervision loop
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay before a failed cycle is restarted (default: 5 seconds)
    pub retry_delay: Duration,
    /// Interval of the control plane ping, also the longest wait for any
    /// control plane answer within a cycle (default: 5 seconds)
    pub ping_interval: Duration,
    pub stream: StreamConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(5),
            stream: StreamConfig::default(),
        }
    }
}

/// Why a monitoring cycle ended
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("control plane ping failed: {0}")]
    Ping(#[source] DockerError),

    #[error("control plane answered the ping without an API version")]
    NoApiVersion,

    #[error("control plane did not answer within {0:?}")]
    Timeout(Duration),

    #[error("failed to subscribe to container events: {0}")]
    Subscribe(#[source] DockerError),

    #[error("failed to list running containers: {0}")]
    Enumerate(#[source] DockerError),

    #[error("container event feed ended: {0}")]
    EventsClosed(#[source] StreamError),

    #[error("event watcher task failed: {0}")]
    WatcherFailed(String),
}

impl CycleError {
    fn component(&self) -> &'static str {
        match self {
            CycleError::EventsClosed(_) | CycleError::WatcherFailed(_) => components::EVENT_WATCHER,
            _ => components::CONTROL_PLANE,
        }
    }
}

/// Keeps the monitoring pipeline alive across control plane failures
pub struct Supervisor {
    control_plane: Arc<dyn ControlPlane>,
    registry: Arc<WorkloadRegistry>,
    health: HealthRegistry,
    metrics: MonitorMetrics,
    logger: StructuredLogger,
    config: SupervisorConfig,
}

impl Supervisor {
    /// The registry fed by this supervisor
    pub fn registry(&self) -> Arc<WorkloadRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run cycles until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!(
            retry_delay_secs = self.config.retry_delay.as_secs_f64(),
            ping_interval_secs = self.config.ping_interval.as_secs_f64(),
            "Starting container monitor supervisor"
        );

        loop {
            let cycle = token.child_token();
            let result = self.run_once(&cycle).await;
            cycle.cancel();

            if token.is_cancelled() {
                break;
            }
            let Err(e) = result else {
                break;
            };

            self.registry.clear().await;
            self.health.set_unhealthy(e.component(), e.to_string()).await;
            self.metrics.inc_supervisor_restarts();
            self.logger
                .log_supervisor_retry(&e.to_string(), self.config.retry_delay);

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }

        info!("Container monitor supervisor stopped");
    }

    /// One cycle. `Ok` only when `cycle` was cancelled.
    async fn run_once(&self, cycle: &CancellationToken) -> Result<(), CycleError> {
        let Some(ping) = self.ping(cycle).await? else {
            return Ok(());
        };
        debug!(api_version = %ping.api_version, os_type = %ping.os_type, "Control plane reachable");

        let Some(events) = self
            .request(cycle, self.control_plane.events(), CycleError::Subscribe)
            .await?
        else {
            return Ok(());
        };

        let (admissions, queue) = AdmissionQueue::new();
        tokio::spawn(self.registry.clone().run_admissions(queue, cycle.clone()));

        let watcher = EventWatcher::new(self.registry.clone(), admissions.clone());
        let mut watching = tokio::spawn(watcher.run(events, cycle.clone()));

        let listed = self
            .request(cycle, self.control_plane.list_containers(), CycleError::Enumerate)
            .await;
        let running = match listed {
            Ok(Some(running)) => running,
            Ok(None) => {
                watching.abort();
                return Ok(());
            }
            Err(e) => {
                watching.abort();
                return Err(e);
            }
        };
        info!(workloads = running.len(), "Enumerated running workloads");
        for container in running {
            admissions.enqueue(container.id);
        }

        self.health.set_healthy(components::CONTROL_PLANE).await;
        self.health.set_healthy(components::EVENT_WATCHER).await;
        self.health.set_ready(true).await;

        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                biased;
                _ = cycle.cancelled() => break Ok(()),
                watched = &mut watching => {
                    break match watched {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(CycleError::EventsClosed(e)),
                        Err(e) => Err(CycleError::WatcherFailed(e.to_string())),
                    };
                }
                _ = ticker.tick() => match self.ping(cycle).await {
                    Ok(Some(_)) => {}
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
            }
        };

        watching.abort();
        result
    }

    /// Ping the control plane. A daemon that answers without an API version
    /// is not usable yet.
    async fn ping(&self, cycle: &CancellationToken) -> Result<Option<PingInfo>, CycleError> {
        let ping = self
            .request(cycle, self.control_plane.ping(), CycleError::Ping)
            .await?;
        match ping {
            Some(ping) if ping.api_version.is_empty() => Err(CycleError::NoApiVersion),
            ping => Ok(ping),
        }
    }

    /// Await a control plane call for at most one ping interval.
    /// `None` when the cycle is cancelled first.
    async fn request<T>(
        &self,
        cycle: &CancellationToken,
        call: impl Future<Output = Result<T, DockerError>>,
        failed: fn(DockerError) -> CycleError,
    ) -> Result<Option<T>, CycleError> {
        let limit = self.config.ping_interval;
        tokio::select! {
            biased;
            _ = cycle.cancelled() => Ok(None),
            answered = tokio::time::timeout(limit, call) => match answered {
                Ok(result) => result.map(Some).map_err(failed),
                Err(_) => Err(CycleError::Timeout(limit)),
            },
        }
    }
}

/// Builder for creating the supervisor
pub struct SupervisorBuilder {
    control_plane: Option<Arc<dyn ControlPlane>>,
    health: Option<HealthRegistry>,
    metrics: Option<MonitorMetrics>,
    logger: Option<StructuredLogger>,
    bus_capacity: usize,
    config: SupervisorConfig,
}

impl SupervisorBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            control_plane: None,
            health: None,
            metrics: None,
            logger: None,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            config: SupervisorConfig::default(),
        }
    }

    pub fn control_plane(mut self, control_plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: MonitorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.stream.health_check_interval = interval;
        self
    }

    /// Notifications buffered per subscriber of the update bus
    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Supervisor> {
        let control_plane = self
            .control_plane
            .ok_or_else(|| anyhow::anyhow!("Control plane is required"))?;
        if self.config.ping_interval.is_zero() {
            anyhow::bail!("Ping interval must be greater than zero");
        }

        let metrics = self.metrics.unwrap_or_default();
        let logger = self.logger.unwrap_or_default();
        let registry = Arc::new(WorkloadRegistry::new(
            control_plane.clone(),
            UpdateBus::new(self.bus_capacity),
            self.config.stream.clone(),
            metrics.clone(),
            logger.clone(),
        ));

        Ok(Supervisor {
            control_plane,
            registry,
            health: self.health.unwrap_or_default(),
            metrics,
            logger,
            config: self.config,
        })
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::FakeControlPlane;

    #[test]
    fn test_supervisor_config_default() {
        let config = SupervisorConfig::default();
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.stream.decode_backoff, Duration::from_millis(100));
        assert_eq!(config.stream.watchdog_timeout, Duration::from_secs(2));
        assert_eq!(config.stream.health_check_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_supervisor_builder() {
        let supervisor = SupervisorBuilder::new()
            .control_plane(Arc::new(FakeControlPlane::new()))
            .retry_delay(Duration::from_secs(1))
            .health_check_interval(Duration::from_secs(30))
            .build()
            .unwrap();

        assert_eq!(supervisor.config().retry_delay, Duration::from_secs(1));
        assert_eq!(
            supervisor.config().stream.health_check_interval,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_supervisor_builder_missing_control_plane() {
        assert!(SupervisorBuilder::new().build().is_err());
    }

    #[test]
    fn test_supervisor_builder_rejects_zero_ping_interval() {
        let result = SupervisorBuilder::new()
            .control_plane(Arc::new(FakeControlPlane::new()))
            .ping_interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }
}
