//! Monitor configuration

use anyhow::Result;
use monitor_lib::docker::DEFAULT_DOCKER_HOST;
use monitor_lib::SupervisorConfig;
use serde::Deserialize;
use std::time::Duration;

/// Monitor configuration, read from `MONITOR_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Docker daemon socket, `unix:///path` or a bare path
    #[serde(default = "default_docker_host")]
    pub docker_host: String,

    /// API server port for health, metrics and workload snapshots
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Host name reported in structured logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Delay before the pipeline restarts after losing the daemon
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Age after which a workload's health status is inspected again
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

fn default_docker_host() -> String {
    std::env::var("DOCKER_HOST")
        .ok()
        .filter(|host| !host.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_retry_delay() -> u64 {
    5
}

fn default_ping_interval() -> u64 {
    5
}

fn default_health_check_interval() -> u64 {
    5
}

impl MonitorConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("MONITOR"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Timing of the supervision loop and the stream readers
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig {
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ..Default::default()
        };
        config.stream.health_check_interval = Duration::from_secs(self.health_check_interval_secs);
        config
    }
}
