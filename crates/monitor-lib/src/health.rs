//! Liveness and readiness of the monitoring pipeline
//!
//! The supervisor reports on two components, the control plane connection
//! and the event subscription. Probes read the aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Reconnecting, data may be stale
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

/// Last reported state of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }
}

/// Aggregate answer of the liveness probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    fn from_components(components: BTreeMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        Self { status, components }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    /// Reachability of the container engine
    pub const CONTROL_PLANE: &str = "control_plane";
    /// The lifecycle event subscription
    pub const EVENT_WATCHER: &str = "event_watcher";
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<String, ComponentHealth>,
    /// Set once the first cycle has enumerated the running workloads
    connected: bool,
}

/// Shared view of component health; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start reporting on a component, initially healthy
    pub async fn register(&self, name: &str) {
        self.report(name, ComponentHealth::healthy()).await;
    }

    pub async fn report(&self, name: &str, health: ComponentHealth) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.report(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.report(
            name,
            ComponentHealth::new(ComponentStatus::Degraded, Some(message.into())),
        )
        .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.report(
            name,
            ComponentHealth::new(ComponentStatus::Unhealthy, Some(message.into())),
        )
        .await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.connected = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse::from_components(self.state.read().await.components.clone())
    }

    /// Ready once connected, for as long as no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        if !state.connected {
            return ReadinessResponse {
                ready: false,
                reason: Some("not connected to the control plane yet".to_string()),
            };
        }

        let failing: Vec<&str> = state
            .components
            .iter()
            .filter(|(_, health)| !health.status.is_operational())
            .map(|(name, _)| name.as_str())
            .collect();

        if failing.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("unhealthy: {}", failing.join(", "))),
            }
        }
    }
}
