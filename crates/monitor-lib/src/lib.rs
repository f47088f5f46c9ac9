//! Container resource monitor library
//!
//! This crate provides the core functionality for:
//! - Talking to the container engine (Docker Engine API)
//! - Decoding live stats streams and normalising them into metrics
//! - Bounded per-metric history
//! - Workload lifecycle tracking and pipeline supervision
//! - Health checks and observability

pub mod collector;
pub mod docker;
pub mod health;
pub mod history;
pub mod metrics;
pub mod models;
pub mod observability;

pub use collector::{
    Supervisor, SupervisorBuilder, SupervisorConfig, UpdateBus, WorkloadEvent, WorkloadRegistry,
};
pub use docker::{ControlPlane, DockerClient, DockerError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use history::{History, Sample};
pub use models::*;
pub use observability::{MonitorMetrics, StructuredLogger};
