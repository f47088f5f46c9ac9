//! Container control plane access
//!
//! The rest of the crate talks to the container engine only through the
//! [`ControlPlane`] trait. [`DockerClient`] implements it against the Docker
//! Engine API on the local socket.

mod client;
mod decoder;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod types;

pub use client::{DockerClient, DEFAULT_DOCKER_HOST};
pub use decoder::{FrameDecoder, FrameStream, StreamError};
pub use types::{
    ContainerInspect, ContainerSummary, EventMessage, PingInfo, StatsFrame,
};

use async_trait::async_trait;
use bytes::Bytes;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

/// Raw body chunks of a streaming response
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DockerError>> + Send>>;

/// Lifecycle events from the daemon
pub type EventStream = FrameStream<EventMessage>;

/// An open stats stream for one container
pub struct StatsStream {
    /// Operating system of the daemon (`linux`, `windows`)
    pub os_type: String,
    pub frames: FrameStream<StatsFrame>,
}

/// Errors talking to the container engine
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("unsupported docker host {0}, only unix sockets are supported")]
    InvalidHost(String),

    #[error("failed to connect to docker daemon at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),

    #[error("docker api returned {status} for {path}: {message}")]
    Api {
        status: u16,
        path: String,
        message: String,
    },

    #[error("failed to decode docker response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DockerError {
    /// The daemon answered that the container does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, DockerError::Api { status: 404, .. })
    }
}

/// Operations the monitor needs from the container engine
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Liveness check of the daemon
    async fn ping(&self) -> Result<PingInfo, DockerError>;

    /// Currently running containers
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError>;

    /// Labels, environment, health and start time of one container
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, DockerError>;

    /// Open a continuous stats stream for one container
    async fn stats(&self, id: &str) -> Result<StatsStream, DockerError>;

    /// Subscribe to container lifecycle events
    async fn events(&self) -> Result<EventStream, DockerError>;

    async fn stop_container(&self, id: &str) -> Result<(), DockerError>;

    async fn restart_container(&self, id: &str) -> Result<(), DockerError>;
}
