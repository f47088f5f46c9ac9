//! Docker Engine API client over the local Unix socket
//!
//! Each request opens its own connection. Streaming endpoints keep their
//! connection for as long as the returned stream is alive.

use super::types::{ApiErrorBody, ContainerInspect, ContainerSummary, PingInfo};
use super::{ByteStream, ControlPlane, DockerError, EventStream, FrameStream, StatsStream};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, BodyStream, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio_stream::StreamExt;
use tracing::debug;

/// Socket used when `DOCKER_HOST` is not set
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// `filters={"type":["container"]}`, URL-encoded
const EVENTS_PATH: &str = "/events?filters=%7B%22type%22%3A%5B%22container%22%5D%7D";

/// Client for the Docker Engine API
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket_path: PathBuf,
}

impl DockerClient {
    /// Create a client for the socket at `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Create a client from a docker host string (`unix:///path` or a bare path)
    pub fn from_host(host: &str) -> Result<Self, DockerError> {
        let host = host.trim();
        let path = match host.strip_prefix("unix://") {
            Some(path) => path,
            None if host.contains("://") => return Err(DockerError::InvalidHost(host.to_string())),
            None => host,
        };

        if path.is_empty() {
            return Err(DockerError::InvalidHost(host.to_string()));
        }

        Ok(Self::new(path))
    }

    /// Create a client from `DOCKER_HOST`, falling back to the default socket
    pub fn from_env() -> Result<Self, DockerError> {
        match std::env::var("DOCKER_HOST") {
            Ok(host) if !host.trim().is_empty() => Self::from_host(&host),
            _ => Self::from_host(DEFAULT_DOCKER_HOST),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a bodiless request and return the response if the daemon accepted it
    async fn send(&self, method: Method, path: &str) -> Result<Response<Incoming>, DockerError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| DockerError::Connect {
                path: self.socket_path.display().to_string(),
                source,
            })?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Docker connection closed with error");
            }
        });

        let request = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())?;

        debug!(method = %method, path = %path, "Docker API request");
        let response = sender.send_request(request).await?;

        let status = response.status();
        // 304 answers stop/restart of a container already in the target state
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }

        let body = response.into_body().collect().await?.to_bytes();
        let message = serde_json::from_slice::<ApiErrorBody>(&body)
            .map(|error| error.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).trim().to_string());

        Err(DockerError::Api {
            status: status.as_u16(),
            path: path.to_string(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DockerError> {
        let response = self.send(Method::GET, path).await?;
        let body = response.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }
}

fn header_value(response: &Response<Incoming>, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Data chunks of a response body, trailers dropped
fn body_stream(body: Incoming) -> ByteStream {
    let chunks = BodyStream::new(body).filter_map(|frame| match frame {
        Ok(frame) => frame.into_data().ok().map(Ok),
        Err(e) => Some(Err(DockerError::from(e))),
    });
    Box::pin(chunks)
}

#[async_trait]
impl ControlPlane for DockerClient {
    async fn ping(&self) -> Result<PingInfo, DockerError> {
        let response = self.send(Method::GET, "/_ping").await?;
        Ok(PingInfo {
            api_version: header_value(&response, "api-version"),
            os_type: header_value(&response, "ostype"),
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        self.get_json("/containers/json").await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, DockerError> {
        self.get_json(&format!("/containers/{id}/json")).await
    }

    async fn stats(&self, id: &str) -> Result<StatsStream, DockerError> {
        let response = self
            .send(Method::GET, &format!("/containers/{id}/stats?stream=true"))
            .await?;
        let os_type = header_value(&response, "ostype");

        Ok(StatsStream {
            os_type,
            frames: FrameStream::new(body_stream(response.into_body())),
        })
    }

    async fn events(&self) -> Result<EventStream, DockerError> {
        let response = self.send(Method::GET, EVENTS_PATH).await?;
        Ok(FrameStream::new(body_stream(response.into_body())))
    }

    async fn stop_container(&self, id: &str) -> Result<(), DockerError> {
        self.send(Method::POST, &format!("/containers/{id}/stop"))
            .await
            .map(|_| ())
    }

    async fn restart_container(&self, id: &str) -> Result<(), DockerError> {
        self.send(Method::POST, &format!("/containers/{id}/restart"))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_host_accepts_unix_sockets() {
        let client = DockerClient::from_host("unix:///var/run/docker.sock").unwrap();
        assert_eq!(client.socket_path(), Path::new("/var/run/docker.sock"));

        let client = DockerClient::from_host("/tmp/docker.sock").unwrap();
        assert_eq!(client.socket_path(), Path::new("/tmp/docker.sock"));
    }

    #[test]
    fn test_from_host_rejects_other_schemes() {
        assert!(matches!(
            DockerClient::from_host("tcp://127.0.0.1:2375"),
            Err(DockerError::InvalidHost(_))
        ));
        assert!(matches!(
            DockerClient::from_host("unix://"),
            Err(DockerError::InvalidHost(_))
        ));
        assert!(DockerClient::from_host("  ").is_err());
    }

    #[tokio::test]
    async fn test_missing_socket_is_connect_error() {
        let client = DockerClient::new("/nonexistent/docker-monitor-test.sock");
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, DockerError::Connect { .. }));
    }
}
