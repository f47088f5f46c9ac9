//! Scripted in-memory control plane for tests
//!
//! Stats streams replay pre-recorded chunks, the event feed is driven through
//! a channel, and every command is recorded for later assertions.

use super::types::{
    ContainerInspect, ContainerSummary, InspectConfig, InspectHealth, InspectState, PingInfo,
};
use super::{ByteStream, ControlPlane, DockerError, EventStream, FrameStream, StatsStream};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

struct ScriptedStats {
    chunks: Vec<Bytes>,
    keep_open: bool,
}

struct FakeState {
    running: Vec<String>,
    inspects: HashMap<String, ContainerInspect>,
    stats: HashMap<String, VecDeque<ScriptedStats>>,
    event_feeds: VecDeque<mpsc::UnboundedReceiver<Bytes>>,
    os_type: String,
    api_version: String,
    ping_ok: bool,
    ping_hangs: bool,
    fail_inspect: bool,
    fail_list: bool,
    fail_stop: bool,
    fail_stats: bool,
    inspect_calls: usize,
    list_calls: usize,
    ping_calls: usize,
    stats_calls: Vec<String>,
    stop_calls: Vec<String>,
    restart_calls: Vec<String>,
}

/// In-memory [`ControlPlane`] with scripted responses
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                running: Vec::new(),
                inspects: HashMap::new(),
                stats: HashMap::new(),
                event_feeds: VecDeque::new(),
                os_type: "linux".to_string(),
                api_version: "1.43".to_string(),
                ping_ok: true,
                ping_hangs: false,
                fail_inspect: false,
                fail_list: false,
                fail_stop: false,
                fail_stats: false,
                inspect_calls: 0,
                list_calls: 0,
                ping_calls: 0,
                stats_calls: Vec::new(),
                stop_calls: Vec::new(),
                restart_calls: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a running container
    pub fn add_container(&self, inspect: ContainerInspect) {
        let mut state = self.state();
        if !state.running.contains(&inspect.id) {
            state.running.push(inspect.id.clone());
        }
        state.inspects.insert(inspect.id.clone(), inspect);
    }

    /// Drop a container from the running list; inspection keeps working
    pub fn remove_container(&self, id: &str) {
        self.state().running.retain(|running| running != id);
    }

    /// Queue one stats stream for `id`. Later calls queue further streams.
    ///
    /// With `keep_open` the stream stays open after the last chunk instead of
    /// ending.
    pub fn script_stats(&self, id: &str, chunks: Vec<String>, keep_open: bool) {
        let scripted = ScriptedStats {
            chunks: chunks.into_iter().map(Bytes::from).collect(),
            keep_open,
        };
        self.state()
            .stats
            .entry(id.to_string())
            .or_default()
            .push_back(scripted);
    }

    /// Queue an event feed; the next `events()` call is served from it
    pub fn event_feed(&self) -> mpsc::UnboundedSender<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().event_feeds.push_back(rx);
        tx
    }

    pub fn set_os_type(&self, os_type: &str) {
        self.state().os_type = os_type.to_string();
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.state().ping_ok = ok;
    }

    /// Version reported by ping; empty mimics a daemon that is not ready
    pub fn set_api_version(&self, version: &str) {
        self.state().api_version = version.to_string();
    }

    /// Leave later pings unanswered, like a daemon that accepted the
    /// connection but never replies
    pub fn set_ping_hangs(&self, hangs: bool) {
        self.state().ping_hangs = hangs;
    }

    pub fn set_fail_inspect(&self, fail: bool) {
        self.state().fail_inspect = fail;
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.state().fail_stop = fail;
    }

    pub fn set_fail_stats(&self, fail: bool) {
        self.state().fail_stats = fail;
    }

    pub fn inspect_calls(&self) -> usize {
        self.state().inspect_calls
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn ping_calls(&self) -> usize {
        self.state().ping_calls
    }

    pub fn stats_calls(&self) -> Vec<String> {
        self.state().stats_calls.clone()
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.state().stop_calls.clone()
    }

    pub fn restart_calls(&self) -> Vec<String> {
        self.state().restart_calls.clone()
    }
}

fn unavailable(path: &str) -> DockerError {
    DockerError::Api {
        status: 500,
        path: path.to_string(),
        message: "scripted failure".to_string(),
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn ping(&self) -> Result<PingInfo, DockerError> {
        let hangs = {
            let mut state = self.state();
            state.ping_calls += 1;
            state.ping_hangs
        };
        if hangs {
            std::future::pending::<()>().await;
        }

        let state = self.state();
        if !state.ping_ok {
            return Err(unavailable("/_ping"));
        }
        Ok(PingInfo {
            api_version: state.api_version.clone(),
            os_type: state.os_type.clone(),
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        let mut state = self.state();
        state.list_calls += 1;
        if state.fail_list {
            return Err(unavailable("/containers/json"));
        }
        Ok(state
            .running
            .iter()
            .map(|id| ContainerSummary {
                id: id.clone(),
                state: "running".to_string(),
                ..Default::default()
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, DockerError> {
        let mut state = self.state();
        state.inspect_calls += 1;
        if state.fail_inspect {
            return Err(unavailable(&format!("/containers/{id}/json")));
        }
        state
            .inspects
            .get(id)
            .cloned()
            .ok_or_else(|| DockerError::Api {
                status: 404,
                path: format!("/containers/{id}/json"),
                message: format!("No such container: {id}"),
            })
    }

    async fn stats(&self, id: &str) -> Result<StatsStream, DockerError> {
        let mut state = self.state();
        state.stats_calls.push(id.to_string());
        if state.fail_stats {
            return Err(unavailable(&format!("/containers/{id}/stats")));
        }
        let scripted = state.stats.get_mut(id).and_then(|queue| queue.pop_front());

        let body: ByteStream = match scripted {
            Some(ScriptedStats { chunks, keep_open }) => {
                let chunks = tokio_stream::iter(chunks.into_iter().map(Ok::<Bytes, DockerError>));
                if keep_open {
                    Box::pin(chunks.chain(tokio_stream::pending::<Result<Bytes, DockerError>>()))
                } else {
                    Box::pin(chunks)
                }
            }
            None => Box::pin(tokio_stream::pending::<Result<Bytes, DockerError>>()),
        };

        Ok(StatsStream {
            os_type: state.os_type.clone(),
            frames: FrameStream::new(body),
        })
    }

    async fn events(&self) -> Result<EventStream, DockerError> {
        let body: ByteStream = match self.state().event_feeds.pop_front() {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx).map(Ok::<Bytes, DockerError>)),
            None => Box::pin(tokio_stream::pending::<Result<Bytes, DockerError>>()),
        };
        Ok(FrameStream::new(body))
    }

    async fn stop_container(&self, id: &str) -> Result<(), DockerError> {
        let mut state = self.state();
        state.stop_calls.push(id.to_string());
        if state.fail_stop {
            return Err(unavailable(&format!("/containers/{id}/stop")));
        }
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<(), DockerError> {
        self.state().restart_calls.push(id.to_string());
        Ok(())
    }
}

/// Inspection result of a plain running container
pub fn inspect_fixture(id: &str, name: &str) -> ContainerInspect {
    ContainerInspect {
        id: id.to_string(),
        name: name.to_string(),
        image: "sha256:feedface".to_string(),
        state: Some(InspectState {
            status: "running".to_string(),
            running: true,
            started_at: "2024-03-01T12:00:00.000000000Z".to_string(),
            health: None,
        }),
        config: Some(InspectConfig {
            image: "nginx:latest".to_string(),
            labels: Some(HashMap::new()),
            env: Some(vec!["PATH=/usr/bin".to_string(), "MODE=prod=1".to_string()]),
        }),
    }
}

/// Inspection result of a container started by an orchestration project
pub fn compose_inspect_fixture(id: &str, name: &str, service: &str, number: u32) -> ContainerInspect {
    let mut inspect = inspect_fixture(id, name);
    if let Some(config) = inspect.config.as_mut() {
        let labels = config.labels.get_or_insert_with(HashMap::new);
        labels.insert("com.docker.compose.project".to_string(), "shop".to_string());
        labels.insert(
            "com.docker.compose.project.working_dir".to_string(),
            "/srv/shop".to_string(),
        );
        labels.insert("com.docker.compose.service".to_string(), service.to_string());
        labels.insert(
            "com.docker.compose.container-number".to_string(),
            number.to_string(),
        );
    }
    inspect
}

/// Attach a reported health status to an inspection result
pub fn with_health(mut inspect: ContainerInspect, status: &str) -> ContainerInspect {
    if let Some(state) = inspect.state.as_mut() {
        state.health = Some(InspectHealth {
            status: status.to_string(),
        });
    }
    inspect
}

/// Values of one scripted stats frame
#[derive(Debug, Clone)]
pub struct FrameFixture {
    pub read_secs: i64,
    pub total_usage: u64,
    pub pre_total_usage: u64,
    pub system_usage: u64,
    pub pre_system_usage: u64,
    pub online_cpus: u32,
    pub pids: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Previous read time; the same as `read_secs` when unset
    pub preread_secs: Option<i64>,
    /// Windows only
    pub num_procs: u32,
    /// Windows only
    pub private_working_set: u64,
}

impl Default for FrameFixture {
    fn default() -> Self {
        Self {
            read_secs: 1_709_294_400,
            total_usage: 150,
            pre_total_usage: 100,
            system_usage: 1100,
            pre_system_usage: 1000,
            online_cpus: 4,
            pids: 3,
            memory_usage: 256,
            memory_limit: 1024,
            rx_bytes: 1000,
            tx_bytes: 500,
            preread_secs: None,
            num_procs: 0,
            private_working_set: 0,
        }
    }
}

impl FrameFixture {
    /// The frame as the daemon writes it, newline terminated
    pub fn to_json_line(&self) -> String {
        let rfc3339 = |secs: i64| {
            chrono::DateTime::from_timestamp(secs, 0)
                .unwrap_or_default()
                .to_rfc3339()
        };
        let frame = json!({
            "read": rfc3339(self.read_secs),
            "preread": rfc3339(self.preread_secs.unwrap_or(self.read_secs)),
            "pids_stats": {"current": self.pids},
            "num_procs": self.num_procs,
            "cpu_stats": {
                "cpu_usage": {"total_usage": self.total_usage},
                "system_cpu_usage": self.system_usage,
                "online_cpus": self.online_cpus,
                "throttling_data": {"periods": 0, "throttled_periods": 0, "throttled_time": 0}
            },
            "precpu_stats": {
                "cpu_usage": {"total_usage": self.pre_total_usage},
                "system_cpu_usage": self.pre_system_usage,
                "online_cpus": self.online_cpus,
                "throttling_data": {"periods": 0, "throttled_periods": 0, "throttled_time": 0}
            },
            "memory_stats": {
                "usage": self.memory_usage,
                "limit": self.memory_limit,
                "privateworkingset": self.private_working_set
            },
            "blkio_stats": {"io_service_bytes_recursive": [
                {"major": 8, "minor": 0, "op": "read", "value": 4096},
                {"major": 8, "minor": 0, "op": "write", "value": 8192}
            ]},
            "networks": {"eth0": {"rx_bytes": self.rx_bytes, "tx_bytes": self.tx_bytes}}
        });
        format!("{frame}\n")
    }
}

/// A container lifecycle event as written on the event feed
pub fn event_line(action: &str, id: &str) -> Bytes {
    let event = json!({
        "Type": "container",
        "Action": action,
        "Actor": {"ID": id, "Attributes": {}},
        "time": 1_709_294_400
    });
    Bytes::from(format!("{event}\n"))
}
