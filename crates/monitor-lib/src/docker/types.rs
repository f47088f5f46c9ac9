//! Docker Engine API payloads
//!
//! Only the fields the monitor reads are modelled. Every field is defaulted so
//! frames from older daemons or stopped containers still decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One point-in-time resource usage frame from the stats stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsFrame {
    #[serde(default)]
    pub read: Option<DateTime<Utc>>,
    #[serde(default)]
    pub preread: Option<DateTime<Utc>>,
    #[serde(default)]
    pub num_procs: u32,
    #[serde(default)]
    pub pids_stats: PidsStats,
    #[serde(default)]
    pub cpu_stats: CpuStats,
    #[serde(default)]
    pub precpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
    #[serde(default)]
    pub blkio_stats: BlkioStats,
    #[serde(default)]
    pub storage_stats: StorageStats,
    #[serde(default)]
    pub networks: Option<HashMap<String, NetworkStats>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PidsStats {
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub limit: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub system_cpu_usage: u64,
    #[serde(default)]
    pub online_cpus: u32,
    #[serde(default)]
    pub throttling_data: ThrottlingData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default)]
    pub percpu_usage: Option<Vec<u64>>,
    #[serde(default)]
    pub usage_in_kernelmode: u64,
    #[serde(default)]
    pub usage_in_usermode: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottlingData {
    #[serde(default)]
    pub periods: u64,
    #[serde(default)]
    pub throttled_periods: u64,
    #[serde(default)]
    pub throttled_time: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub limit: u64,
    /// Windows only
    #[serde(default, rename = "privateworkingset")]
    pub private_working_set: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlkioStats {
    #[serde(default)]
    pub io_service_bytes_recursive: Option<Vec<BlkioEntry>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlkioEntry {
    #[serde(default)]
    pub major: u64,
    #[serde(default)]
    pub minor: u64,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: u64,
}

/// Windows only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    #[serde(default)]
    pub read_size_bytes: u64,
    #[serde(default)]
    pub write_size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub tx_packets: u64,
}

/// Entry of `GET /containers/json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub state: String,
}

/// Response of `GET /containers/{id}/json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub state: Option<InspectState>,
    #[serde(default)]
    pub config: Option<InspectConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub health: Option<InspectHealth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectHealth {
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
}

/// Message on the `GET /events` feed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default, rename = "Type")]
    pub event_type: String,
    #[serde(default, rename = "Action")]
    pub action: String,
    #[serde(default, rename = "Actor")]
    pub actor: EventActor,
    #[serde(default)]
    pub time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventActor {
    #[serde(default, rename = "ID")]
    pub id: String,
    #[serde(default, rename = "Attributes")]
    pub attributes: HashMap<String, String>,
}

/// Result of `GET /_ping`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingInfo {
    pub api_version: String,
    pub os_type: String,
}

/// Error body returned by the daemon on non-2xx answers
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub message: String,
}
