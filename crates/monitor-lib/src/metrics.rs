//! Normalised metrics from raw stats frames
//!
//! Every frame carries the current counters and the counters of the previous
//! reading (`precpu_stats`), so each formula works on two consecutive
//! snapshots. All functions are pure.

use crate::docker::types::{BlkioStats, CpuStats, NetworkStats, StatsFrame};
use std::collections::HashMap;

/// Operating system family of the daemon, selects the CPU formula
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Unix,
    Windows,
}

impl OsFamily {
    /// Interpret the `Ostype` reported with a stats stream
    pub fn from_os_type(os_type: &str) -> Self {
        if os_type.eq_ignore_ascii_case("windows") {
            OsFamily::Windows
        } else {
            OsFamily::Unix
        }
    }
}

/// CPU usage in percent of one core, scaled by the number of cores
pub fn cpu_percent_unix(previous: &CpuStats, current: &CpuStats) -> f64 {
    let cpu_delta = current.cpu_usage.total_usage as f64 - previous.cpu_usage.total_usage as f64;
    let system_delta = current.system_cpu_usage as f64 - previous.system_cpu_usage as f64;

    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }

    let per_cpu = current
        .cpu_usage
        .percpu_usage
        .as_ref()
        .map(Vec::len)
        .unwrap_or(0) as f64;
    let cpus = per_cpu.max(current.online_cpus as f64);

    (cpu_delta / system_delta) * cpus * 100.0
}

/// CPU usage from 100ns intervals used against intervals available
pub fn cpu_percent_windows(frame: &StatsFrame) -> f64 {
    let elapsed_ns = match (frame.read, frame.preread) {
        (Some(read), Some(preread)) => (read - preread).num_nanoseconds().unwrap_or(0),
        _ => 0,
    };
    let possible_intervals = (elapsed_ns.max(0) / 100) as f64 * frame.num_procs as f64;

    if possible_intervals <= 0.0 {
        return 0.0;
    }

    let used_intervals = frame
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(frame.precpu_stats.cpu_usage.total_usage) as f64;

    used_intervals / possible_intervals * 100.0
}

/// Share of scheduler periods in which the container was throttled
pub fn cpu_throttled_percent(previous: &CpuStats, current: &CpuStats) -> f64 {
    let throttled_delta = current.throttling_data.throttled_periods as f64
        - previous.throttling_data.throttled_periods as f64;
    let periods_delta =
        current.throttling_data.periods as f64 - previous.throttling_data.periods as f64;

    if throttled_delta <= 0.0 || periods_delta <= 0.0 {
        return 0.0;
    }

    (throttled_delta / periods_delta * 100.0).clamp(0.0, 100.0)
}

pub fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}

/// Total bytes read and written, from entries labelled `read` / `write`
pub fn block_io(blkio: &BlkioStats) -> (u64, u64) {
    let mut read = 0u64;
    let mut write = 0u64;

    for entry in blkio.io_service_bytes_recursive.iter().flatten() {
        if entry.op.eq_ignore_ascii_case("read") {
            read = read.saturating_add(entry.value);
        } else if entry.op.eq_ignore_ascii_case("write") {
            write = write.saturating_add(entry.value);
        }
    }

    (read, write)
}

/// Received and transmitted bytes summed over all interfaces
pub fn network_io(networks: Option<&HashMap<String, NetworkStats>>) -> (u64, u64) {
    networks
        .into_iter()
        .flat_map(|interfaces| interfaces.values())
        .fold((0u64, 0u64), |(rx, tx), stats| {
            (rx.saturating_add(stats.rx_bytes), tx.saturating_add(stats.tx_bytes))
        })
}

/// Everything derived from one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsUpdate {
    /// Read time of the frame in unix seconds, 0 when the daemon had none
    /// or sent the zero time
    pub timestamp: f64,
    pub cpu_percent: f64,
    pub cpu_throttled_percent: f64,
    pub memory: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
}

impl MetricsUpdate {
    pub fn from_frame(frame: &StatsFrame, os: OsFamily) -> Self {
        let timestamp = frame
            .read
            .map(|read| read.timestamp_millis() as f64 / 1000.0)
            .filter(|timestamp| *timestamp > 0.0)
            .unwrap_or(0.0);
        let (network_rx, network_tx) = network_io(frame.networks.as_ref());

        match os {
            OsFamily::Unix => {
                let (block_read, block_write) = block_io(&frame.blkio_stats);
                Self {
                    timestamp,
                    cpu_percent: cpu_percent_unix(&frame.precpu_stats, &frame.cpu_stats),
                    cpu_throttled_percent: cpu_throttled_percent(
                        &frame.precpu_stats,
                        &frame.cpu_stats,
                    ),
                    memory: frame.memory_stats.usage,
                    memory_limit: frame.memory_stats.limit,
                    memory_percent: memory_percent(
                        frame.memory_stats.usage,
                        frame.memory_stats.limit,
                    ),
                    network_rx,
                    network_tx,
                    block_read,
                    block_write,
                    pids: frame.pids_stats.current,
                }
            }
            OsFamily::Windows => Self {
                timestamp,
                cpu_percent: cpu_percent_windows(frame),
                cpu_throttled_percent: 0.0,
                memory: frame.memory_stats.private_working_set,
                memory_limit: 0,
                memory_percent: 0.0,
                network_rx,
                network_tx,
                block_read: frame.storage_stats.read_size_bytes,
                block_write: frame.storage_stats.write_size_bytes,
                pids: frame.pids_stats.current,
            },
        }
    }
}
