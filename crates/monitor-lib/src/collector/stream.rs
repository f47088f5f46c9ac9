//! Per-workload stats stream reader

use super::bus::WorkloadEvent;
use super::registry::{StopReason, WorkloadEntry, WorkloadRegistry};
use crate::docker::{StatsFrame, StatsStream};
use crate::metrics::{MetricsUpdate, OsFamily};
use crate::observability::MonitorMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Follows the stats stream of one workload until it ends or is cancelled
pub(crate) struct StatsStreamReader {
    registry: Arc<WorkloadRegistry>,
    entry: Arc<WorkloadEntry>,
    token: CancellationToken,
}

impl StatsStreamReader {
    pub(crate) fn new(
        registry: Arc<WorkloadRegistry>,
        entry: Arc<WorkloadEntry>,
        token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            entry,
            token,
        }
    }

    pub(crate) async fn run(self) {
        let id = self.entry.id().to_string();

        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            opened = self.registry.control_plane.stats(&id) => opened,
        };
        let StatsStream { os_type, mut frames } = match opened {
            Ok(stream) => stream,
            Err(e) => {
                // Left to the event feed or the next cycle to clean up
                self.registry.metrics.inc_stream_open_failures();
                warn!(
                    container_id = %id,
                    error = %e,
                    "Failed to open stats stream, workload stays tracked without readings"
                );
                return;
            }
        };
        let os = OsFamily::from_os_type(&os_type);
        debug!(container_id = %id, os_type = %os_type, "Stats stream opened");

        let (heartbeat, heartbeats) = mpsc::channel(1);
        tokio::spawn(watch_stream(
            id.clone(),
            heartbeats,
            self.registry.config.watchdog_timeout,
            self.token.clone(),
            self.registry.metrics.clone(),
        ));

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = frames.next_frame() => next,
            };
            // Full channel means the watchdog has an unread beat already
            let _ = heartbeat.try_send(());

            match next {
                Ok(frame) => self.ingest(&frame, os).await,
                Err(e) if e.is_terminal() => {
                    debug!(container_id = %id, reason = %e, "Stats stream ended");
                    break;
                }
                Err(e) => {
                    self.registry.metrics.inc_decode_errors();
                    warn!(container_id = %id, error = %e, "Skipping malformed stats frame");
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(self.registry.config.decode_backoff) => {}
                    }
                }
            }
        }
    }

    /// Record one frame, then run the follow-ups it calls for
    async fn ingest(&self, frame: &StatsFrame, os: OsFamily) {
        let started = Instant::now();
        let id = self.entry.id();
        let update = MetricsUpdate::from_frame(frame, os);

        let outcome = self.entry.record.write().await.record_metrics(
            &update,
            self.registry.config.health_check_interval.as_secs_f64(),
        );
        self.registry.metrics.inc_frames_ingested();
        self.registry.metrics.observe_ingest_latency(started.elapsed());

        if outcome.needs_inspection() {
            self.registry
                .refresh_metadata(&self.entry, outcome.first_seen)
                .await;
        }

        if outcome.suspect_stopped && !self.registry.verify_running(id).await {
            self.registry.mark_stopped(id, StopReason::Heuristic).await;
            return;
        }

        self.registry.bus.publish(WorkloadEvent::Updated(id.to_string()));
    }
}

/// Log whenever the reader goes `timeout` without a frame or an error.
/// Ends with the reader.
async fn watch_stream(
    id: String,
    mut heartbeats: mpsc::Receiver<()>,
    timeout: Duration,
    token: CancellationToken,
    metrics: MonitorMetrics,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            beat = heartbeats.recv() => {
                if beat.is_none() {
                    break;
                }
            }
            _ = tokio::time::sleep(timeout) => {
                metrics.inc_stream_timeouts();
                info!(
                    container_id = %id,
                    timeout_secs = timeout.as_secs_f64(),
                    "No stats received within timeout"
                );
            }
        }
    }
}
