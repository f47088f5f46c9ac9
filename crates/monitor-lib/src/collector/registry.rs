//! Registry of tracked workloads and their lifecycle
//!
//! The map of IDs to entries is guarded by one lock that is only taken for
//! structural changes. Every entry carries its own record lock, so a stream
//! reader updating one workload never waits on another.

use super::bus::{UpdateBus, WorkloadEvent};
use super::stream::StatsStreamReader;
use super::supervisor::StreamConfig;
use crate::docker::ControlPlane;
use crate::models::{WorkloadRecord, WorkloadState};
use crate::observability::{MonitorMetrics, StructuredLogger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a workload was marked stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A `stop` lifecycle event
    Event,
    /// A `destroy` lifecycle event
    Destroyed,
    /// No processes left and no longer listed by the control plane
    Heuristic,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Event => "stop_event",
            StopReason::Destroyed => "destroy_event",
            StopReason::Heuristic => "no_processes",
        }
    }
}

/// One tracked workload: its record and the cancellation scope of its tasks
#[derive(Debug)]
pub(crate) struct WorkloadEntry {
    id: String,
    pub(crate) record: RwLock<WorkloadRecord>,
    /// Scope of everything running for this workload
    cancel: CancellationToken,
    /// Scope of the current stream reader, replaced on restart
    reader: Mutex<CancellationToken>,
}

impl WorkloadEntry {
    pub(crate) fn new(record: WorkloadRecord, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let reader = cancel.child_token();
        Self {
            id: record.id.clone(),
            record: RwLock::new(record),
            cancel,
            reader: Mutex::new(reader),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Cancel the current reader and hand out the scope for its successor
    fn replace_reader(&self) -> CancellationToken {
        let next = self.cancel.child_token();
        let mut reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = std::mem::replace(&mut *reader, next.clone());
        previous.cancel();
        next
    }

    fn reader_token(&self) -> CancellationToken {
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Sending side of the admission queue
///
/// Both the event watcher and the initial enumeration push IDs here; a
/// single consumer ([`WorkloadRegistry::run_admissions`]) admits them one at
/// a time so the same ID can never get two readers.
#[derive(Debug, Clone)]
pub struct AdmissionQueue {
    sender: mpsc::UnboundedSender<String>,
}

impl AdmissionQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queue an ID for admission, false if the consumer is gone
    pub fn enqueue(&self, id: impl Into<String>) -> bool {
        self.sender.send(id.into()).is_ok()
    }
}

/// Owns every [`WorkloadRecord`] and drives the lifecycle state machine
pub struct WorkloadRegistry {
    entries: RwLock<HashMap<String, Arc<WorkloadEntry>>>,
    pub(crate) control_plane: Arc<dyn ControlPlane>,
    pub(crate) bus: UpdateBus,
    pub(crate) config: StreamConfig,
    pub(crate) metrics: MonitorMetrics,
    logger: StructuredLogger,
}

impl WorkloadRegistry {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        bus: UpdateBus,
        config: StreamConfig,
        metrics: MonitorMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            control_plane,
            bus,
            config,
            metrics,
            logger,
        }
    }

    /// Receive a notification after every recorded frame, stop and clear
    pub fn subscribe(&self) -> broadcast::Receiver<WorkloadEvent> {
        self.bus.subscribe()
    }

    pub(crate) async fn entry(&self, id: &str) -> Option<Arc<WorkloadEntry>> {
        self.entries.read().await.get(id).cloned()
    }

    /// Admit queued IDs until the queue closes or `token` is cancelled
    pub async fn run_admissions(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<String>,
        token: CancellationToken,
    ) {
        loop {
            let id = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                id = queue.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };
            self.admit(&id, &token).await;
        }
        debug!("Admission queue closed");
    }

    /// Start tracking `id` unless it is tracked already.
    ///
    /// The workload is inspected once to fill its identity. A failed
    /// inspection still creates the record, in state Unknown.
    pub async fn admit(self: &Arc<Self>, id: &str, parent: &CancellationToken) -> bool {
        if self.contains(id).await {
            debug!(container_id = %id, "Workload already tracked");
            return false;
        }

        let mut record = WorkloadRecord::new(id);
        match self.control_plane.inspect_container(id).await {
            Ok(inspect) => record.apply_inspect(&inspect),
            Err(e) => warn!(container_id = %id, error = %e, "Failed to inspect new workload"),
        }

        let (name, alternative_name) = (record.name.clone(), record.alternative_name.clone());
        let entry = Arc::new(WorkloadEntry::new(record, parent));
        {
            let mut entries = self.entries.write().await;
            // The cycle may have ended while the inspection was in flight
            if parent.is_cancelled() || entries.contains_key(id) {
                return false;
            }
            entries.insert(id.to_string(), entry.clone());
            self.metrics.set_workloads_tracked(entries.len());
        }

        self.logger
            .log_workload_followed(id, &name, &alternative_name);
        self.spawn_reader(entry.clone(), entry.reader_token());
        true
    }

    fn spawn_reader(self: &Arc<Self>, entry: Arc<WorkloadEntry>, token: CancellationToken) {
        let reader = StatsStreamReader::new(self.clone(), entry, token);
        tokio::spawn(reader.run());
    }

    /// Move a workload to Stopped and deregister it.
    ///
    /// Returns true only for the call that performed the transition. A stop
    /// event is ignored while a restart is in flight since the restart emits
    /// one itself.
    pub async fn mark_stopped(&self, id: &str, reason: StopReason) -> bool {
        let Some(entry) = self.entry(id).await else {
            return false;
        };

        let name = {
            let mut record = entry.record.write().await;
            match (record.state, reason) {
                (WorkloadState::Stopped, _) => return false,
                (WorkloadState::Restarting, StopReason::Event) => {
                    debug!(container_id = %id, "Ignoring stop event during restart");
                    return false;
                }
                _ => {}
            }
            record.state = WorkloadState::Stopped;
            record.name.clone()
        };

        self.deregister(&entry).await;
        self.logger.log_workload_stopped(id, &name, reason.as_str());
        self.bus.publish(WorkloadEvent::Stopped(id.to_string()));
        true
    }

    /// Remove the entry and cancel its tasks. A newer entry registered under
    /// the same ID is left alone.
    pub(crate) async fn deregister(&self, entry: &Arc<WorkloadEntry>) {
        {
            let mut entries = self.entries.write().await;
            if entries
                .get(entry.id())
                .is_some_and(|current| Arc::ptr_eq(current, entry))
            {
                entries.remove(entry.id());
            }
            self.metrics.set_workloads_tracked(entries.len());
        }
        entry.cancel.cancel();
    }

    /// Ask the control plane to stop a Running workload.
    ///
    /// The record stays Stopping until the stop is confirmed by an event or
    /// by the process heuristic. Unknown IDs are ignored.
    pub async fn stop(&self, id: &str) {
        let Some(entry) = self.entry(id).await else {
            return;
        };
        if !transition(&entry, WorkloadState::Running, WorkloadState::Stopping).await {
            return;
        }

        let result = self.control_plane.stop_container(id).await;
        self.metrics.inc_command("stop", result.is_ok());

        if let Err(e) = result {
            warn!(container_id = %id, error = %e, "Failed to stop workload");
            transition(&entry, WorkloadState::Stopping, WorkloadState::Running).await;
        }
    }

    /// Restart a Running workload and follow it with a fresh stream reader.
    /// Unknown IDs are ignored.
    pub async fn restart(self: &Arc<Self>, id: &str) {
        let Some(entry) = self.entry(id).await else {
            return;
        };
        if !transition(&entry, WorkloadState::Running, WorkloadState::Restarting).await {
            return;
        }

        let result = self.control_plane.restart_container(id).await;
        self.metrics.inc_command("restart", result.is_ok());
        if let Err(e) = result {
            warn!(container_id = %id, error = %e, "Failed to restart workload");
        }

        // A destroy event may have removed the workload meanwhile
        if transition(&entry, WorkloadState::Restarting, WorkloadState::Running).await {
            let token = entry.replace_reader();
            self.spawn_reader(entry, token);
        }
    }

    /// Copies of every record, ordered by ID
    pub async fn snapshot(&self) -> Vec<WorkloadRecord> {
        let entries: Vec<Arc<WorkloadEntry>> = self.entries.read().await.values().cloned().collect();

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.record.read().await.clone());
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn get(&self, id: &str) -> Option<WorkloadRecord> {
        let entry = self.entry(id).await?;
        let record = entry.record.read().await.clone();
        Some(record)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop every record and cancel every reader
    pub async fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.write().await);
        for entry in entries.values() {
            entry.cancel.cancel();
        }
        self.metrics.set_workloads_tracked(0);
        self.bus.publish(WorkloadEvent::Cleared);
        debug!(cleared = entries.len(), "Cleared workload registry");
    }

    /// Refresh health, and on first observation the environment, from a
    /// fresh inspection. A record that is still Unknown gets its identity too.
    /// Failures leave the previous values in place.
    pub(crate) async fn refresh_metadata(&self, entry: &WorkloadEntry, first_seen: bool) {
        match self.control_plane.inspect_container(entry.id()).await {
            Ok(inspect) => {
                let mut record = entry.record.write().await;
                if record.state == WorkloadState::Unknown {
                    record.apply_inspect(&inspect);
                }
                record.apply_health_check(&inspect, first_seen);
            }
            Err(e) => {
                warn!(container_id = %entry.id(), error = %e, "Failed to refresh workload metadata");
            }
        }
    }

    /// Whether the control plane still lists the workload as running.
    /// Assumes it is when the list cannot be fetched.
    pub(crate) async fn verify_running(&self, id: &str) -> bool {
        match self.control_plane.list_containers().await {
            Ok(containers) => containers.iter().any(|container| container.id == id),
            Err(e) => {
                debug!(container_id = %id, error = %e, "Could not list workloads");
                true
            }
        }
    }
}

/// Move the record from `from` to `to`, false if it was in another state
async fn transition(entry: &WorkloadEntry, from: WorkloadState, to: WorkloadState) -> bool {
    let mut record = entry.record.write().await;
    if record.state != from {
        return false;
    }
    record.state = to;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::{compose_inspect_fixture, inspect_fixture, FakeControlPlane};
    use std::time::Duration;

    fn registry(fake: &Arc<FakeControlPlane>) -> Arc<WorkloadRegistry> {
        Arc::new(WorkloadRegistry::new(
            fake.clone(),
            UpdateBus::default(),
            StreamConfig::default(),
            MonitorMetrics::new(),
            StructuredLogger::new("test-node"),
        ))
    }

    #[tokio::test]
    async fn test_admit_inspects_once_and_sets_running() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(compose_inspect_fixture("abcdef0123456789", "/shop-web-1", "web", 1));
        let registry = registry(&fake);
        let token = CancellationToken::new();

        assert!(registry.admit("abcdef0123456789", &token).await);
        assert!(!registry.admit("abcdef0123456789", &token).await);

        let record = registry.get("abcdef0123456789").await.unwrap();
        assert_eq!(record.state, WorkloadState::Running);
        assert_eq!(record.name, "shop-web-1");
        assert_eq!(record.alternative_name, "web-1");
        assert_eq!(record.compose.project.as_deref(), Some("shop"));
        assert_eq!(fake.inspect_calls(), 1);
        assert_eq!(registry.len().await, 1);
        token.cancel();
    }

    #[tokio::test]
    async fn test_admit_with_failed_inspection_creates_unknown_record() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.set_fail_inspect(true);
        let registry = registry(&fake);
        let token = CancellationToken::new();

        assert!(registry.admit("abcdef0123456789", &token).await);

        let record = registry.get("abcdef0123456789").await.unwrap();
        assert_eq!(record.state, WorkloadState::Unknown);
        assert_eq!(record.alternative_name, "abcdef01");
        token.cancel();
    }

    #[tokio::test]
    async fn test_admit_after_cancellation_is_dropped() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(inspect_fixture("abc", "/app"));
        let registry = registry(&fake);
        let token = CancellationToken::new();
        token.cancel();

        assert!(!registry.admit("abc", &token).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_admission_queue_skips_duplicates() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(inspect_fixture("abc", "/app"));
        let registry = registry(&fake);
        let token = CancellationToken::new();

        let (queue, receiver) = AdmissionQueue::new();
        assert!(queue.enqueue("abc"));
        assert!(queue.enqueue("abc"));
        drop(queue);

        registry.clone().run_admissions(receiver, token.clone()).await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(fake.inspect_calls(), 1);
        token.cancel();
    }

    #[tokio::test]
    async fn test_mark_stopped_fires_once() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(inspect_fixture("abc", "/app"));
        let registry = registry(&fake);
        let token = CancellationToken::new();
        let mut updates = registry.subscribe();

        registry.admit("abc", &token).await;
        let entry = registry.entry("abc").await.unwrap();

        assert!(registry.mark_stopped("abc", StopReason::Heuristic).await);
        assert!(!registry.mark_stopped("abc", StopReason::Event).await);

        assert!(!registry.contains("abc").await);
        assert!(entry.cancel.is_cancelled());
        assert!(entry.reader_token().is_cancelled());
        assert!(!token.is_cancelled());
        assert_eq!(
            updates.recv().await.unwrap(),
            WorkloadEvent::Stopped("abc".to_string())
        );
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_event_ignored_while_restarting() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(inspect_fixture("abc", "/app"));
        let registry = registry(&fake);
        let token = CancellationToken::new();

        registry.admit("abc", &token).await;
        let entry = registry.entry("abc").await.unwrap();
        entry.record.write().await.state = WorkloadState::Restarting;

        assert!(!registry.mark_stopped("abc", StopReason::Event).await);
        assert!(registry.contains("abc").await);

        assert!(registry.mark_stopped("abc", StopReason::Destroyed).await);
        assert!(!registry.contains("abc").await);
        token.cancel();
    }

    #[tokio::test]
    async fn test_deregister_keeps_successor() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(inspect_fixture("abc", "/app"));
        let registry = registry(&fake);
        let token = CancellationToken::new();

        registry.admit("abc", &token).await;
        let old = registry.entry("abc").await.unwrap();
        registry.mark_stopped("abc", StopReason::Event).await;

        registry.admit("abc", &token).await;
        registry.deregister(&old).await;

        let record = registry.get("abc").await.unwrap();
        assert_eq!(record.state, WorkloadState::Running);
        token.cancel();
    }

    #[tokio::test]
    async fn test_stop_marks_stopping_until_confirmed() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(inspect_fixture("abc", "/app"));
        let registry = registry(&fake);
        let token = CancellationToken::new();
        registry.admit("abc", &token).await;

        registry.stop("abc").await;
        assert_eq!(fake.stop_calls(), vec!["abc".to_string()]);
        assert_eq!(
            registry.get("abc").await.unwrap().state,
            WorkloadState::Stopping
        );

        // Only Running workloads accept commands
        registry.stop("abc").await;
        registry.restart("abc").await;
        assert_eq!(fake.stop_calls().len(), 1);
        assert!(fake.restart_calls().is_empty());

        assert!(registry.mark_stopped("abc", StopReason::Event).await);
        token.cancel();
    }

    #[tokio::test]
    async fn test_failed_stop_reverts_to_running() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(inspect_fixture("abc", "/app"));
        fake.set_fail_stop(true);
        let registry = registry(&fake);
        let token = CancellationToken::new();
        registry.admit("abc", &token).await;

        registry.stop("abc").await;

        assert_eq!(
            registry.get("abc").await.unwrap().state,
            WorkloadState::Running
        );
        token.cancel();
    }

    #[tokio::test]
    async fn test_commands_on_unknown_id_are_noops() {
        let fake = Arc::new(FakeControlPlane::new());
        let registry = registry(&fake);

        registry.stop("missing").await;
        registry.restart("missing").await;

        assert!(fake.stop_calls().is_empty());
        assert!(fake.restart_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_reader() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(inspect_fixture("abc", "/app"));
        let registry = registry(&fake);
        let token = CancellationToken::new();
        registry.admit("abc", &token).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let entry = registry.entry("abc").await.unwrap();
        let first_reader = entry.reader_token();

        registry.restart("abc").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(first_reader.is_cancelled());
        assert!(!entry.reader_token().is_cancelled());
        assert_eq!(fake.restart_calls(), vec!["abc".to_string()]);
        assert_eq!(fake.stats_calls().len(), 2);
        assert_eq!(
            registry.get("abc").await.unwrap().state,
            WorkloadState::Running
        );
        token.cancel();
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted_and_clear_empties() {
        let fake = Arc::new(FakeControlPlane::new());
        for id in ["ccc", "aaa", "bbb"] {
            fake.add_container(inspect_fixture(id, &format!("/{id}")));
        }
        let registry = registry(&fake);
        let token = CancellationToken::new();
        for id in ["ccc", "aaa", "bbb"] {
            registry.admit(id, &token).await;
        }
        let mut updates = registry.subscribe();

        let ids: Vec<String> = registry.snapshot().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["aaa", "bbb", "ccc"]);

        let entry = registry.entry("aaa").await.unwrap();
        registry.clear().await;
        assert!(registry.is_empty().await);
        assert!(entry.cancel.is_cancelled());
        assert_eq!(updates.recv().await.unwrap(), WorkloadEvent::Cleared);
    }

    #[tokio::test]
    async fn test_verify_running_uses_fresh_enumeration() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(inspect_fixture("abc", "/app"));
        let registry = registry(&fake);

        assert!(registry.verify_running("abc").await);
        fake.remove_container("abc");
        assert!(!registry.verify_running("abc").await);
        fake.set_fail_list(true);
        assert!(registry.verify_running("abc").await);
    }
}
