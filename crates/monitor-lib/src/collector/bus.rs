//! Change notifications for consumers of the registry

use tokio::sync::broadcast;

/// Default number of notifications buffered per subscriber
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Something about the tracked workloads changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadEvent {
    /// A stats frame was recorded for the workload
    Updated(String),
    /// The workload stopped and its record was removed
    Stopped(String),
    /// Every record was dropped after a control plane failure
    Cleared,
}

/// Fan-out of [`WorkloadEvent`]s to any number of subscribers.
///
/// Subscribers that fall behind lose the oldest notifications, which is fine
/// since each one only says that data changed.
#[derive(Debug, Clone)]
pub struct UpdateBus {
    sender: broadcast::Sender<WorkloadEvent>,
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl UpdateBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkloadEvent> {
        self.sender.subscribe()
    }

    /// Notify all current subscribers, returns how many there were
    pub fn publish(&self, event: WorkloadEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}
