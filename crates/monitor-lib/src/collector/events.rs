//! Lifecycle event subscription

use super::registry::{AdmissionQueue, StopReason, WorkloadRegistry};
use crate::docker::{EventMessage, EventStream, StreamError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Forwards container lifecycle events into the registry
pub struct EventWatcher {
    registry: Arc<WorkloadRegistry>,
    admissions: AdmissionQueue,
}

impl EventWatcher {
    pub fn new(registry: Arc<WorkloadRegistry>, admissions: AdmissionQueue) -> Self {
        Self {
            registry,
            admissions,
        }
    }

    /// Handle events until the feed ends or `token` is cancelled.
    ///
    /// Returns the error that ended the feed; `Ok` only on cancellation.
    pub async fn run(
        self,
        mut events: EventStream,
        token: CancellationToken,
    ) -> Result<(), StreamError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                next = events.next_frame() => next,
            };

            match next {
                Ok(event) => self.handle(&event).await,
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => warn!(error = %e, "Skipping malformed event"),
            }
        }
    }

    async fn handle(&self, event: &EventMessage) {
        if event.event_type != "container" {
            return;
        }

        let id = event.actor.id.as_str();
        debug!(container_id = %id, action = %event.action, "Container event");

        match event.action.as_str() {
            "start" => {
                self.admissions.enqueue(id);
            }
            "stop" => {
                self.registry.mark_stopped(id, StopReason::Event).await;
            }
            "destroy" => {
                self.registry.mark_stopped(id, StopReason::Destroyed).await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::bus::UpdateBus;
    use crate::collector::supervisor::StreamConfig;
    use crate::docker::fake::{event_line, inspect_fixture, FakeControlPlane};
    use crate::docker::ControlPlane;
    use crate::observability::{MonitorMetrics, StructuredLogger};
    use bytes::Bytes;
    use std::time::Duration;

    async fn wait_until_tracked(registry: &WorkloadRegistry, id: &str, tracked: bool) {
        for _ in 0..100 {
            if registry.contains(id).await == tracked {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{id} tracked state never became {tracked}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_and_malformed_events() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.add_container(inspect_fixture("abc", "/app"));
        let registry = Arc::new(WorkloadRegistry::new(
            fake.clone(),
            UpdateBus::default(),
            StreamConfig::default(),
            MonitorMetrics::new(),
            StructuredLogger::new("test-node"),
        ));
        let token = CancellationToken::new();
        let (admissions, queue) = AdmissionQueue::new();
        tokio::spawn(registry.clone().run_admissions(queue, token.clone()));

        let feed = fake.event_feed();
        let events = fake.events().await.unwrap();
        let watcher = tokio::spawn(
            EventWatcher::new(registry.clone(), admissions).run(events, token.clone()),
        );

        feed.send(event_line("start", "abc")).unwrap();
        feed.send(event_line("start", "abc")).unwrap();
        feed.send(Bytes::from_static(b"{\"Type\": oops}\n")).unwrap();
        feed.send(Bytes::from(
            "{\"Type\":\"network\",\"Action\":\"destroy\",\"Actor\":{\"ID\":\"abc\"}}\n",
        ))
        .unwrap();
        wait_until_tracked(&registry, "abc", true).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(fake.inspect_calls(), 1);

        feed.send(event_line("stop", "abc")).unwrap();
        wait_until_tracked(&registry, "abc", false).await;

        drop(feed);
        let ended = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(ended, Err(StreamError::EndOfStream)));
        token.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_stops_watcher() {
        let fake = Arc::new(FakeControlPlane::new());
        let registry = Arc::new(WorkloadRegistry::new(
            fake.clone(),
            UpdateBus::default(),
            StreamConfig::default(),
            MonitorMetrics::new(),
            StructuredLogger::new("test-node"),
        ));
        let (admissions, _queue) = AdmissionQueue::new();
        let token = CancellationToken::new();
        token.cancel();

        let events = fake.events().await.unwrap();
        let result = EventWatcher::new(registry, admissions).run(events, token).await;
        assert!(result.is_ok());
    }
}
