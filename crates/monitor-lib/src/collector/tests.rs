//! Integration tests for the collection pipeline
//!
//! These drive the supervisor end to end against the scripted control plane,
//! on a paused clock so retry delays and ping intervals elapse instantly.

use super::{Supervisor, SupervisorBuilder, WorkloadEvent};
use crate::docker::fake::{event_line, inspect_fixture, FakeControlPlane, FrameFixture};
use crate::health::{components, ComponentStatus, HealthRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    supervisor: Arc<Supervisor>,
    health: HealthRegistry,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    fn start(fake: &Arc<FakeControlPlane>) -> Self {
        let health = HealthRegistry::new();
        let supervisor = Arc::new(
            SupervisorBuilder::new()
                .control_plane(fake.clone())
                .health(health.clone())
                .build()
                .unwrap(),
        );
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let supervisor = supervisor.clone();
            let token = token.clone();
            async move { supervisor.run(token).await }
        });

        Self {
            supervisor,
            health,
            token,
            handle,
        }
    }

    async fn tracked(&self) -> usize {
        self.supervisor.registry().len().await
    }

    async fn wait_for_tracked(&self, expected: usize) {
        for _ in 0..300 {
            if self.tracked().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("expected {expected} tracked workloads, found {}", self.tracked().await);
    }

    async fn wait_for_status(&self, component: &str, status: ComponentStatus) {
        for _ in 0..300 {
            let health = self.health.health().await;
            if health.components.get(component).map(|c| c.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("{component} never became {status:?}");
    }

    async fn shutdown(self) {
        self.token.cancel();
        tokio::time::timeout(Duration::from_millis(10), self.handle)
            .await
            .expect("cancellation must end the supervisor without delay")
            .unwrap();
    }
}

fn script_frames(fake: &FakeControlPlane, id: &str, count: usize) {
    let lines = (0..count)
        .map(|i| {
            FrameFixture {
                read_secs: 1_709_294_400 + i as i64,
                ..Default::default()
            }
            .to_json_line()
        })
        .collect();
    fake.script_stats(id, lines, true);
}

#[tokio::test(start_paused = true)]
async fn test_enumerated_workloads_are_followed() {
    let fake = Arc::new(FakeControlPlane::new());
    for id in ["aaa", "bbb"] {
        fake.add_container(inspect_fixture(id, &format!("/{id}")));
        script_frames(&fake, id, 3);
    }

    let running = Running::start(&fake);
    running.wait_for_tracked(2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = running.supervisor.registry().snapshot().await;
    assert_eq!(snapshot.len(), 2);
    for record in &snapshot {
        assert_eq!(record.cpu_percent_history.len(), 3);
        assert_eq!(record.cpu_percent, 200.0);
    }
    assert!(running.health.readiness().await.ready);
    assert_eq!(fake.stats_calls().len(), 2);

    running.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ping_failure_clears_state_and_restarts() {
    let fake = Arc::new(FakeControlPlane::new());
    fake.add_container(inspect_fixture("abc", "/app"));

    let running = Running::start(&fake);
    let mut updates = running.supervisor.registry().subscribe();
    running.wait_for_tracked(1).await;

    fake.set_ping_ok(false);
    running
        .wait_for_status(components::CONTROL_PLANE, ComponentStatus::Unhealthy)
        .await;
    assert_eq!(running.tracked().await, 0);
    assert!(!running.health.readiness().await.ready);

    let mut cleared = false;
    while let Ok(event) = updates.try_recv() {
        cleared |= event == WorkloadEvent::Cleared;
    }
    assert!(cleared);

    fake.set_ping_ok(true);
    running.wait_for_tracked(1).await;
    running
        .wait_for_status(components::CONTROL_PLANE, ComponentStatus::Healthy)
        .await;
    assert!(fake.list_calls() >= 2);

    running.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_ping_ends_cycle() {
    let fake = Arc::new(FakeControlPlane::new());
    fake.add_container(inspect_fixture("abc", "/app"));

    let running = Running::start(&fake);
    running.wait_for_tracked(1).await;

    fake.set_ping_hangs(true);
    running
        .wait_for_status(components::CONTROL_PLANE, ComponentStatus::Unhealthy)
        .await;
    assert_eq!(running.tracked().await, 0);
    let health = running.health.health().await;
    let message = health.components[components::CONTROL_PLANE]
        .message
        .clone()
        .unwrap_or_default();
    assert!(message.contains("did not answer"), "{message}");

    // The retried cycle is now waiting on its first ping
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(fake.list_calls(), 1);

    running.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ping_without_api_version_is_a_failure() {
    let fake = Arc::new(FakeControlPlane::new());
    fake.add_container(inspect_fixture("abc", "/app"));
    fake.set_api_version("");

    let running = Running::start(&fake);
    running
        .wait_for_status(components::CONTROL_PLANE, ComponentStatus::Unhealthy)
        .await;
    assert_eq!(fake.list_calls(), 0);
    assert!(!running.health.readiness().await.ready);

    fake.set_api_version("1.43");
    running.wait_for_tracked(1).await;
    running
        .wait_for_status(components::CONTROL_PLANE, ComponentStatus::Healthy)
        .await;

    running.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_closed_event_feed_restarts_cycle() {
    let fake = Arc::new(FakeControlPlane::new());
    fake.add_container(inspect_fixture("abc", "/app"));
    let feed = fake.event_feed();

    let running = Running::start(&fake);
    running.wait_for_tracked(1).await;

    drop(feed);
    running
        .wait_for_status(components::EVENT_WATCHER, ComponentStatus::Unhealthy)
        .await;

    // The next cycle subscribes again and re-enumerates after the retry delay
    running.wait_for_tracked(1).await;
    running
        .wait_for_status(components::EVENT_WATCHER, ComponentStatus::Healthy)
        .await;
    assert_eq!(fake.list_calls(), 2);

    running.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_skips_retry_delay() {
    let fake = Arc::new(FakeControlPlane::new());
    fake.set_ping_ok(false);

    let running = Running::start(&fake);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fake.ping_calls(), 1);

    running.shutdown().await;
    assert_eq!(fake.ping_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_events_start_and_stop_workloads() {
    let fake = Arc::new(FakeControlPlane::new());
    let feed = fake.event_feed();

    let running = Running::start(&fake);
    let mut updates = running.supervisor.registry().subscribe();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(running.tracked().await, 0);

    fake.add_container(inspect_fixture("abc", "/app"));
    script_frames(&fake, "abc", 1);
    feed.send(event_line("start", "abc")).unwrap();
    running.wait_for_tracked(1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    feed.send(event_line("destroy", "abc")).unwrap();
    running.wait_for_tracked(0).await;

    let mut events = Vec::new();
    while let Ok(event) = updates.try_recv() {
        events.push(event);
    }
    assert!(events.contains(&WorkloadEvent::Updated("abc".to_string())));
    assert_eq!(events.last(), Some(&WorkloadEvent::Stopped("abc".to_string())));

    running.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_event_during_enumeration_admits_once() {
    let fake = Arc::new(FakeControlPlane::new());
    fake.add_container(inspect_fixture("abc", "/app"));
    let feed = fake.event_feed();
    feed.send(event_line("start", "abc")).unwrap();

    let running = Running::start(&fake);
    running.wait_for_tracked(1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(running.tracked().await, 1);
    assert_eq!(fake.stats_calls(), vec!["abc".to_string()]);

    running.shutdown().await;
}
