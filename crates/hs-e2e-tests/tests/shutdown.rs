//! E2E tests for cancellation and graceful shutdown.

mod helpers;

use std::time::Duration;

use tokio::time::Instant;

use helpers::TestHarness;
use hs_mqtt_channel::{ConnectOutcome, ConnectionState};

/// Cancelling stops every task and the connection is closed exactly once.
#[tokio::test(start_paused = true)]
async fn e2e_cancel_stops_agent_and_disconnects_once() {
    let mut h = TestHarness::new();
    h.manager.connect().await.unwrap();
    h.spawn_supervisor();
    h.spawn_drain();
    let publisher = h.spawn_publisher();

    tokio::time::sleep(Duration::from_secs(11)).await;
    h.cancel.cancel();
    assert_eq!(publisher.await.unwrap(), 3);

    let manager = h.manager.clone();
    let broker = h.shutdown().await;
    assert_eq!(broker.disconnect_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    // Repeated calls are no-ops.
    manager.disconnect().await.unwrap();
    assert_eq!(broker.disconnect_count(), 1);
    assert_eq!(broker.published_to("hello/sensor_01").len(), 3);
}

/// Shutdown during a backoff wait returns promptly without another attempt.
#[tokio::test(start_paused = true)]
async fn e2e_cancel_during_backoff() {
    let mut h = TestHarness::new();
    h.broker
        .script_connects(std::iter::repeat_n(ConnectOutcome::Unreachable, 10));
    assert!(h.manager.connect().await.is_err());
    h.spawn_supervisor();
    h.spawn_drain();

    // Attempts at 0s, 1s, 3s and 7s; the next one is due at 15s.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let cancelled_at = Instant::now();
    let manager = h.manager.clone();
    let broker = h.shutdown().await;

    assert_eq!(cancelled_at.elapsed(), Duration::ZERO);
    assert_eq!(broker.connect_attempts().len(), 4);
    assert_eq!(broker.disconnect_count(), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

/// Messages still queued at shutdown are not flushed by `disconnect`.
#[tokio::test(start_paused = true)]
async fn e2e_shutdown_while_offline_keeps_backlog() {
    let h = TestHarness::new();
    let publisher = h.spawn_publisher();
    tokio::time::sleep(Duration::from_secs(6)).await;
    h.cancel.cancel();
    assert_eq!(publisher.await.unwrap(), 2);

    let manager = h.manager.clone();
    let broker = h.shutdown().await;
    assert_eq!(manager.queue().len(), 2);
    assert!(broker.published().is_empty());
}
