//! E2E tests for the reconnect supervisor's backoff schedule.

mod helpers;

use std::time::Duration;

use tokio::time::Instant;

use helpers::TestHarness;
use hs_mqtt_channel::{ConnectOutcome, ConnectionState};

fn gaps(attempts: &[Instant]) -> Vec<u64> {
    attempts
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_secs())
        .collect()
}

/// Consecutive failures double the delay from 1s up to the 32s cap.
#[tokio::test(start_paused = true)]
async fn e2e_backoff_doubles_then_caps() {
    let mut h = TestHarness::new();
    h.broker
        .script_connects(std::iter::repeat_n(ConnectOutcome::Unreachable, 7));

    assert!(h.manager.connect().await.is_err());
    h.spawn_supervisor();
    h.wait_for(ConnectionState::Connected).await;

    let attempts = h.broker.connect_attempts();
    assert_eq!(attempts.len(), 8);
    assert_eq!(gaps(&attempts), [1, 2, 4, 8, 16, 32, 32]);

    h.shutdown().await;
}

/// Refused credentials are retried on the same schedule as network errors.
#[tokio::test(start_paused = true)]
async fn e2e_auth_failure_is_retried_with_backoff() {
    let mut h = TestHarness::new();
    h.broker.script_connects([
        ConnectOutcome::AuthFailure,
        ConnectOutcome::AuthFailure,
        ConnectOutcome::Hang,
    ]);

    assert!(h.manager.connect().await.is_err());
    h.spawn_supervisor();
    h.wait_for(ConnectionState::Connected).await;

    // 1s, 2s, then a 10s connect timeout followed by a 4s delay.
    assert_eq!(gaps(&h.broker.connect_attempts()), [1, 2, 14]);

    h.shutdown().await;
}

/// A connection that stayed up past the stable threshold restarts the
/// schedule at the minimum delay.
#[tokio::test(start_paused = true)]
async fn e2e_stable_session_resets_backoff() {
    let mut h = TestHarness::new();
    h.broker
        .script_connects(std::iter::repeat_n(ConnectOutcome::Unreachable, 4));

    assert!(h.manager.connect().await.is_err());
    h.spawn_supervisor();
    h.wait_for(ConnectionState::Connected).await;
    assert_eq!(h.manager.next_backoff(), Duration::from_secs(16));

    tokio::time::sleep(Duration::from_secs(25)).await;
    let dropped_at = Instant::now();
    h.broker.drop_connection();
    h.wait_for(ConnectionState::Disconnected).await;
    h.wait_for(ConnectionState::Connected).await;

    let attempts = h.broker.connect_attempts();
    assert_eq!(*attempts.last().unwrap() - dropped_at, Duration::from_secs(1));

    h.shutdown().await;
}

/// A flapping connection keeps growing the delay instead of hammering
/// the broker.
#[tokio::test(start_paused = true)]
async fn e2e_flapping_session_keeps_backing_off() {
    let mut h = TestHarness::new();
    h.manager.connect().await.unwrap();
    h.spawn_supervisor();

    let mut drops = Vec::new();
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        drops.push(Instant::now());
        h.broker.drop_connection();
        h.wait_for(ConnectionState::Disconnected).await;
        h.wait_for(ConnectionState::Connected).await;
    }

    let attempts = h.broker.connect_attempts();
    let delays: Vec<_> = drops
        .iter()
        .zip(&attempts[1..])
        .map(|(dropped, attempt)| (*attempt - *dropped).as_secs())
        .collect();
    assert_eq!(delays, [1, 2, 4]);

    h.shutdown().await;
}
