// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: concurrent deliveries and failing destinations.
//!
//! These tests verify the pipeline holds its guarantees under contention
//! and keeps working when a destination or the store misbehaves.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use channel_replication::{Action, CircuitSettings, EngineConfig, Outcome, ReplicationEngine};
use common::*;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn into_owned(engine: Arc<TestEngine>) -> TestEngine {
    Arc::try_unwrap(engine)
        .ok()
        .expect("engine still shared")
}

// =============================================================================
// Concurrent Delivery
// =============================================================================

/// Test: The same event delivered concurrently is processed once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_accepted_once() {
    let h = harness(vec![immediate(1, 0)]).await;
    let engine = Arc::new(h.engine);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.handle_event(text_post(1, "same")).await.unwrap() })
        })
        .collect();
    let outcomes: Vec<Outcome> = join_all(tasks)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();

    let delivered = outcomes.iter().filter(|o| matches!(o, Outcome::Delivered { .. })).count();
    let skipped = outcomes.iter().filter(|o| **o == Outcome::DedupSkip).count();
    assert_eq!(delivered, 1);
    assert_eq!(skipped, 31);
    assert_eq!(h.transport.copies_of(1), 1);

    into_owned(engine).shutdown().await;
}

/// Test: Concurrent attempts never spend more tokens than the bucket holds
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempts_respect_rate_limit() {
    let h = harness(vec![immediate(1, 5)]).await;
    let engine = Arc::new(h.engine);

    let tasks: Vec<_> = (0..50)
        .map(|id| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.handle_event(text_post(id, "burst")).await.unwrap() })
        })
        .collect();
    let outcomes: Vec<Outcome> = join_all(tasks)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();

    let delivered = outcomes.iter().filter(|o| matches!(o, Outcome::Delivered { .. })).count();
    let limited = outcomes
        .iter()
        .filter(|o| matches!(o, Outcome::RateLimitSkip { .. }))
        .count();
    assert_eq!(delivered, 5);
    assert_eq!(limited, 45);
    assert_eq!(h.transport.call_count(), 5);

    into_owned(engine).shutdown().await;
}

/// Test: Configs fed concurrently keep their own sequential order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_queues_are_isolated_per_config() {
    let mut second = sequential(2);
    second.source_channel_id = -1002;
    second.destination_channel_id = Some(-2002);
    let h = harness(vec![sequential(1), second]).await;
    h.transport.fail_copies_of(1, 2);
    let engine = Arc::new(h.engine);

    let a = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for id in 1..=10 {
                engine.handle_event(text_post(id, "a")).await.unwrap();
            }
        })
    };
    let b = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for id in 101..=110 {
                let mut event = text_post(id, "b");
                event.message.chat_id = -1002;
                engine.handle_event(event).await.unwrap();
            }
        })
    };
    a.await.unwrap();
    b.await.unwrap();
    sleep(Duration::from_secs(2)).await;

    let delivered_to = |chat: i64| -> Vec<i32> {
        h.transport
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Copy { to, message_id, .. } if to == chat => Some(message_id),
                _ => None,
            })
            .collect()
    };
    // Message 1 is attempted three times, then the rest in order.
    let mut expected_a = vec![1, 1];
    expected_a.extend(1..=10);
    assert_eq!(delivered_to(DEST), expected_a);
    assert_eq!(delivered_to(-2002), (101..=110).collect::<Vec<_>>());

    into_owned(engine).shutdown().await;
}

// =============================================================================
// Failing Destinations
// =============================================================================

/// Test: A dead destination trips its breaker instead of absorbing every retry
#[tokio::test]
async fn circuit_breaker_stops_hammering_dead_destination() {
    let mut config = EngineConfig::for_testing("circuit");
    config.settings.circuit = CircuitSettings {
        enabled: true,
        failure_rate: 0.5,
        window: 4,
        half_open_probes: 1,
        open_wait_sec: 60,
    };
    let h = harness_with(config, vec![immediate(1, 0)]).await;
    h.transport.fail_chat(DEST, 1_000);
    let mut engine = h.engine;

    for id in 1..=20 {
        engine.handle_event(text_post(id, "x")).await.unwrap();
    }
    sleep(Duration::from_millis(500)).await;

    // 20 units x 3 attempts would be 60 calls without the breaker.
    assert!(h.transport.call_count() < 20);
    let health = engine.health_check();
    assert!(!health.healthy);
    assert_eq!(health.circuits.len(), 1);
    assert!(health.circuits[0].rejections > 0);
    assert_eq!(engine.stats().config(1).failed, 20);
    assert_eq!(h.store.actions_of(Action::CloneError).len(), 20);

    engine.shutdown().await;
}

/// Test: Mapping write failures do not fail delivery
#[tokio::test]
async fn mapping_store_failure_is_not_fatal() {
    let h = harness(vec![immediate(1, 0)]).await;
    h.store.set_fail_mapping_writes(true);
    let mut engine = h.engine;

    let outcomes = engine.handle_event(text_post(1, "x")).await.unwrap();
    assert!(matches!(outcomes[0], Outcome::Delivered { .. }));
    assert_eq!(h.store.mapping_count(), 0);
    assert_eq!(h.store.actions_of(Action::CloneSuccess).len(), 1);

    engine.shutdown().await;
}

/// Test: Shutdown with busy workers and timers completes promptly
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_under_load_completes() {
    let mut delayed_config = delayed(2, 30);
    delayed_config.source_channel_id = -1002;
    let h = harness(vec![sequential(1), delayed_config]).await;
    h.transport.set_latency(Duration::from_millis(20));
    let mut engine = h.engine;

    for id in 1..=50 {
        engine.handle_event(text_post(id, "load")).await.unwrap();
        let mut event = text_post(1000 + id, "later");
        event.message.chat_id = -1002;
        engine.handle_event(event).await.unwrap();
    }

    let started = std::time::Instant::now();
    engine.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let calls_at_shutdown = h.transport.call_count();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.transport.call_count(), calls_at_shutdown);
    assert!(calls_at_shutdown < 50);
    assert_eq!(engine.health_check().queued_tasks, 0);
}

/// Test: An engine over a fresh store starts and stops repeatedly
#[tokio::test]
async fn engines_share_no_state() {
    let a = harness(vec![immediate(1, 1)]).await;
    let b = harness(vec![immediate(1, 1)]).await;
    let (mut ea, mut eb) = (a.engine, b.engine);

    let first = ea.handle_event(text_post(1, "x")).await.unwrap();
    let second = eb.handle_event(text_post(1, "x")).await.unwrap();
    assert!(matches!(first[0], Outcome::Delivered { .. }));
    assert!(matches!(second[0], Outcome::Delivered { .. }));

    ea.shutdown().await;
    eb.shutdown().await;

    let restarted = ReplicationEngine::new(
        EngineConfig::for_testing("again"),
        Arc::clone(&a.transport),
        Arc::clone(&a.store),
    );
    assert!(!restarted.is_running());
}
