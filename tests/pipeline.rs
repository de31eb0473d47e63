//! End-to-end pipeline tests on a paused clock.
//!
//! Each test drives a started engine with a [`MockTransport`] and checks
//! outbound calls, mappings, audit entries and statistics.
//!
//! # Running
//! ```bash
//! cargo test --test pipeline
//! ```

mod common;

use channel_replication::{Action, EngineConfig, EngineState, Outcome, ReplicationConfig};
use common::*;
use std::time::Duration;

async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

// =============================================================================
// Immediate delivery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn two_photos_are_cloned_immediately_without_queueing() {
    let mut h = harness(vec![immediate(1, 30)]).await;

    let first = h.engine.handle_event(photo_post(10)).await.unwrap();
    settle(Duration::from_millis(1)).await;
    let second = h.engine.handle_event(photo_post(11)).await.unwrap();

    assert_eq!(first, vec![Outcome::Delivered { config_id: 1, destinations: 1 }]);
    assert_eq!(second, vec![Outcome::Delivered { config_id: 1, destinations: 1 }]);

    assert_eq!(h.store.mapping_count(), 2);
    assert!(h.store.mapping(1, 10).is_some());
    assert!(h.store.mapping(1, 11).is_some());

    assert_eq!(h.engine.queue_depth(1), 0);
    assert!(h.store.actions_of(Action::Queued).is_empty());
    let health = h.engine.health_check();
    assert_eq!(health.queued_tasks, 0);
    assert_eq!(health.pending_timers, 0);

    assert_eq!(h.store.actions_of(Action::CloneSuccess).len(), 2);
    assert_eq!(h.engine.stats().config(1).cloned, 2);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limit_denies_second_request_without_transport_call() {
    let mut h = harness(vec![immediate(1, 1)]).await;

    let first = h.engine.handle_event(text_post(1, "one")).await.unwrap();
    let second = h.engine.handle_event(text_post(2, "two")).await.unwrap();

    assert!(matches!(first[0], Outcome::Delivered { .. }));
    assert_eq!(second, vec![Outcome::RateLimitSkip { config_id: 1 }]);
    assert_eq!(h.transport.call_count(), 1);
    assert_eq!(h.transport.copies_of(2), 0);

    let bucket = h.engine.rate_limiter_state(1).unwrap();
    assert_eq!(bucket.tokens, 0);
    assert_eq!(bucket.capacity, 1);
    assert_eq!(h.engine.stats().config(1).rate_limited, 1);
    assert_eq!(h.store.actions_of(Action::RateLimited).len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limit_refills_after_a_minute() {
    let mut h = harness(vec![immediate(1, 1)]).await;

    h.engine.handle_event(text_post(1, "one")).await.unwrap();
    settle(Duration::from_secs(61)).await;
    let later = h.engine.handle_event(text_post(2, "two")).await.unwrap();

    assert!(matches!(later[0], Outcome::Delivered { .. }));
    assert_eq!(h.transport.call_count(), 2);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_event_is_skipped() {
    let mut h = harness(vec![immediate(1, 0)]).await;

    h.engine.handle_event(text_post(5, "hello")).await.unwrap();
    let again = h.engine.handle_event(text_post(5, "hello")).await.unwrap();

    assert_eq!(again, vec![Outcome::DedupSkip]);
    assert_eq!(h.transport.copies_of(5), 1);
    assert_eq!(h.engine.stats().dedup_skipped, 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reused_message_id_with_new_content_is_cloned_again() {
    let mut h = harness(vec![immediate(1, 0)]).await;

    h.engine.handle_event(text_post(5, "first")).await.unwrap();
    let reused = h.engine.handle_event(text_post(5, "different")).await.unwrap();

    assert!(matches!(reused[0], Outcome::Delivered { .. }));
    assert_eq!(h.transport.copies_of(5), 2);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unconfigured_and_disabled_sources_are_ignored() {
    let mut disabled = immediate(1, 0);
    disabled.enabled = false;
    let mut h = harness(vec![disabled]).await;

    let outcomes = h.engine.handle_event(text_post(1, "hi")).await.unwrap();
    assert_eq!(outcomes, vec![Outcome::Ignored]);
    assert_eq!(h.transport.call_count(), 0);
    assert!(h.store.actions().is_empty());
    h.engine.shutdown().await;
}

// =============================================================================
// Media groups
// =============================================================================

#[tokio::test(start_paused = true)]
async fn album_is_sealed_once_in_message_order() {
    let mut config = EngineConfig::for_testing("albums");
    config.settings.media_group.quiet_period = "2s".to_string();
    let mut h = harness_with(config, vec![immediate(1, 30)]).await;

    // Out of order, all within one second.
    for (id, caption) in [(22, Some("holiday")), (21, None), (23, None)] {
        let outcomes = h
            .engine
            .handle_event(album_member(id, "G1", caption))
            .await
            .unwrap();
        assert_eq!(
            outcomes,
            vec![Outcome::Buffered {
                config_id: 1,
                group_id: "G1".into()
            }]
        );
        settle(Duration::from_millis(300)).await;
    }
    assert_eq!(h.transport.call_count(), 0);

    settle(Duration::from_secs(3)).await;

    let groups = h.transport.media_groups();
    assert_eq!(groups.len(), 1);
    let (to, items) = &groups[0];
    assert_eq!(*to, DEST);
    let files: Vec<&str> = items.iter().map(|i| i.file_id.as_str()).collect();
    assert_eq!(files, vec!["photo-21", "photo-22", "photo-23"]);
    assert_eq!(items[0].caption.as_deref(), Some("holiday"));
    assert!(items[1..].iter().all(|i| i.caption.is_none()));
    assert_eq!(h.store.mapping_count(), 3);

    // A late member never re-seals the group.
    let late = h
        .engine
        .handle_event(album_member(24, "G1", None))
        .await
        .unwrap();
    assert_eq!(
        late,
        vec![Outcome::StaleMember {
            config_id: 1,
            group_id: "G1".into()
        }]
    );
    settle(Duration::from_secs(5)).await;
    assert_eq!(h.transport.media_groups().len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn album_without_album_items_is_dropped_once() {
    let mut h = harness(vec![immediate(1, 0)]).await;

    // A text member with a group id cannot go into an album.
    let mut event = text_post(40, "not a photo");
    event.message.media_group_id = Some("G9".to_string());
    h.engine.handle_event(event).await.unwrap();

    settle(Duration::from_secs(1)).await;

    assert_eq!(h.transport.call_count(), 0);
    assert_eq!(h.store.actions_of(Action::GroupDropped).len(), 1);
    assert_eq!(h.engine.stats().config(1).groups_dropped, 1);
    h.engine.shutdown().await;
}

// =============================================================================
// Sequential queue
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sequential_retries_block_the_next_task() {
    let mut h = harness(vec![sequential(1)]).await;
    h.transport.fail_copies_of(31, 2);

    let first = h.engine.handle_event(photo_post(31)).await.unwrap();
    let second = h.engine.handle_event(photo_post(32)).await.unwrap();
    assert!(matches!(first[0], Outcome::Queued { config_id: 1, .. }));
    assert!(matches!(second[0], Outcome::Queued { config_id: 1, .. }));

    settle(Duration::from_secs(2)).await;

    assert_eq!(h.transport.copies_of(31), 3);
    assert_eq!(h.transport.copies_of(32), 1);

    // Every call for 31 finished before 32 started.
    let marks = h.transport.marks();
    let last_31 = marks.iter().rposition(|m| *m == Mark::Finished(31)).unwrap();
    let start_32 = marks.iter().position(|m| *m == Mark::Started(32)).unwrap();
    assert!(last_31 < start_32);

    // Two backoff waits, growing.
    let times: Vec<_> = h
        .transport
        .timed_calls()
        .into_iter()
        .filter(|(_, c)| matches!(c, Call::Copy { message_id: 31, .. }))
        .map(|(at, _)| at)
        .collect();
    let first_wait = times[1] - times[0];
    let second_wait = times[2] - times[1];
    assert!(first_wait >= Duration::from_millis(10));
    assert!(second_wait >= Duration::from_millis(20));

    let stats = h.engine.stats().config(1);
    assert_eq!(stats.cloned, 2);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(h.store.actions_of(Action::Retried).len(), 2);
    assert_eq!(h.engine.queue_depth(1), 0);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sequential_preserves_fifo_order() {
    let mut h = harness(vec![sequential(1)]).await;
    h.transport.set_latency(Duration::from_millis(5));

    for id in 1..=5 {
        h.engine.handle_event(text_post(id, &format!("post {}", id))).await.unwrap();
    }
    settle(Duration::from_secs(1)).await;

    let order: Vec<_> = h
        .transport
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Copy { message_id, .. } => Some(message_id),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![1, 2, 3, 4, 5]);
    assert_eq!(h.engine.health_check().active_workers, 0);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sequential_exhausted_task_fails_once_and_queue_moves_on() {
    let mut h = harness(vec![sequential(1)]).await;
    h.transport.fail_copies_of(7, 100);

    h.engine.handle_event(text_post(7, "doomed")).await.unwrap();
    h.engine.handle_event(text_post(8, "fine")).await.unwrap();
    settle(Duration::from_secs(2)).await;

    assert_eq!(h.transport.copies_of(7), 3);
    assert_eq!(h.transport.copies_of(8), 1);
    assert_eq!(h.store.actions_of(Action::CloneError).len(), 1);
    assert_eq!(h.engine.stats().config(1).failed, 1);
    assert!(h.store.mapping(1, 7).is_none());
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sequential_rate_limit_waits_for_refill() {
    let mut config = sequential(1);
    config.rate_limit_per_minute = 1;
    let mut h = harness(vec![config]).await;

    h.engine.handle_event(text_post(1, "a")).await.unwrap();
    h.engine.handle_event(text_post(2, "b")).await.unwrap();

    settle(Duration::from_secs(30)).await;
    assert_eq!(h.transport.call_count(), 1);
    assert_eq!(h.engine.queue_depth(1), 1);

    settle(Duration::from_secs(31)).await;
    assert_eq!(h.transport.call_count(), 2);
    assert_eq!(h.engine.stats().config(1).failed, 0);
    h.engine.shutdown().await;
}

// =============================================================================
// Delayed delivery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn delayed_delivery_waits_for_its_timer() {
    let mut h = harness(vec![delayed(1, 5)]).await;

    let outcomes = h.engine.handle_event(text_post(1, "later")).await.unwrap();
    assert_eq!(
        outcomes,
        vec![Outcome::Scheduled {
            config_id: 1,
            execute_in: Duration::from_secs(5)
        }]
    );
    assert_eq!(h.engine.queue_depth(1), 1);

    settle(Duration::from_secs(4)).await;
    assert_eq!(h.transport.call_count(), 0);

    settle(Duration::from_secs(2)).await;
    assert_eq!(h.transport.call_count(), 1);
    assert_eq!(h.engine.queue_depth(1), 0);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sequential_takes_precedence_over_delay() {
    let mut config = sequential(1);
    config.delay_seconds = 30;
    let mut h = harness(vec![config]).await;

    let outcomes = h.engine.handle_event(text_post(1, "x")).await.unwrap();
    assert!(matches!(outcomes[0], Outcome::Queued { .. }));
    settle(Duration::from_secs(1)).await;
    assert_eq!(h.transport.call_count(), 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn flush_drops_only_that_configs_tasks() {
    let mut other = delayed(2, 5);
    other.source_channel_id = -1009;
    let mut h = harness(vec![delayed(1, 5), other]).await;

    for id in 1..=3 {
        h.engine.handle_event(text_post(id, "pending")).await.unwrap();
    }
    let mut foreign = text_post(9, "other source");
    foreign.message.chat_id = -1009;
    h.engine.handle_event(foreign).await.unwrap();

    assert_eq!(h.engine.flush_queue(1), 3);
    assert_eq!(h.engine.queue_depth(1), 0);
    assert_eq!(h.engine.queue_depth(2), 1);

    settle(Duration::from_secs(10)).await;
    assert_eq!(h.transport.call_count(), 1);
    assert_eq!(h.transport.copies_of(9), 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn flush_stops_retries_of_an_in_flight_sequential_task() {
    let mut h = harness(vec![sequential(1)]).await;
    h.transport.set_latency(Duration::from_millis(100));
    h.transport.fail_copies_of(7, 100);

    h.engine.handle_event(text_post(7, "doomed")).await.unwrap();
    settle(Duration::from_millis(50)).await;
    assert_eq!(h.transport.copies_of(7), 1);

    assert_eq!(h.engine.flush_queue(1), 0);
    settle(Duration::from_secs(5)).await;

    assert_eq!(h.transport.copies_of(7), 1);
    assert!(h.store.actions_of(Action::Retried).is_empty());
    assert!(h.store.actions_of(Action::CloneError).is_empty());
    assert_eq!(h.engine.queue_depth(1), 0);

    // Work queued after the flush is delivered normally.
    h.engine.handle_event(text_post(8, "fresh")).await.unwrap();
    settle(Duration::from_secs(1)).await;
    assert_eq!(h.transport.copies_of(8), 1);
    assert_eq!(h.store.actions_of(Action::CloneSuccess).len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn flush_stops_retries_of_an_in_flight_delayed_task() {
    let mut h = harness(vec![delayed(1, 1)]).await;
    h.transport.set_latency(Duration::from_millis(100));
    h.transport.fail_copies_of(7, 100);

    h.engine.handle_event(text_post(7, "doomed")).await.unwrap();
    settle(Duration::from_millis(1050)).await;
    assert_eq!(h.transport.copies_of(7), 1);

    assert_eq!(h.engine.flush_queue(1), 0);
    settle(Duration::from_secs(5)).await;

    assert_eq!(h.transport.copies_of(7), 1);
    assert!(h.store.actions_of(Action::Retried).is_empty());
    assert_eq!(h.engine.queue_depth(1), 0);
    h.engine.shutdown().await;
}

// =============================================================================
// Retries and terminal failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn immediate_failure_retries_then_fails_exactly_once() {
    let mut h = harness(vec![immediate(1, 0)]).await;
    h.transport.fail_copies_of(70, 100);

    let outcomes = h.engine.handle_event(text_post(70, "x")).await.unwrap();
    assert!(matches!(
        outcomes[0],
        Outcome::Retrying {
            config_id: 1,
            attempt: 1,
            ..
        }
    ));

    settle(Duration::from_secs(2)).await;

    assert_eq!(h.transport.copies_of(70), 3);
    assert_eq!(h.store.actions_of(Action::CloneError).len(), 1);
    assert_eq!(h.store.actions_of(Action::Retried).len(), 2);
    let stats = h.engine.stats().config(1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 2);
    assert_eq!(h.engine.health_check().pending_timers, 0);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn partial_fan_out_retries_only_missing_destinations() {
    let mut config = immediate(1, 0);
    config.destination_group_ids = vec![-3001, -3002];
    let mut h = harness(vec![config]).await;
    h.transport.fail_chat(-3001, 1);

    let outcomes = h.engine.handle_event(text_post(12, "broadcast")).await.unwrap();
    assert!(matches!(outcomes[0], Outcome::Retrying { .. }));

    settle(Duration::from_secs(1)).await;

    let copies_to = |chat: i64| {
        h.transport
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Copy { to, .. } if *to == chat))
            .count()
    };
    assert_eq!(copies_to(DEST), 1);
    assert_eq!(copies_to(-3001), 2);
    assert_eq!(copies_to(-3002), 1);

    let mapping = h.store.mapping(1, 12).unwrap();
    assert_eq!(mapping.destinations.len(), 3);
    h.engine.shutdown().await;
}

// =============================================================================
// Edit synchronization
// =============================================================================

#[tokio::test(start_paused = true)]
async fn edit_without_mapping_is_a_quiet_no_op() {
    let mut config = immediate(1, 0);
    config.edit_sync = true;
    let mut h = harness(vec![config]).await;

    let outcomes = h.engine.handle_event(text_edit(50, "changed")).await.unwrap();

    assert_eq!(
        outcomes,
        vec![Outcome::EditSkipped {
            config_id: 1,
            reason: "no_mapping"
        }]
    );
    assert_eq!(h.transport.call_count(), 0);
    assert!(h.store.actions_of(Action::EditSyncError).is_empty());
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn edit_is_replayed_onto_the_clone() {
    let mut config = immediate(1, 0);
    config.edit_sync = true;
    let mut h = harness(vec![config]).await;

    h.engine.handle_event(text_post(60, "v1")).await.unwrap();
    let target = h.store.mapping(1, 60).unwrap().target_in(DEST).unwrap();

    let outcomes = h.engine.handle_event(text_edit(60, "v2")).await.unwrap();
    assert_eq!(
        outcomes,
        vec![Outcome::EditSynced {
            config_id: 1,
            destinations: 1
        }]
    );
    assert_eq!(
        h.transport.edits(),
        vec![Call::EditText {
            chat: DEST,
            message_id: target,
            text: "v2".into()
        }]
    );
    assert_eq!(h.store.actions_of(Action::EditSyncSuccess).len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn edits_ignored_when_sync_disabled() {
    let mut h = harness(vec![immediate(1, 0)]).await;

    h.engine.handle_event(text_post(61, "v1")).await.unwrap();
    let outcomes = h.engine.handle_event(text_edit(61, "v2")).await.unwrap();

    assert_eq!(
        outcomes,
        vec![Outcome::EditSkipped {
            config_id: 1,
            reason: "disabled"
        }]
    );
    assert!(h.transport.edits().is_empty());
    h.engine.shutdown().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_timers() {
    let mut config = EngineConfig::for_testing("shutdown");
    config.settings.media_group.quiet_period = "5s".to_string();
    let mut h = harness_with(config, vec![delayed(1, 5)]).await;

    h.engine.handle_event(text_post(1, "delayed")).await.unwrap();
    h.engine
        .handle_event(album_member(2, "G2", None))
        .await
        .unwrap();
    assert_eq!(h.engine.health_check().pending_timers, 2);

    h.engine.shutdown().await;
    settle(Duration::from_secs(10)).await;

    assert_eq!(h.engine.state(), EngineState::Stopped);
    assert_eq!(h.transport.call_count(), 0);
    assert_eq!(h.engine.health_check().pending_timers, 0);
    assert!(h.engine.handle_event(text_post(3, "late")).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn config_changes_apply_after_invalidation() {
    let mut h = harness(vec![]).await;

    let outcomes = h.engine.handle_event(text_post(1, "before")).await.unwrap();
    assert_eq!(outcomes, vec![Outcome::Ignored]);

    let config: ReplicationConfig = immediate(1, 0);
    h.store.upsert_config(config.clone());
    h.engine.config_changed(&config);

    let outcomes = h.engine.handle_event(text_post(2, "after")).await.unwrap();
    assert!(matches!(outcomes[0], Outcome::Delivered { .. }));
    h.engine.shutdown().await;
}
