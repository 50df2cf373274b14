//! Tests for the outbox: enqueue dedup, retry with backoff, dead-letter on
//! permanent failure or exhausted attempts, and the wall-clock ceiling
//! (scenario: outbox dedup + retry).

mod common;

use std::time::Duration;

use common::{ScriptDriver, ScriptedOutcome};
use mu::outbox::{EnqueueOutcome, EnvelopeDraft, ListOutbox, OutboxState};

fn draft(dedupe_key: &str) -> EnvelopeDraft {
    EnvelopeDraft {
        channel: "slack".to_owned(),
        channel_tenant_id: "tenant-1".to_owned(),
        channel_conversation_id: "C1".to_owned(),
        binding_id: "bd-000000000001".to_owned(),
        kind: "wake".to_owned(),
        body: serde_json::json!({ "title": "hello" }),
        dedupe_key: dedupe_key.to_owned(),
        metadata: serde_json::Map::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn enqueue_then_enqueue_is_duplicate() {
    let world = common::build_world();
    let first = world.outbox.enqueue(draft("k1")).expect("enqueue");
    let EnqueueOutcome::Queued { outbox_id } = first else {
        panic!("first enqueue must queue");
    };
    let second = world.outbox.enqueue(draft("k1")).expect("enqueue");
    assert_eq!(
        second,
        EnqueueOutcome::Duplicate {
            outbox_id: outbox_id.clone()
        },
        "duplicate attaches to the existing envelope"
    );

    let envelopes = world.outbox.list(&ListOutbox::default()).expect("list");
    assert_eq!(envelopes.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_then_deliver() {
    let world = common::build_world();
    let driver = ScriptDriver::scripted(
        "slack",
        vec![
            ScriptedOutcome::Transient("adapter returned 503"),
            ScriptedOutcome::Transient("adapter returned 503"),
            ScriptedOutcome::Ok,
        ],
    );
    world.outbox.register_driver(driver.clone());

    world.outbox.enqueue(draft("k1")).expect("enqueue");
    let dup = world.outbox.enqueue(draft("k1")).expect("enqueue");
    assert!(matches!(dup, EnqueueOutcome::Duplicate { .. }));

    // Attempt 1 fails, backoff <= 600 ms; attempt 2 fails, backoff <= 1200
    // ms; attempt 3 delivers.
    world.outbox.process_due().await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    world.outbox.process_due().await;
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    world.outbox.process_due().await;

    let envelopes = world.outbox.list(&ListOutbox::default()).expect("list");
    assert_eq!(envelopes.len(), 1, "one terminal outcome for the dedup pair");
    assert_eq!(envelopes[0].state, OutboxState::Delivered);
    assert_eq!(envelopes[0].attempt_count, 3);
    assert!(envelopes[0].attempt_count <= envelopes[0].max_attempts);
    assert_eq!(driver.delivered().len(), 1);

    let states: Vec<String> = world
        .events_of("outbox.state")
        .iter()
        .map(|e| e.payload["state"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(
        states,
        vec![
            "delivering", "retried", "delivering", "retried", "delivering", "delivered"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_dead_letters_immediately() {
    let world = common::build_world();
    world.outbox.register_driver(ScriptDriver::scripted(
        "slack",
        vec![ScriptedOutcome::Permanent("adapter returned 403")],
    ));

    world.outbox.enqueue(draft("k1")).expect("enqueue");
    world.outbox.process_due().await;

    let envelopes = world.outbox.list(&ListOutbox::default()).expect("list");
    assert_eq!(envelopes[0].state, OutboxState::Dead);
    assert_eq!(envelopes[0].attempt_count, 1);
    assert_eq!(
        envelopes[0].last_error.as_deref(),
        Some("adapter returned 403")
    );

    let states: Vec<String> = world
        .events_of("outbox.state")
        .iter()
        .map(|e| e.payload["state"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(states, vec!["delivering", "dead_letter"]);

    // A dead envelope no longer blocks its dedupe key.
    let again = world.outbox.enqueue(draft("k1")).expect("enqueue");
    assert!(matches!(again, EnqueueOutcome::Queued { .. }));
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_dead_letter() {
    let world = common::build_world();
    let driver = ScriptDriver::scripted(
        "slack",
        (0..10)
            .map(|_| ScriptedOutcome::Transient("adapter returned 502"))
            .collect(),
    );
    world.outbox.register_driver(driver);

    world.outbox.enqueue(draft("k1")).expect("enqueue");
    for _ in 0..10 {
        world.outbox.process_due().await;
        tokio::time::sleep(Duration::from_secs(80)).await;
    }

    let envelopes = world.outbox.list(&ListOutbox::default()).expect("list");
    assert_eq!(envelopes[0].state, OutboxState::Dead);
    assert_eq!(
        envelopes[0].attempt_count, envelopes[0].max_attempts,
        "attempt_count never exceeds max_attempts"
    );
    assert_eq!(envelopes[0].max_attempts, 6);
}

#[tokio::test(start_paused = true)]
async fn missing_driver_dead_letters() {
    let world = common::build_world();
    world.outbox.enqueue(draft("k1")).expect("enqueue");
    world.outbox.process_due().await;

    let envelopes = world.outbox.list(&ListOutbox::default()).expect("list");
    assert_eq!(envelopes[0].state, OutboxState::Dead);
    assert_eq!(
        envelopes[0].last_error.as_deref(),
        Some("channel_unconfigured")
    );
}

#[tokio::test(start_paused = true)]
async fn envelope_past_wall_clock_ceiling_dead_letters() {
    let world = common::build_world();
    // A driver exists but the envelope has aged out before any attempt.
    world.outbox.register_driver(ScriptDriver::ok("slack"));
    world.outbox.enqueue(draft("k1")).expect("enqueue");

    tokio::time::sleep(Duration::from_secs(3_700)).await;
    world.outbox.process_due().await;

    let envelopes = world.outbox.list(&ListOutbox::default()).expect("list");
    assert_eq!(envelopes[0].state, OutboxState::Dead);
    assert_eq!(envelopes[0].last_error.as_deref(), Some("ttl_exceeded"));
    assert_eq!(envelopes[0].attempt_count, 0, "no attempt was started");
}

#[tokio::test(start_paused = true)]
async fn list_filters_by_state_and_channel() {
    let world = common::build_world();
    world.outbox.register_driver(ScriptDriver::ok("slack"));
    world.outbox.enqueue(draft("k1")).expect("enqueue");
    let mut other = draft("k2");
    other.channel = "telegram".to_owned();
    world.outbox.enqueue(other).expect("enqueue");

    world.outbox.process_due().await;

    let delivered = world
        .outbox
        .list(&ListOutbox {
            state: Some(OutboxState::Delivered),
            ..Default::default()
        })
        .expect("list");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].channel, "slack");

    let telegram = world
        .outbox
        .list(&ListOutbox {
            channel: Some("telegram".to_owned()),
            ..Default::default()
        })
        .expect("list");
    assert_eq!(telegram.len(), 1);
    assert_eq!(telegram[0].state, OutboxState::Dead, "no telegram driver");
}
