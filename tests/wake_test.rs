//! Tests for the wake orchestrator: active-mode turn submission with
//! at-most-once semantics (scenario: active-mode wake invokes turn once),
//! fallback without a pipeline (scenario: active-mode fallback), and
//! passive fan-out decisions.

mod common;

use std::time::Duration;

use common::{RecordingBackend, ScriptDriver};
use mu::config::WakeTurnMode;
use mu::outbox::{ListOutbox, OutboxState};
use mu::programs::heartbeat::CreateHeartbeat;
use mu::programs::LastResult;

fn heartbeat(title: &str) -> CreateHeartbeat {
    CreateHeartbeat {
        title: title.to_owned(),
        prompt: None,
        every_ms: 0,
        reason: Some("heartbeat-wake".to_owned()),
        enabled: None,
        metadata: None,
    }
}

#[tokio::test(start_paused = true)]
async fn active_mode_invokes_turn_exactly_once() {
    let world = common::build_world_with(|config| {
        config.operator.wake_turn_mode = WakeTurnMode::Active;
    });
    let backend = RecordingBackend::new();
    world.pipeline.set_backend(backend.clone());
    world.bind("slack", "U100");
    world.outbox.register_driver(ScriptDriver::ok("slack"));

    let program = world.heartbeats.create(heartbeat("active")).expect("create");
    let first = world
        .heartbeats
        .trigger(&program.program_id, Some("manual"))
        .await
        .expect("first trigger");
    assert_eq!(first.status, LastResult::Ok);
    let second = world
        .heartbeats
        .trigger(&program.program_id, Some("manual"))
        .await
        .expect("second trigger");
    assert_eq!(second.status, LastResult::Coalesced);

    // Exactly one turn reached the pipeline, addressed by the wake id.
    let calls = backend.calls();
    assert_eq!(calls.len(), 1, "repeated triggers must submit one turn");

    let wakes = world.events_of("operator.wake");
    assert_eq!(wakes.len(), 1);
    let wake_id = wakes[0].payload["wake_id"].as_str().expect("wake_id").to_owned();
    assert_eq!(
        calls[0].request_id.as_deref(),
        Some(format!("wake-turn-{wake_id}").as_str())
    );
    assert!(calls[0].command_text.contains(&format!("wake_id={wake_id}")));
    assert!(calls[0].command_text.contains("wake_source=heartbeat_program"));
    assert!(calls[0]
        .command_text
        .contains(&format!("program_id={}", program.program_id)));

    let decisions = world.events_of("operator.wake.decision");
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].payload["outcome"], "triggered");
    assert_eq!(decisions[0].payload["turn_result_kind"], "completed");

    // The wake notification still fans out and gets delivered.
    world.outbox.process_due().await;
    let delivery_states: Vec<String> = world
        .events_of("operator.wake.delivery")
        .iter()
        .map(|e| e.payload["state"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert!(delivery_states.contains(&"queued".to_owned()));
    assert!(delivery_states.contains(&"delivered".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn active_mode_without_pipeline_falls_back() {
    let world = common::build_world_with(|config| {
        config.operator.wake_turn_mode = WakeTurnMode::Active;
    });
    world.bind("slack", "U100");
    world.outbox.register_driver(ScriptDriver::ok("slack"));

    let program = world.heartbeats.create(heartbeat("fallback")).expect("create");
    let err = world
        .heartbeats
        .trigger(&program.program_id, Some("manual"))
        .await
        .expect_err("fallback surfaces as a failed trigger");
    assert_eq!(err.reason_code(), "precondition_failed");
    assert_eq!(err.http_status(), 409);

    let decisions = world.events_of("operator.wake.decision");
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].payload["outcome"], "fallback");
    assert_eq!(decisions[0].payload["reason"], "control_plane_unavailable");

    // No envelopes were created.
    let envelopes = world.outbox.list(&ListOutbox::default()).expect("list");
    assert!(envelopes.is_empty());

    let program = world.heartbeats.get(&program.program_id).expect("get");
    assert_eq!(program.last_result, Some(LastResult::Failed));
    assert!(program
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("control_plane_unavailable")));
}

#[tokio::test(start_paused = true)]
async fn passive_wake_fans_out_one_envelope_per_binding() {
    let world = common::build_world();
    world.bind("slack", "U100");
    world.bind("slack", "U200");
    world.bind("telegram", "T300");
    world.outbox.register_driver(ScriptDriver::ok("slack"));
    // No telegram driver: that binding is skipped.

    let program = world.heartbeats.create(heartbeat("notify")).expect("create");
    world
        .heartbeats
        .trigger(&program.program_id, Some("manual"))
        .await
        .expect("trigger");

    let wakes = world.events_of("operator.wake");
    assert_eq!(wakes.len(), 1);
    assert_eq!(wakes[0].payload["delivery"]["queued"], 2);
    assert_eq!(wakes[0].payload["delivery"]["duplicate"], 0);
    assert_eq!(wakes[0].payload["delivery"]["skipped"], 1);
    assert_eq!(wakes[0].payload["delivery_summary_v2"]["total"], 3);
    assert_eq!(wakes[0].payload["wake_turn_mode"], "passive");

    let envelopes = world
        .outbox
        .list(&ListOutbox {
            state: Some(OutboxState::Pending),
            ..Default::default()
        })
        .expect("list");
    assert_eq!(envelopes.len(), 2);
    for envelope in &envelopes {
        assert_eq!(envelope.kind, "wake");
        assert_eq!(envelope.channel, "slack");
        assert!(envelope
            .dedupe_key
            .starts_with(&format!("heartbeat-program:{}:wake:", program.program_id)));
        assert_eq!(envelope.body["wake_delivery_reason"], "heartbeat_cron_wake");
        assert_eq!(envelope.body["wake_turn_outcome"], "triggered");
    }

    let skipped: Vec<_> = world
        .events_of("operator.wake.delivery")
        .into_iter()
        .filter(|e| e.payload["state"] == "skipped")
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].payload["channel"], "telegram");
    assert_eq!(skipped[0].payload["reason_code"], "channel_unconfigured");
}

#[tokio::test(start_paused = true)]
async fn wakes_for_different_programs_do_not_coalesce() {
    let world = common::build_world();
    let a = world.heartbeats.create(heartbeat("a")).expect("create a");
    let b = world.heartbeats.create(heartbeat("b")).expect("create b");

    world
        .heartbeats
        .trigger(&a.program_id, Some("manual"))
        .await
        .expect("trigger a");
    world
        .heartbeats
        .trigger(&b.program_id, Some("manual"))
        .await
        .expect("trigger b");

    assert_eq!(world.events_of("operator.wake").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn coalesce_window_expires() {
    let world = common::build_world();
    let program = world.heartbeats.create(heartbeat("slow")).expect("create");

    world
        .heartbeats
        .trigger(&program.program_id, Some("manual"))
        .await
        .expect("first");
    tokio::time::sleep(Duration::from_millis(61_000)).await;
    let second = world
        .heartbeats
        .trigger(&program.program_id, Some("manual"))
        .await
        .expect("second after window");
    assert_eq!(second.status, LastResult::Ok, "a new wake after the window");
    assert_eq!(world.events_of("operator.wake").len(), 2);
}
