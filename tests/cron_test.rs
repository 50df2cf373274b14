//! Tests for the cron program registry: arming, one-shot auto-disable,
//! grid reload across restart (scenario: cron `every` reloads across
//! restart), lifecycle events, and trigger semantics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use mu::programs::cron::{CreateCron, CronRegistry, CronSchedule, UpdateCron};
use mu::programs::{LastResult, WakeDispatcher};

fn create_every(title: &str, every_ms: i64) -> CreateCron {
    CreateCron {
        title: title.to_owned(),
        prompt: None,
        schedule: CronSchedule::Every {
            every_ms,
            anchor_ms: None,
        },
        reason: Some("cron-wake".to_owned()),
        enabled: None,
        metadata: None,
    }
}

#[tokio::test(start_paused = true)]
async fn create_arms_next_run() {
    let world = common::build_world();
    let program = world.cron.create(create_every("grid", 5_000)).expect("create");

    let next = program.next_run_at_ms.expect("armed");
    assert_eq!(next, program.created_at_ms + 5_000, "first fire one period after the anchor");
}

#[tokio::test(start_paused = true)]
async fn every_program_fires_and_advances_on_the_grid() {
    let world = common::build_world();
    let program = world.cron.create(create_every("grid", 1_000)).expect("create");
    let first_due = program.next_run_at_ms.expect("armed");

    tokio::time::sleep(Duration::from_millis(1_400)).await;
    let fetched = world.cron.get(&program.program_id).expect("get");
    let triggered = fetched.last_triggered_at_ms.expect("fired once");
    assert!(triggered >= first_due);
    assert_eq!(fetched.last_result, Some(LastResult::Ok));
    // Re-armed before dispatch to the next grid instant.
    let re_armed = fetched.next_run_at_ms.expect("re-armed");
    assert!(re_armed > first_due);
    assert_eq!((re_armed - program.created_at_ms) % 1_000, 0, "stays on the anchor grid");

    let ticks = world.events_of("cron_program.tick");
    assert!(!ticks.is_empty());
    assert_eq!(ticks[0].payload["status"], "ok");
}

#[tokio::test(start_paused = true)]
async fn every_grid_survives_registry_restart() {
    let world = common::build_world();
    let program = world.cron.create(create_every("durable", 1_000)).expect("create");

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let before = world.cron.get(&program.program_id).expect("get");
    let t1 = before.last_triggered_at_ms.expect("first tick");
    assert_eq!(before.last_result, Some(LastResult::Ok));
    world.cron.stop();

    // Fresh registry over the same file, as after a process restart.
    let clock_dyn: Arc<dyn mu::clock::Clock> = world.clock.clone();
    let reloaded = CronRegistry::new(
        &world.paths.cron_jsonl,
        clock_dyn,
        world.scheduler.clone(),
        world.wake.clone() as Arc<dyn WakeDispatcher>,
        world.events.clone(),
    );
    reloaded.load().expect("load");

    let armed = reloaded.get(&program.program_id).expect("get");
    let next = armed.next_run_at_ms.expect("re-armed on load");
    assert_eq!((next - program.created_at_ms) % 1_000, 0, "reload re-arms on the same grid");

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let after = reloaded.get(&program.program_id).expect("get");
    let t2 = after.last_triggered_at_ms.expect("ticked after restart");
    assert!(t2 > t1, "last_triggered_at_ms is monotone across restart");
    assert!(matches!(
        after.last_result,
        Some(LastResult::Ok) | Some(LastResult::Coalesced)
    ));
}

#[tokio::test(start_paused = true)]
async fn at_in_the_past_auto_disables_before_arming() {
    let world = common::build_world();
    let now = common::EPOCH_MS;
    let program = world
        .cron
        .create(CreateCron {
            title: "stale".to_owned(),
            prompt: None,
            schedule: CronSchedule::At { at_ms: now - 60_000 },
            reason: None,
            enabled: None,
            metadata: None,
        })
        .expect("create");

    assert!(!program.enabled, "past at_ms auto-disables");
    assert!(program.next_run_at_ms.is_none());
    assert!(program.last_triggered_at_ms.is_none(), "never fired");
}

#[tokio::test(start_paused = true)]
async fn at_fires_once_then_disables() {
    let world = common::build_world();
    let fire_at = common::EPOCH_MS + 500;
    let program = world
        .cron
        .create(CreateCron {
            title: "once".to_owned(),
            prompt: None,
            schedule: CronSchedule::At { at_ms: fire_at },
            reason: None,
            enabled: None,
            metadata: None,
        })
        .expect("create");
    assert_eq!(program.next_run_at_ms, Some(fire_at));

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let fired = world.cron.get(&program.program_id).expect("get");
    assert!(!fired.enabled, "one-shot disables after firing");
    assert!(fired.next_run_at_ms.is_none());
    let t1 = fired.last_triggered_at_ms.expect("fired");
    assert_eq!(fired.last_result, Some(LastResult::Ok));

    tokio::time::sleep(Duration::from_millis(5_000)).await;
    let later = world.cron.get(&program.program_id).expect("get");
    assert_eq!(later.last_triggered_at_ms, Some(t1), "must not fire twice");
}

#[tokio::test(start_paused = true)]
async fn lifecycle_events_cover_create_update_remove() {
    let world = common::build_world();
    let program = world.cron.create(create_every("life", 60_000)).expect("create");
    world
        .cron
        .update(
            &program.program_id,
            UpdateCron {
                title: Some("renamed".to_owned()),
                ..Default::default()
            },
        )
        .expect("update");
    world.cron.remove(&program.program_id).expect("remove");

    let actions: Vec<String> = world
        .events_of("cron_program.lifecycle")
        .iter()
        .map(|e| e.payload["action"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(actions, vec!["created", "updated", "removed"]);
}

#[tokio::test(start_paused = true)]
async fn invalid_cron_expression_is_a_validation_error() {
    let world = common::build_world();
    let err = world
        .cron
        .create(CreateCron {
            title: "bad".to_owned(),
            prompt: None,
            schedule: CronSchedule::Cron {
                expr: "not a cron".to_owned(),
                tz: "UTC".to_owned(),
            },
            reason: None,
            enabled: None,
            metadata: None,
        })
        .expect_err("invalid expr must be rejected");
    assert_eq!(err.reason_code(), "validation");
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test(start_paused = true)]
async fn trigger_on_disabled_program_is_a_precondition_failure() {
    let world = common::build_world();
    let program = world.cron.create(create_every("off", 60_000)).expect("create");
    world
        .cron
        .update(
            &program.program_id,
            UpdateCron {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .expect("disable");

    let err = world
        .cron
        .trigger(&program.program_id, None)
        .await
        .expect_err("disabled trigger must fail");
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test(start_paused = true)]
async fn manual_trigger_does_not_touch_the_schedule() {
    let world = common::build_world();
    let program = world.cron.create(create_every("manual", 60_000)).expect("create");
    let armed = program.next_run_at_ms;

    let report = world
        .cron
        .trigger(&program.program_id, Some("manual"))
        .await
        .expect("trigger");
    assert_eq!(report.status, LastResult::Ok);

    let fetched = world.cron.get(&program.program_id).expect("get");
    assert_eq!(fetched.next_run_at_ms, armed, "manual trigger leaves next_run_at_ms alone");
    assert!(fetched.last_triggered_at_ms.is_some());
}
