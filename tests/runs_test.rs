//! Tests for the run registry: lifecycle transitions and the run-heartbeat
//! coupling (auto registration for API runs, in-place update on resume,
//! disable on terminal states).

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{CloseWithSuccessExecutor, SlowExecutor};
use mu::dag::{DagRunner, RunExecutor};
use mu::issues::NewIssue;
use mu::programs::heartbeat::ListHeartbeats;
use mu::runs::{RunRegistry, RunSource, RunStatus, StartRun};

fn registry_with(world: &common::World, executor: Arc<dyn RunExecutor>) -> Arc<RunRegistry> {
    let clock_dyn: Arc<dyn mu::clock::Clock> = world.clock.clone();
    let runner = DagRunner::new(
        world.issues.clone(),
        world.forum.clone(),
        world.events.clone(),
        clock_dyn.clone(),
        executor,
        world.paths.clone(),
    );
    RunRegistry::new(
        clock_dyn,
        world.events.clone(),
        world.issues.clone(),
        runner,
        world.heartbeats.clone(),
        20,
        120_000,
    )
}

fn tagged_root(world: &common::World) -> String {
    let mut tags = BTreeSet::new();
    tags.insert("node:agent".to_owned());
    world
        .issues
        .create(NewIssue {
            title: "root".to_owned(),
            body: String::new(),
            parent: None,
            blocked_by: Vec::new(),
            tags,
            priority: Some(2),
        })
        .expect("root")
        .id
}

async fn wait_terminal(registry: &Arc<RunRegistry>, job_id: &str) -> RunStatus {
    for _ in 0..200 {
        let record = registry.get(job_id).expect("get run");
        if record.status.is_terminal() {
            return record.status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {job_id} did not reach a terminal state");
}

#[tokio::test(start_paused = true)]
async fn unknown_root_is_not_found() {
    let world = common::build_world();
    let registry = registry_with(&world, CloseWithSuccessExecutor::new(world.issues.clone()));
    let err = registry
        .start(
            StartRun {
                root_issue_id: "is-missing".to_owned(),
                max_steps: None,
                prompt: None,
            },
            RunSource::Api,
        )
        .expect_err("missing root");
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test(start_paused = true)]
async fn api_run_registers_then_disables_auto_heartbeat() {
    let world = common::build_world();
    let registry = registry_with(&world, CloseWithSuccessExecutor::new(world.issues.clone()));
    let root_id = tagged_root(&world);

    let record = registry
        .start(
            StartRun {
                root_issue_id: root_id,
                max_steps: Some(5),
                prompt: None,
            },
            RunSource::Api,
        )
        .expect("start");
    assert_eq!(record.status, RunStatus::Running);

    // The auto heartbeat exists and is marked as such.
    let programs = world
        .heartbeats
        .list(&ListHeartbeats::default())
        .expect("list");
    assert_eq!(programs.len(), 1);
    let program = &programs[0];
    assert_eq!(program.reason, "auto-run-heartbeat");
    assert_eq!(program.metadata["auto_run_heartbeat"], true);
    assert_eq!(program.metadata["auto_run_job_id"], record.job_id.as_str());
    assert_eq!(program.every_ms, 120_000);
    assert!(program.enabled);

    let status = wait_terminal(&registry, &record.job_id).await;
    assert_eq!(status, RunStatus::Succeeded);
    let finished = registry.get(&record.job_id).expect("get");
    assert_eq!(finished.exit_code, Some(0));
    assert_eq!(finished.last_progress.as_deref(), Some("root_final"));

    // Terminal state disabled the heartbeat with the audit annotations.
    let program = world.heartbeats.get(&program.program_id).expect("get");
    assert!(!program.enabled);
    assert_eq!(program.every_ms, 0);
    assert_eq!(program.metadata["auto_disabled_from_status"], "succeeded");
    assert_eq!(program.metadata["auto_disabled_reason"], "run_terminal");
    assert!(program.metadata.contains_key("auto_disabled_at_ms"));

    let actions: Vec<String> = world
        .events_of("run.auto_heartbeat.lifecycle")
        .iter()
        .map(|e| e.payload["action"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(actions, vec!["registered", "disabled"]);
}

#[tokio::test(start_paused = true)]
async fn command_sourced_run_gets_no_auto_heartbeat() {
    let world = common::build_world();
    let registry = registry_with(&world, CloseWithSuccessExecutor::new(world.issues.clone()));
    let root_id = tagged_root(&world);

    let record = registry
        .start(
            StartRun {
                root_issue_id: root_id,
                max_steps: Some(5),
                prompt: None,
            },
            RunSource::Command,
        )
        .expect("start");
    wait_terminal(&registry, &record.job_id).await;

    let programs = world
        .heartbeats
        .list(&ListHeartbeats::default())
        .expect("list");
    assert!(programs.is_empty(), "command runs never register heartbeats");
    assert!(world.events_of("run.auto_heartbeat.lifecycle").is_empty());
}

#[tokio::test(start_paused = true)]
async fn resume_updates_the_same_heartbeat_in_place() {
    let world = common::build_world();
    let registry = registry_with(&world, CloseWithSuccessExecutor::new(world.issues.clone()));
    let root_id = tagged_root(&world);

    let record = registry
        .start(
            StartRun {
                root_issue_id: root_id,
                max_steps: Some(5),
                prompt: None,
            },
            RunSource::Api,
        )
        .expect("start");
    wait_terminal(&registry, &record.job_id).await;

    let resumed = registry.resume(&record.job_id).expect("resume");
    assert_eq!(resumed.job_id, record.job_id);
    wait_terminal(&registry, &record.job_id).await;

    // Still exactly one heartbeat program for the job.
    let programs = world
        .heartbeats
        .list(&ListHeartbeats::default())
        .expect("list");
    assert_eq!(programs.len(), 1);

    let actions: Vec<String> = world
        .events_of("run.auto_heartbeat.lifecycle")
        .iter()
        .map(|e| e.payload["action"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(actions, vec!["registered", "disabled", "updated", "disabled"]);
}

#[tokio::test(start_paused = true)]
async fn resume_of_a_running_run_conflicts() {
    let world = common::build_world();
    let registry = registry_with(&world, Arc::new(SlowExecutor { step_ms: 60_000 }));
    let root_id = tagged_root(&world);

    let record = registry
        .start(
            StartRun {
                root_issue_id: root_id,
                max_steps: Some(2),
                prompt: None,
            },
            RunSource::Api,
        )
        .expect("start");

    let err = registry.resume(&record.job_id).expect_err("still running");
    assert_eq!(err.exit_code(), 4);
    registry.interrupt(&record.job_id).expect("interrupt");
}

#[tokio::test(start_paused = true)]
async fn interrupt_marks_run_interrupted() {
    let world = common::build_world();
    let registry = registry_with(&world, Arc::new(SlowExecutor { step_ms: 60_000 }));
    let root_id = tagged_root(&world);

    let record = registry
        .start(
            StartRun {
                root_issue_id: root_id,
                max_steps: Some(50),
                prompt: None,
            },
            RunSource::Api,
        )
        .expect("start");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let interrupted = registry.interrupt(&record.job_id).expect("interrupt");
    assert_eq!(interrupted.status, RunStatus::Interrupted);

    let status = wait_terminal(&registry, &record.job_id).await;
    assert_eq!(status, RunStatus::Interrupted);

    // Interrupting twice is a conflict.
    let err = registry.interrupt(&record.job_id).expect_err("already done");
    assert_eq!(err.exit_code(), 4);

    // Let the in-flight step drain so the runner observes the flag and the
    // registry disables the heartbeat.
    tokio::time::sleep(Duration::from_secs(70)).await;
    let programs = world
        .heartbeats
        .list(&ListHeartbeats::default())
        .expect("list");
    assert_eq!(programs[0].metadata["auto_disabled_from_status"], "interrupted");
}

#[tokio::test(start_paused = true)]
async fn trace_returns_run_scoped_events() {
    let world = common::build_world();
    let registry = registry_with(&world, CloseWithSuccessExecutor::new(world.issues.clone()));
    let root_id = tagged_root(&world);

    let record = registry
        .start(
            StartRun {
                root_issue_id: root_id,
                max_steps: Some(5),
                prompt: None,
            },
            RunSource::Api,
        )
        .expect("start");
    wait_terminal(&registry, &record.job_id).await;

    let trace = registry.trace(&record.job_id).expect("trace");
    assert!(!trace.is_empty());
    assert!(trace.iter().all(|e| e.run_id.as_deref() == Some(record.job_id.as_str())));
    assert!(trace.iter().any(|e| e.event_type == "dag.run.end"));
}
