//! Run lifecycle registry.
//!
//! Owns run records, drives the DAG runner in background tasks, and keeps
//! run heartbeat programs in sync with run state: registering a run as
//! `running` through the API creates (or updates) an auto heartbeat
//! program, and every terminal transition disables it. Only this registry
//! touches auto heartbeats; wake-initiated turns cannot register one,
//! which breaks the run → wake → turn → run cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::dag::{DagRunner, RunVerdict};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventLog, EventRecord, EventScope};
use crate::ids;
use crate::issues::IssueStore;
use crate::programs::heartbeat::{CreateHeartbeat, HeartbeatRegistry, UpdateHeartbeat};

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted, not yet started.
    Queued,
    /// The runner loop is executing.
    Running,
    /// Terminal: the validator reported the root final.
    Succeeded,
    /// Terminal: error or exhausted step budget.
    Failed,
    /// Terminal: cancelled before it could start.
    Cancelled,
    /// Terminal: an interrupt was observed.
    Interrupted,
}

impl RunStatus {
    /// Snake-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }

    /// Whether this state ends the run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Interrupted
        )
    }
}

/// How the run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Fresh run.
    RunStart,
    /// Resume of a finished or interrupted run.
    RunResume,
}

/// Who started the run. Only API-sourced runs get auto heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    /// Started by a terminal command.
    Command,
    /// Started through the run lifecycle API.
    Api,
}

/// One run record.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    /// Stable id, `run-<12 hex>`.
    pub job_id: String,
    /// Root issue the run drives.
    pub root_issue_id: String,
    /// Lifecycle state.
    pub status: RunStatus,
    /// Start mode.
    pub mode: RunMode,
    /// Start source.
    pub source: RunSource,
    /// Step budget.
    pub max_steps: u32,
    /// Optional operator prompt attached to the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Start time.
    pub started_at_ms: i64,
    /// Last transition time.
    pub updated_at_ms: i64,
    /// Finish time, once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    /// Exit code, once terminal (0 success, 1 failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Last progress note (verdict label).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress: Option<String>,
}

/// Fields accepted when starting a run.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRun {
    /// Root issue to drive.
    pub root_issue_id: String,
    /// Step budget; defaults to the configured maximum.
    #[serde(default)]
    pub max_steps: Option<u32>,
    /// Optional operator prompt.
    #[serde(default)]
    pub prompt: Option<String>,
}

struct RunEntry {
    record: RunRecord,
    interrupt: Arc<AtomicBool>,
}

/// Registry of runs for this server process.
pub struct RunRegistry {
    clock: Arc<dyn Clock>,
    events: Arc<EventLog>,
    issues: Arc<IssueStore>,
    runner: Arc<DagRunner>,
    heartbeats: Arc<HeartbeatRegistry>,
    default_max_steps: u32,
    auto_heartbeat_every_ms: i64,
    runs: Mutex<HashMap<String, RunEntry>>,
    /// Auto heartbeat program per job id; duplicate registrations for one
    /// job update in place.
    auto_heartbeat_by_job: Mutex<HashMap<String, String>>,
}

impl RunRegistry {
    /// Create a registry.
    pub fn new(
        clock: Arc<dyn Clock>,
        events: Arc<EventLog>,
        issues: Arc<IssueStore>,
        runner: Arc<DagRunner>,
        heartbeats: Arc<HeartbeatRegistry>,
        default_max_steps: u32,
        auto_heartbeat_every_ms: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            events,
            issues,
            runner,
            heartbeats,
            default_max_steps,
            auto_heartbeat_every_ms,
            runs: Mutex::new(HashMap::new()),
            auto_heartbeat_by_job: Mutex::new(HashMap::new()),
        })
    }

    /// Start a run and drive it in a background task.
    pub fn start(self: &Arc<Self>, req: StartRun, source: RunSource) -> CoreResult<RunRecord> {
        // The root must exist before a runner task is committed to it.
        self.issues.get(&req.root_issue_id)?;

        let now = self.clock.now_ms();
        let record = RunRecord {
            job_id: ids::job_id(),
            root_issue_id: req.root_issue_id,
            status: RunStatus::Running,
            mode: RunMode::RunStart,
            source,
            max_steps: req.max_steps.unwrap_or(self.default_max_steps).max(1),
            prompt: req.prompt,
            started_at_ms: now,
            updated_at_ms: now,
            finished_at_ms: None,
            exit_code: None,
            last_progress: None,
        };
        self.launch(record.clone());
        Ok(record)
    }

    /// Resume a terminal run under the same job id.
    pub fn resume(self: &Arc<Self>, job_id: &str) -> CoreResult<RunRecord> {
        let mut record = self.get(job_id)?;
        if !record.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "run {job_id} is still {}",
                record.status.as_str()
            )));
        }
        let now = self.clock.now_ms();
        record.status = RunStatus::Running;
        record.mode = RunMode::RunResume;
        record.updated_at_ms = now;
        record.finished_at_ms = None;
        record.exit_code = None;
        record.last_progress = None;
        self.launch(record.clone());
        Ok(record)
    }

    /// Request an interrupt. The runner observes the flag at the top of its
    /// next step.
    pub fn interrupt(self: &Arc<Self>, job_id: &str) -> CoreResult<RunRecord> {
        let record = {
            let mut runs = self.lock_runs();
            let entry = runs
                .get_mut(job_id)
                .ok_or_else(|| CoreError::NotFound(format!("run {job_id}")))?;
            if entry.record.status.is_terminal() {
                return Err(CoreError::Conflict(format!(
                    "run {job_id} already {}",
                    entry.record.status.as_str()
                )));
            }
            entry.interrupt.store(true, Ordering::SeqCst);
            entry.record.status = RunStatus::Interrupted;
            entry.record.updated_at_ms = self.clock.now_ms();
            entry.record.clone()
        };
        info!(job_id, "run interrupt requested");
        Ok(record)
    }

    /// Fetch one run.
    pub fn get(&self, job_id: &str) -> CoreResult<RunRecord> {
        self.lock_runs()
            .get(job_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| CoreError::NotFound(format!("run {job_id}")))
    }

    /// All runs, newest first.
    pub fn list(&self) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> =
            self.lock_runs().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| b.started_at_ms.cmp(&a.started_at_ms));
        records
    }

    /// Telemetry trail for one run.
    pub fn trace(&self, job_id: &str) -> CoreResult<Vec<EventRecord>> {
        self.get(job_id)?;
        self.events.query(&crate::events::EventFilter {
            run_id: Some(job_id.to_owned()),
            ..Default::default()
        })
    }

    fn launch(self: &Arc<Self>, record: RunRecord) {
        let interrupt = Arc::new(AtomicBool::new(false));
        {
            let mut runs = self.lock_runs();
            runs.insert(
                record.job_id.clone(),
                RunEntry {
                    record: record.clone(),
                    interrupt: Arc::clone(&interrupt),
                },
            );
        }
        self.register_running(&record);

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let verdict = registry
                .runner
                .run(
                    &record.root_issue_id,
                    &record.job_id,
                    record.max_steps,
                    interrupt,
                )
                .await;
            registry.finish(&record.job_id, &verdict);
        });
    }

    /// Record the run as running and sync its auto heartbeat. Only runs
    /// registered through the API get one; command-sourced runs never do.
    fn register_running(self: &Arc<Self>, record: &RunRecord) {
        if record.source != RunSource::Api {
            return;
        }
        let job_id = record.job_id.clone();
        let existing = self.lock_auto().get(&job_id).cloned();

        let mut metadata = serde_json::Map::new();
        metadata.insert("auto_run_heartbeat".to_owned(), true.into());
        metadata.insert("auto_run_job_id".to_owned(), job_id.clone().into());

        let (action, program) = match existing {
            Some(program_id) => {
                let patch = UpdateHeartbeat {
                    every_ms: Some(self.auto_heartbeat_every_ms),
                    enabled: Some(true),
                    reason: Some("auto-run-heartbeat".to_owned()),
                    metadata: Some(metadata),
                    ..Default::default()
                };
                match self.heartbeats.update(&program_id, patch) {
                    Ok(program) => ("updated", program),
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "failed to update auto run heartbeat");
                        return;
                    }
                }
            }
            None => {
                let create = CreateHeartbeat {
                    title: format!("Run heartbeat {job_id}"),
                    prompt: None,
                    every_ms: self.auto_heartbeat_every_ms,
                    reason: Some("auto-run-heartbeat".to_owned()),
                    enabled: Some(true),
                    metadata: Some(metadata),
                };
                match self.heartbeats.create(create) {
                    Ok(program) => {
                        self.lock_auto()
                            .insert(job_id.clone(), program.program_id.clone());
                        ("registered", program)
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "failed to create auto run heartbeat");
                        return;
                    }
                }
            }
        };

        self.events.emit(
            "run.auto_heartbeat.lifecycle",
            "runs",
            EventScope::run(job_id.clone()),
            serde_json::json!({
                "action": action,
                "run_job_id": job_id,
                "program_id": program.program_id,
                "program": serde_json::to_value(&program).unwrap_or_default(),
            }),
        );
    }

    /// Record the terminal state and disable the run's auto heartbeat.
    fn finish(self: &Arc<Self>, job_id: &str, verdict: &RunVerdict) {
        let now = self.clock.now_ms();
        let record = {
            let mut runs = self.lock_runs();
            let Some(entry) = runs.get_mut(job_id) else {
                return;
            };
            // An interrupt observed mid-run wins over the verdict mapping.
            if entry.record.status != RunStatus::Interrupted {
                entry.record.status = match verdict {
                    RunVerdict::RootFinal { .. } => RunStatus::Succeeded,
                    RunVerdict::Interrupted { .. } => RunStatus::Interrupted,
                    RunVerdict::MaxStepsExhausted { .. } | RunVerdict::Error { .. } => {
                        RunStatus::Failed
                    }
                };
            }
            entry.record.exit_code = Some(match entry.record.status {
                RunStatus::Succeeded => 0,
                _ => 1,
            });
            entry.record.last_progress = Some(verdict.label().to_owned());
            entry.record.finished_at_ms = Some(now);
            entry.record.updated_at_ms = now;
            entry.record.clone()
        };
        self.disable_auto_heartbeat(job_id, record.status);
    }

    fn disable_auto_heartbeat(self: &Arc<Self>, job_id: &str, status: RunStatus) {
        let Some(program_id) = self.lock_auto().get(job_id).cloned() else {
            return;
        };
        let current = match self.heartbeats.get(&program_id) {
            Ok(program) => program,
            Err(e) => {
                warn!(job_id, error = %e, "auto run heartbeat missing at disable");
                return;
            }
        };
        let mut metadata = current.metadata.clone();
        metadata.insert(
            "auto_disabled_from_status".to_owned(),
            status.as_str().into(),
        );
        metadata.insert(
            "auto_disabled_reason".to_owned(),
            "run_terminal".to_owned().into(),
        );
        metadata.insert(
            "auto_disabled_at_ms".to_owned(),
            self.clock.now_ms().into(),
        );

        let patch = UpdateHeartbeat {
            enabled: Some(false),
            every_ms: Some(0),
            metadata: Some(metadata),
            ..Default::default()
        };
        match self.heartbeats.update(&program_id, patch) {
            Ok(program) => {
                self.events.emit(
                    "run.auto_heartbeat.lifecycle",
                    "runs",
                    EventScope::run(job_id.to_owned()),
                    serde_json::json!({
                        "action": "disabled",
                        "run_job_id": job_id,
                        "program_id": program.program_id,
                        "program": serde_json::to_value(&program).unwrap_or_default(),
                    }),
                );
            }
            Err(e) => {
                warn!(job_id, error = %e, "failed to disable auto run heartbeat");
            }
        }
    }

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<String, RunEntry>> {
        match self.runs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_auto(&self) -> MutexGuard<'_, HashMap<String, String>> {
        match self.auto_heartbeat_by_job.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry")
            .field("runs", &self.lock_runs().len())
            .finish_non_exhaustive()
    }
}
