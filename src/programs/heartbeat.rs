//! Heartbeat program registry.
//!
//! Programs persist to `.mu/heartbeats.jsonl` (rewritten sorted on every
//! mutation). Each enabled program with `every_ms > 0` is bound to a
//! scheduler activity named `heartbeat-program:<id>`; `every_ms = 0`
//! programs are event-driven only and fire via [`HeartbeatRegistry::trigger`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventLog, EventScope};
use crate::ids;
use crate::scheduler::{ActivityScheduler, ActivitySpec, TickContext, TickFuture, TickResult};
use crate::store::JsonlStore;

use super::{DispatchOutcome, LastResult, WakeDispatcher, WakeRequest, WakeSource};

/// Upper bound on records returned by `list`.
const MAX_LIST_LIMIT: usize = 500;

/// One persistent heartbeat program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatProgram {
    /// Stable id, `hb-<12 hex>`.
    pub program_id: String,
    /// Operator-facing title.
    pub title: String,
    /// Optional prompt delivered with each wake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Whether the program fires at all.
    pub enabled: bool,
    /// Periodic interval; 0 means event-driven only.
    pub every_ms: i64,
    /// Wake reason recorded on ticks.
    pub reason: String,
    /// Free-form metadata forwarded to channel adapters.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Creation time.
    pub created_at_ms: i64,
    /// Last mutation time.
    pub updated_at_ms: i64,
    /// Last tick time; monotone non-decreasing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at_ms: Option<i64>,
    /// Result of the last tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<LastResult>,
    /// Error recorded by the last failed tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HeartbeatProgram {
    /// Scheduler activity id for this program.
    pub fn schedule_id(&self) -> String {
        format!("{}:{}", WakeSource::HeartbeatProgram.dedupe_prefix(), self.program_id)
    }
}

/// Fields accepted by `create`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateHeartbeat {
    /// Required title.
    pub title: String,
    /// Optional prompt.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Interval; defaults to 0 (event-driven only).
    #[serde(default)]
    pub every_ms: i64,
    /// Wake reason; defaults to `heartbeat-wake`.
    #[serde(default)]
    pub reason: Option<String>,
    /// Enabled at creation; defaults to true.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Initial metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Patch accepted by `update`. Absent fields keep their values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateHeartbeat {
    /// New title.
    #[serde(default)]
    pub title: Option<String>,
    /// New prompt.
    #[serde(default)]
    pub prompt: Option<String>,
    /// New interval.
    #[serde(default)]
    pub every_ms: Option<i64>,
    /// New reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Enable or disable.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Replacement metadata map.
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// List filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListHeartbeats {
    /// Only programs with this enabled state.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Maximum records, capped at 500.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Report returned by a manual trigger.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    /// Triggered program.
    pub program_id: String,
    /// `ok` or `coalesced`.
    pub status: LastResult,
    /// Reason detail for non-ok statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Persistent registry of heartbeat programs.
pub struct HeartbeatRegistry {
    store: JsonlStore,
    clock: Arc<dyn Clock>,
    scheduler: Arc<ActivityScheduler>,
    dispatcher: Arc<dyn WakeDispatcher>,
    events: Arc<EventLog>,
    programs: Mutex<Option<HashMap<String, HeartbeatProgram>>>,
}

impl HeartbeatRegistry {
    /// Create a registry persisting to `path`. Programs load lazily on the
    /// first operation; [`HeartbeatRegistry::load`] arms enabled schedules.
    pub fn new(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<ActivityScheduler>,
        dispatcher: Arc<dyn WakeDispatcher>,
        events: Arc<EventLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: JsonlStore::new(path),
            clock,
            scheduler,
            dispatcher,
            events,
            programs: Mutex::new(None),
        })
    }

    /// Load programs from disk and arm every enabled periodic schedule.
    pub fn load(self: &Arc<Self>) -> CoreResult<()> {
        let snapshot = {
            let mut guard = self.lock();
            self.ensure_loaded_locked(&mut guard)?;
            guard
                .as_ref()
                .map(|m| m.values().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        };
        for program in snapshot {
            self.sync_schedule(&program);
        }
        Ok(())
    }

    /// List programs sorted by `(created_at_ms, program_id)`.
    pub fn list(self: &Arc<Self>, filter: &ListHeartbeats) -> CoreResult<Vec<HeartbeatProgram>> {
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        let mut programs: Vec<HeartbeatProgram> = guard
            .as_ref()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        if let Some(enabled) = filter.enabled {
            programs.retain(|p| p.enabled == enabled);
        }
        sort_programs(&mut programs);
        programs.truncate(filter.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT));
        Ok(programs)
    }

    /// Fetch one program.
    pub fn get(self: &Arc<Self>, program_id: &str) -> CoreResult<HeartbeatProgram> {
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        guard
            .as_ref()
            .and_then(|m| m.get(program_id).cloned())
            .ok_or_else(|| CoreError::NotFound(format!("heartbeat program {program_id}")))
    }

    /// Create a program and arm its schedule when due.
    pub fn create(self: &Arc<Self>, req: CreateHeartbeat) -> CoreResult<HeartbeatProgram> {
        if req.title.trim().is_empty() {
            return Err(CoreError::Validation("title must not be empty".to_owned()));
        }
        if req.every_ms < 0 {
            return Err(CoreError::Validation("every_ms must be >= 0".to_owned()));
        }

        let now = self.clock.now_ms();
        let program = HeartbeatProgram {
            program_id: ids::heartbeat_program_id(),
            title: req.title,
            prompt: req.prompt,
            enabled: req.enabled.unwrap_or(true),
            every_ms: req.every_ms,
            reason: req.reason.unwrap_or_else(|| "heartbeat-wake".to_owned()),
            metadata: req.metadata.unwrap_or_default(),
            created_at_ms: now,
            updated_at_ms: now,
            last_triggered_at_ms: None,
            last_result: None,
            last_error: None,
        };

        {
            let mut guard = self.lock();
            self.ensure_loaded_locked(&mut guard)?;
            if let Some(map) = guard.as_mut() {
                map.insert(program.program_id.clone(), program.clone());
            }
            self.persist_locked(&guard)?;
        }
        self.sync_schedule(&program);
        info!(program_id = %program.program_id, every_ms = program.every_ms, "heartbeat program created");
        Ok(program)
    }

    /// Apply a patch; re-arms the schedule when enablement or cadence change.
    pub fn update(
        self: &Arc<Self>,
        program_id: &str,
        patch: UpdateHeartbeat,
    ) -> CoreResult<HeartbeatProgram> {
        if let Some(every_ms) = patch.every_ms {
            if every_ms < 0 {
                return Err(CoreError::Validation("every_ms must be >= 0".to_owned()));
            }
        }
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(CoreError::Validation("title must not be empty".to_owned()));
            }
        }

        let updated = {
            let mut guard = self.lock();
            self.ensure_loaded_locked(&mut guard)?;
            let map = guard
                .as_mut()
                .ok_or_else(|| CoreError::Internal("registry not loaded".to_owned()))?;
            let program = map
                .get_mut(program_id)
                .ok_or_else(|| CoreError::NotFound(format!("heartbeat program {program_id}")))?;

            if let Some(title) = patch.title {
                program.title = title;
            }
            if let Some(prompt) = patch.prompt {
                program.prompt = Some(prompt);
            }
            if let Some(every_ms) = patch.every_ms {
                program.every_ms = every_ms;
            }
            if let Some(reason) = patch.reason {
                program.reason = reason;
            }
            if let Some(enabled) = patch.enabled {
                program.enabled = enabled;
            }
            if let Some(metadata) = patch.metadata {
                program.metadata = metadata;
            }
            program.updated_at_ms = self.clock.now_ms();
            let updated = program.clone();
            self.persist_locked(&guard)?;
            updated
        };
        self.sync_schedule(&updated);
        Ok(updated)
    }

    /// Remove a program and unregister its schedule.
    pub fn remove(self: &Arc<Self>, program_id: &str) -> CoreResult<HeartbeatProgram> {
        let removed = {
            let mut guard = self.lock();
            self.ensure_loaded_locked(&mut guard)?;
            let map = guard
                .as_mut()
                .ok_or_else(|| CoreError::Internal("registry not loaded".to_owned()))?;
            let removed = map
                .remove(program_id)
                .ok_or_else(|| CoreError::NotFound(format!("heartbeat program {program_id}")))?;
            self.persist_locked(&guard)?;
            removed
        };
        self.scheduler.unregister(&removed.schedule_id());
        debug!(program_id, "heartbeat program removed");
        Ok(removed)
    }

    /// Manually dispatch a program's wake. Disabled programs are a
    /// precondition failure, as is an active-mode wake with no pipeline.
    pub async fn trigger(
        self: &Arc<Self>,
        program_id: &str,
        reason: Option<&str>,
    ) -> CoreResult<TriggerReport> {
        let program = self.get(program_id)?;
        if !program.enabled {
            return Err(CoreError::PreconditionFailed(format!(
                "heartbeat program {program_id} is disabled"
            )));
        }

        match self.tick(program_id, reason.unwrap_or("manual")).await {
            TickResult::Ran { .. } => Ok(TriggerReport {
                program_id: program_id.to_owned(),
                status: LastResult::Ok,
                reason: None,
            }),
            TickResult::Skipped { reason } if reason == "coalesced" => Ok(TriggerReport {
                program_id: program_id.to_owned(),
                status: LastResult::Coalesced,
                reason: Some(reason),
            }),
            TickResult::Skipped { reason } => Err(CoreError::PreconditionFailed(reason)),
            TickResult::Failed { reason } => Err(CoreError::PreconditionFailed(reason)),
        }
    }

    /// Unregister every schedule; the store stays untouched.
    pub fn stop(self: &Arc<Self>) {
        let guard = self.lock();
        if let Some(map) = guard.as_ref() {
            for program in map.values() {
                self.scheduler.unregister(&program.schedule_id());
            }
        }
    }

    /// Tick handler body shared by schedule fires and manual triggers.
    ///
    /// Looks up the program, dispatches its wake, records
    /// `last_triggered_at_ms` / `last_result` / `last_error`, persists, and
    /// emits `heartbeat_program.tick`.
    pub async fn tick(self: &Arc<Self>, program_id: &str, reason: &str) -> TickResult {
        let program = {
            let mut guard = self.lock();
            if self.ensure_loaded_locked(&mut guard).is_err() {
                return TickResult::Failed {
                    reason: "registry load failed".to_owned(),
                };
            }
            guard.as_ref().and_then(|m| m.get(program_id).cloned())
        };
        let Some(program) = program else {
            return TickResult::Skipped {
                reason: "not_found".to_owned(),
            };
        };
        if !program.enabled {
            return TickResult::Skipped {
                reason: "disabled".to_owned(),
            };
        }

        let started = self.clock.now_ms();
        // Schedule-driven ticks carry the program's configured reason;
        // manual and hook triggers keep their own.
        let scheduled_fire = reason == "interval" || reason == "retry" || reason == "default";
        let wake_reason = if scheduled_fire {
            program.reason.clone()
        } else {
            reason.to_owned()
        };
        let wake = WakeRequest {
            source: WakeSource::HeartbeatProgram,
            program_id: program.program_id.clone(),
            title: program.title.clone(),
            prompt: program.prompt.clone(),
            reason: wake_reason,
            metadata: program.metadata.clone(),
            program_snapshot: serde_json::to_value(&program).unwrap_or_default(),
        };
        let outcome = self.dispatcher.dispatch(wake).await;

        let (last_result, last_error, tick_result) = match &outcome {
            DispatchOutcome::Ok => (
                LastResult::Ok,
                None,
                TickResult::Ran {
                    duration_ms: self.clock.now_ms().saturating_sub(started),
                },
            ),
            DispatchOutcome::Coalesced { reason } => (
                LastResult::Coalesced,
                None,
                TickResult::Skipped {
                    reason: reason.clone(),
                },
            ),
            DispatchOutcome::Failed { reason } => (
                LastResult::Failed,
                Some(reason.clone()),
                TickResult::Failed {
                    reason: reason.clone(),
                },
            ),
        };

        let snapshot = {
            let mut guard = self.lock();
            let map = match guard.as_mut() {
                Some(m) => m,
                None => return tick_result,
            };
            let Some(stored) = map.get_mut(program_id) else {
                return tick_result;
            };
            let now = self.clock.now_ms();
            stored.last_triggered_at_ms =
                Some(stored.last_triggered_at_ms.unwrap_or(i64::MIN).max(now));
            stored.last_result = Some(last_result);
            stored.last_error = last_error;
            let snapshot = stored.clone();
            if let Err(e) = self.persist_locked(&guard) {
                return TickResult::Failed {
                    reason: format!("persist failed: {e}"),
                };
            }
            snapshot
        };

        self.events.emit(
            "heartbeat_program.tick",
            "heartbeat_program",
            EventScope::none(),
            serde_json::json!({
                "program_id": program_id,
                "status": last_result.as_str(),
                "reason": reason,
                "message": snapshot.last_error,
                "program": serde_json::to_value(&snapshot).unwrap_or_default(),
            }),
        );

        tick_result
    }

    /// Bind or unbind the program's scheduler activity to match its state.
    fn sync_schedule(self: &Arc<Self>, program: &HeartbeatProgram) {
        let schedule_id = program.schedule_id();
        if program.enabled && program.every_ms > 0 {
            let weak = Arc::downgrade(self);
            let program_id = program.program_id.clone();
            let handler = Arc::new(move |ctx: TickContext| -> TickFuture {
                let weak = weak.clone();
                let program_id = program_id.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(registry) => registry.tick(&program_id, &ctx.reason).await,
                        None => TickResult::Skipped {
                            reason: "registry-stopped".to_owned(),
                        },
                    }
                })
            });
            self.scheduler.register(ActivitySpec {
                activity_id: schedule_id,
                every_ms: program.every_ms,
                coalesce_ms: None,
                handler,
            });
        } else {
            self.scheduler.unregister(&schedule_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<HashMap<String, HeartbeatProgram>>> {
        match self.programs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_loaded_locked(
        &self,
        guard: &mut MutexGuard<'_, Option<HashMap<String, HeartbeatProgram>>>,
    ) -> CoreResult<()> {
        if guard.is_none() {
            let records: Vec<HeartbeatProgram> = self.store.read_all()?;
            let map = records
                .into_iter()
                .map(|p| (p.program_id.clone(), p))
                .collect();
            **guard = Some(map);
        }
        Ok(())
    }

    fn persist_locked(
        &self,
        guard: &MutexGuard<'_, Option<HashMap<String, HeartbeatProgram>>>,
    ) -> CoreResult<()> {
        let mut programs: Vec<HeartbeatProgram> = guard
            .as_ref()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        sort_programs(&mut programs);
        self.store.rewrite(&programs)
    }
}

fn sort_programs(programs: &mut [HeartbeatProgram]) {
    programs.sort_by(|a, b| {
        (a.created_at_ms, a.program_id.as_str()).cmp(&(b.created_at_ms, b.program_id.as_str()))
    });
}

impl std::fmt::Debug for HeartbeatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatRegistry")
            .field("path", &self.store.path())
            .finish_non_exhaustive()
    }
}
