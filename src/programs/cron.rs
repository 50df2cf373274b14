//! Cron program registry.
//!
//! Persists `at` / `every` / `cron` schedules to `.mu/cron.jsonl` and arms
//! each enabled program as an event-driven scheduler activity plus a
//! one-shot timer at `next_run_at_ms`. `every` programs stay on their
//! anchor grid across restarts; `cron` programs evaluate 5-field
//! expressions in the program's IANA timezone; `at` programs fire at most
//! once and then auto-disable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, TimerHandle, Timers};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventLog, EventScope};
use crate::ids;
use crate::scheduler::{ActivityScheduler, ActivitySpec, TickContext, TickFuture, TickResult};
use crate::store::JsonlStore;

use super::{DispatchOutcome, LastResult, WakeDispatcher, WakeRequest, WakeSource};

/// Upper bound on records returned by `list`.
const MAX_LIST_LIMIT: usize = 500;

/// Cron candidates scanned per evaluation before giving up (covers years
/// of last-of-month filtering).
const MAX_CRON_CANDIDATES: usize = 1024;

/// When a program fires: once, on a fixed grid, or on a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    /// Fire once at an absolute time, then auto-disable.
    At {
        /// Epoch-ms fire time.
        at_ms: i64,
    },
    /// Fire every `every_ms` on the grid anchored at `anchor_ms`
    /// (defaults to the program's creation time).
    Every {
        /// Grid period, at least 1 ms.
        every_ms: i64,
        /// Grid anchor.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    /// Fire on a standard 5-field cron expression evaluated in `tz`.
    Cron {
        /// `minute hour day-of-month month day-of-week`; supports `*`,
        /// `*/n`, lists, ranges, and `L` for last day of month.
        expr: String,
        /// IANA zone name; unknown zones fall back to UTC.
        #[serde(default = "default_tz")]
        tz: String,
    },
}

fn default_tz() -> String {
    "UTC".to_owned()
}

/// One persistent cron program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronProgram {
    /// Stable id, `cr-<12 hex>`.
    pub program_id: String,
    /// Operator-facing title.
    pub title: String,
    /// Optional prompt delivered with each wake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Whether the program fires at all.
    pub enabled: bool,
    /// Fire schedule.
    pub schedule: CronSchedule,
    /// Wake reason recorded on ticks.
    pub reason: String,
    /// Free-form metadata forwarded to channel adapters.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Creation time.
    pub created_at_ms: i64,
    /// Last mutation time.
    pub updated_at_ms: i64,
    /// Next armed fire time, when enabled and computable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
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

impl CronProgram {
    /// Scheduler activity id for this program.
    pub fn schedule_id(&self) -> String {
        format!("{}:{}", WakeSource::CronProgram.dedupe_prefix(), self.program_id)
    }
}

/// Fields accepted by `create`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCron {
    /// Required title.
    pub title: String,
    /// Optional prompt.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Fire schedule.
    pub schedule: CronSchedule,
    /// Wake reason; defaults to `cron-wake`.
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
pub struct UpdateCron {
    /// New title.
    #[serde(default)]
    pub title: Option<String>,
    /// New prompt.
    #[serde(default)]
    pub prompt: Option<String>,
    /// New schedule.
    #[serde(default)]
    pub schedule: Option<CronSchedule>,
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
pub struct ListCron {
    /// Only programs with this enabled state.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Maximum records, capped at 500.
    #[serde(default)]
    pub limit: Option<usize>,
}

// ── Schedule evaluation ─────────────────────────────────────────

/// Resolve an IANA zone name, falling back to UTC.
pub fn resolve_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::Tz::UTC)
}

/// Parse a 5-field cron expression into the 6-field form the evaluator
/// consumes. `L` in the day-of-month field selects the last day of each
/// month (expanded to `28-31` plus a post-filter).
fn parse_cron_expr(expr: &str) -> CoreResult<(cron::Schedule, bool)> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CoreError::Validation(format!(
            "cron expression must have 5 fields (minute hour dom month dow), got {}",
            fields.len()
        )));
    }
    let mut last_dom = false;
    let dom = if fields[2].eq_ignore_ascii_case("l") {
        last_dom = true;
        "28-31"
    } else {
        fields[2]
    };
    let with_seconds = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], dom, fields[3], fields[4]
    );
    let schedule = cron::Schedule::from_str(&with_seconds)
        .map_err(|e| CoreError::Validation(format!("invalid cron expression '{expr}': {e}")))?;
    Ok((schedule, last_dom))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year.saturating_add(1), 1)
    } else {
        (year, month.saturating_add(1))
    };
    chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn is_last_day_of_month<Tz: TimeZone>(dt: &DateTime<Tz>) -> bool {
    dt.day() == days_in_month(dt.year(), dt.month())
}

/// Next cron instant strictly after `after_ms + 1 s`, evaluated in `tz`,
/// as epoch ms. `skip_wall` suppresses a fall-back repeat of an already
/// fired wall-clock time.
fn cron_next_ms(
    expr: &str,
    tz: &str,
    after_ms: i64,
    skip_wall: Option<NaiveDateTime>,
) -> CoreResult<Option<i64>> {
    let (schedule, last_dom) = parse_cron_expr(expr)?;
    let zone = resolve_tz(tz);
    let after_utc = Utc
        .timestamp_millis_opt(after_ms.saturating_add(999))
        .single()
        .ok_or_else(|| CoreError::Validation(format!("time out of range: {after_ms}")))?;
    let after_local = after_utc.with_timezone(&zone);

    for candidate in schedule.after(&after_local).take(MAX_CRON_CANDIDATES) {
        if last_dom && !is_last_day_of_month(&candidate) {
            continue;
        }
        if let Some(fired) = skip_wall {
            // Fall-back repeats the same wall-clock hour; never fire it twice.
            if candidate.naive_local() == fired {
                continue;
            }
        }
        return Ok(Some(candidate.with_timezone(&Utc).timestamp_millis()));
    }
    Ok(None)
}

/// Compute the next fire strictly after `after_ms` for any schedule kind.
///
/// Returns `None` for an `at` schedule already in the past (the caller
/// auto-disables) or a cron expression with no upcoming instant.
pub fn next_fire_after(
    schedule: &CronSchedule,
    after_ms: i64,
    created_at_ms: i64,
    skip_wall: Option<NaiveDateTime>,
) -> CoreResult<Option<i64>> {
    match schedule {
        CronSchedule::At { at_ms } => {
            if *at_ms < 0 {
                return Err(CoreError::Validation("at_ms must be >= 0".to_owned()));
            }
            Ok(if *at_ms >= after_ms { Some(*at_ms) } else { None })
        }
        CronSchedule::Every { every_ms, anchor_ms } => {
            if *every_ms < 1 {
                return Err(CoreError::Validation("every_ms must be >= 1".to_owned()));
            }
            let anchor = anchor_ms.unwrap_or(created_at_ms);
            if after_ms < anchor {
                return Ok(Some(anchor));
            }
            // First grid instant strictly after `after_ms`. Staying strict
            // keeps a tick-time recompute from re-arming its own instant.
            let elapsed = after_ms.saturating_sub(anchor);
            let periods = elapsed.div_euclid(*every_ms).saturating_add(1);
            Ok(Some(anchor.saturating_add(periods.saturating_mul(*every_ms))))
        }
        CronSchedule::Cron { expr, tz } => cron_next_ms(expr, tz, after_ms, skip_wall),
    }
}

/// Validate a schedule at create/update time.
fn validate_schedule(schedule: &CronSchedule) -> CoreResult<()> {
    match schedule {
        CronSchedule::At { at_ms } => {
            if *at_ms < 0 {
                return Err(CoreError::Validation("at_ms must be >= 0".to_owned()));
            }
        }
        CronSchedule::Every { every_ms, .. } => {
            if *every_ms < 1 {
                return Err(CoreError::Validation("every_ms must be >= 1".to_owned()));
            }
        }
        CronSchedule::Cron { expr, .. } => {
            parse_cron_expr(expr)?;
        }
    }
    Ok(())
}

// ── Registry ────────────────────────────────────────────────────

/// Persistent registry of cron programs.
pub struct CronRegistry {
    store: JsonlStore,
    clock: Arc<dyn Clock>,
    timers: Timers,
    scheduler: Arc<ActivityScheduler>,
    dispatcher: Arc<dyn WakeDispatcher>,
    events: Arc<EventLog>,
    programs: Mutex<Option<HashMap<String, CronProgram>>>,
    fire_timers: Mutex<HashMap<String, TimerHandle>>,
    /// Wall-clock instants already fired per program, for the fall-back
    /// guard. Process-local.
    fired_wall: Mutex<HashMap<String, NaiveDateTime>>,
}

impl CronRegistry {
    /// Create a registry persisting to `path`.
    pub fn new(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<ActivityScheduler>,
        dispatcher: Arc<dyn WakeDispatcher>,
        events: Arc<EventLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: JsonlStore::new(path),
            timers: Timers::new(Arc::clone(&clock)),
            clock,
            scheduler,
            dispatcher,
            events,
            programs: Mutex::new(None),
            fire_timers: Mutex::new(HashMap::new()),
            fired_wall: Mutex::new(HashMap::new()),
        })
    }

    /// Load programs and re-arm every enabled one. Past `at` schedules
    /// auto-disable before arming.
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
            if program.enabled {
                self.arm(&program.program_id)?;
            }
        }
        Ok(())
    }

    /// List programs sorted by `(created_at_ms, program_id)`.
    pub fn list(self: &Arc<Self>, filter: &ListCron) -> CoreResult<Vec<CronProgram>> {
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        let mut programs: Vec<CronProgram> = guard
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
    pub fn get(self: &Arc<Self>, program_id: &str) -> CoreResult<CronProgram> {
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        guard
            .as_ref()
            .and_then(|m| m.get(program_id).cloned())
            .ok_or_else(|| CoreError::NotFound(format!("cron program {program_id}")))
    }

    /// Create a program and arm it.
    pub fn create(self: &Arc<Self>, req: CreateCron) -> CoreResult<CronProgram> {
        if req.title.trim().is_empty() {
            return Err(CoreError::Validation("title must not be empty".to_owned()));
        }
        validate_schedule(&req.schedule)?;

        let now = self.clock.now_ms();
        let program = CronProgram {
            program_id: ids::cron_program_id(),
            title: req.title,
            prompt: req.prompt,
            enabled: req.enabled.unwrap_or(true),
            schedule: req.schedule,
            reason: req.reason.unwrap_or_else(|| "cron-wake".to_owned()),
            metadata: req.metadata.unwrap_or_default(),
            created_at_ms: now,
            updated_at_ms: now,
            next_run_at_ms: None,
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
        if program.enabled {
            self.arm(&program.program_id)?;
        }
        let snapshot = self.get(&program.program_id)?;
        self.emit_lifecycle("created", &snapshot, "cron program created");
        info!(program_id = %snapshot.program_id, "cron program created");
        Ok(snapshot)
    }

    /// Apply a patch and re-arm.
    pub fn update(self: &Arc<Self>, program_id: &str, patch: UpdateCron) -> CoreResult<CronProgram> {
        if let Some(schedule) = &patch.schedule {
            validate_schedule(schedule)?;
        }
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(CoreError::Validation("title must not be empty".to_owned()));
            }
        }

        {
            let mut guard = self.lock();
            self.ensure_loaded_locked(&mut guard)?;
            let map = guard
                .as_mut()
                .ok_or_else(|| CoreError::Internal("registry not loaded".to_owned()))?;
            let program = map
                .get_mut(program_id)
                .ok_or_else(|| CoreError::NotFound(format!("cron program {program_id}")))?;

            if let Some(title) = patch.title {
                program.title = title;
            }
            if let Some(prompt) = patch.prompt {
                program.prompt = Some(prompt);
            }
            if let Some(schedule) = patch.schedule {
                program.schedule = schedule;
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
            if !program.enabled {
                program.next_run_at_ms = None;
            }
            self.persist_locked(&guard)?;
        }

        let updated = self.get(program_id)?;
        if updated.enabled {
            self.arm(program_id)?;
        } else {
            self.disarm(program_id);
        }
        let snapshot = self.get(program_id)?;
        self.emit_lifecycle("updated", &snapshot, "cron program updated");
        Ok(snapshot)
    }

    /// Remove a program, cancelling its timers.
    pub fn remove(self: &Arc<Self>, program_id: &str) -> CoreResult<CronProgram> {
        let removed = {
            let mut guard = self.lock();
            self.ensure_loaded_locked(&mut guard)?;
            let map = guard
                .as_mut()
                .ok_or_else(|| CoreError::Internal("registry not loaded".to_owned()))?;
            let removed = map
                .remove(program_id)
                .ok_or_else(|| CoreError::NotFound(format!("cron program {program_id}")))?;
            self.persist_locked(&guard)?;
            removed
        };
        self.disarm(program_id);
        self.emit_lifecycle("removed", &removed, "cron program removed");
        debug!(program_id, "cron program removed");
        Ok(removed)
    }

    /// Manually dispatch a program's wake without touching its schedule.
    pub async fn trigger(
        self: &Arc<Self>,
        program_id: &str,
        reason: Option<&str>,
    ) -> CoreResult<super::heartbeat::TriggerReport> {
        let program = self.get(program_id)?;
        if !program.enabled {
            return Err(CoreError::PreconditionFailed(format!(
                "cron program {program_id} is disabled"
            )));
        }

        match self.tick(program_id, reason.unwrap_or("manual")).await {
            TickResult::Ran { .. } => Ok(super::heartbeat::TriggerReport {
                program_id: program_id.to_owned(),
                status: LastResult::Ok,
                reason: None,
            }),
            TickResult::Skipped { reason } if reason == "coalesced" => {
                Ok(super::heartbeat::TriggerReport {
                    program_id: program_id.to_owned(),
                    status: LastResult::Coalesced,
                    reason: Some(reason),
                })
            }
            TickResult::Skipped { reason } => Err(CoreError::PreconditionFailed(reason)),
            TickResult::Failed { reason } => Err(CoreError::PreconditionFailed(reason)),
        }
    }

    /// Cancel all timers; the store stays untouched.
    pub fn stop(self: &Arc<Self>) {
        let mut timers = self.lock_timers();
        for (_, handle) in timers.drain() {
            handle.cancel();
        }
        let guard = self.lock();
        if let Some(map) = guard.as_ref() {
            for program in map.values() {
                self.scheduler.unregister(&program.schedule_id());
            }
        }
    }

    /// Tick body: recompute the schedule, dispatch the wake, record the
    /// result, and auto-disable fired `at` programs.
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

        let now = self.clock.now_ms();
        let scheduled_fire = reason == "interval" || reason == "retry" || reason == "default";
        let is_at = matches!(program.schedule, CronSchedule::At { .. });

        // Re-arm before dispatch so a slow handler cannot drift the grid.
        if scheduled_fire && !is_at {
            self.record_fired_wall(&program, now);
            if let Err(e) = self.arm(program_id) {
                warn!(program_id, error = %e, "failed to re-arm cron program");
            }
        }

        let started = now;
        let wake_reason = if scheduled_fire {
            program.reason.clone()
        } else {
            reason.to_owned()
        };
        let wake = WakeRequest {
            source: WakeSource::CronProgram,
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
            if scheduled_fire && is_at {
                // One-shot schedules never fire twice.
                stored.enabled = false;
                stored.next_run_at_ms = None;
            }
            let snapshot = stored.clone();
            if let Err(e) = self.persist_locked(&guard) {
                return TickResult::Failed {
                    reason: format!("persist failed: {e}"),
                };
            }
            snapshot
        };
        if scheduled_fire && is_at {
            self.disarm(program_id);
        }

        self.events.emit(
            "cron_program.tick",
            "cron_program",
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

    /// Compute and persist `next_run_at_ms`, register the event-driven
    /// activity, and arm the one-shot fire timer. Past `at` schedules
    /// auto-disable instead.
    fn arm(self: &Arc<Self>, program_id: &str) -> CoreResult<()> {
        let program = self.get(program_id)?;
        if !program.enabled {
            return Ok(());
        }
        let now = self.clock.now_ms();
        let skip_wall = self.lock_fired().get(program_id).copied();
        let next = next_fire_after(&program.schedule, now, program.created_at_ms, skip_wall)?;

        let Some(next) = next else {
            // An `at` time already in the past: disable before arming.
            let mut guard = self.lock();
            if let Some(map) = guard.as_mut() {
                if let Some(stored) = map.get_mut(program_id) {
                    stored.enabled = false;
                    stored.next_run_at_ms = None;
                    stored.updated_at_ms = now;
                }
            }
            self.persist_locked(&guard)?;
            drop(guard);
            self.disarm(program_id);
            debug!(program_id, "one-shot schedule in the past, auto-disabled");
            return Ok(());
        };

        {
            let mut guard = self.lock();
            if let Some(map) = guard.as_mut() {
                if let Some(stored) = map.get_mut(program_id) {
                    stored.next_run_at_ms = Some(next);
                }
            }
            self.persist_locked(&guard)?;
        }

        // Event-driven activity; the one-shot timer below queues the tick.
        let schedule_id = program.schedule_id();
        if !self.scheduler.has(&schedule_id) {
            let weak = Arc::downgrade(self);
            let pid = program.program_id.clone();
            let handler = Arc::new(move |ctx: TickContext| -> TickFuture {
                let weak = weak.clone();
                let pid = pid.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(registry) => registry.tick(&pid, &ctx.reason).await,
                        None => TickResult::Skipped {
                            reason: "registry-stopped".to_owned(),
                        },
                    }
                })
            });
            self.scheduler.register(ActivitySpec {
                activity_id: schedule_id.clone(),
                every_ms: 0,
                coalesce_ms: None,
                handler,
            });
        }

        let scheduler = Arc::downgrade(&self.scheduler);
        let activity_id = schedule_id;
        let handle = self.timers.at(next, move || async move {
            if let Some(s) = scheduler.upgrade() {
                s.request_now(&activity_id, "interval", Some(0));
            }
        });
        let mut timers = self.lock_timers();
        if let Some(old) = timers.insert(program_id.to_owned(), handle) {
            old.cancel();
        }
        Ok(())
    }

    fn disarm(&self, program_id: &str) {
        if let Some(handle) = self.lock_timers().remove(program_id) {
            handle.cancel();
        }
        self.scheduler
            .unregister(&format!("{}:{}", WakeSource::CronProgram.dedupe_prefix(), program_id));
    }

    /// Remember the wall-clock instant that just fired so a DST fall-back
    /// cannot re-fire it.
    fn record_fired_wall(&self, program: &CronProgram, now_ms: i64) {
        use chrono::Timelike;
        if let CronSchedule::Cron { tz, .. } = &program.schedule {
            let zone = resolve_tz(tz);
            if let Some(utc) = Utc.timestamp_millis_opt(now_ms).single() {
                // Truncate to the minute: cron instants are whole minutes
                // but the tick observes them a few ms late.
                let wall = utc.with_timezone(&zone).naive_local();
                let wall = wall
                    .with_second(0)
                    .and_then(|w| w.with_nanosecond(0))
                    .unwrap_or(wall);
                self.lock_fired().insert(program.program_id.clone(), wall);
            }
        }
    }

    fn emit_lifecycle(&self, action: &str, program: &CronProgram, message: &str) {
        self.events.emit(
            "cron_program.lifecycle",
            "cron_program",
            EventScope::none(),
            serde_json::json!({
                "action": action,
                "program_id": program.program_id,
                "program": serde_json::to_value(program).unwrap_or_default(),
                "message": message,
            }),
        );
    }

    fn lock(&self) -> MutexGuard<'_, Option<HashMap<String, CronProgram>>> {
        match self.programs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<String, TimerHandle>> {
        match self.fire_timers.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_fired(&self) -> MutexGuard<'_, HashMap<String, NaiveDateTime>> {
        match self.fired_wall.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_loaded_locked(
        &self,
        guard: &mut MutexGuard<'_, Option<HashMap<String, CronProgram>>>,
    ) -> CoreResult<()> {
        if guard.is_none() {
            let records: Vec<CronProgram> = self.store.read_all()?;
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
        guard: &MutexGuard<'_, Option<HashMap<String, CronProgram>>>,
    ) -> CoreResult<()> {
        let mut programs: Vec<CronProgram> = guard
            .as_ref()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        sort_programs(&mut programs);
        self.store.rewrite(&programs)
    }
}

fn sort_programs(programs: &mut [CronProgram]) {
    programs.sort_by(|a, b| {
        (a.created_at_ms, a.program_id.as_str()).cmp(&(b.created_at_ms, b.program_id.as_str()))
    });
}

impl std::fmt::Debug for CronRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronRegistry")
            .field("path", &self.store.path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_schedule_next_fire() {
        let schedule = CronSchedule::At { at_ms: 5_000 };
        assert_eq!(next_fire_after(&schedule, 1_000, 0, None).expect("ok"), Some(5_000));
        assert_eq!(next_fire_after(&schedule, 5_000, 0, None).expect("ok"), Some(5_000));
        // Past fire time: caller auto-disables.
        assert_eq!(next_fire_after(&schedule, 5_001, 0, None).expect("ok"), None);
    }

    #[test]
    fn every_schedule_stays_on_anchor_grid() {
        let schedule = CronSchedule::Every {
            every_ms: 40,
            anchor_ms: Some(1_000),
        };
        // Before the anchor the first fire is the anchor itself.
        assert_eq!(next_fire_after(&schedule, 999, 0, None).expect("ok"), Some(1_000));
        // Mid-period rounds up to the next grid instant.
        assert_eq!(next_fire_after(&schedule, 1_050, 0, None).expect("ok"), Some(1_080));
        // Exactly on the grid advances a full period (strictly future).
        assert_eq!(next_fire_after(&schedule, 1_040, 0, None).expect("ok"), Some(1_080));
    }

    #[test]
    fn every_schedule_defaults_anchor_to_created_at() {
        let schedule = CronSchedule::Every {
            every_ms: 100,
            anchor_ms: None,
        };
        assert_eq!(next_fire_after(&schedule, 250, 200, None).expect("ok"), Some(300));
    }

    #[test]
    fn every_schedule_rejects_zero_period() {
        let schedule = CronSchedule::Every {
            every_ms: 0,
            anchor_ms: None,
        };
        assert!(next_fire_after(&schedule, 0, 0, None).is_err());
    }

    #[test]
    fn cron_five_field_next_in_utc() {
        let schedule = CronSchedule::Cron {
            expr: "*/5 * * * *".to_owned(),
            tz: "UTC".to_owned(),
        };
        // After the epoch, the next */5 minute boundary is 00:05:00.
        assert_eq!(next_fire_after(&schedule, 0, 0, None).expect("ok"), Some(300_000));
    }

    #[test]
    fn cron_six_field_expressions_are_rejected() {
        assert!(parse_cron_expr("0 0 * * * *").is_err());
        assert!(parse_cron_expr("not a cron").is_err());
    }

    #[test]
    fn cron_evaluates_in_named_zone() {
        // Noon in New York in January is 17:00 UTC (EST, no DST).
        let schedule = CronSchedule::Cron {
            expr: "0 12 * * *".to_owned(),
            tz: "America/New_York".to_owned(),
        };
        let after = Utc
            .with_ymd_and_hms(2024, 1, 10, 0, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        let next = next_fire_after(&schedule, after, 0, None)
            .expect("ok")
            .expect("some");
        let expected = Utc
            .with_ymd_and_hms(2024, 1, 10, 17, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        assert_eq!(next, expected);
    }

    #[test]
    fn cron_unknown_zone_falls_back_to_utc() {
        assert_eq!(resolve_tz("Not/AZone"), chrono_tz::Tz::UTC);
    }

    #[test]
    fn cron_last_of_month() {
        let schedule = CronSchedule::Cron {
            expr: "0 0 L * *".to_owned(),
            tz: "UTC".to_owned(),
        };
        // Mid-January 2021: next last-of-month midnight is Jan 31.
        let after = Utc
            .with_ymd_and_hms(2021, 1, 5, 0, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        let next = next_fire_after(&schedule, after, 0, None)
            .expect("ok")
            .expect("some");
        let expected = Utc
            .with_ymd_and_hms(2021, 1, 31, 0, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        assert_eq!(next, expected);

        // February 2021 ends on the 28th; 29-31 candidates are filtered out.
        let after_feb = Utc
            .with_ymd_and_hms(2021, 2, 1, 0, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        let next_feb = next_fire_after(&schedule, after_feb, 0, None)
            .expect("ok")
            .expect("some");
        let expected_feb = Utc
            .with_ymd_and_hms(2021, 2, 28, 0, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        assert_eq!(next_feb, expected_feb);
    }

    #[test]
    fn fall_back_wall_clock_repeat_is_skipped() {
        // Daily 01:30 in a zone with a fall-back would surface the same
        // wall-clock datetime twice; the skip guard filters the repeat.
        let schedule = CronSchedule::Cron {
            expr: "30 1 * * *".to_owned(),
            tz: "UTC".to_owned(),
        };
        let after = Utc
            .with_ymd_and_hms(2024, 6, 1, 1, 0, 0)
            .single()
            .expect("valid");
        let fired_wall = Utc
            .with_ymd_and_hms(2024, 6, 1, 1, 30, 0)
            .single()
            .expect("valid")
            .naive_utc();
        let next = next_fire_after(&schedule, after.timestamp_millis(), 0, Some(fired_wall))
            .expect("ok")
            .expect("some");
        // 2024-06-01T01:30 is suppressed; the next fire is the day after.
        let expected = Utc
            .with_ymd_and_hms(2024, 6, 2, 1, 30, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        assert_eq!(next, expected);
    }

    #[test]
    fn days_in_month_handles_leap_years() {
        assert_eq!(days_in_month(2021, 2), 28);
        assert_eq!(days_in_month(2020, 2), 29);
        assert_eq!(days_in_month(2021, 12), 31);
    }
}
