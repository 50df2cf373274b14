//! Per-activity coalescing wake scheduler.
//!
//! Each registered activity owns a pending-wake slot, an optional periodic
//! interval, and at most one armed wake timer. Wake requests coalesce by
//! reason priority until the timer flushes; failed ticks re-queue on a
//! retry cooldown that later requests cannot pre-empt. Ticks for one
//! activity never overlap.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::clock::{Clock, TimerHandle, Timers};
use crate::config::SchedulerConfig;

/// Boxed future returned by tick handlers.
pub type TickFuture = Pin<Box<dyn Future<Output = TickResult> + Send>>;

/// Handler invoked when an activity's wake timer flushes.
pub type TickHandler = Arc<dyn Fn(TickContext) -> TickFuture + Send + Sync>;

/// Context passed to a tick handler.
#[derive(Debug, Clone)]
pub struct TickContext {
    /// Activity being ticked.
    pub activity_id: String,
    /// Highest-priority reason coalesced into this tick.
    pub reason: String,
}

/// Outcome of one tick handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickResult {
    /// The handler did its work.
    Ran {
        /// Wall-clock duration of the handler.
        duration_ms: i64,
    },
    /// The handler declined to run.
    Skipped {
        /// Why it declined (e.g. `coalesced`, `disabled`, `requests-in-flight`).
        reason: String,
    },
    /// The handler failed; a retry wake is queued.
    Failed {
        /// Failure description.
        reason: String,
    },
}

/// Wake timer flavor. Retry timers are authoritative: later requests never
/// re-arm them earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeKind {
    Normal,
    Retry,
}

/// Skip reason that, like a failure, earns a retry wake.
const SKIP_REQUESTS_IN_FLIGHT: &str = "requests-in-flight";

/// Map a wake reason to its coalescing priority. Higher wins.
///
/// `manual`, `exec-event`, and any `hook:`-prefixed reason are operator
/// actions (3); unrecognized reasons are defaults (2); `interval` ticks are
/// background (1); `retry` is lowest (0) so real requests overtake it.
pub fn reason_priority(reason: &str) -> u8 {
    if reason == "manual" || reason == "exec-event" || reason.starts_with("hook:") {
        3
    } else if reason == "retry" {
        0
    } else if reason == "interval" {
        1
    } else {
        2
    }
}

/// Registration parameters for one activity.
pub struct ActivitySpec {
    /// Stable activity identifier (e.g. `heartbeat-program:hb-…`).
    pub activity_id: String,
    /// Periodic tick interval; 0 disables periodic ticks (event-driven only).
    pub every_ms: i64,
    /// Per-activity coalesce override; falls back to the scheduler default.
    pub coalesce_ms: Option<i64>,
    /// Handler invoked on flush.
    pub handler: TickHandler,
}

#[derive(Debug, Clone)]
struct PendingWake {
    reason: String,
    priority: u8,
    requested_at_ms: i64,
}

struct WakeTimer {
    due_at_ms: i64,
    kind: WakeKind,
    token: u64,
    handle: TimerHandle,
}

struct ActivityState {
    every_ms: i64,
    coalesce_ms: i64,
    handler: TickHandler,
    pending: Option<PendingWake>,
    scheduled: bool,
    running: bool,
    interval_timer: Option<TimerHandle>,
    wake_timer: Option<WakeTimer>,
    disposed: bool,
}

impl ActivityState {
    fn cancel_timers(&mut self) {
        if let Some(t) = self.interval_timer.take() {
            t.cancel();
        }
        if let Some(t) = self.wake_timer.take() {
            t.handle.cancel();
        }
    }
}

/// Introspection snapshot of one activity (`list`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActivitySnapshot {
    /// Activity identifier.
    pub activity_id: String,
    /// Effective periodic interval (after the minimum clamp), 0 if none.
    pub every_ms: i64,
    /// Reason of the coalesced pending wake, if any.
    pub pending_reason: Option<String>,
    /// Whether a handler is currently executing.
    pub running: bool,
    /// Whether a tick arrived while running and a follow-up is owed.
    pub scheduled: bool,
    /// Due time of the armed wake timer, if any.
    pub wake_due_at_ms: Option<i64>,
}

/// The per-activity coalescing wake scheduler.
pub struct ActivityScheduler {
    clock: Arc<dyn Clock>,
    timers: Timers,
    settings: SchedulerConfig,
    activities: Mutex<HashMap<String, ActivityState>>,
    timer_tokens: AtomicU64,
}

impl ActivityScheduler {
    /// Create a scheduler over the given clock and settings.
    pub fn new(clock: Arc<dyn Clock>, settings: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            timers: Timers::new(Arc::clone(&clock)),
            clock,
            settings,
            activities: Mutex::new(HashMap::new()),
            timer_tokens: AtomicU64::new(1),
        })
    }

    /// Install (or replace) an activity. An `every_ms > 0` arms a periodic
    /// interval timer, clamped to the configured minimum interval.
    pub fn register(self: &Arc<Self>, spec: ActivitySpec) {
        let every_ms = if spec.every_ms > 0 {
            spec.every_ms.max(self.settings.min_interval_ms)
        } else {
            0
        };

        let mut map = self.lock();
        if let Some(mut old) = map.remove(&spec.activity_id) {
            old.cancel_timers();
            old.disposed = true;
        }

        let interval_timer = if every_ms > 0 {
            let scheduler = Arc::downgrade(self);
            let activity_id = spec.activity_id.clone();
            Some(self.timers.interval(every_ms, move || {
                let scheduler = scheduler.clone();
                let activity_id = activity_id.clone();
                async move {
                    if let Some(s) = scheduler.upgrade() {
                        s.request_now(&activity_id, "interval", Some(0));
                    }
                }
            }))
        } else {
            None
        };

        map.insert(
            spec.activity_id.clone(),
            ActivityState {
                every_ms,
                coalesce_ms: spec.coalesce_ms.unwrap_or(self.settings.coalesce_ms).max(0),
                handler: spec.handler,
                pending: None,
                scheduled: false,
                running: false,
                interval_timer,
                wake_timer: None,
                disposed: false,
            },
        );
        debug!(activity_id = %spec.activity_id, every_ms, "activity registered");
    }

    /// Queue a wake for an activity. Returns false when the activity is not
    /// registered.
    ///
    /// The request coalesces into any pending wake by reason priority (ties
    /// go to the later request) and arms or tightens the wake timer, except
    /// that an armed retry timer is never pre-empted.
    pub fn request_now(
        self: &Arc<Self>,
        activity_id: &str,
        reason: &str,
        coalesce_ms: Option<i64>,
    ) -> bool {
        let now = self.clock.now_ms();
        let mut map = self.lock();
        let Some(state) = map.get_mut(activity_id) else {
            return false;
        };

        let priority = reason_priority(reason);
        let replace = match &state.pending {
            Some(p) => priority >= p.priority,
            None => true,
        };
        if replace {
            state.pending = Some(PendingWake {
                reason: reason.to_owned(),
                priority,
                requested_at_ms: now,
            });
        }

        let due = now.saturating_add(coalesce_ms.unwrap_or(state.coalesce_ms).max(0));
        let rearm = match &state.wake_timer {
            None => true,
            // Cooldown is authoritative; the pending slot keeps the
            // higher-priority reason for when it fires.
            Some(t) if t.kind == WakeKind::Retry => false,
            // Absorbed into the earlier timer.
            Some(t) if t.due_at_ms <= due => false,
            Some(_) => true,
        };
        if rearm {
            if let Some(old) = state.wake_timer.take() {
                old.handle.cancel();
            }
            self.arm_locked(activity_id, state, due, WakeKind::Normal);
        }
        true
    }

    /// Whether an activity is registered.
    pub fn has(&self, activity_id: &str) -> bool {
        self.lock().contains_key(activity_id)
    }

    /// Snapshot all registered activities.
    pub fn list(&self) -> Vec<ActivitySnapshot> {
        let map = self.lock();
        let mut out: Vec<ActivitySnapshot> = map
            .iter()
            .map(|(id, st)| ActivitySnapshot {
                activity_id: id.clone(),
                every_ms: st.every_ms,
                pending_reason: st.pending.as_ref().map(|p| p.reason.clone()),
                running: st.running,
                scheduled: st.scheduled,
                wake_due_at_ms: st.wake_timer.as_ref().map(|t| t.due_at_ms),
            })
            .collect();
        out.sort_by(|a, b| a.activity_id.cmp(&b.activity_id));
        out
    }

    /// Remove an activity and cancel its timers. Idempotent.
    pub fn unregister(&self, activity_id: &str) {
        let mut map = self.lock();
        if let Some(mut state) = map.remove(activity_id) {
            state.cancel_timers();
            state.disposed = true;
            debug!(activity_id, "activity unregistered");
        }
    }

    /// Cancel every timer and drop all activities.
    pub fn stop(&self) {
        let mut map = self.lock();
        for (_, state) in map.iter_mut() {
            state.cancel_timers();
            state.disposed = true;
        }
        map.clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActivityState>> {
        match self.activities.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Arm a wake timer for `activity_id` at `due_at_ms`. Caller holds the
    /// activities lock and has already cleared any previous timer.
    fn arm_locked(
        self: &Arc<Self>,
        activity_id: &str,
        state: &mut ActivityState,
        due_at_ms: i64,
        kind: WakeKind,
    ) {
        let token = self.timer_tokens.fetch_add(1, Ordering::Relaxed);
        let scheduler = Arc::downgrade(self);
        let id = activity_id.to_owned();
        let handle = self.timers.at(due_at_ms, move || async move {
            if let Some(s) = scheduler.upgrade() {
                s.on_wake_timer(&id, token).await;
            }
        });
        state.wake_timer = Some(WakeTimer {
            due_at_ms,
            kind,
            token,
            handle,
        });
    }

    /// Flush step: runs when an armed wake timer fires.
    async fn on_wake_timer(self: &Arc<Self>, activity_id: &str, token: u64) {
        let (handler, reason) = {
            let mut map = self.lock();
            let Some(state) = map.get_mut(activity_id) else {
                return;
            };
            match &state.wake_timer {
                Some(t) if t.token == token => {}
                _ => return, // stale fire from a cancelled timer
            }
            let kind = state.wake_timer.take().map(|t| t.kind);

            if state.running {
                // A tick is in flight; owe a follow-up and re-arm same kind.
                // The floor keeps a zero-coalesce activity from re-firing in
                // a tight loop for the whole handler duration.
                state.scheduled = true;
                let kind = kind.unwrap_or(WakeKind::Normal);
                let delay = match kind {
                    WakeKind::Normal => state.coalesce_ms.max(25),
                    WakeKind::Retry => self.retry_cooldown(),
                };
                let due = self.clock.now_ms().saturating_add(delay);
                self.arm_locked(activity_id, state, due, kind);
                return;
            }

            let pending = state.pending.take();
            state.running = true;
            state.scheduled = false;
            let reason = pending.map(|p| p.reason).unwrap_or_else(|| "default".to_owned());
            (Arc::clone(&state.handler), reason)
        };

        let ctx = TickContext {
            activity_id: activity_id.to_owned(),
            reason,
        };
        let fut = handler(ctx);
        // Run the handler in its own task so a panic cannot take the
        // scheduler down with it.
        let result = match tokio::spawn(fut).await {
            Ok(result) => result,
            Err(e) => TickResult::Failed {
                reason: format!("handler panicked: {e}"),
            },
        };

        let mut map = self.lock();
        let Some(state) = map.get_mut(activity_id) else {
            return;
        };
        state.running = false;

        let needs_retry = match &result {
            TickResult::Failed { reason } => {
                warn!(activity_id, reason = %reason, "tick failed, queueing retry");
                true
            }
            TickResult::Skipped { reason } => reason == SKIP_REQUESTS_IN_FLIGHT,
            TickResult::Ran { .. } => false,
        };

        if needs_retry {
            if state.pending.is_none() {
                state.pending = Some(PendingWake {
                    reason: "retry".to_owned(),
                    priority: reason_priority("retry"),
                    requested_at_ms: self.clock.now_ms(),
                });
            }
            if let Some(t) = state.wake_timer.take() {
                t.handle.cancel();
            }
            let due = self.clock.now_ms().saturating_add(self.retry_cooldown());
            self.arm_locked(activity_id, state, due, WakeKind::Retry);
        } else if (state.pending.is_some() || state.scheduled) && state.wake_timer.is_none() {
            state.scheduled = false;
            let due = self.clock.now_ms().saturating_add(state.coalesce_ms);
            self.arm_locked(activity_id, state, due, WakeKind::Normal);
        } else {
            state.scheduled = false;
        }
    }

    fn retry_cooldown(&self) -> i64 {
        self.settings
            .retry_cooldown_ms
            .max(self.settings.min_retry_cooldown_ms)
    }
}

impl std::fmt::Debug for ActivityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityScheduler")
            .field("activities", &self.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_priorities_order() {
        assert_eq!(reason_priority("manual"), 3);
        assert_eq!(reason_priority("exec-event"), 3);
        assert_eq!(reason_priority("hook:post-commit"), 3);
        assert_eq!(reason_priority("heartbeat-wake"), 2);
        assert_eq!(reason_priority("interval"), 1);
        assert_eq!(reason_priority("retry"), 0);
    }
}
