//! Wake orchestrator.
//!
//! Every due program wake lands here. The orchestrator coalesces by dedupe
//! key inside a short window, decides between a passive notification and an
//! active autonomous turn, fans the wake out through the outbox, and emits
//! the `operator.wake` / `operator.wake.decision` audit pair. Within one
//! coalesce window at most one active turn is submitted per dedupe key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ServerConfig, WakeTurnMode};
use crate::error::CoreError;
use crate::events::{EventLog, EventScope};
use crate::ids;
use crate::outbox::{FanOutSummary, Outbox, WakeFanOut};
use crate::pipeline::{CommandPipeline, TurnRequest};
use crate::programs::{DispatchOutcome, WakeDispatcher, WakeRequest};

/// How a wake resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeOutcome {
    /// Turn submitted (active) or notify-only wake accepted (passive).
    Triggered,
    /// Collapsed into a recent wake for the same dedupe key.
    Coalesced,
    /// Active mode requested but the command pipeline is unavailable.
    Fallback,
    /// The wake could not proceed (e.g. turn submission error).
    Skipped,
}

impl WakeOutcome {
    /// Snake-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Coalesced => "coalesced",
            Self::Fallback => "fallback",
            Self::Skipped => "skipped",
        }
    }
}

/// Full decision record emitted as `operator.wake.decision`.
#[derive(Debug, Clone, Serialize)]
pub struct WakeDecision {
    /// Wake id, 16 hex.
    pub wake_id: String,
    /// `<source>:<program_id>`.
    pub dedupe_key: String,
    /// Mode in effect at decision time.
    pub mode: WakeTurnMode,
    /// How the wake resolved.
    pub outcome: WakeOutcome,
    /// Decision reason (`turn_invoked`, `control_plane_unavailable`, …).
    pub reason: String,
    /// Idempotency key of the submitted turn, in active mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_request_id: Option<String>,
    /// Result kind of the submitted turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_result_kind: Option<String>,
}

/// The wake orchestrator; registries reach it through [`WakeDispatcher`].
pub struct WakeOrchestrator {
    clock: Arc<dyn Clock>,
    events: Arc<EventLog>,
    config: Arc<RwLock<ServerConfig>>,
    pipeline: Arc<CommandPipeline>,
    outbox: Arc<Outbox>,
    repo_root: PathBuf,
    /// Short-lived coalescing map: dedupe key → last wake time.
    recent: Mutex<HashMap<String, i64>>,
    wakes_total: AtomicU64,
    turns_total: AtomicU64,
}

impl WakeOrchestrator {
    /// Create the orchestrator.
    pub fn new(
        clock: Arc<dyn Clock>,
        events: Arc<EventLog>,
        config: Arc<RwLock<ServerConfig>>,
        pipeline: Arc<CommandPipeline>,
        outbox: Arc<Outbox>,
        repo_root: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            events,
            config,
            pipeline,
            outbox,
            repo_root,
            recent: Mutex::new(HashMap::new()),
            wakes_total: AtomicU64::new(0),
            turns_total: AtomicU64::new(0),
        })
    }

    /// Wakes dispatched (non-coalesced) by this process.
    pub fn wakes_count(&self) -> u64 {
        self.wakes_total.load(Ordering::Relaxed)
    }

    /// Turns submitted by this process.
    pub fn turns_count(&self) -> u64 {
        self.turns_total.load(Ordering::Relaxed)
    }

    fn lock_recent(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        match self.recent.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot_config(&self) -> (WakeTurnMode, i64) {
        let config = match self.config.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        (
            config.operator.wake_turn_mode,
            config.operator.wake_coalesce_window_ms,
        )
    }

    /// Claim the dedupe key for this wake, or report it coalesced.
    fn claim_dedupe_key(&self, dedupe_key: &str, now: i64, window_ms: i64) -> bool {
        let mut recent = self.lock_recent();
        recent.retain(|_, last| now.saturating_sub(*last) < window_ms.saturating_mul(2));
        if let Some(last) = recent.get(dedupe_key) {
            if now.saturating_sub(*last) < window_ms {
                return false;
            }
        }
        recent.insert(dedupe_key.to_owned(), now);
        true
    }
}

#[async_trait]
impl WakeDispatcher for WakeOrchestrator {
    async fn dispatch(&self, wake: WakeRequest) -> DispatchOutcome {
        let now = self.clock.now_ms();
        let wake_id = ids::wake_id();
        let dedupe_key = format!("{}:{}", wake.source.dedupe_prefix(), wake.program_id);
        let (mode, window_ms) = self.snapshot_config();

        if !self.claim_dedupe_key(&dedupe_key, now, window_ms) {
            debug!(dedupe_key = %dedupe_key, "wake coalesced");
            return DispatchOutcome::Coalesced {
                reason: "coalesced".to_owned(),
            };
        }
        self.wakes_total.fetch_add(1, Ordering::Relaxed);

        let feature_enabled = self.pipeline.available();
        let mut decision = WakeDecision {
            wake_id: wake_id.clone(),
            dedupe_key: dedupe_key.clone(),
            mode,
            outcome: WakeOutcome::Triggered,
            reason: "turn_invoked".to_owned(),
            turn_request_id: None,
            turn_result_kind: None,
        };
        let mut status = DispatchOutcome::Ok;

        if mode == WakeTurnMode::Active {
            if feature_enabled {
                let turn_request_id = format!("wake-turn-{wake_id}");
                let command_text = format!(
                    "Autonomous wake turn triggered by heartbeat/cron scheduler.\n  \
                     wake_id={wake_id}\n  wake_source={}\n  program_id={}\n  title={}\n  reason={}",
                    wake.source.as_str(),
                    wake.program_id,
                    wake.title,
                    wake.reason
                );
                let request = TurnRequest {
                    command_text,
                    repo_root: self.repo_root.clone(),
                    request_id: Some(turn_request_id.clone()),
                    correlation: Some(serde_json::json!({
                        "wake_id": wake_id,
                        "dedupe_key": dedupe_key,
                    })),
                    deadline_ms: None,
                };
                decision.turn_request_id = Some(turn_request_id);
                match self.pipeline.submit_terminal_command(request).await {
                    Ok(result) => {
                        self.turns_total.fetch_add(1, Ordering::Relaxed);
                        decision.turn_result_kind = Some(result.kind.as_str().to_owned());
                        info!(wake_id = %wake_id, kind = result.kind.as_str(), "wake turn submitted");
                    }
                    Err(CoreError::PreconditionFailed(_)) => {
                        decision.outcome = WakeOutcome::Fallback;
                        decision.reason = "control_plane_unavailable".to_owned();
                        status = DispatchOutcome::Failed {
                            reason: "control_plane_unavailable".to_owned(),
                        };
                    }
                    Err(e) => {
                        warn!(wake_id = %wake_id, error = %e, "wake turn submission failed");
                        decision.outcome = WakeOutcome::Skipped;
                        decision.reason = format!("turn_submit_failed: {e}");
                        status = DispatchOutcome::Failed {
                            reason: decision.reason.clone(),
                        };
                    }
                }
            } else {
                decision.outcome = WakeOutcome::Fallback;
                decision.reason = "control_plane_unavailable".to_owned();
                status = DispatchOutcome::Failed {
                    reason: "control_plane_unavailable".to_owned(),
                };
            }
        }

        // Notify fan-out for every wake that actually triggered; a fallback
        // or failed turn produces no envelopes.
        let summary = if decision.outcome == WakeOutcome::Triggered {
            let fan_out = WakeFanOut {
                wake_id: wake_id.clone(),
                dedupe_key: dedupe_key.clone(),
                title: wake.title.clone(),
                prompt: wake.prompt.clone(),
                reason: wake.reason.clone(),
                program_metadata: wake.metadata.clone(),
                turn_outcome: decision.outcome.as_str().to_owned(),
                turn_reason: decision.reason.clone(),
            };
            match self.outbox.fan_out_wake(&fan_out) {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(wake_id = %wake_id, error = %e, "wake fan-out failed");
                    FanOutSummary::default()
                }
            }
        } else {
            FanOutSummary::default()
        };

        self.events.emit(
            "operator.wake",
            "wake",
            EventScope::none(),
            serde_json::json!({
                "wake_id": wake_id,
                "program_id": wake.program_id,
                "dedupe_key": dedupe_key,
                "source": wake.source.as_str(),
                "wake_turn_mode": mode.as_str(),
                "wake_turn_feature_enabled": feature_enabled,
                "wake_turn_outcome": decision.outcome.as_str(),
                "wake_turn_reason": decision.reason.clone(),
                "turn_request_id": decision.turn_request_id.clone(),
                "turn_result_kind": decision.turn_result_kind.clone(),
                "delivery": {
                    "queued": summary.queued,
                    "duplicate": summary.duplicate,
                    "skipped": summary.skipped,
                },
                "delivery_summary_v2": serde_json::to_value(&summary).unwrap_or_default(),
                "program": wake.program_snapshot,
            }),
        );
        self.events.emit(
            "operator.wake.decision",
            "wake",
            EventScope::none(),
            serde_json::to_value(&decision).unwrap_or_default(),
        );

        status
    }
}

impl std::fmt::Debug for WakeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeOrchestrator")
            .field("wakes_total", &self.wakes_count())
            .finish_non_exhaustive()
    }
}
