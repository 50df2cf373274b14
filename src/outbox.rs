//! Outbox and delivery worker.
//!
//! Every outbound message is an envelope moving `pending → delivering →
//! {delivered | pending (retry) | dead}`. Enqueue dedups per binding by
//! `dedupe_key`; the worker retries transient failures with exponential
//! backoff and jitter, and dead-letters on permanent failure, exhausted
//! attempts, or the per-envelope wall-clock ceiling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channels::ChannelDriver;
use crate::clock::Clock;
use crate::config::OutboxConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventLog, EventScope};
use crate::identity::IdentityRegistry;
use crate::ids;
use crate::store::JsonlStore;

/// Upper bound on records returned by `list`.
const MAX_LIST_LIMIT: usize = 500;

/// Envelope delivery state. `failed` is transient inside the worker; it is
/// never persisted: a failed attempt lands back in `pending` or in `dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxState {
    /// Waiting for its next attempt.
    Pending,
    /// An attempt is in flight.
    Delivering,
    /// Terminal success.
    Delivered,
    /// Transient failure between attempts.
    Failed,
    /// Terminal failure.
    Dead,
}

impl OutboxState {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

/// One outbound message record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    /// Stable id, `ob-<12 hex>`.
    pub outbox_id: String,
    /// Destination channel.
    pub channel: String,
    /// Channel tenant.
    pub channel_tenant_id: String,
    /// Conversation inside the tenant.
    pub channel_conversation_id: String,
    /// Binding this envelope is addressed to.
    pub binding_id: String,
    /// Message kind (`wake`, `reply`, `ack`, …).
    pub kind: String,
    /// Channel-agnostic message body.
    pub body: serde_json::Value,
    /// Per-binding dedup key.
    pub dedupe_key: String,
    /// Delivery state.
    pub state: OutboxState,
    /// Attempts started so far.
    pub attempt_count: u32,
    /// Attempts allowed before dead-lettering.
    pub max_attempts: u32,
    /// Earliest time of the next attempt.
    pub next_attempt_at_ms: i64,
    /// Creation time.
    pub created_at_ms: i64,
    /// Last transition time.
    pub updated_at_ms: i64,
    /// Most recent failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Correlation metadata (e.g. `wake_id` for the wake delivery observer).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Fields the caller provides when enqueueing.
#[derive(Debug, Clone)]
pub struct EnvelopeDraft {
    /// Destination channel.
    pub channel: String,
    /// Channel tenant.
    pub channel_tenant_id: String,
    /// Conversation inside the tenant.
    pub channel_conversation_id: String,
    /// Binding this envelope is addressed to.
    pub binding_id: String,
    /// Message kind.
    pub kind: String,
    /// Message body.
    pub body: serde_json::Value,
    /// Per-binding dedup key.
    pub dedupe_key: String,
    /// Correlation metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Enqueue verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new envelope was queued.
    Queued {
        /// Id of the new envelope.
        outbox_id: String,
    },
    /// An envelope with the same dedup key already exists; the caller is
    /// attached to it for observer correlation.
    Duplicate {
        /// Id of the existing envelope.
        outbox_id: String,
    },
}

/// List filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListOutbox {
    /// Only envelopes in this state.
    #[serde(default)]
    pub state: Option<OutboxState>,
    /// Only envelopes for this channel.
    #[serde(default)]
    pub channel: Option<String>,
    /// Maximum records, capped at 500.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One wake to fan out across active bindings.
#[derive(Debug, Clone)]
pub struct WakeFanOut {
    /// Wake id, 16 hex.
    pub wake_id: String,
    /// Wake dedupe key (`<source>:<program_id>`).
    pub dedupe_key: String,
    /// Program title.
    pub title: String,
    /// Program prompt.
    pub prompt: Option<String>,
    /// Wake reason.
    pub reason: String,
    /// Program metadata forwarded to adapters.
    pub program_metadata: serde_json::Map<String, serde_json::Value>,
    /// Turn outcome recorded by the orchestrator.
    pub turn_outcome: String,
    /// Turn reason recorded by the orchestrator.
    pub turn_reason: String,
}

/// Per-wake fan-out counts for wake telemetry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanOutSummary {
    /// Envelopes newly queued.
    pub queued: u32,
    /// Envelopes deduplicated against existing ones.
    pub duplicate: u32,
    /// Bindings skipped (channel unconfigured or inactive).
    pub skipped: u32,
    /// Active bindings considered.
    pub total: u32,
}

/// Persistent per-binding delivery queue.
pub struct Outbox {
    store: JsonlStore,
    clock: Arc<dyn Clock>,
    events: Arc<EventLog>,
    identities: Arc<IdentityRegistry>,
    settings: OutboxConfig,
    envelopes: Mutex<Option<Vec<OutboxEnvelope>>>,
    drivers: RwLock<HashMap<String, Arc<dyn ChannelDriver>>>,
    delivered_total: AtomicU64,
    dead_total: AtomicU64,
}

impl Outbox {
    /// Create an outbox persisting to `path`.
    pub fn new(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        events: Arc<EventLog>,
        identities: Arc<IdentityRegistry>,
        settings: OutboxConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: JsonlStore::new(path),
            clock,
            events,
            identities,
            settings,
            envelopes: Mutex::new(None),
            drivers: RwLock::new(HashMap::new()),
            delivered_total: AtomicU64::new(0),
            dead_total: AtomicU64::new(0),
        })
    }

    /// Register (or replace) the driver for a channel.
    pub fn register_driver(&self, driver: Arc<dyn ChannelDriver>) {
        let mut drivers = match self.drivers.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        drivers.insert(driver.channel().to_owned(), driver);
    }

    /// Drop every registered driver (generation reload).
    pub fn clear_drivers(&self) {
        let mut drivers = match self.drivers.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        drivers.clear();
    }

    /// Channels with a registered driver.
    pub fn driver_channels(&self) -> Vec<String> {
        let drivers = match self.drivers.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut channels: Vec<String> = drivers.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Envelopes delivered by this process.
    pub fn delivered_count(&self) -> u64 {
        self.delivered_total.load(Ordering::Relaxed)
    }

    /// Envelopes dead-lettered by this process.
    pub fn dead_count(&self) -> u64 {
        self.dead_total.load(Ordering::Relaxed)
    }

    /// Enqueue an envelope, dedup by `dedupe_key`.
    ///
    /// An existing envelope in `pending`, `delivering`, or `delivered`
    /// blocks a re-enqueue; only `dead` envelopes allow one.
    pub fn enqueue(&self, draft: EnvelopeDraft) -> CoreResult<EnqueueOutcome> {
        let now = self.clock.now_ms();
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        let envelopes = guard
            .as_mut()
            .ok_or_else(|| CoreError::Internal("outbox not loaded".to_owned()))?;

        if let Some(existing) = envelopes
            .iter()
            .find(|e| e.dedupe_key == draft.dedupe_key && e.state != OutboxState::Dead)
        {
            return Ok(EnqueueOutcome::Duplicate {
                outbox_id: existing.outbox_id.clone(),
            });
        }

        let envelope = OutboxEnvelope {
            outbox_id: ids::outbox_id(),
            channel: draft.channel,
            channel_tenant_id: draft.channel_tenant_id,
            channel_conversation_id: draft.channel_conversation_id,
            binding_id: draft.binding_id,
            kind: draft.kind,
            body: draft.body,
            dedupe_key: draft.dedupe_key,
            state: OutboxState::Pending,
            attempt_count: 0,
            max_attempts: self.settings.max_attempts,
            next_attempt_at_ms: now,
            created_at_ms: now,
            updated_at_ms: now,
            last_error: None,
            metadata: draft.metadata,
        };
        let outbox_id = envelope.outbox_id.clone();
        envelopes.push(envelope);
        self.persist_locked(&guard)?;
        debug!(outbox_id = %outbox_id, "envelope queued");
        Ok(EnqueueOutcome::Queued { outbox_id })
    }

    /// List envelopes, newest first.
    pub fn list(&self, filter: &ListOutbox) -> CoreResult<Vec<OutboxEnvelope>> {
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        let mut envelopes: Vec<OutboxEnvelope> =
            guard.as_ref().cloned().unwrap_or_default();
        if let Some(state) = filter.state {
            envelopes.retain(|e| e.state == state);
        }
        if let Some(channel) = &filter.channel {
            envelopes.retain(|e| &e.channel == channel);
        }
        envelopes.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        envelopes.truncate(filter.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT));
        Ok(envelopes)
    }

    /// Pending envelopes due at `now`, ordered by
    /// `(next_attempt_at_ms, created_at_ms)`.
    pub fn retry_due(&self, now: i64) -> CoreResult<Vec<OutboxEnvelope>> {
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        let mut due: Vec<OutboxEnvelope> = guard
            .as_ref()
            .map(|list| {
                list.iter()
                    .filter(|e| e.state == OutboxState::Pending && e.next_attempt_at_ms <= now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        due.sort_by(|a, b| {
            (a.next_attempt_at_ms, a.created_at_ms).cmp(&(b.next_attempt_at_ms, b.created_at_ms))
        });
        Ok(due)
    }

    /// Transition an envelope to `delivering`, counting the attempt.
    pub fn mark_delivering(&self, outbox_id: &str) -> CoreResult<OutboxEnvelope> {
        let envelope = self.mutate(outbox_id, |e, now| {
            e.state = OutboxState::Delivering;
            e.attempt_count = e.attempt_count.saturating_add(1);
            e.updated_at_ms = now;
        })?;
        self.emit_state(&envelope, "delivering", None);
        Ok(envelope)
    }

    /// Terminal success.
    pub fn mark_delivered(
        &self,
        outbox_id: &str,
        delivery_id: Option<&str>,
    ) -> CoreResult<OutboxEnvelope> {
        let envelope = self.mutate(outbox_id, |e, now| {
            e.state = OutboxState::Delivered;
            e.last_error = None;
            if let Some(id) = delivery_id {
                e.metadata
                    .insert("delivery_id".to_owned(), serde_json::Value::from(id));
            }
            e.updated_at_ms = now;
        })?;
        self.delivered_total.fetch_add(1, Ordering::Relaxed);
        self.emit_state(&envelope, "delivered", None);
        info!(outbox_id, channel = %envelope.channel, "envelope delivered");
        Ok(envelope)
    }

    /// Record a failed attempt. Transient failures below the attempt cap go
    /// back to `pending` with backoff; everything else dead-letters.
    pub fn mark_failed(
        &self,
        outbox_id: &str,
        reason: &str,
        transient: bool,
    ) -> CoreResult<OutboxEnvelope> {
        let backoff = self.backoff_ms();
        let envelope = self.mutate(outbox_id, |e, now| {
            e.last_error = Some(reason.to_owned());
            e.updated_at_ms = now;
            if transient && e.attempt_count < e.max_attempts {
                e.state = OutboxState::Pending;
                e.next_attempt_at_ms = now.saturating_add(backoff(e.attempt_count));
            } else {
                e.state = OutboxState::Dead;
            }
        })?;
        match envelope.state {
            OutboxState::Dead => {
                self.dead_total.fetch_add(1, Ordering::Relaxed);
                self.emit_state(&envelope, "dead_letter", Some(reason));
                warn!(outbox_id, reason, "envelope dead-lettered");
            }
            _ => {
                self.emit_state(&envelope, "retried", Some(reason));
                debug!(outbox_id, reason, "envelope queued for retry");
            }
        }
        Ok(envelope)
    }

    /// Fan a wake out to every active binding, one envelope per binding.
    ///
    /// Bindings on channels with no registered driver are skipped with a
    /// reason code; skipped envelopes never enter `pending`.
    pub fn fan_out_wake(&self, wake: &WakeFanOut) -> CoreResult<FanOutSummary> {
        let bindings = self.identities.list_active(None)?;
        let mut summary = FanOutSummary::default();

        for binding in bindings {
            summary.total = summary.total.saturating_add(1);
            let has_driver = {
                let drivers = match self.drivers.read() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                drivers.contains_key(&binding.channel)
            };
            let outbox_dedupe_key = format!(
                "{}:wake:{}:{}:{}",
                wake.dedupe_key, wake.wake_id, binding.channel, binding.binding_id
            );

            if !has_driver {
                summary.skipped = summary.skipped.saturating_add(1);
                self.emit_wake_delivery(
                    "skipped",
                    Some("channel_unconfigured"),
                    wake,
                    &binding.binding_id,
                    &binding.channel,
                    None,
                    &outbox_dedupe_key,
                    0,
                );
                continue;
            }

            let mut metadata = serde_json::Map::new();
            metadata.insert("wake_id".to_owned(), wake.wake_id.clone().into());
            metadata.insert("wake_dedupe_key".to_owned(), wake.dedupe_key.clone().into());
            let draft = EnvelopeDraft {
                channel: binding.channel.clone(),
                channel_tenant_id: binding.channel_tenant_id.clone(),
                channel_conversation_id: binding.channel_actor_id.clone(),
                binding_id: binding.binding_id.clone(),
                kind: "wake".to_owned(),
                body: serde_json::json!({
                    "title": wake.title,
                    "prompt": wake.prompt,
                    "reason": wake.reason,
                    "wake_delivery_reason": "heartbeat_cron_wake",
                    "wake_turn_outcome": wake.turn_outcome,
                    "wake_turn_reason": wake.turn_reason,
                    "program_metadata": wake.program_metadata,
                }),
                dedupe_key: outbox_dedupe_key.clone(),
                metadata,
            };

            match self.enqueue(draft)? {
                EnqueueOutcome::Queued { outbox_id } => {
                    summary.queued = summary.queued.saturating_add(1);
                    self.emit_wake_delivery(
                        "queued",
                        None,
                        wake,
                        &binding.binding_id,
                        &binding.channel,
                        Some(outbox_id.as_str()),
                        &outbox_dedupe_key,
                        0,
                    );
                }
                EnqueueOutcome::Duplicate { outbox_id } => {
                    summary.duplicate = summary.duplicate.saturating_add(1);
                    self.emit_wake_delivery(
                        "duplicate",
                        None,
                        wake,
                        &binding.binding_id,
                        &binding.channel,
                        Some(outbox_id.as_str()),
                        &outbox_dedupe_key,
                        0,
                    );
                }
            }
        }
        Ok(summary)
    }

    /// Spawn the delivery worker loop. Exits on the shutdown signal.
    pub fn spawn_worker(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            info!("outbox delivery worker started");
            loop {
                tokio::select! {
                    () = outbox.clock.sleep_ms(outbox.settings.poll_interval_ms) => {
                        outbox.process_due().await;
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            info!("outbox delivery worker stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Deliver every due envelope once. Split out from the worker loop so
    /// tests can drive delivery deterministically.
    pub async fn process_due(&self) {
        let now = self.clock.now_ms();
        let due = match self.retry_due(now) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "failed to read due envelopes");
                return;
            }
        };

        for envelope in due {
            // Wall-clock ceiling before another attempt starts.
            if now.saturating_sub(envelope.created_at_ms) >= self.settings.envelope_ttl_ms {
                let _ = self.mark_failed(&envelope.outbox_id, "ttl_exceeded", false);
                continue;
            }
            let claimed = match self.mark_delivering(&envelope.outbox_id) {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(outbox_id = %envelope.outbox_id, error = %e, "failed to claim envelope");
                    continue;
                }
            };
            self.attempt(claimed).await;
        }
    }

    async fn attempt(&self, envelope: OutboxEnvelope) {
        let driver = {
            let drivers = match self.drivers.read() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            drivers.get(&envelope.channel).cloned()
        };
        let Some(driver) = driver else {
            let _ = self.mark_failed(&envelope.outbox_id, "channel_unconfigured", false);
            return;
        };

        let timeout = u64::try_from(self.settings.attempt_timeout_ms.max(0)).unwrap_or(0);
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(timeout),
            driver.deliver(&envelope),
        )
        .await;

        match outcome {
            Ok(Ok(receipt)) => {
                let _ = self.mark_delivered(&envelope.outbox_id, receipt.delivery_id.as_deref());
            }
            Ok(Err(failure)) => {
                let _ = self.mark_failed(&envelope.outbox_id, &failure.reason, failure.transient);
            }
            Err(_) => {
                let _ = self.mark_failed(&envelope.outbox_id, "delivery attempt timed out", true);
            }
        }
    }

    /// Exponential backoff with ±20 % jitter, in integer math:
    /// `min(max_backoff, base · 2^(n-1)) · uniform(0.8, 1.2)`.
    fn backoff_ms(&self) -> impl Fn(u32) -> i64 {
        let base = self.settings.base_backoff_ms.max(1);
        let cap = self.settings.max_backoff_ms.max(base);
        move |attempt: u32| {
            let exponent = attempt.saturating_sub(1).min(30);
            let raw = base
                .checked_shl(exponent)
                .unwrap_or(cap)
                .min(cap);
            let factor = rand::thread_rng().gen_range(800..=1_200_i64);
            raw.saturating_mul(factor).wrapping_div(1_000)
        }
    }

    fn mutate(
        &self,
        outbox_id: &str,
        apply: impl FnOnce(&mut OutboxEnvelope, i64),
    ) -> CoreResult<OutboxEnvelope> {
        let now = self.clock.now_ms();
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        let envelopes = guard
            .as_mut()
            .ok_or_else(|| CoreError::Internal("outbox not loaded".to_owned()))?;
        let envelope = envelopes
            .iter_mut()
            .find(|e| e.outbox_id == outbox_id)
            .ok_or_else(|| CoreError::NotFound(format!("envelope {outbox_id}")))?;
        apply(envelope, now);
        let snapshot = envelope.clone();
        self.persist_locked(&guard)?;
        Ok(snapshot)
    }

    /// Emit the channel-generic `outbox.state` event plus the wake delivery
    /// observer event when the envelope carries wake correlation.
    fn emit_state(&self, envelope: &OutboxEnvelope, state: &str, reason_code: Option<&str>) {
        self.events.emit(
            "outbox.state",
            "outbox",
            EventScope::none(),
            serde_json::json!({
                "state": state,
                "outbox_id": envelope.outbox_id,
                "channel": envelope.channel,
                "dedupe_key": envelope.dedupe_key,
                "attempt_count": envelope.attempt_count,
                "reason_code": reason_code,
            }),
        );

        let wake_id = envelope.metadata.get("wake_id").and_then(|v| v.as_str());
        if let Some(wake_id) = wake_id {
            let wake_dedupe = envelope
                .metadata
                .get("wake_dedupe_key")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            self.events.emit(
                "operator.wake.delivery",
                "outbox",
                EventScope::none(),
                serde_json::json!({
                    "state": state,
                    "reason_code": reason_code,
                    "wake_id": wake_id,
                    "dedupe_key": wake_dedupe,
                    "binding_id": envelope.binding_id,
                    "channel": envelope.channel,
                    "outbox_id": envelope.outbox_id,
                    "outbox_dedupe_key": envelope.dedupe_key,
                    "attempt_count": envelope.attempt_count,
                }),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_wake_delivery(
        &self,
        state: &str,
        reason_code: Option<&str>,
        wake: &WakeFanOut,
        binding_id: &str,
        channel: &str,
        outbox_id: Option<&str>,
        outbox_dedupe_key: &str,
        attempt_count: u32,
    ) {
        self.events.emit(
            "operator.wake.delivery",
            "outbox",
            EventScope::none(),
            serde_json::json!({
                "state": state,
                "reason_code": reason_code,
                "wake_id": wake.wake_id,
                "dedupe_key": wake.dedupe_key,
                "binding_id": binding_id,
                "channel": channel,
                "outbox_id": outbox_id,
                "outbox_dedupe_key": outbox_dedupe_key,
                "attempt_count": attempt_count,
            }),
        );
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<OutboxEnvelope>>> {
        match self.envelopes.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_loaded_locked(
        &self,
        guard: &mut MutexGuard<'_, Option<Vec<OutboxEnvelope>>>,
    ) -> CoreResult<()> {
        if guard.is_none() {
            **guard = Some(self.store.read_all()?);
        }
        Ok(())
    }

    fn persist_locked(
        &self,
        guard: &MutexGuard<'_, Option<Vec<OutboxEnvelope>>>,
    ) -> CoreResult<()> {
        let envelopes = guard.as_ref().cloned().unwrap_or_default();
        self.store.rewrite(&envelopes)
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("path", &self.store.path())
            .finish_non_exhaustive()
    }
}
