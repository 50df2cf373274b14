//! HTTP surface of the control plane.
//!
//! A local JSON API over axum: health, status, config, channel
//! capabilities, webhook ingress, run lifecycle, heartbeat and cron
//! program CRUD, identity bindings, event retrieval, and adapter
//! generation reload/rollback. A discovery record
//! (`.mu/control-plane/server.json`) is written once the listener binds.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::channels::{channel_capabilities, IngressEnvelope, WebhookDriver, KNOWN_CHANNELS};
use crate::clock::{Clock, SystemClock};
use crate::config::{self, RuntimePaths, ServerConfig};
use crate::dag::{DagRunner, RunExecutor};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventFilter, EventLog};
use crate::identity::{BindRequest, IdentityRegistry};
use crate::issues::{ForumLog, IssueStore, NewIssue};
use crate::outbox::Outbox;
use crate::pipeline::{CommandBackend, CommandPipeline, TurnRequest};
use crate::programs::cron::{CreateCron, CronRegistry, ListCron, UpdateCron};
use crate::programs::heartbeat::{
    CreateHeartbeat, HeartbeatRegistry, ListHeartbeats, UpdateHeartbeat,
};
use crate::runs::{RunRegistry, RunSource, StartRun};
use crate::scheduler::ActivityScheduler;
use crate::store::JsonlStore;
use crate::wake::WakeOrchestrator;

/// One adapter generation: the set of channels with live drivers.
#[derive(Debug, Clone, Serialize)]
pub struct Generation {
    /// Monotone generation id.
    pub id: u64,
    /// Channels with registered drivers.
    pub adapters: Vec<String>,
    /// Activation time.
    pub activated_at_ms: i64,
}

/// Reload/rollback bookkeeping exposed in `/api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationState {
    /// Generation currently serving.
    pub active: Generation,
    /// Previous generation, available for rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Generation>,
    /// Snapshot of the last reload/rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<serde_json::Value>,
}

/// Everything the handlers need, shared as router state.
pub struct AppContext {
    /// Resolved `.mu/` paths.
    pub paths: RuntimePaths,
    /// Live server config.
    pub config: Arc<RwLock<ServerConfig>>,
    /// Shared clock.
    pub clock: Arc<dyn Clock>,
    /// Telemetry sink.
    pub events: Arc<EventLog>,
    /// Activity scheduler.
    pub scheduler: Arc<ActivityScheduler>,
    /// Command pipeline.
    pub pipeline: Arc<CommandPipeline>,
    /// Identity bindings.
    pub identities: Arc<IdentityRegistry>,
    /// Outbox.
    pub outbox: Arc<Outbox>,
    /// Wake orchestrator.
    pub wake: Arc<WakeOrchestrator>,
    /// Heartbeat programs.
    pub heartbeats: Arc<HeartbeatRegistry>,
    /// Cron programs.
    pub cron: Arc<CronRegistry>,
    /// Issue graph.
    pub issues: Arc<IssueStore>,
    /// Forum log.
    pub forum: Arc<ForumLog>,
    /// Run registry.
    pub runs: Arc<RunRegistry>,
    /// Adapter ingress audit log.
    pub adapter_audit: JsonlStore,
    /// Generation bookkeeping.
    pub generation: Mutex<GenerationState>,
    /// Process start time.
    pub started_at_ms: i64,
    /// Shutdown signal for background workers.
    pub shutdown: watch::Sender<bool>,
}

impl AppContext {
    fn lock_generation(&self) -> MutexGuard<'_, GenerationState> {
        match self.generation.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register webhook drivers for every active configured channel.
    /// Returns the adapter names that came up.
    fn install_drivers(&self) -> Vec<String> {
        self.outbox.clear_drivers();
        let config = match self.config.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let mut adapters = Vec::new();
        for (name, channel_config) in &config.channels {
            if !channel_config.active {
                continue;
            }
            if let Some(driver) = WebhookDriver::from_config(name, channel_config) {
                self.outbox.register_driver(Arc::new(driver));
                adapters.push(name.clone());
            }
        }
        adapters.sort();
        adapters
    }

    /// Stop background work: scheduler timers, registries, outbox worker.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.heartbeats.stop();
        self.cron.stop();
        self.scheduler.stop();
    }
}

/// Assemble the full control plane for a workspace root.
///
/// `backend` is the command pipeline seam: absent means active wake turns
/// fall back with `control_plane_unavailable`.
pub fn build_context(
    repo_root: impl Into<std::path::PathBuf>,
    executor: Arc<dyn RunExecutor>,
    backend: Option<Arc<dyn CommandBackend>>,
) -> CoreResult<Arc<AppContext>> {
    let paths = RuntimePaths::resolve(repo_root);
    let config = Arc::new(RwLock::new(config::load_config(&paths.config_toml)?));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (scheduler_settings, outbox_settings, runs_settings) = {
        let guard = match config.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        (
            guard.scheduler.clone(),
            guard.outbox.clone(),
            guard.runs.clone(),
        )
    };

    let events = Arc::new(EventLog::new(&paths.events_jsonl, Arc::clone(&clock)));
    let scheduler = ActivityScheduler::new(Arc::clone(&clock), scheduler_settings);
    let pipeline = Arc::new(CommandPipeline::new(Arc::clone(&clock)));
    if let Some(backend) = backend {
        pipeline.set_backend(backend);
    }
    let identities = IdentityRegistry::new(&paths.identities_jsonl, Arc::clone(&clock));
    let outbox = Outbox::new(
        &paths.outbox_jsonl,
        Arc::clone(&clock),
        Arc::clone(&events),
        Arc::clone(&identities),
        outbox_settings,
    );
    let wake = WakeOrchestrator::new(
        Arc::clone(&clock),
        Arc::clone(&events),
        Arc::clone(&config),
        Arc::clone(&pipeline),
        Arc::clone(&outbox),
        paths.repo_root.clone(),
    );
    let heartbeats = HeartbeatRegistry::new(
        &paths.heartbeats_jsonl,
        Arc::clone(&clock),
        Arc::clone(&scheduler),
        wake.clone() as Arc<dyn crate::programs::WakeDispatcher>,
        Arc::clone(&events),
    );
    heartbeats.load()?;
    let cron = CronRegistry::new(
        &paths.cron_jsonl,
        Arc::clone(&clock),
        Arc::clone(&scheduler),
        wake.clone() as Arc<dyn crate::programs::WakeDispatcher>,
        Arc::clone(&events),
    );
    cron.load()?;
    let issues = IssueStore::new(&paths.issues_jsonl, Arc::clone(&clock));
    let forum = ForumLog::new(&paths.forum_jsonl, Arc::clone(&clock));
    let runner = DagRunner::new(
        Arc::clone(&issues),
        Arc::clone(&forum),
        Arc::clone(&events),
        Arc::clone(&clock),
        executor,
        paths.clone(),
    );
    let runs = RunRegistry::new(
        Arc::clone(&clock),
        Arc::clone(&events),
        Arc::clone(&issues),
        runner,
        Arc::clone(&heartbeats),
        runs_settings.default_max_steps,
        runs_settings.auto_run_heartbeat_every_ms,
    );

    let (shutdown, shutdown_rx) = watch::channel(false);
    outbox.spawn_worker(shutdown_rx);

    let context = Arc::new(AppContext {
        adapter_audit: JsonlStore::new(&paths.adapter_audit_jsonl),
        paths,
        config,
        clock: Arc::clone(&clock),
        events,
        scheduler,
        pipeline,
        identities,
        outbox,
        wake,
        heartbeats,
        cron,
        issues,
        forum,
        runs,
        generation: Mutex::new(GenerationState {
            active: Generation {
                id: 1,
                adapters: Vec::new(),
                activated_at_ms: clock.now_ms(),
            },
            previous: None,
            last_outcome: None,
        }),
        started_at_ms: clock.now_ms(),
        shutdown,
    });

    let adapters = context.install_drivers();
    context.lock_generation().active.adapters = adapters;
    Ok(context)
}

/// Build the router over an assembled context.
pub fn router(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status))
        .route("/api/config", get(get_config).post(patch_config))
        .route("/api/control-plane/channels", get(channels))
        .route("/webhooks/:channel", post(webhook_ingress))
        .route("/api/control-plane/runs", get(list_runs))
        .route("/api/control-plane/runs/start", post(start_run))
        .route("/api/control-plane/runs/resume", post(resume_run))
        .route("/api/control-plane/runs/interrupt", post(interrupt_run))
        .route("/api/control-plane/runs/:id", get(get_run))
        .route("/api/control-plane/runs/:id/trace", get(run_trace))
        .route("/api/control-plane/identities", get(list_identities).post(bind_identity))
        .route("/api/control-plane/identities/:id/revoke", post(revoke_identity))
        .route("/api/control-plane/reload", post(reload_generation))
        .route("/api/control-plane/rollback", post(rollback_generation))
        .route("/api/heartbeats", get(list_heartbeats).post(create_heartbeat))
        .route(
            "/api/heartbeats/:id",
            get(get_heartbeat).post(update_heartbeat).delete(remove_heartbeat),
        )
        .route("/api/heartbeats/:id/trigger", post(trigger_heartbeat))
        .route("/api/cron", get(list_cron).post(create_cron))
        .route("/api/cron/:id", get(get_cron).post(update_cron).delete(remove_cron))
        .route("/api/cron/:id/trigger", post(trigger_cron))
        .route("/api/issues", get(list_issues).post(create_issue))
        .route("/api/events", get(list_events))
        .route("/api/events/tail", get(tail_events))
        .with_state(context)
}

/// Bind the listener, write the discovery record, and serve until the
/// process exits.
///
/// # Errors
///
/// Returns an error when binding or serving fails.
pub async fn serve(context: Arc<AppContext>, port: u16) -> CoreResult<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| CoreError::Internal(format!("failed to bind port {port}: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| CoreError::Internal(format!("failed to read local addr: {e}")))?;

    let discovery = serde_json::json!({
        "pid": std::process::id(),
        "port": local.port(),
        "url": format!("http://127.0.0.1:{}", local.port()),
        "started_at_ms": context.started_at_ms,
    });
    crate::store::ensure_parent_dir(&context.paths.server_json)?;
    std::fs::write(
        &context.paths.server_json,
        serde_json::to_string_pretty(&discovery)?,
    )
    .map_err(|e| CoreError::Internal(format!("failed to write server.json: {e}")))?;
    info!(port = local.port(), "control plane listening");

    let app = router(context);
    axum::serve(listener, app)
        .await
        .map_err(|e| CoreError::Internal(format!("server error: {e}")))
}

// ── Error mapping ───────────────────────────────────────────────

/// JSON error envelope carrying the taxonomy reason code.
struct ApiError(CoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "reason_code": self.0.reason_code(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Handlers ────────────────────────────────────────────────────

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let generation = ctx.lock_generation().clone();
    Json(serde_json::json!({
        "repo_root": ctx.paths.repo_root.display().to_string(),
        "control_plane": {
            "active": true,
            "adapters": ctx.outbox.driver_channels(),
            "routes": KNOWN_CHANNELS.iter().map(|c| format!("/webhooks/{c}")).collect::<Vec<_>>(),
            "generation": serde_json::to_value(&generation).unwrap_or_default(),
            "observability": {
                "counters": {
                    "events_emitted": ctx.events.emitted_count(),
                    "wakes": ctx.wake.wakes_count(),
                    "turns": ctx.wake.turns_count(),
                    "envelopes_delivered": ctx.outbox.delivered_count(),
                    "envelopes_dead": ctx.outbox.dead_count(),
                }
            },
        },
    }))
}

async fn get_config(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let config = match ctx.config.read() {
        Ok(g) => g.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    Json(serde_json::to_value(&config).unwrap_or_default())
}

async fn patch_config(
    State(ctx): State<Arc<AppContext>>,
    Json(patch): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let merged = {
        let current = match ctx.config.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        config::apply_patch(&current, &patch)?
    };
    config::save_config(&ctx.paths.config_toml, &merged)?;
    {
        let mut guard = match ctx.config.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = merged.clone();
    }
    Ok(Json(serde_json::to_value(&merged).unwrap_or_default()))
}

async fn channels(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let config = match ctx.config.read() {
        Ok(g) => g.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    Json(serde_json::json!({ "channels": channel_capabilities(&config.channels) }))
}

async fn webhook_ingress(
    State(ctx): State<Arc<AppContext>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    Json(envelope): Json<IngressEnvelope>,
) -> ApiResult<Json<serde_json::Value>> {
    if !KNOWN_CHANNELS.contains(&channel.as_str()) {
        return Err(CoreError::NotFound(format!("channel {channel}")).into());
    }
    let channel_config = {
        let config = match ctx.config.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        config.channels.get(&channel).cloned()
    };
    let Some(channel_config) = channel_config else {
        return Err(CoreError::PreconditionFailed(format!("channel {channel} not configured")).into());
    };
    if !channel_config.active {
        return Err(CoreError::PreconditionFailed(format!("channel {channel} inactive")).into());
    }
    let presented = headers
        .get(channel_config.secret_header.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != channel_config.secret {
        return Err(CoreError::Validation("invalid shared secret".to_owned()).into());
    }

    if let Err(e) = ctx.adapter_audit.append(&serde_json::json!({
        "ts_ms": ctx.clock.now_ms(),
        "channel": channel,
        "channel_tenant_id": envelope.channel_tenant_id,
        "channel_actor_id": envelope.channel_actor_id,
        "text_len": envelope.text.len(),
    })) {
        warn!(error = %e, "failed to append adapter audit record");
    }
    record_conversation(&ctx, &channel, &envelope);

    let request = TurnRequest {
        command_text: envelope.text.clone(),
        repo_root: ctx.paths.repo_root.clone(),
        request_id: envelope.request_id.clone(),
        correlation: Some(serde_json::json!({
            "channel": channel,
            "channel_conversation_id": envelope.channel_conversation_id,
            "channel_actor_id": envelope.channel_actor_id,
        })),
        deadline_ms: None,
    };
    let result = ctx.pipeline.submit_terminal_command(request).await?;
    Ok(Json(serde_json::json!({
        "accepted": true,
        "result": serde_json::to_value(&result).unwrap_or_default(),
    })))
}

/// Remember which actor last spoke in a conversation so replies resolve
/// their context without a fresh ingress.
fn record_conversation(ctx: &AppContext, channel: &str, envelope: &IngressEnvelope) {
    let path = &ctx.paths.operator_conversations_json;
    let mut map: serde_json::Map<String, serde_json::Value> = std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let key = format!(
        "{channel}:{}:{}",
        envelope.channel_tenant_id, envelope.channel_conversation_id
    );
    map.insert(
        key,
        serde_json::json!({
            "channel": channel,
            "channel_tenant_id": envelope.channel_tenant_id,
            "channel_conversation_id": envelope.channel_conversation_id,
            "channel_actor_id": envelope.channel_actor_id,
            "last_seen_ms": ctx.clock.now_ms(),
        }),
    );
    if let Err(e) = crate::store::ensure_parent_dir(path).and_then(|()| {
        std::fs::write(path, serde_json::to_string_pretty(&map).unwrap_or_default())
            .map_err(|e| CoreError::Internal(e.to_string()))
    }) {
        warn!(error = %e, "failed to update operator conversations");
    }
}

#[derive(Deserialize)]
struct JobIdBody {
    job_id: String,
}

async fn start_run(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<StartRun>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = ctx.runs.start(req, RunSource::Api)?;
    Ok(Json(serde_json::to_value(&record).unwrap_or_default()))
}

async fn resume_run(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<JobIdBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = ctx.runs.resume(&body.job_id)?;
    Ok(Json(serde_json::to_value(&record).unwrap_or_default()))
}

async fn interrupt_run(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<JobIdBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = ctx.runs.interrupt(&body.job_id)?;
    Ok(Json(serde_json::to_value(&record).unwrap_or_default()))
}

async fn list_runs(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "runs": ctx.runs.list() }))
}

async fn get_run(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = ctx.runs.get(&id)?;
    Ok(Json(serde_json::to_value(&record).unwrap_or_default()))
}

async fn run_trace(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let trace = ctx.runs.trace(&id)?;
    Ok(Json(serde_json::json!({ "events": trace })))
}

async fn list_identities(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<serde_json::Value>> {
    let bindings = ctx.identities.list()?;
    Ok(Json(serde_json::json!({ "bindings": bindings })))
}

async fn bind_identity(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<BindRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let binding = ctx.identities.bind(req)?;
    Ok(Json(serde_json::to_value(&binding).unwrap_or_default()))
}

async fn revoke_identity(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let binding = ctx.identities.revoke(&id)?;
    Ok(Json(serde_json::to_value(&binding).unwrap_or_default()))
}

async fn reload_generation(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let adapters = ctx.install_drivers();
    let now = ctx.clock.now_ms();
    let mut generation = ctx.lock_generation();
    let from = generation.active.id;
    let next = Generation {
        id: from.saturating_add(1),
        adapters,
        activated_at_ms: now,
    };
    generation.previous = Some(generation.active.clone());
    generation.active = next;
    generation.last_outcome = Some(serde_json::json!({
        "outcome": "reloaded",
        "from": from,
        "to": generation.active.id,
        "active": generation.active.id,
    }));
    Json(serde_json::to_value(&*generation).unwrap_or_default())
}

async fn rollback_generation(
    State(ctx): State<Arc<AppContext>>,
) -> ApiResult<Json<serde_json::Value>> {
    let now = ctx.clock.now_ms();
    let mut generation = ctx.lock_generation();
    let Some(mut previous) = generation.previous.take() else {
        return Err(CoreError::PreconditionFailed("no previous generation".to_owned()).into());
    };
    let from = generation.active.id;
    previous.activated_at_ms = now;
    let rolled_back = std::mem::replace(&mut generation.active, previous);
    generation.previous = Some(rolled_back);
    generation.last_outcome = Some(serde_json::json!({
        "outcome": "rolled_back",
        "from": from,
        "to": generation.active.id,
        "active": generation.active.id,
    }));
    // Re-register drivers to match the restored adapter set.
    drop(generation);
    ctx.install_drivers();
    Ok(Json(
        serde_json::to_value(&*ctx.lock_generation()).unwrap_or_default(),
    ))
}

async fn list_heartbeats(
    State(ctx): State<Arc<AppContext>>,
    Query(filter): Query<ListHeartbeats>,
) -> ApiResult<Json<serde_json::Value>> {
    let programs = ctx.heartbeats.list(&filter)?;
    Ok(Json(serde_json::json!({ "programs": programs })))
}

async fn create_heartbeat(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<CreateHeartbeat>,
) -> ApiResult<Json<serde_json::Value>> {
    let program = ctx.heartbeats.create(req)?;
    Ok(Json(serde_json::to_value(&program).unwrap_or_default()))
}

async fn get_heartbeat(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let program = ctx.heartbeats.get(&id)?;
    Ok(Json(serde_json::to_value(&program).unwrap_or_default()))
}

async fn update_heartbeat(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(patch): Json<UpdateHeartbeat>,
) -> ApiResult<Json<serde_json::Value>> {
    let program = ctx.heartbeats.update(&id, patch)?;
    Ok(Json(serde_json::to_value(&program).unwrap_or_default()))
}

async fn remove_heartbeat(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let program = ctx.heartbeats.remove(&id)?;
    Ok(Json(serde_json::to_value(&program).unwrap_or_default()))
}

#[derive(Debug, Default, Deserialize)]
struct TriggerBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn trigger_heartbeat(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    body: Option<Json<TriggerBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let reason = body.as_ref().and_then(|b| b.reason.clone());
    let report = ctx.heartbeats.trigger(&id, reason.as_deref()).await?;
    Ok(Json(serde_json::to_value(&report).unwrap_or_default()))
}

async fn list_cron(
    State(ctx): State<Arc<AppContext>>,
    Query(filter): Query<ListCron>,
) -> ApiResult<Json<serde_json::Value>> {
    let programs = ctx.cron.list(&filter)?;
    Ok(Json(serde_json::json!({ "programs": programs })))
}

async fn create_cron(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<CreateCron>,
) -> ApiResult<Json<serde_json::Value>> {
    let program = ctx.cron.create(req)?;
    Ok(Json(serde_json::to_value(&program).unwrap_or_default()))
}

async fn get_cron(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let program = ctx.cron.get(&id)?;
    Ok(Json(serde_json::to_value(&program).unwrap_or_default()))
}

async fn update_cron(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(patch): Json<UpdateCron>,
) -> ApiResult<Json<serde_json::Value>> {
    let program = ctx.cron.update(&id, patch)?;
    Ok(Json(serde_json::to_value(&program).unwrap_or_default()))
}

async fn remove_cron(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let program = ctx.cron.remove(&id)?;
    Ok(Json(serde_json::to_value(&program).unwrap_or_default()))
}

async fn trigger_cron(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    body: Option<Json<TriggerBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let reason = body.as_ref().and_then(|b| b.reason.clone());
    let report = ctx.cron.trigger(&id, reason.as_deref()).await?;
    Ok(Json(serde_json::to_value(&report).unwrap_or_default()))
}

async fn list_issues(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<serde_json::Value>> {
    let issues = ctx.issues.list()?;
    Ok(Json(serde_json::json!({ "issues": issues })))
}

async fn create_issue(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<NewIssue>,
) -> ApiResult<Json<serde_json::Value>> {
    let issue = ctx.issues.create(req)?;
    Ok(Json(serde_json::to_value(&issue).unwrap_or_default()))
}

async fn list_events(
    State(ctx): State<Arc<AppContext>>,
    Query(filter): Query<EventFilter>,
) -> ApiResult<Json<serde_json::Value>> {
    let events = ctx.events.query(&filter)?;
    Ok(Json(serde_json::json!({ "events": events })))
}

async fn tail_events(
    State(ctx): State<Arc<AppContext>>,
    Query(mut filter): Query<EventFilter>,
) -> ApiResult<Json<serde_json::Value>> {
    filter.tail = true;
    let events = ctx.events.query(&filter)?;
    Ok(Json(serde_json::json!({ "events": events })))
}
