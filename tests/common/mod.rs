//! Shared fixtures for integration tests: an assembled control-plane world
//! over a temp directory plus scripted mocks for the command backend,
//! channel drivers, and the run executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use mu::channels::{ChannelDriver, DeliveryFailure, DeliveryReceipt};
use mu::clock::TestClock;
use mu::config::{RuntimePaths, ServerConfig};
use mu::dag::{RunExecutor, StepOutput, StepRequest};
use mu::error::{CoreError, CoreResult};
use mu::events::{EventFilter, EventLog, EventRecord};
use mu::identity::{BindRequest, IdentityRegistry};
use mu::issues::{ForumLog, IssueOutcome, IssueStore};
use mu::outbox::{Outbox, OutboxEnvelope};
use mu::pipeline::{CommandBackend, CommandPipeline, TurnRequest, TurnResult, TurnResultKind};
use mu::programs::cron::CronRegistry;
use mu::programs::heartbeat::HeartbeatRegistry;
use mu::programs::WakeDispatcher;
use mu::scheduler::ActivityScheduler;
use mu::wake::WakeOrchestrator;

/// Epoch the test clock starts at (an arbitrary fixed instant).
pub const EPOCH_MS: i64 = 1_700_000_000_000;

/// Fully wired control-plane core over a temp directory.
pub struct World {
    /// Keeps the temp directory alive for the test.
    pub dir: tempfile::TempDir,
    pub paths: RuntimePaths,
    pub clock: Arc<TestClock>,
    pub config: Arc<RwLock<ServerConfig>>,
    pub events: Arc<EventLog>,
    pub scheduler: Arc<ActivityScheduler>,
    pub pipeline: Arc<CommandPipeline>,
    pub identities: Arc<IdentityRegistry>,
    pub outbox: Arc<Outbox>,
    pub wake: Arc<WakeOrchestrator>,
    pub heartbeats: Arc<HeartbeatRegistry>,
    pub cron: Arc<CronRegistry>,
    pub issues: Arc<IssueStore>,
    pub forum: Arc<ForumLog>,
}

/// Build a world with default config.
pub fn build_world() -> World {
    build_world_with(|_| {})
}

/// Build a world after tweaking the config.
pub fn build_world_with(adjust: impl FnOnce(&mut ServerConfig)) -> World {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = RuntimePaths::resolve(dir.path());
    let mut server_config = ServerConfig::default();
    adjust(&mut server_config);

    let clock = Arc::new(TestClock::new(EPOCH_MS));
    let clock_dyn: Arc<dyn mu::clock::Clock> = clock.clone();
    let config = Arc::new(RwLock::new(server_config.clone()));
    let events = Arc::new(EventLog::new(&paths.events_jsonl, clock_dyn.clone()));
    let scheduler = ActivityScheduler::new(clock_dyn.clone(), server_config.scheduler.clone());
    let pipeline = Arc::new(CommandPipeline::new(clock_dyn.clone()));
    let identities = IdentityRegistry::new(&paths.identities_jsonl, clock_dyn.clone());
    let outbox = Outbox::new(
        &paths.outbox_jsonl,
        clock_dyn.clone(),
        events.clone(),
        identities.clone(),
        server_config.outbox.clone(),
    );
    let wake = WakeOrchestrator::new(
        clock_dyn.clone(),
        events.clone(),
        config.clone(),
        pipeline.clone(),
        outbox.clone(),
        paths.repo_root.clone(),
    );
    let heartbeats = HeartbeatRegistry::new(
        &paths.heartbeats_jsonl,
        clock_dyn.clone(),
        scheduler.clone(),
        wake.clone() as Arc<dyn WakeDispatcher>,
        events.clone(),
    );
    heartbeats.load().expect("load heartbeats");
    let cron = CronRegistry::new(
        &paths.cron_jsonl,
        clock_dyn.clone(),
        scheduler.clone(),
        wake.clone() as Arc<dyn WakeDispatcher>,
        events.clone(),
    );
    cron.load().expect("load cron");
    let issues = IssueStore::new(&paths.issues_jsonl, clock_dyn.clone());
    let forum = ForumLog::new(&paths.forum_jsonl, clock_dyn);

    World {
        dir,
        paths,
        clock,
        config,
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
    }
}

impl World {
    /// Events of one type, in emission order.
    pub fn events_of(&self, event_type: &str) -> Vec<EventRecord> {
        self.events
            .query(&EventFilter {
                event_type: Some(event_type.to_owned()),
                ..Default::default()
            })
            .expect("query events")
    }

    /// Bind an operator identity on `channel`.
    pub fn bind(&self, channel: &str, actor: &str) -> String {
        self.identities
            .bind(BindRequest {
                operator_id: "op-1".to_owned(),
                channel: channel.to_owned(),
                channel_tenant_id: "tenant-1".to_owned(),
                channel_actor_id: actor.to_owned(),
                scopes: vec!["notify".to_owned()],
            })
            .expect("bind identity")
            .binding_id
    }
}

// ── Command backend mock ────────────────────────────────────────

/// Recorded pipeline submission.
#[derive(Debug, Clone)]
pub struct RecordedTurn {
    pub command_text: String,
    pub request_id: Option<String>,
}

/// Backend that records every execution and always completes.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<RecordedTurn>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<RecordedTurn> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl CommandBackend for RecordingBackend {
    async fn execute(&self, request: &TurnRequest) -> CoreResult<TurnResult> {
        self.calls.lock().expect("lock").push(RecordedTurn {
            command_text: request.command_text.clone(),
            request_id: request.request_id.clone(),
        });
        Ok(TurnResult {
            kind: TurnResultKind::Completed,
            message: None,
            command_id: None,
        })
    }
}

// ── Channel driver mock ─────────────────────────────────────────

/// Scripted per-attempt delivery outcome.
pub enum ScriptedOutcome {
    Ok,
    Transient(&'static str),
    Permanent(&'static str),
}

/// Driver that plays back scripted outcomes, then succeeds.
pub struct ScriptDriver {
    channel: String,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    delivered: Mutex<Vec<String>>,
}

impl ScriptDriver {
    pub fn ok(channel: &str) -> Arc<Self> {
        Self::scripted(channel, Vec::new())
    }

    pub fn scripted(channel: &str, script: Vec<ScriptedOutcome>) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_owned(),
            script: Mutex::new(script.into_iter().collect()),
            delivered: Mutex::new(Vec::new()),
        })
    }

    /// Outbox ids delivered through this driver.
    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChannelDriver for ScriptDriver {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn deliver(&self, envelope: &OutboxEnvelope) -> Result<DeliveryReceipt, DeliveryFailure> {
        let next = self.script.lock().expect("lock").pop_front();
        match next {
            None | Some(ScriptedOutcome::Ok) => {
                self.delivered
                    .lock()
                    .expect("lock")
                    .push(envelope.outbox_id.clone());
                Ok(DeliveryReceipt {
                    delivery_id: Some(format!("d-{}", envelope.attempt_count)),
                })
            }
            Some(ScriptedOutcome::Transient(reason)) => Err(DeliveryFailure::transient(reason)),
            Some(ScriptedOutcome::Permanent(reason)) => Err(DeliveryFailure::permanent(reason)),
        }
    }
}

// ── Run executor mocks ──────────────────────────────────────────

/// Executor that never closes issues and always exits nonzero.
#[derive(Default)]
pub struct AlwaysFailExecutor;

#[async_trait]
impl RunExecutor for AlwaysFailExecutor {
    async fn execute_step(&self, _request: &StepRequest) -> CoreResult<StepOutput> {
        Ok(StepOutput {
            exit_code: 1,
            elapsed_ms: 5,
        })
    }
}

/// Executor that closes the executed issue with `success`.
pub struct CloseWithSuccessExecutor {
    issues: Arc<IssueStore>,
}

impl CloseWithSuccessExecutor {
    pub fn new(issues: Arc<IssueStore>) -> Arc<Self> {
        Arc::new(Self { issues })
    }
}

#[async_trait]
impl RunExecutor for CloseWithSuccessExecutor {
    async fn execute_step(&self, request: &StepRequest) -> CoreResult<StepOutput> {
        self.issues
            .close(&request.issue_id, IssueOutcome::Success)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(StepOutput {
            exit_code: 0,
            elapsed_ms: 5,
        })
    }
}

/// Executor that exits 0 but leaves the issue open.
#[derive(Default)]
pub struct LeaveOpenExecutor;

#[async_trait]
impl RunExecutor for LeaveOpenExecutor {
    async fn execute_step(&self, _request: &StepRequest) -> CoreResult<StepOutput> {
        Ok(StepOutput {
            exit_code: 0,
            elapsed_ms: 5,
        })
    }
}

/// Executor whose every step takes simulated wall-clock time.
pub struct SlowExecutor {
    pub step_ms: u64,
}

#[async_trait]
impl RunExecutor for SlowExecutor {
    async fn execute_step(&self, _request: &StepRequest) -> CoreResult<StepOutput> {
        tokio::time::sleep(std::time::Duration::from_millis(self.step_ms)).await;
        Ok(StepOutput {
            exit_code: 1,
            elapsed_ms: i64::try_from(self.step_ms).unwrap_or(0),
        })
    }
}
