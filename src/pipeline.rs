//! Command pipeline seam.
//!
//! A single-writer mutator: at most one terminal command executes at a
//! time for the workspace. Reused `request_id`s inside the dedupe window
//! return the cached result instead of re-executing, which is what makes
//! the wake orchestrator's at-most-once turn property hold under retries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::ids;

/// How long a cached `request_id` result stays authoritative.
const DEDUPE_WINDOW_MS: i64 = 300_000;

/// One terminal command submission.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Command text executed by the backend.
    pub command_text: String,
    /// Workspace the command mutates.
    pub repo_root: PathBuf,
    /// Idempotency key; reuse inside the dedupe window returns the cached
    /// result.
    pub request_id: Option<String>,
    /// Opaque correlation data carried through to the backend.
    pub correlation: Option<serde_json::Value>,
    /// Absolute deadline; breached deadlines reject with `timeout`.
    pub deadline_ms: Option<i64>,
}

/// Result classification of a terminal command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnResultKind {
    /// The command ran to completion.
    Completed,
    /// The operator replied with content instead of a mutation.
    OperatorResponse,
    /// The command was rejected; not retried automatically.
    Rejected,
    /// The command was accepted for later execution.
    Deferred,
}

impl TurnResultKind {
    /// Snake-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::OperatorResponse => "operator_response",
            Self::Rejected => "rejected",
            Self::Deferred => "deferred",
        }
    }
}

/// Outcome of one submission.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    /// Result classification.
    pub kind: TurnResultKind,
    /// Operator-visible message, mandatory for rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Command id assigned by the pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

/// Executes one command against the workspace. The control plane treats the
/// backend as opaque; absence of a backend means the control plane is not
/// available for autonomous turns.
#[async_trait]
pub trait CommandBackend: Send + Sync {
    /// Execute one command. Errors become failed turns, not panics.
    async fn execute(&self, request: &TurnRequest) -> CoreResult<TurnResult>;
}

/// Serialized single-writer command pipeline.
pub struct CommandPipeline {
    clock: Arc<dyn Clock>,
    backend: RwLock<Option<Arc<dyn CommandBackend>>>,
    /// One mutation at a time for this workspace.
    gate: tokio::sync::Mutex<()>,
    dedupe: Mutex<HashMap<String, (i64, TurnResult)>>,
}

impl CommandPipeline {
    /// Create a pipeline with no backend; [`CommandPipeline::set_backend`]
    /// attaches one.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            backend: RwLock::new(None),
            gate: tokio::sync::Mutex::new(()),
            dedupe: Mutex::new(HashMap::new()),
        }
    }

    /// Attach or replace the command backend.
    pub fn set_backend(&self, backend: Arc<dyn CommandBackend>) {
        let mut slot = match self.backend.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(backend);
    }

    /// Whether `submit_terminal_command` can execute turns.
    pub fn available(&self) -> bool {
        match self.backend.read() {
            Ok(g) => g.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Submit one terminal command.
    ///
    /// Commands serialize behind an async gate; a reused `request_id`
    /// returns its cached result without re-executing; a breached deadline
    /// returns `rejected` with reason `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a precondition failure when no backend is attached.
    pub async fn submit_terminal_command(&self, request: TurnRequest) -> CoreResult<TurnResult> {
        let backend = {
            let guard = match self.backend.read() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };
        let Some(backend) = backend else {
            return Err(CoreError::PreconditionFailed(
                "control_plane_unavailable".to_owned(),
            ));
        };

        if let Some(cached) = self.cached_result(request.request_id.as_deref()) {
            debug!(request_id = ?request.request_id, "returning cached turn result");
            return Ok(cached);
        }

        let _gate = self.gate.lock().await;
        // A concurrent submission with the same id may have landed while we
        // waited on the gate.
        if let Some(cached) = self.cached_result(request.request_id.as_deref()) {
            return Ok(cached);
        }

        let now = self.clock.now_ms();
        if let Some(deadline) = request.deadline_ms {
            if now >= deadline {
                let result = TurnResult {
                    kind: TurnResultKind::Rejected,
                    message: Some("timeout".to_owned()),
                    command_id: None,
                };
                self.cache_result(request.request_id.as_deref(), &result);
                return Ok(result);
            }
        }

        let command_id = ids::command_id();
        let executed = match request.deadline_ms {
            Some(deadline) => {
                let budget = deadline.saturating_sub(now);
                let millis = u64::try_from(budget).unwrap_or(0);
                match tokio::time::timeout(
                    std::time::Duration::from_millis(millis),
                    backend.execute(&request),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Ok(TurnResult {
                        kind: TurnResultKind::Rejected,
                        message: Some("timeout".to_owned()),
                        command_id: Some(command_id.clone()),
                    }),
                }
            }
            None => backend.execute(&request).await,
        };

        let mut result = executed?;
        if result.command_id.is_none() {
            result.command_id = Some(command_id);
        }
        info!(
            kind = result.kind.as_str(),
            request_id = ?request.request_id,
            "terminal command finished"
        );
        self.cache_result(request.request_id.as_deref(), &result);
        Ok(result)
    }

    fn cached_result(&self, request_id: Option<&str>) -> Option<TurnResult> {
        let request_id = request_id?;
        let now = self.clock.now_ms();
        let map = self.lock_dedupe();
        map.get(request_id).and_then(|(at, result)| {
            (now.saturating_sub(*at) < DEDUPE_WINDOW_MS).then(|| result.clone())
        })
    }

    fn cache_result(&self, request_id: Option<&str>, result: &TurnResult) {
        let Some(request_id) = request_id else {
            return;
        };
        let now = self.clock.now_ms();
        let mut map = self.lock_dedupe();
        map.retain(|_, (at, _)| now.saturating_sub(*at) < DEDUPE_WINDOW_MS);
        map.insert(request_id.to_owned(), (now, result.clone()));
    }

    fn lock_dedupe(&self) -> MutexGuard<'_, HashMap<String, (i64, TurnResult)>> {
        match self.dedupe.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for CommandPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPipeline")
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}
