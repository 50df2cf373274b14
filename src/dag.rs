//! DAG runner.
//!
//! Drives one run against the issue graph: unstick → terminate check →
//! select ready leaf → claim → execute → postconditions → forum log →
//! re-orchestrate, bounded by `max_steps`. A per-issue in-memory attempt
//! counter (cap 3) is the circuit breaker against infinite
//! re-orchestration; it resets only on process restart or explicit
//! operator action.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::RuntimePaths;
use crate::error::CoreResult;
use crate::events::{EventLog, EventScope};
use crate::issues::{ForumLog, Issue, IssueOutcome, IssueStatus, IssueStore};

/// Attempts per issue before the circuit breaker opens.
pub const MAX_ISSUE_ATTEMPTS: u32 = 3;

/// One step handed to the backend executor.
#[derive(Debug, Clone)]
pub struct StepRequest {
    /// Root issue of the run.
    pub root_id: String,
    /// Issue being executed (the root itself for repair steps).
    pub issue_id: String,
    /// Run job id.
    pub run_id: String,
    /// 1-based step number within the run.
    pub step: u32,
    /// Attempt number for this issue.
    pub attempt: u32,
    /// Rendered user prompt.
    pub user_prompt: String,
    /// Role-specific system prompt.
    pub system_prompt: String,
    /// Per-step tee log path.
    pub log_path: PathBuf,
}

/// Backend result for one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutput {
    /// Process-style exit code; 0 is success.
    pub exit_code: i32,
    /// Wall-clock duration of the step.
    pub elapsed_ms: i64,
}

/// Executes one step of agent work. The runner treats the backend as
/// opaque; exhaustion and failure are signalled through the exit code.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Execute one step, teeing output to `request.log_path`.
    async fn execute_step(&self, request: &StepRequest) -> CoreResult<StepOutput>;

    /// Model identifier recorded in run context blocks.
    fn model_id(&self) -> String {
        "backend".to_owned()
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunVerdict {
    /// The validator reported the root final.
    RootFinal {
        /// Executed steps.
        steps: u32,
    },
    /// The step budget ran out.
    MaxStepsExhausted {
        /// Executed steps.
        steps: u32,
    },
    /// An external interrupt was observed.
    Interrupted {
        /// Executed steps.
        steps: u32,
    },
    /// The run aborted on an error.
    Error {
        /// Failure description.
        message: String,
        /// Executed steps.
        steps: u32,
    },
}

impl RunVerdict {
    /// Snake-case label for telemetry.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RootFinal { .. } => "root_final",
            Self::MaxStepsExhausted { .. } => "max_steps_exhausted",
            Self::Interrupted { .. } => "interrupted",
            Self::Error { .. } => "error",
        }
    }

    /// Executed steps.
    pub fn steps(&self) -> u32 {
        match self {
            Self::RootFinal { steps }
            | Self::MaxStepsExhausted { steps }
            | Self::Interrupted { steps }
            | Self::Error { steps, .. } => *steps,
        }
    }
}

/// Outcomes that send an issue back to orchestration.
fn reorchestrates(outcome: Option<IssueOutcome>) -> bool {
    matches!(
        outcome,
        Some(IssueOutcome::Failure) | Some(IssueOutcome::NeedsWork)
    )
}

/// The DAG runner.
pub struct DagRunner {
    issues: Arc<IssueStore>,
    forum: Arc<ForumLog>,
    events: Arc<EventLog>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn RunExecutor>,
    paths: RuntimePaths,
    /// Per-issue attempt counters. Process-local; a restart resets the
    /// circuit breaker.
    attempts: Mutex<HashMap<String, u32>>,
}

impl DagRunner {
    /// Create a runner.
    pub fn new(
        issues: Arc<IssueStore>,
        forum: Arc<ForumLog>,
        events: Arc<EventLog>,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn RunExecutor>,
        paths: RuntimePaths,
    ) -> Arc<Self> {
        Arc::new(Self {
            issues,
            forum,
            events,
            clock,
            executor,
            paths,
            attempts: Mutex::new(HashMap::new()),
        })
    }

    /// Attempt count recorded for an issue.
    pub fn attempts_for(&self, issue_id: &str) -> u32 {
        self.lock_attempts().get(issue_id).copied().unwrap_or(0)
    }

    /// Operator action: reset an issue's circuit breaker.
    pub fn reset_attempts(&self, issue_id: &str) {
        self.lock_attempts().remove(issue_id);
    }

    /// Drive one run to a verdict. Emits `dag.run.start` first and exactly
    /// one `dag.run.end` on every path, including errors.
    pub async fn run(
        &self,
        root_id: &str,
        run_id: &str,
        max_steps: u32,
        interrupt: Arc<AtomicBool>,
    ) -> RunVerdict {
        self.events.emit(
            "dag.run.start",
            "dag",
            EventScope::issue_in_run(root_id, run_id),
            serde_json::json!({ "root_id": root_id, "max_steps": max_steps }),
        );

        let mut steps: u32 = 0;
        let verdict = match self
            .drive(root_id, run_id, max_steps, &interrupt, &mut steps)
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(root_id, run_id, error = %e, "run aborted");
                RunVerdict::Error {
                    message: e.to_string(),
                    steps,
                }
            }
        };

        self.events.emit(
            "dag.run.end",
            "dag",
            EventScope::issue_in_run(root_id, run_id),
            serde_json::json!({
                "verdict": verdict.label(),
                "steps": verdict.steps(),
            }),
        );
        info!(root_id, run_id, verdict = verdict.label(), steps = verdict.steps(), "run finished");
        verdict
    }

    async fn drive(
        &self,
        root_id: &str,
        run_id: &str,
        max_steps: u32,
        interrupt: &Arc<AtomicBool>,
        steps: &mut u32,
    ) -> CoreResult<RunVerdict> {
        for _ in 0..max_steps {
            if interrupt.load(Ordering::SeqCst) {
                return Ok(RunVerdict::Interrupted { steps: *steps });
            }

            // 0. Unstick: reopen one stuck closed issue, then spend the
            // iteration.
            if self.unstick_pass(root_id, run_id)? {
                continue;
            }

            // 1. Terminate check.
            let root = self.issues.get(root_id)?;
            if root.status == IssueStatus::Closed {
                return Ok(RunVerdict::RootFinal { steps: *steps });
            }

            // 2. Select ready leaf.
            let ready = self.issues.ready(root_id, &["node:agent"])?;
            let Some(issue) = ready.into_iter().next() else {
                self.repair_pass(root_id, run_id, steps).await?;
                continue;
            };

            // 3. Claim.
            let issue = self.issues.claim(&issue.id)?;
            let attempt = self.bump_attempt(&issue.id);
            self.events.emit(
                "dag.claim",
                "dag",
                EventScope::issue_in_run(&issue.id, run_id),
                serde_json::json!({
                    "issue_id": issue.id,
                    "attempt": attempt,
                    "priority": issue.priority,
                }),
            );

            // 4. Execute.
            let step_no = steps.saturating_add(1);
            self.events.emit(
                "dag.step.start",
                "dag",
                EventScope::issue_in_run(&issue.id, run_id),
                serde_json::json!({ "issue_id": issue.id, "step": step_no, "attempt": attempt }),
            );
            let suffix = (attempt > 1).then(|| format!("attempt-{attempt}"));
            let request = StepRequest {
                root_id: root_id.to_owned(),
                issue_id: issue.id.clone(),
                run_id: run_id.to_owned(),
                step: step_no,
                attempt,
                user_prompt: self.render_user_prompt(&issue, root_id, run_id, step_no, attempt),
                system_prompt: render_system_prompt(&issue),
                log_path: self.paths.step_log_path(root_id, &issue.id, suffix.as_deref()),
            };
            let output = self.execute_backend(&request).await?;

            // 5. Postconditions: the executor must have closed the issue.
            let mut reloaded = self.issues.get(&issue.id)?;
            if reloaded.status != IssueStatus::Closed {
                reloaded = self.issues.close(&issue.id, IssueOutcome::Failure)?;
                self.events.emit(
                    "dag.step.force_close",
                    "dag",
                    EventScope::issue_in_run(&issue.id, run_id),
                    serde_json::json!({ "issue_id": issue.id, "exit_code": output.exit_code }),
                );
            }

            // 6. Forum log & step end.
            let record = serde_json::json!({
                "step": step_no,
                "issue_id": issue.id,
                "attempt": attempt,
                "exit_code": output.exit_code,
                "elapsed_ms": output.elapsed_ms,
                "outcome": reloaded.outcome.map(IssueOutcome::as_str),
            });
            self.forum
                .post(&format!("issue:{}", issue.id), &record.to_string())?;
            self.events.emit(
                "dag.step.end",
                "dag",
                EventScope::issue_in_run(&issue.id, run_id),
                record,
            );
            *steps = step_no;

            // 7. Re-orchestrate or open the circuit breaker.
            if reorchestrates(reloaded.outcome) {
                let attempts = self.attempts_for(&issue.id);
                if attempts < MAX_ISSUE_ATTEMPTS {
                    self.reopen_for_orchestration(&issue.id, run_id, "reorchestrate")?;
                } else {
                    self.events.emit(
                        "dag.circuit_breaker",
                        "dag",
                        EventScope::issue_in_run(&issue.id, run_id),
                        serde_json::json!({ "issue_id": issue.id, "attempts": attempts }),
                    );
                    info!(issue_id = %issue.id, attempts, "circuit breaker open, leaving closed");
                }
            }
        }
        Ok(RunVerdict::MaxStepsExhausted { steps: *steps })
    }

    /// Reopen one stuck closed issue, highest priority first. Returns
    /// whether a reopen happened.
    fn unstick_pass(&self, root_id: &str, run_id: &str) -> CoreResult<bool> {
        let subtree = self.issues.subtree(root_id)?;
        let mut open_children: HashMap<&str, u32> = HashMap::new();
        let mut child_counts: HashMap<&str, u32> = HashMap::new();
        for issue in &subtree {
            if let Some(parent) = issue.parent_id() {
                let total = child_counts.entry(parent).or_insert(0);
                *total = total.saturating_add(1);
                if issue.status != IssueStatus::Closed {
                    let open = open_children.entry(parent).or_insert(0);
                    *open = open.saturating_add(1);
                }
            }
        }

        let mut candidates: Vec<&Issue> = subtree
            .iter()
            .filter(|issue| {
                if issue.status != IssueStatus::Closed {
                    return false;
                }
                match issue.outcome {
                    Some(IssueOutcome::Failure) | Some(IssueOutcome::NeedsWork) => {
                        open_children.get(issue.id.as_str()).copied().unwrap_or(0) == 0
                    }
                    Some(IssueOutcome::Expanded) => {
                        child_counts.get(issue.id.as_str()).copied().unwrap_or(0) == 0
                    }
                    _ => false,
                }
            })
            .collect();
        candidates.sort_by_key(|i| (i.priority, i.created_at_ms));

        for candidate in candidates {
            let attempts = self.attempts_for(&candidate.id);
            if attempts >= MAX_ISSUE_ATTEMPTS {
                self.events.emit(
                    "dag.unstick.skipped",
                    "dag",
                    EventScope::issue_in_run(&candidate.id, run_id),
                    serde_json::json!({ "issue_id": candidate.id, "attempts": attempts }),
                );
                continue;
            }
            self.reopen_for_orchestration(&candidate.id, run_id, "unstick")?;
            return Ok(true);
        }
        Ok(false)
    }

    fn reopen_for_orchestration(&self, issue_id: &str, run_id: &str, via: &str) -> CoreResult<()> {
        let reopened = self.issues.reopen_for_orchestration(issue_id)?;
        self.forum.post(
            &format!("issue:{issue_id}"),
            &serde_json::json!({
                "kind": "reorchestrate",
                "issue_id": issue_id,
                "via": via,
                "attempts": self.attempts_for(issue_id),
            })
            .to_string(),
        )?;
        self.events.emit(
            "dag.unstick.reopen",
            "dag",
            EventScope::issue_in_run(issue_id, run_id),
            serde_json::json!({
                "issue_id": issue_id,
                "via": via,
                "priority": reopened.priority,
            }),
        );
        Ok(())
    }

    /// No ready leaf: run one diagnostic backend step against the root.
    async fn repair_pass(
        &self,
        root_id: &str,
        run_id: &str,
        steps: &mut u32,
    ) -> CoreResult<()> {
        let subtree = self.issues.subtree(root_id)?;
        let open = subtree.iter().filter(|i| i.status == IssueStatus::Open).count();
        let in_progress = subtree
            .iter()
            .filter(|i| i.status == IssueStatus::InProgress)
            .count();
        let closed = subtree.iter().filter(|i| i.status == IssueStatus::Closed).count();

        let step_no = steps.saturating_add(1);
        let request = StepRequest {
            root_id: root_id.to_owned(),
            issue_id: root_id.to_owned(),
            run_id: run_id.to_owned(),
            step: step_no,
            attempt: 1,
            user_prompt: format!(
                "Repair stuck DAG: no ready agent leaves under {root_id}.\n\n\
                 Subtree state: {open} open, {in_progress} in progress, {closed} closed.\n\
                 Diagnose why no leaf is ready and either expand an issue or unblock a dependency."
            ),
            system_prompt: "You are the orchestrator for a stuck issue graph. \
                            Restructure it so agent work can continue."
                .to_owned(),
            log_path: self.paths.step_log_path(root_id, root_id, Some("unstick")),
        };

        self.events.emit(
            "dag.step.start",
            "dag",
            EventScope::issue_in_run(root_id, run_id),
            serde_json::json!({ "issue_id": root_id, "step": step_no, "repair": true }),
        );
        let output = self.execute_backend(&request).await?;
        let record = serde_json::json!({
            "step": step_no,
            "issue_id": root_id,
            "repair": true,
            "exit_code": output.exit_code,
            "elapsed_ms": output.elapsed_ms,
        });
        self.forum
            .post(&format!("issue:{root_id}"), &record.to_string())?;
        self.events.emit(
            "dag.step.end",
            "dag",
            EventScope::issue_in_run(root_id, run_id),
            record,
        );
        *steps = step_no;
        Ok(())
    }

    async fn execute_backend(&self, request: &StepRequest) -> CoreResult<StepOutput> {
        self.events.emit(
            "backend.run.start",
            "backend",
            EventScope::issue_in_run(&request.issue_id, &request.run_id),
            serde_json::json!({
                "issue_id": request.issue_id,
                "step": request.step,
                "log_path": request.log_path.display().to_string(),
            }),
        );
        let started = self.clock.now_ms();
        let result = self.executor.execute_step(request).await;
        let elapsed_ms = self.clock.now_ms().saturating_sub(started);
        match result {
            Ok(output) => {
                self.events.emit(
                    "backend.run.end",
                    "backend",
                    EventScope::issue_in_run(&request.issue_id, &request.run_id),
                    serde_json::json!({
                        "issue_id": request.issue_id,
                        "exit_code": output.exit_code,
                        "elapsed_ms": output.elapsed_ms,
                    }),
                );
                Ok(output)
            }
            Err(e) => {
                self.events.emit(
                    "backend.run.end",
                    "backend",
                    EventScope::issue_in_run(&request.issue_id, &request.run_id),
                    serde_json::json!({
                        "issue_id": request.issue_id,
                        "error": e.to_string(),
                        "elapsed_ms": elapsed_ms,
                    }),
                );
                Err(e)
            }
        }
    }

    fn render_user_prompt(
        &self,
        issue: &Issue,
        root_id: &str,
        run_id: &str,
        step: u32,
        attempt: u32,
    ) -> String {
        let mut prompt = format!("# {}\n\n{}\n\n## Mu Run Context\n", issue.title, issue.body);
        prompt.push_str(&format!("- root: {root_id}\n"));
        prompt.push_str(&format!("- issue: {}\n", issue.id));
        prompt.push_str(&format!("- step: {step}\n"));
        prompt.push_str(&format!("- run_id: {run_id}\n"));
        prompt.push_str(&format!("- model: {}\n", self.executor.model_id()));
        if attempt > 1 {
            prompt.push_str(&format!(
                "- attempt: {attempt}; earlier attempts are recorded in forum topic \
                 issue:{}; review them before retrying.\n",
                issue.id
            ));
        }
        prompt
    }

    fn bump_attempt(&self, issue_id: &str) -> u32 {
        let mut attempts = self.lock_attempts();
        let entry = attempts.entry(issue_id.to_owned()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    fn lock_attempts(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        match self.attempts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn render_system_prompt(issue: &Issue) -> String {
    if issue.tags.contains("role:orchestrator") {
        "You are the orchestrator. Review the issue, its children, and its \
         forum history; expand or restructure work so the run can finish."
            .to_owned()
    } else {
        "You are an agent working one issue of a run. Do the work the issue \
         describes and close it with an outcome."
            .to_owned()
    }
}

impl std::fmt::Debug for DagRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagRunner").finish_non_exhaustive()
    }
}
