//! Process-backed agent executors.
//!
//! The server shells out for both seams: [`ProcessRunExecutor`] runs one
//! DAG step, [`ProcessCommandBackend`] runs one terminal command. Each
//! invocation receives the rendered prompt on stdin and is judged by its
//! exit code; combined output is teed to the step log.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::dag::{RunExecutor, StepOutput, StepRequest};
use crate::error::{CoreError, CoreResult};
use crate::pipeline::{CommandBackend, TurnRequest, TurnResult, TurnResultKind};

/// Cap on captured output persisted per invocation.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

async fn run_shell(cmd: &str, stdin_text: &str) -> CoreResult<(i32, String)> {
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CoreError::Internal(format!("failed to spawn backend: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(stdin_text.as_bytes()).await {
            warn!(error = %e, "failed to write prompt to backend stdin");
        }
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| CoreError::Internal(format!("backend wait failed: {e}")))?;
    let exit_code = output.status.code().unwrap_or(-1);
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined.truncate(MAX_CAPTURED_OUTPUT);
    Ok((exit_code, combined))
}

fn tee_log(path: &Path, record: &serde_json::Value) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %path.display(), error = %e, "failed to create log directory");
            return;
        }
    }
    let mut line = record.to_string();
    line.push('\n');
    if let Err(e) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()))
    {
        warn!(path = %path.display(), error = %e, "failed to append step log");
    }
}

/// Runs DAG steps through a configured shell command.
pub struct ProcessRunExecutor {
    cmd: String,
    clock: Arc<dyn Clock>,
}

impl ProcessRunExecutor {
    /// Create an executor running `cmd` per step.
    pub fn new(cmd: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cmd: cmd.into(),
            clock,
        }
    }
}

#[async_trait]
impl RunExecutor for ProcessRunExecutor {
    async fn execute_step(&self, request: &StepRequest) -> CoreResult<StepOutput> {
        debug!(issue_id = %request.issue_id, step = request.step, "executing backend step");
        let started = self.clock.now_ms();
        let prompt = format!("{}\n\n{}", request.system_prompt, request.user_prompt);
        let (exit_code, output) = run_shell(&self.cmd, &prompt).await?;
        let elapsed_ms = self.clock.now_ms().saturating_sub(started);

        tee_log(
            &request.log_path,
            &serde_json::json!({
                "ts_ms": self.clock.now_ms(),
                "run_id": request.run_id,
                "issue_id": request.issue_id,
                "step": request.step,
                "attempt": request.attempt,
                "exit_code": exit_code,
                "elapsed_ms": elapsed_ms,
                "output": output,
            }),
        );
        Ok(StepOutput {
            exit_code,
            elapsed_ms,
        })
    }

    fn model_id(&self) -> String {
        self.cmd.clone()
    }
}

/// Placeholder executor for servers with no `backend.run_cmd`. Every step
/// fails the run with a precondition error.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredRunExecutor;

#[async_trait]
impl RunExecutor for UnconfiguredRunExecutor {
    async fn execute_step(&self, _request: &StepRequest) -> CoreResult<StepOutput> {
        Err(CoreError::PreconditionFailed(
            "backend.run_cmd not configured".to_owned(),
        ))
    }

    fn model_id(&self) -> String {
        "unconfigured".to_owned()
    }
}

/// Runs terminal commands through a configured shell command.
pub struct ProcessCommandBackend {
    cmd: String,
}

impl ProcessCommandBackend {
    /// Create a backend running `cmd` per terminal command.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

#[async_trait]
impl CommandBackend for ProcessCommandBackend {
    async fn execute(&self, request: &TurnRequest) -> CoreResult<TurnResult> {
        let (exit_code, output) = run_shell(&self.cmd, &request.command_text).await?;
        let kind = if exit_code == 0 {
            TurnResultKind::Completed
        } else {
            TurnResultKind::Rejected
        };
        Ok(TurnResult {
            kind,
            message: (!output.trim().is_empty()).then(|| output.trim().to_owned()),
            command_id: None,
        })
    }
}
