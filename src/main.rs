//! mu CLI entry point.
//!
//! `mu serve` runs the control-plane server in the current workspace;
//! every other subcommand is a thin client of the local HTTP API,
//! discovered through `.mu/control-plane/server.json`. Exit codes:
//! 0 success, 1 generic failure, 2 validation, 3 not found,
//! 4 precondition failed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use mu::backend::{ProcessCommandBackend, ProcessRunExecutor, UnconfiguredRunExecutor};
use mu::clock::SystemClock;
use mu::config::RuntimePaths;
use mu::dag::RunExecutor;
use mu::pipeline::CommandBackend;

/// mu — local control-plane server for an autonomous operator workspace.
#[derive(Parser)]
#[command(name = "mu", version, about)]
struct Cli {
    /// Workspace root holding the `.mu` state directory.
    #[arg(long, global = true, default_value = ".")]
    repo_root: PathBuf,

    /// Emit JSON instead of compact text.
    #[arg(long, global = true)]
    json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the control-plane server.
    Serve {
        /// Port to bind; 0 picks an ephemeral port.
        #[arg(long, default_value_t = 0)]
        port: u16,
    },
    /// Show server status.
    Status,
    /// Heartbeat program operations.
    Heartbeat {
        #[command(subcommand)]
        command: HeartbeatCommand,
    },
    /// Cron program operations.
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
    /// Run lifecycle operations.
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    /// Issue operations.
    Issues {
        #[command(subcommand)]
        command: IssuesCommand,
    },
    /// Telemetry retrieval.
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
}

#[derive(Subcommand)]
enum HeartbeatCommand {
    /// List programs.
    List {
        /// Only enabled (true) or disabled (false) programs.
        #[arg(long)]
        enabled: Option<bool>,
    },
    /// Show one program.
    Get {
        /// Program id.
        program_id: String,
    },
    /// Create a program.
    Create {
        /// Title.
        #[arg(long)]
        title: String,
        /// Optional prompt delivered with each wake.
        #[arg(long)]
        prompt: Option<String>,
        /// Interval in ms; 0 means event-driven only.
        #[arg(long, default_value_t = 0)]
        every_ms: i64,
        /// Wake reason.
        #[arg(long)]
        reason: Option<String>,
        /// Create disabled.
        #[arg(long)]
        disabled: bool,
    },
    /// Update a program.
    Update {
        /// Program id.
        program_id: String,
        /// New title.
        #[arg(long)]
        title: Option<String>,
        /// New prompt.
        #[arg(long)]
        prompt: Option<String>,
        /// New interval in ms.
        #[arg(long)]
        every_ms: Option<i64>,
        /// Enable or disable.
        #[arg(long)]
        enabled: Option<bool>,
    },
    /// Remove a program.
    Remove {
        /// Program id.
        program_id: String,
    },
    /// Trigger a program now.
    Trigger {
        /// Program id.
        program_id: String,
        /// Trigger reason.
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum CronCommand {
    /// List programs.
    List {
        /// Only enabled (true) or disabled (false) programs.
        #[arg(long)]
        enabled: Option<bool>,
    },
    /// Show one program.
    Get {
        /// Program id.
        program_id: String,
    },
    /// Create a program. Exactly one of --at-ms / --every-ms / --cron.
    Create {
        /// Title.
        #[arg(long)]
        title: String,
        /// Optional prompt delivered with each wake.
        #[arg(long)]
        prompt: Option<String>,
        /// Fire once at this epoch-ms.
        #[arg(long, conflicts_with_all = ["every_ms", "cron"])]
        at_ms: Option<i64>,
        /// Fire on a fixed grid of this period in ms.
        #[arg(long, conflicts_with = "cron")]
        every_ms: Option<i64>,
        /// Grid anchor in epoch-ms (with --every-ms).
        #[arg(long, requires = "every_ms")]
        anchor_ms: Option<i64>,
        /// 5-field cron expression.
        #[arg(long)]
        cron: Option<String>,
        /// IANA zone for --cron; defaults to UTC.
        #[arg(long, requires = "cron")]
        tz: Option<String>,
        /// Wake reason.
        #[arg(long)]
        reason: Option<String>,
    },
    /// Enable or disable a program.
    Update {
        /// Program id.
        program_id: String,
        /// Enable or disable.
        #[arg(long)]
        enabled: Option<bool>,
        /// New title.
        #[arg(long)]
        title: Option<String>,
    },
    /// Remove a program.
    Remove {
        /// Program id.
        program_id: String,
    },
    /// Trigger a program now.
    Trigger {
        /// Program id.
        program_id: String,
        /// Trigger reason.
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    /// Start a run.
    Start {
        /// Root issue id.
        #[arg(long)]
        root: String,
        /// Step budget.
        #[arg(long)]
        max_steps: Option<u32>,
        /// Optional operator prompt.
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Resume a finished or interrupted run.
    Resume {
        /// Job id.
        job_id: String,
    },
    /// Interrupt a running run.
    Interrupt {
        /// Job id.
        job_id: String,
    },
    /// List runs.
    List,
    /// Show one run.
    Get {
        /// Job id.
        job_id: String,
    },
    /// Show a run's telemetry trail.
    Trace {
        /// Job id.
        job_id: String,
    },
}

#[derive(Subcommand)]
enum IssuesCommand {
    /// List issues.
    List,
    /// Create an issue.
    Create {
        /// Title.
        #[arg(long)]
        title: String,
        /// Body text.
        #[arg(long, default_value = "")]
        body: String,
        /// Parent issue id.
        #[arg(long)]
        parent: Option<String>,
        /// Tags (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Priority 1..5.
        #[arg(long)]
        priority: Option<u8>,
    },
}

#[derive(Subcommand)]
enum EventsCommand {
    /// List events with filters.
    List {
        /// Exact event type.
        #[arg(long = "type")]
        event_type: Option<String>,
        /// Issue correlation.
        #[arg(long)]
        issue_id: Option<String>,
        /// Run correlation.
        #[arg(long)]
        run_id: Option<String>,
        /// Substring match.
        #[arg(long)]
        contains: Option<String>,
        /// Maximum records.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show the newest events.
    Tail {
        /// Maximum records.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port } => serve(cli.repo_root, port).await,
        command => {
            mu::logging::init_cli();
            let client = Client::discover(&cli.repo_root, cli.json)?;
            client.dispatch(command).await;
            Ok(())
        }
    }
}

/// Run the control-plane server until the process is terminated.
async fn serve(repo_root: PathBuf, port: u16) -> anyhow::Result<()> {
    let repo_root = repo_root
        .canonicalize()
        .with_context(|| format!("workspace root {} not found", repo_root.display()))?;
    let paths = RuntimePaths::resolve(&repo_root);
    let _logging_guard = mu::logging::init_server(&paths.server_logs_dir)?;

    let config = mu::config::load_config(&paths.config_toml)
        .with_context(|| format!("failed to load {}", paths.config_toml.display()))?;
    let clock = Arc::new(SystemClock);

    let executor: Arc<dyn RunExecutor> = match &config.backend.run_cmd {
        Some(cmd) => Arc::new(ProcessRunExecutor::new(cmd.clone(), clock.clone())),
        None => Arc::new(UnconfiguredRunExecutor),
    };
    let backend: Option<Arc<dyn CommandBackend>> = config
        .backend
        .command_cmd
        .as_ref()
        .map(|cmd| Arc::new(ProcessCommandBackend::new(cmd.clone())) as Arc<dyn CommandBackend>);

    let context = mu::server::build_context(&repo_root, executor, backend)
        .map_err(|e| anyhow::anyhow!("failed to assemble control plane: {e}"))?;
    info!(repo_root = %repo_root.display(), "control plane assembled");

    let result = mu::server::serve(context.clone(), port).await;
    context.stop();
    result.map_err(|e| anyhow::anyhow!("server exited: {e}"))
}

/// Thin HTTP client over the discovered local server.
struct Client {
    base: String,
    http: reqwest::Client,
    json: bool,
}

impl Client {
    /// Read `.mu/control-plane/server.json` and build a client.
    fn discover(repo_root: &std::path::Path, json: bool) -> anyhow::Result<Self> {
        let paths = RuntimePaths::resolve(repo_root);
        let raw = std::fs::read_to_string(&paths.server_json).with_context(|| {
            format!(
                "no server discovery record at {} (is `mu serve` running?)",
                paths.server_json.display()
            )
        })?;
        let discovery: serde_json::Value =
            serde_json::from_str(&raw).context("malformed server.json")?;
        let base = discovery
            .get("url")
            .and_then(|u| u.as_str())
            .context("server.json has no url")?
            .to_owned();
        Ok(Self {
            base,
            http: reqwest::Client::new(),
            json,
        })
    }

    async fn dispatch(&self, command: Command) {
        match command {
            Command::Serve { .. } => unreachable!("serve handled in main"),
            Command::Status => self.get("/api/status", &[]).await,
            Command::Heartbeat { command } => self.dispatch_heartbeat(command).await,
            Command::Cron { command } => self.dispatch_cron(command).await,
            Command::Runs { command } => self.dispatch_runs(command).await,
            Command::Issues { command } => self.dispatch_issues(command).await,
            Command::Events { command } => self.dispatch_events(command).await,
        }
    }

    async fn dispatch_heartbeat(&self, command: HeartbeatCommand) {
        match command {
            HeartbeatCommand::List { enabled } => {
                let mut query = Vec::new();
                if let Some(enabled) = enabled {
                    query.push(("enabled".to_owned(), enabled.to_string()));
                }
                self.get("/api/heartbeats", &query).await;
            }
            HeartbeatCommand::Get { program_id } => {
                self.get(&format!("/api/heartbeats/{program_id}"), &[]).await;
            }
            HeartbeatCommand::Create {
                title,
                prompt,
                every_ms,
                reason,
                disabled,
            } => {
                self.post(
                    "/api/heartbeats",
                    serde_json::json!({
                        "title": title,
                        "prompt": prompt,
                        "every_ms": every_ms,
                        "reason": reason,
                        "enabled": !disabled,
                    }),
                )
                .await;
            }
            HeartbeatCommand::Update {
                program_id,
                title,
                prompt,
                every_ms,
                enabled,
            } => {
                self.post(
                    &format!("/api/heartbeats/{program_id}"),
                    serde_json::json!({
                        "title": title,
                        "prompt": prompt,
                        "every_ms": every_ms,
                        "enabled": enabled,
                    }),
                )
                .await;
            }
            HeartbeatCommand::Remove { program_id } => {
                self.delete(&format!("/api/heartbeats/{program_id}")).await;
            }
            HeartbeatCommand::Trigger { program_id, reason } => {
                self.post(
                    &format!("/api/heartbeats/{program_id}/trigger"),
                    serde_json::json!({ "reason": reason }),
                )
                .await;
            }
        }
    }

    async fn dispatch_cron(&self, command: CronCommand) {
        match command {
            CronCommand::List { enabled } => {
                let mut query = Vec::new();
                if let Some(enabled) = enabled {
                    query.push(("enabled".to_owned(), enabled.to_string()));
                }
                self.get("/api/cron", &query).await;
            }
            CronCommand::Get { program_id } => {
                self.get(&format!("/api/cron/{program_id}"), &[]).await;
            }
            CronCommand::Create {
                title,
                prompt,
                at_ms,
                every_ms,
                anchor_ms,
                cron,
                tz,
                reason,
            } => {
                let schedule = if let Some(at_ms) = at_ms {
                    serde_json::json!({ "kind": "at", "at_ms": at_ms })
                } else if let Some(every_ms) = every_ms {
                    serde_json::json!({ "kind": "every", "every_ms": every_ms, "anchor_ms": anchor_ms })
                } else if let Some(expr) = cron {
                    serde_json::json!({
                        "kind": "cron",
                        "expr": expr,
                        "tz": tz.unwrap_or_else(|| "UTC".to_owned()),
                    })
                } else {
                    self.fail_validation(
                        "one of --at-ms, --every-ms, or --cron is required",
                        "mu cron create --title t --every-ms 60000",
                    );
                    return;
                };
                self.post(
                    "/api/cron",
                    serde_json::json!({
                        "title": title,
                        "prompt": prompt,
                        "schedule": schedule,
                        "reason": reason,
                    }),
                )
                .await;
            }
            CronCommand::Update {
                program_id,
                enabled,
                title,
            } => {
                self.post(
                    &format!("/api/cron/{program_id}"),
                    serde_json::json!({ "enabled": enabled, "title": title }),
                )
                .await;
            }
            CronCommand::Remove { program_id } => {
                self.delete(&format!("/api/cron/{program_id}")).await;
            }
            CronCommand::Trigger { program_id, reason } => {
                self.post(
                    &format!("/api/cron/{program_id}/trigger"),
                    serde_json::json!({ "reason": reason }),
                )
                .await;
            }
        }
    }

    async fn dispatch_runs(&self, command: RunsCommand) {
        match command {
            RunsCommand::Start {
                root,
                max_steps,
                prompt,
            } => {
                self.post(
                    "/api/control-plane/runs/start",
                    serde_json::json!({
                        "root_issue_id": root,
                        "max_steps": max_steps,
                        "prompt": prompt,
                    }),
                )
                .await;
            }
            RunsCommand::Resume { job_id } => {
                self.post(
                    "/api/control-plane/runs/resume",
                    serde_json::json!({ "job_id": job_id }),
                )
                .await;
            }
            RunsCommand::Interrupt { job_id } => {
                self.post(
                    "/api/control-plane/runs/interrupt",
                    serde_json::json!({ "job_id": job_id }),
                )
                .await;
            }
            RunsCommand::List => self.get("/api/control-plane/runs", &[]).await,
            RunsCommand::Get { job_id } => {
                self.get(&format!("/api/control-plane/runs/{job_id}"), &[]).await;
            }
            RunsCommand::Trace { job_id } => {
                self.get(&format!("/api/control-plane/runs/{job_id}/trace"), &[])
                    .await;
            }
        }
    }

    async fn dispatch_issues(&self, command: IssuesCommand) {
        match command {
            IssuesCommand::List => self.get("/api/issues", &[]).await,
            IssuesCommand::Create {
                title,
                body,
                parent,
                tags,
                priority,
            } => {
                self.post(
                    "/api/issues",
                    serde_json::json!({
                        "title": title,
                        "body": body,
                        "parent": parent,
                        "tags": tags,
                        "priority": priority,
                    }),
                )
                .await;
            }
        }
    }

    async fn dispatch_events(&self, command: EventsCommand) {
        match command {
            EventsCommand::List {
                event_type,
                issue_id,
                run_id,
                contains,
                limit,
            } => {
                let mut query = Vec::new();
                if let Some(t) = event_type {
                    query.push(("type".to_owned(), t));
                }
                if let Some(i) = issue_id {
                    query.push(("issue_id".to_owned(), i));
                }
                if let Some(r) = run_id {
                    query.push(("run_id".to_owned(), r));
                }
                if let Some(c) = contains {
                    query.push(("contains".to_owned(), c));
                }
                if let Some(l) = limit {
                    query.push(("limit".to_owned(), l.to_string()));
                }
                self.get("/api/events", &query).await;
            }
            EventsCommand::Tail { limit } => {
                let mut query = Vec::new();
                if let Some(l) = limit {
                    query.push(("limit".to_owned(), l.to_string()));
                }
                self.get("/api/events/tail", &query).await;
            }
        }
    }

    async fn get(&self, path: &str, query: &[(String, String)]) {
        let request = self.http.get(format!("{}{path}", self.base)).query(query);
        self.finish(request.send().await).await;
    }

    async fn post(&self, path: &str, body: serde_json::Value) {
        let request = self.http.post(format!("{}{path}", self.base)).json(&body);
        self.finish(request.send().await).await;
    }

    async fn delete(&self, path: &str) {
        let request = self.http.delete(format!("{}{path}", self.base));
        self.finish(request.send().await).await;
    }

    async fn finish(&self, response: Result<reqwest::Response, reqwest::Error>) {
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.render_error(&format!("request failed: {e}"), "mu status", 1);
                std::process::exit(1);
            }
        };
        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await.unwrap_or_default();

        if (200..300).contains(&status) {
            if self.json {
                println!("{}", serde_json::to_string(&body).unwrap_or_default());
            } else {
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            }
            return;
        }

        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request failed")
            .to_owned();
        let exit = match status {
            400 => 2,
            404 => 3,
            409 => 4,
            _ => 1,
        };
        self.render_error(&message, "mu status", exit);
        std::process::exit(exit);
    }

    fn fail_validation(&self, message: &str, recovery: &str) {
        self.render_error(message, recovery, 2);
        std::process::exit(2);
    }

    fn render_error(&self, message: &str, recovery: &str, _exit: i32) {
        if self.json {
            let body = serde_json::json!({
                "error": message,
                "recovery": [recovery],
            });
            eprintln!("{}", serde_json::to_string(&body).unwrap_or_default());
        } else {
            eprintln!("{message}\ntry: {recovery}");
        }
    }
}
