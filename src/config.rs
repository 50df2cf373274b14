//! Server configuration and runtime path resolution.
//!
//! Config lives at `<repo_root>/.mu/config.toml`. A missing file yields the
//! defaults; `POST /api/config` patches the in-memory config and persists
//! the merged result back to the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Whether a wake dispatches an autonomous turn or only notifies channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeTurnMode {
    /// Notify linked identities only.
    Passive,
    /// Submit an autonomous turn through the command pipeline.
    Active,
}

impl WakeTurnMode {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passive => "passive",
            Self::Active => "active",
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Operator wake behavior.
    #[serde(default)]
    pub operator: OperatorConfig,

    /// Activity scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Outbox delivery tuning.
    #[serde(default)]
    pub outbox: OutboxConfig,

    /// Run lifecycle settings.
    #[serde(default)]
    pub runs: RunsConfig,

    /// Agent backend wiring.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Per-channel adapter settings, keyed by channel name.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

/// Agent backend wiring. Both commands run through `sh -c` with the prompt
/// on stdin; absence disables the corresponding seam.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Command executing one DAG step.
    #[serde(default)]
    pub run_cmd: Option<String>,

    /// Command executing one terminal command (the pipeline seam). Absent
    /// means active wake turns fall back with `control_plane_unavailable`.
    #[serde(default)]
    pub command_cmd: Option<String>,
}

/// Operator wake behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Passive (notify only) or active (autonomous turn) wakes.
    #[serde(default = "default_wake_turn_mode")]
    pub wake_turn_mode: WakeTurnMode,

    /// Window within which wakes for one dedupe key collapse to one effect.
    #[serde(default = "default_wake_coalesce_window_ms")]
    pub wake_coalesce_window_ms: i64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            wake_turn_mode: default_wake_turn_mode(),
            wake_coalesce_window_ms: default_wake_coalesce_window_ms(),
        }
    }
}

/// Activity scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between a wake request and its flush, absorbing bursts.
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: i64,

    /// Cooldown before a failed tick is retried.
    #[serde(default = "default_retry_cooldown_ms")]
    pub retry_cooldown_ms: i64,

    /// Lower bound applied to the retry cooldown.
    #[serde(default = "default_min_retry_cooldown_ms")]
    pub min_retry_cooldown_ms: i64,

    /// Lower bound applied to periodic activity intervals.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            coalesce_ms: default_coalesce_ms(),
            retry_cooldown_ms: default_retry_cooldown_ms(),
            min_retry_cooldown_ms: default_min_retry_cooldown_ms(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

/// Outbox delivery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Delivery attempts before an envelope dead-letters.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry backoff; doubles per attempt.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: i64,

    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: i64,

    /// Per-attempt driver timeout.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: i64,

    /// Wall-clock ceiling per envelope; older envelopes dead-letter.
    #[serde(default = "default_envelope_ttl_ms")]
    pub envelope_ttl_ms: i64,

    /// Worker poll cadence for due envelopes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: i64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            envelope_ttl_ms: default_envelope_ttl_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Run lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Default step budget for a run.
    #[serde(default = "default_max_steps")]
    pub default_max_steps: u32,

    /// Interval for auto-registered run heartbeat programs.
    #[serde(default = "default_auto_heartbeat_every_ms")]
    pub auto_run_heartbeat_every_ms: i64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            default_max_steps: default_max_steps(),
            auto_run_heartbeat_every_ms: default_auto_heartbeat_every_ms(),
        }
    }
}

/// Per-channel adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Shared secret expected on webhook ingress and sent on delivery.
    pub secret: String,

    /// Header carrying the shared secret.
    #[serde(default = "default_secret_header")]
    pub secret_header: String,

    /// Adapter endpoint that receives outbox envelopes. Channels without a
    /// delivery URL are listed as configured but skipped at fan-out.
    #[serde(default)]
    pub delivery_url: Option<String>,

    /// Whether the channel participates in ingress and fan-out.
    #[serde(default = "default_true")]
    pub active: bool,
}

// Default value functions for serde

fn default_wake_turn_mode() -> WakeTurnMode {
    WakeTurnMode::Passive
}
fn default_wake_coalesce_window_ms() -> i64 {
    60_000
}
fn default_coalesce_ms() -> i64 {
    250
}
fn default_retry_cooldown_ms() -> i64 {
    1_000
}
fn default_min_retry_cooldown_ms() -> i64 {
    100
}
fn default_min_interval_ms() -> i64 {
    2_000
}
fn default_max_attempts() -> u32 {
    6
}
fn default_base_backoff_ms() -> i64 {
    500
}
fn default_max_backoff_ms() -> i64 {
    60_000
}
fn default_attempt_timeout_ms() -> i64 {
    10_000
}
fn default_envelope_ttl_ms() -> i64 {
    3_600_000
}
fn default_poll_interval_ms() -> i64 {
    250
}
fn default_max_steps() -> u32 {
    20
}
fn default_auto_heartbeat_every_ms() -> i64 {
    300_000
}
fn default_secret_header() -> String {
    "x-mu-adapter-secret".to_owned()
}
fn default_true() -> bool {
    true
}

/// Resolved paths under `<repo_root>/.mu/`.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Workspace root the server was started in.
    pub repo_root: PathBuf,
    /// `.mu` state directory.
    pub mu_dir: PathBuf,
    /// Server config file.
    pub config_toml: PathBuf,
    /// Issue graph store.
    pub issues_jsonl: PathBuf,
    /// Forum log.
    pub forum_jsonl: PathBuf,
    /// Telemetry event log.
    pub events_jsonl: PathBuf,
    /// Heartbeat program registry.
    pub heartbeats_jsonl: PathBuf,
    /// Cron program registry.
    pub cron_jsonl: PathBuf,
    /// Control-plane runtime directory.
    pub control_plane_dir: PathBuf,
    /// Server discovery record.
    pub server_json: PathBuf,
    /// Outbox envelope store.
    pub outbox_jsonl: PathBuf,
    /// Adapter ingress audit log.
    pub adapter_audit_jsonl: PathBuf,
    /// Identity binding store.
    pub identities_jsonl: PathBuf,
    /// Last-seen conversation/actor context per channel conversation.
    pub operator_conversations_json: PathBuf,
    /// Per-run step tee logs root.
    pub run_logs_dir: PathBuf,
    /// Server log files (tracing appender output).
    pub server_logs_dir: PathBuf,
}

impl RuntimePaths {
    /// Resolve all paths for a workspace root.
    pub fn resolve(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let mu_dir = repo_root.join(".mu");
        let control_plane_dir = mu_dir.join("control-plane");
        Self {
            config_toml: mu_dir.join("config.toml"),
            issues_jsonl: mu_dir.join("issues.jsonl"),
            forum_jsonl: mu_dir.join("forum.jsonl"),
            events_jsonl: mu_dir.join("events.jsonl"),
            heartbeats_jsonl: mu_dir.join("heartbeats.jsonl"),
            cron_jsonl: mu_dir.join("cron.jsonl"),
            server_json: control_plane_dir.join("server.json"),
            outbox_jsonl: control_plane_dir.join("outbox.jsonl"),
            adapter_audit_jsonl: control_plane_dir.join("adapter_audit.jsonl"),
            identities_jsonl: control_plane_dir.join("identities.jsonl"),
            operator_conversations_json: control_plane_dir.join("operator_conversations.json"),
            run_logs_dir: mu_dir.join("logs"),
            server_logs_dir: mu_dir.join("logs").join("server"),
            control_plane_dir,
            mu_dir,
            repo_root,
        }
    }

    /// Tee log path for one DAG step:
    /// `.mu/logs/<root_id>/<issue_id>[.suffix].jsonl`.
    pub fn step_log_path(&self, root_id: &str, issue_id: &str, suffix: Option<&str>) -> PathBuf {
        let file = match suffix {
            Some(s) => format!("{issue_id}.{s}.jsonl"),
            None => format!("{issue_id}.jsonl"),
        };
        self.run_logs_dir.join(root_id).join(file)
    }
}

/// Load config from a TOML file. A missing file yields the defaults.
///
/// # Errors
///
/// Returns a validation error when the file exists but cannot be parsed.
pub fn load_config(path: &Path) -> CoreResult<ServerConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ServerConfig::default())
        }
        Err(e) => {
            return Err(CoreError::Internal(format!(
                "failed to read config at {}: {e}",
                path.display()
            )))
        }
    };
    toml::from_str(&contents).map_err(|e| {
        CoreError::Validation(format!("failed to parse config at {}: {e}", path.display()))
    })
}

/// Persist config back to its TOML file.
///
/// # Errors
///
/// Returns an error when the file cannot be serialized or written.
pub fn save_config(path: &Path, config: &ServerConfig) -> CoreResult<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| CoreError::Internal(format!("failed to serialize config: {e}")))?;
    crate::store::ensure_parent_dir(path)?;
    std::fs::write(path, contents).map_err(|e| {
        CoreError::Internal(format!("failed to write config at {}: {e}", path.display()))
    })?;
    Ok(())
}

/// Apply a JSON merge patch to `config`.
///
/// Object values merge recursively; any other value replaces. Unknown or
/// ill-typed fields reject the whole patch.
///
/// # Errors
///
/// Returns a validation error when the patch is not an object or the merged
/// document no longer deserializes.
pub fn apply_patch(config: &ServerConfig, patch: &serde_json::Value) -> CoreResult<ServerConfig> {
    if !patch.is_object() {
        return Err(CoreError::Validation(
            "config patch must be an object".to_owned(),
        ));
    }
    let mut current = serde_json::to_value(config)?;
    merge_value(&mut current, patch);
    serde_json::from_value(current)
        .map_err(|e| CoreError::Validation(format!("invalid config patch: {e}")))
}

fn merge_value(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_contract_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.operator.wake_turn_mode, WakeTurnMode::Passive);
        assert_eq!(cfg.operator.wake_coalesce_window_ms, 60_000);
        assert_eq!(cfg.scheduler.coalesce_ms, 250);
        assert_eq!(cfg.scheduler.retry_cooldown_ms, 1_000);
        assert_eq!(cfg.scheduler.min_interval_ms, 2_000);
        assert_eq!(cfg.outbox.max_attempts, 6);
        assert_eq!(cfg.outbox.max_backoff_ms, 60_000);
        assert_eq!(cfg.runs.default_max_steps, 20);
    }

    #[test]
    fn patch_merges_nested_fields() {
        let cfg = ServerConfig::default();
        let patch = serde_json::json!({
            "operator": { "wake_turn_mode": "active" }
        });
        let merged = apply_patch(&cfg, &patch).expect("patch");
        assert_eq!(merged.operator.wake_turn_mode, WakeTurnMode::Active);
        // Untouched siblings keep their values.
        assert_eq!(merged.operator.wake_coalesce_window_ms, 60_000);
    }

    #[test]
    fn patch_rejects_bad_values() {
        let cfg = ServerConfig::default();
        let patch = serde_json::json!({
            "operator": { "wake_turn_mode": "sideways" }
        });
        assert!(apply_patch(&cfg, &patch).is_err());
    }

    #[test]
    fn missing_config_file_is_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&dir.path().join("config.toml")).expect("load");
        assert_eq!(cfg.scheduler.coalesce_ms, 250);
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut cfg = ServerConfig::default();
        cfg.operator.wake_turn_mode = WakeTurnMode::Active;
        save_config(&path, &cfg).expect("save");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded.operator.wake_turn_mode, WakeTurnMode::Active);
    }

    #[test]
    fn step_log_path_suffix() {
        let paths = RuntimePaths::resolve("/tmp/w");
        let p = paths.step_log_path("is-aaa", "is-bbb", Some("attempt-2"));
        assert!(p.ends_with(".mu/logs/is-aaa/is-bbb.attempt-2.jsonl"));
        let p = paths.step_log_path("is-aaa", "is-bbb", None);
        assert!(p.ends_with(".mu/logs/is-aaa/is-bbb.jsonl"));
    }
}
