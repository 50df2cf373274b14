//! Persistent wake program registries.
//!
//! Heartbeat programs fire on a fixed interval (or on demand); cron
//! programs fire on `at`/`every`/`cron` schedules. Both persist to JSONL
//! under `.mu/` and hand due wakes to the wake orchestrator through
//! [`WakeDispatcher`].

pub mod cron;
pub mod heartbeat;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which registry produced a wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeSource {
    /// Heartbeat program registry.
    HeartbeatProgram,
    /// Cron program registry.
    CronProgram,
}

impl WakeSource {
    /// Snake-case wire name (`heartbeat_program` / `cron_program`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatProgram => "heartbeat_program",
            Self::CronProgram => "cron_program",
        }
    }

    /// Dedupe-key prefix (`heartbeat-program` / `cron-program`).
    pub fn dedupe_prefix(self) -> &'static str {
        match self {
            Self::HeartbeatProgram => "heartbeat-program",
            Self::CronProgram => "cron-program",
        }
    }
}

/// Result of the last dispatch recorded on a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastResult {
    /// The wake dispatched.
    Ok,
    /// The wake collapsed into a recent one.
    Coalesced,
    /// Dispatch failed.
    Failed,
}

impl LastResult {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Coalesced => "coalesced",
            Self::Failed => "failed",
        }
    }
}

/// Orchestrator verdict for one dispatched wake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Wake went through (turn submitted and/or fan-out queued).
    Ok,
    /// Wake collapsed into a recent wake for the same dedupe key.
    Coalesced {
        /// Coalescing reason, normally `coalesced`.
        reason: String,
    },
    /// Wake could not be dispatched.
    Failed {
        /// Failure reason (e.g. `control_plane_unavailable`).
        reason: String,
    },
}

/// A due wake handed from a registry to the orchestrator.
#[derive(Debug, Clone)]
pub struct WakeRequest {
    /// Producing registry.
    pub source: WakeSource,
    /// Program that fired.
    pub program_id: String,
    /// Program title.
    pub title: String,
    /// Optional operator prompt attached to the program.
    pub prompt: Option<String>,
    /// Wake reason recorded on the program (or the manual trigger reason).
    pub reason: String,
    /// Program metadata, forwarded to channel adapters.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Full program snapshot for telemetry.
    pub program_snapshot: serde_json::Value,
}

/// Sink for due wakes; implemented by the wake orchestrator.
#[async_trait]
pub trait WakeDispatcher: Send + Sync {
    /// Dispatch one wake, returning how it resolved.
    async fn dispatch(&self, wake: WakeRequest) -> DispatchOutcome;
}
