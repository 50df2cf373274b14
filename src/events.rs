//! Append-only structured telemetry sink.
//!
//! Every wake, delivery, and DAG step decision lands here as one JSON
//! record per line in `.mu/events.jsonl`. The log is the single audit
//! trail for the scheduling core; it is never read back for control flow.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::Clock;
use crate::error::CoreResult;
use crate::store::JsonlStore;

/// One telemetry record as persisted to `events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Record schema version, currently always 1.
    pub v: u8,
    /// Emission time, epoch milliseconds.
    pub ts_ms: i64,
    /// Event type, e.g. `operator.wake.decision` or `dag.step.end`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Emitting component, e.g. `wake` or `dag`.
    pub source: String,
    /// Issue the event concerns, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    /// Run the event concerns, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Event-type-specific payload.
    pub payload: serde_json::Value,
}

/// Optional issue/run correlation attached to an emission.
#[derive(Debug, Clone, Default)]
pub struct EventScope {
    /// Issue correlation.
    pub issue_id: Option<String>,
    /// Run correlation.
    pub run_id: Option<String>,
}

impl EventScope {
    /// No correlation.
    pub fn none() -> Self {
        Self::default()
    }

    /// Correlate with an issue.
    pub fn issue(issue_id: impl Into<String>) -> Self {
        Self {
            issue_id: Some(issue_id.into()),
            run_id: None,
        }
    }

    /// Correlate with a run.
    pub fn run(run_id: impl Into<String>) -> Self {
        Self {
            issue_id: None,
            run_id: Some(run_id.into()),
        }
    }

    /// Correlate with both an issue and a run.
    pub fn issue_in_run(issue_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            issue_id: Some(issue_id.into()),
            run_id: Some(run_id.into()),
        }
    }
}

/// Filters for event retrieval (`GET /api/events`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    /// Exact event type match.
    #[serde(default, alias = "type")]
    pub event_type: Option<String>,
    /// Exact issue correlation match.
    pub issue_id: Option<String>,
    /// Exact run correlation match.
    pub run_id: Option<String>,
    /// Substring match against the serialized record.
    pub contains: Option<String>,
    /// Maximum records returned, capped at 500.
    pub limit: Option<usize>,
    /// Return the newest matches instead of the oldest.
    #[serde(default)]
    pub tail: bool,
}

/// Upper bound on records returned by a single query.
const MAX_QUERY_LIMIT: usize = 500;

/// Append-only event log.
pub struct EventLog {
    store: JsonlStore,
    clock: Arc<dyn Clock>,
    emitted: AtomicU64,
}

impl EventLog {
    /// Create an event log writing to `path`.
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: JsonlStore::new(path),
            clock,
            emitted: AtomicU64::new(0),
        }
    }

    /// Append one event. Failures are logged and swallowed so telemetry can
    /// never take down the operation being audited.
    pub fn emit(
        &self,
        event_type: &str,
        source: &str,
        scope: EventScope,
        payload: serde_json::Value,
    ) {
        let record = EventRecord {
            v: 1,
            ts_ms: self.clock.now_ms(),
            event_type: event_type.to_owned(),
            source: source.to_owned(),
            issue_id: scope.issue_id,
            run_id: scope.run_id,
            payload,
        };
        if let Err(e) = self.store.append(&record) {
            warn!(event_type, error = %e, "failed to append event record");
            return;
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of events emitted by this process.
    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Read events matching `filter`, oldest first (newest first with
    /// `tail`).
    pub fn query(&self, filter: &EventFilter) -> CoreResult<Vec<EventRecord>> {
        let records: Vec<EventRecord> = self.store.read_all()?;
        let limit = filter.limit.unwrap_or(MAX_QUERY_LIMIT).min(MAX_QUERY_LIMIT);

        let mut matched: Vec<EventRecord> = records
            .into_iter()
            .filter(|r| {
                if let Some(t) = &filter.event_type {
                    if &r.event_type != t {
                        return false;
                    }
                }
                if let Some(i) = &filter.issue_id {
                    if r.issue_id.as_deref() != Some(i.as_str()) {
                        return false;
                    }
                }
                if let Some(j) = &filter.run_id {
                    if r.run_id.as_deref() != Some(j.as_str()) {
                        return false;
                    }
                }
                if let Some(needle) = &filter.contains {
                    let serialized = serde_json::to_string(r).unwrap_or_default();
                    if !serialized.contains(needle.as_str()) {
                        return false;
                    }
                }
                true
            })
            .collect();

        if filter.tail {
            let keep = matched.len().saturating_sub(limit);
            matched.drain(..keep);
        } else {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.store.path())
            .finish_non_exhaustive()
    }
}
