//! Issue graph store and forum log.
//!
//! Exposes exactly the read/claim surface the DAG runner consumes: subtree
//! scans, ready-leaf selection with dependency checks, claim, close, and
//! reopen-for-orchestration. Issues persist to `.mu/issues.jsonl`; the
//! forum is an append-only log of step records and reorchestrate messages
//! in `.mu/forum.jsonl`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::ids;
use crate::store::JsonlStore;

/// Dep type linking an issue to its parent in the graph.
pub const DEP_PARENT: &str = "parent";
/// Dep type gating an issue on another issue closing.
pub const DEP_BLOCKED_BY: &str = "blocked_by";

/// Issue lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    /// Available for work.
    Open,
    /// Claimed by a run step.
    InProgress,
    /// Finished with an outcome.
    Closed,
}

/// Outcome recorded when an issue closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueOutcome {
    /// Work succeeded.
    Success,
    /// Work failed.
    Failure,
    /// Work finished but needs another pass.
    NeedsWork,
    /// The issue was expanded into children.
    Expanded,
}

impl IssueOutcome {
    /// Snake-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::NeedsWork => "needs_work",
            Self::Expanded => "expanded",
        }
    }
}

/// One typed dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDep {
    /// Edge type: [`DEP_PARENT`] or [`DEP_BLOCKED_BY`].
    #[serde(rename = "type")]
    pub dep_type: String,
    /// Target issue id.
    pub target: String,
}

/// One issue record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Stable id, `is-<12 hex>`.
    pub id: String,
    /// Title.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Lifecycle state.
    pub status: IssueStatus,
    /// Outcome, once closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<IssueOutcome>,
    /// Tag set (e.g. `node:agent`, `role:orchestrator`).
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Dependency edges.
    #[serde(default)]
    pub deps: Vec<IssueDep>,
    /// Priority 1 (highest) to 5 (lowest).
    pub priority: u8,
    /// Creation time.
    pub created_at_ms: i64,
    /// Last mutation time.
    pub updated_at_ms: i64,
}

impl Issue {
    /// Parent issue id, when the issue has one.
    pub fn parent_id(&self) -> Option<&str> {
        self.deps
            .iter()
            .find(|d| d.dep_type == DEP_PARENT)
            .map(|d| d.target.as_str())
    }
}

/// Fields accepted when creating an issue.
#[derive(Debug, Clone, Deserialize)]
pub struct NewIssue {
    /// Title.
    pub title: String,
    /// Body text.
    #[serde(default)]
    pub body: String,
    /// Parent issue id.
    #[serde(default)]
    pub parent: Option<String>,
    /// Issues that must close before this one is ready.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    /// Initial tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Priority 1..5; defaults to 3.
    #[serde(default)]
    pub priority: Option<u8>,
}

/// Persistent issue graph store.
pub struct IssueStore {
    store: JsonlStore,
    clock: Arc<dyn Clock>,
    issues: Mutex<Option<HashMap<String, Issue>>>,
}

impl IssueStore {
    /// Create a store persisting to `path`.
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            store: JsonlStore::new(path),
            clock,
            issues: Mutex::new(None),
        })
    }

    /// Create an issue.
    pub fn create(&self, req: NewIssue) -> CoreResult<Issue> {
        if req.title.trim().is_empty() {
            return Err(CoreError::Validation("title must not be empty".to_owned()));
        }
        let priority = req.priority.unwrap_or(3);
        if !(1..=5).contains(&priority) {
            return Err(CoreError::Validation("priority must be 1..=5".to_owned()));
        }

        let now = self.clock.now_ms();
        let mut deps = Vec::new();
        if let Some(parent) = req.parent {
            deps.push(IssueDep {
                dep_type: DEP_PARENT.to_owned(),
                target: parent,
            });
        }
        for target in req.blocked_by {
            deps.push(IssueDep {
                dep_type: DEP_BLOCKED_BY.to_owned(),
                target,
            });
        }

        let issue = Issue {
            id: ids::issue_id(),
            title: req.title,
            body: req.body,
            status: IssueStatus::Open,
            outcome: None,
            tags: req.tags,
            deps,
            priority,
            created_at_ms: now,
            updated_at_ms: now,
        };

        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        if let Some(map) = guard.as_mut() {
            map.insert(issue.id.clone(), issue.clone());
        }
        self.persist_locked(&guard)?;
        debug!(issue_id = %issue.id, "issue created");
        Ok(issue)
    }

    /// Fetch one issue.
    pub fn get(&self, issue_id: &str) -> CoreResult<Issue> {
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        guard
            .as_ref()
            .and_then(|m| m.get(issue_id).cloned())
            .ok_or_else(|| CoreError::NotFound(format!("issue {issue_id}")))
    }

    /// All issues.
    pub fn list(&self) -> CoreResult<Vec<Issue>> {
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        let mut issues: Vec<Issue> = guard
            .as_ref()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        issues.sort_by(|a, b| {
            (a.created_at_ms, a.id.as_str()).cmp(&(b.created_at_ms, b.id.as_str()))
        });
        Ok(issues)
    }

    /// The subtree rooted at `root_id`, including the root, via parent
    /// edges.
    pub fn subtree(&self, root_id: &str) -> CoreResult<Vec<Issue>> {
        let issues = self.list()?;
        let mut members: HashSet<String> = HashSet::new();
        members.insert(root_id.to_owned());
        // Parent edges always point upward, so one pass per depth level.
        loop {
            let before = members.len();
            for issue in &issues {
                if let Some(parent) = issue.parent_id() {
                    if members.contains(parent) {
                        members.insert(issue.id.clone());
                    }
                }
            }
            if members.len() == before {
                break;
            }
        }
        Ok(issues
            .into_iter()
            .filter(|i| members.contains(&i.id))
            .collect())
    }

    /// Direct children of an issue.
    pub fn children(&self, issue_id: &str) -> CoreResult<Vec<Issue>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| i.parent_id() == Some(issue_id))
            .collect())
    }

    /// Open issues in the subtree whose `blocked_by` deps are all closed
    /// and that carry every tag in `required_tags`. Ordered by priority,
    /// then `updated_at_ms`.
    pub fn ready(&self, root_id: &str, required_tags: &[&str]) -> CoreResult<Vec<Issue>> {
        let subtree = self.subtree(root_id)?;
        let by_id: HashMap<&str, &Issue> = subtree.iter().map(|i| (i.id.as_str(), i)).collect();

        let mut ready: Vec<Issue> = subtree
            .iter()
            .filter(|issue| {
                issue.status == IssueStatus::Open
                    && required_tags.iter().all(|t| issue.tags.contains(*t))
                    && issue
                        .deps
                        .iter()
                        .filter(|d| d.dep_type == DEP_BLOCKED_BY)
                        .all(|d| {
                            by_id
                                .get(d.target.as_str())
                                .map(|dep| dep.status == IssueStatus::Closed)
                                .unwrap_or(true)
                        })
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| (a.priority, a.updated_at_ms).cmp(&(b.priority, b.updated_at_ms)));
        Ok(ready)
    }

    /// Claim an open issue for a run step.
    pub fn claim(&self, issue_id: &str) -> CoreResult<Issue> {
        self.mutate(issue_id, |issue| {
            if issue.status != IssueStatus::Open {
                return Err(CoreError::Conflict(format!(
                    "issue {} is not open",
                    issue.id
                )));
            }
            issue.status = IssueStatus::InProgress;
            Ok(())
        })
    }

    /// Close an issue with an outcome.
    pub fn close(&self, issue_id: &str, outcome: IssueOutcome) -> CoreResult<Issue> {
        self.mutate(issue_id, |issue| {
            issue.status = IssueStatus::Closed;
            issue.outcome = Some(outcome);
            Ok(())
        })
    }

    /// Reopen a closed issue for orchestration: outcome clears, the
    /// `role:orchestrator` tag is added.
    pub fn reopen_for_orchestration(&self, issue_id: &str) -> CoreResult<Issue> {
        self.mutate(issue_id, |issue| {
            issue.status = IssueStatus::Open;
            issue.outcome = None;
            issue.tags.insert("role:orchestrator".to_owned());
            Ok(())
        })
    }

    fn mutate(
        &self,
        issue_id: &str,
        apply: impl FnOnce(&mut Issue) -> CoreResult<()>,
    ) -> CoreResult<Issue> {
        let now = self.clock.now_ms();
        let mut guard = self.lock();
        self.ensure_loaded_locked(&mut guard)?;
        let map = guard
            .as_mut()
            .ok_or_else(|| CoreError::Internal("issue store not loaded".to_owned()))?;
        let issue = map
            .get_mut(issue_id)
            .ok_or_else(|| CoreError::NotFound(format!("issue {issue_id}")))?;
        apply(issue)?;
        issue.updated_at_ms = now;
        let snapshot = issue.clone();
        self.persist_locked(&guard)?;
        Ok(snapshot)
    }

    fn lock(&self) -> MutexGuard<'_, Option<HashMap<String, Issue>>> {
        match self.issues.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_loaded_locked(
        &self,
        guard: &mut MutexGuard<'_, Option<HashMap<String, Issue>>>,
    ) -> CoreResult<()> {
        if guard.is_none() {
            let records: Vec<Issue> = self.store.read_all()?;
            **guard = Some(records.into_iter().map(|i| (i.id.clone(), i)).collect());
        }
        Ok(())
    }

    fn persist_locked(
        &self,
        guard: &MutexGuard<'_, Option<HashMap<String, Issue>>>,
    ) -> CoreResult<()> {
        let mut issues: Vec<Issue> = guard
            .as_ref()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        issues.sort_by(|a, b| {
            (a.created_at_ms, a.id.as_str()).cmp(&(b.created_at_ms, b.id.as_str()))
        });
        self.store.rewrite(&issues)
    }
}

impl std::fmt::Debug for IssueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueStore")
            .field("path", &self.store.path())
            .finish_non_exhaustive()
    }
}

/// One forum post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumPost {
    /// Stable id, `fp-<12 hex>`.
    pub post_id: String,
    /// Topic, e.g. `issue:<issue_id>`.
    pub topic: String,
    /// Post body (free text or JSON-encoded step record).
    pub body: String,
    /// Creation time.
    pub created_at_ms: i64,
}

/// Append-only forum log.
pub struct ForumLog {
    store: JsonlStore,
    clock: Arc<dyn Clock>,
}

impl ForumLog {
    /// Create a forum log persisting to `path`.
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            store: JsonlStore::new(path),
            clock,
        })
    }

    /// Append one post.
    pub fn post(&self, topic: &str, body: &str) -> CoreResult<ForumPost> {
        let post = ForumPost {
            post_id: ids::forum_post_id(),
            topic: topic.to_owned(),
            body: body.to_owned(),
            created_at_ms: self.clock.now_ms(),
        };
        self.store.append(&post)?;
        Ok(post)
    }

    /// Posts for one topic, oldest first.
    pub fn list(&self, topic: &str) -> CoreResult<Vec<ForumPost>> {
        let posts: Vec<ForumPost> = self.store.read_all()?;
        Ok(posts.into_iter().filter(|p| p.topic == topic).collect())
    }
}

impl std::fmt::Debug for ForumLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForumLog")
            .field("path", &self.store.path())
            .finish_non_exhaustive()
    }
}
