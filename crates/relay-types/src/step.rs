use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StepFailureCategory;

/// How a step's work is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Interactive PTY worker, injected and verified by echo match.
    Agent,
    /// One-shot subprocess with piped stdio; no echo verification.
    NonInteractive,
    /// A shell command, run to completion with captured stdout/stderr.
    Deterministic,
    /// An agent step additionally given its own git worktree as a working
    /// directory, so parallel agent steps never collide on file state.
    Worktree,
}

impl StepKind {
    /// Whether this kind is dispatched through the interactive PTY executor
    /// (`agent` and `worktree` both are; `worktree` only differs in the
    /// working directory the worker is spawned into).
    pub fn is_pty_backed(self) -> bool {
        matches!(self, StepKind::Agent | StepKind::Worktree)
    }
}

/// Per-run status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Dispatched,
    Completed,
    Failed,
    Skipped,
}

/// A node in the workflow DAG: a unit of work gated on the completion of its
/// dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
    pub worker: Option<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub retries_used: u32,
    /// The task/command text this step runs, after both interpolation
    /// passes have been applied.
    #[serde(default)]
    pub task: String,
    /// Captured output, available for `{{steps.<id>.output}}` interpolation
    /// in downstream steps once this step is `completed`.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_category: Option<StepFailureCategory>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            worker: None,
            depends_on: BTreeSet::new(),
            status: StepStatus::Pending,
            retries_used: 0,
            task: String::new(),
            output: None,
            exit_code: None,
            error: None,
            failure_category: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// A step is ready to dispatch once every dependency has completed (not
    /// merely reached a terminal state — a skipped or failed dependency
    /// gates its dependents per the run's fail-fast-vs-continue policy,
    /// handled by the scheduler, not this type).
    pub fn is_ready(&self, completed: &BTreeSet<String>) -> bool {
        self.status == StepStatus::Pending && self.depends_on.is_subset(completed)
    }
}
