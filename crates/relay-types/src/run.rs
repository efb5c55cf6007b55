use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

/// A single execution of a workflow document against the step DAG it defines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workflow_name: String,
    #[serde(default)]
    pub swarm_pattern: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Step ids that have completed, in completion order — not dispatch
    /// order, since a wave can finish out of order.
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub failed_steps: Vec<String>,
    #[serde(default)]
    pub skipped_steps: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Run {
    pub fn new(id: impl Into<String>, workflow_name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            workflow_name: workflow_name.into(),
            swarm_pattern: None,
            status: RunStatus::Planning,
            started_at,
            finished_at: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted)
    }
}
