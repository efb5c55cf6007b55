use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Runtime tag for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Pty,
    NonInteractive,
}

/// Lifecycle states of a worker. `spawning -> ready -> active -> idle ->
/// exiting -> exited`, with `idle` and `active` re-entered any number of
/// times before the worker exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Ready,
    Active,
    Idle,
    Exiting,
    Exited,
}

impl WorkerState {
    /// Whether `next` is a legal transition from `self` under the regular
    /// language `spawning (ready (active|idle)*)? (exiting)? (exited)`.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Spawning, Ready)
                | (Ready, Active)
                | (Ready, Idle)
                | (Ready, Exiting)
                | (Active, Idle)
                | (Active, Exiting)
                | (Active, Active)
                | (Idle, Active)
                | (Idle, Exiting)
                | (Exiting, Exited)
        )
    }
}

/// Restart policy consulted by the supervisor on unexpected worker exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum RestartPolicy {
    Never,
    OnFailure { max_attempts: u32 },
    Always,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Never
    }
}

/// A single PTY-backed or non-interactive worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub runtime: RuntimeKind,
    pub pid: Option<u32>,
    #[serde(default)]
    pub channels: HashSet<String>,
    pub state: WorkerState,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub restart_count: u32,
}

impl Worker {
    pub fn new(name: impl Into<String>, runtime: RuntimeKind) -> Self {
        Self {
            name: name.into(),
            runtime,
            pid: None,
            channels: HashSet::new(),
            state: WorkerState::Spawning,
            restart_policy: RestartPolicy::default(),
            restart_count: 0,
        }
    }

    pub fn in_channel(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_follow_the_regular_language() {
        assert!(WorkerState::Spawning.can_transition_to(WorkerState::Ready));
        assert!(WorkerState::Ready.can_transition_to(WorkerState::Active));
        assert!(WorkerState::Active.can_transition_to(WorkerState::Idle));
        assert!(WorkerState::Idle.can_transition_to(WorkerState::Active));
        assert!(WorkerState::Active.can_transition_to(WorkerState::Exiting));
        assert!(WorkerState::Exiting.can_transition_to(WorkerState::Exited));
    }

    #[test]
    fn illegal_transitions_rejected() {
        assert!(!WorkerState::Exited.can_transition_to(WorkerState::Active));
        assert!(!WorkerState::Spawning.can_transition_to(WorkerState::Exited));
        assert!(!WorkerState::Exiting.can_transition_to(WorkerState::Ready));
    }
}
