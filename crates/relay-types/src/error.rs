/// Why a step failed, for routing into retry vs. fail-fast logic and for
/// the trajectory recorder's summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureCategory {
    Timeout,
    VerificationMismatch,
    SpawnFailed,
    ExitNonzero,
    Aborted,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("worker {name} already registered")]
    AlreadyRegistered { name: String },
    #[error("failed to spawn pty for worker {name}: {source}")]
    Pty {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker {name} exceeded restart budget")]
    RestartBudgetExhausted { name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("unknown worker {worker}")]
    UnknownWorker { worker: String },
    #[error("delivery {delivery_id} exhausted {attempts} attempts without verification")]
    VerificationExhausted { delivery_id: String, attempts: u32 },
    #[error("worker {worker} channel closed")]
    ChannelClosed { worker: String },
}

impl DeliveryError {
    /// Whether retrying the same delivery might succeed, as opposed to a
    /// structural error that will always fail the same way.
    pub fn retryable(&self) -> bool {
        matches!(self, DeliveryError::VerificationExhausted { .. })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("step {step_id} failed: {category:?}")]
pub struct StepError {
    pub step_id: String,
    pub category: StepFailureCategory,
    #[source]
    pub source: Option<anyhow::Error>,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("workflow document has a cycle involving step {step_id}")]
    CyclicDependency { step_id: String },
    #[error("step {step_id} depends on unknown step {dependency}")]
    UnknownDependency { step_id: String, dependency: String },
    #[error("run {run_id} is already terminal")]
    AlreadyTerminal { run_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("unknown method {0}")]
    UnknownMethod(String),
    #[error("connection closed")]
    Closed,
}

impl ProtocolError {
    pub fn retryable(&self) -> bool {
        matches!(self, ProtocolError::Closed)
    }
}
