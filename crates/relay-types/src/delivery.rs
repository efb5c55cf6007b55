use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single injection attempt into a worker, from enqueue
/// through echo verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Injected,
    Verified,
    Failed,
}

/// Bookkeeping for one message's delivery to one worker: how many times it
/// has been injected, what echo text confirms receipt, and when the current
/// attempt was injected (for verification-window timeout tracking).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub message_id: String,
    pub worker: String,
    pub state: DeliveryState,
    pub expected_echo: String,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub injected_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    pub fn new(delivery_id: impl Into<String>, message_id: impl Into<String>, worker: impl Into<String>, expected_echo: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            message_id: message_id.into(),
            worker: worker.into(),
            state: DeliveryState::Queued,
            expected_echo: expected_echo.into(),
            attempts: 0,
            max_attempts,
            injected_at: None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
