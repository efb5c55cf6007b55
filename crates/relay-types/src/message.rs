use serde::{Deserialize, Serialize};

/// Delivery addressing for a message: a single worker, a channel (fan-out to
/// every worker subscribed to it), or a broadcast to all workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum MessageTarget {
    Worker(String),
    Channel(String),
    Broadcast,
}

/// Lifecycle of a message from the moment it is accepted by the inbound
/// gateway to the moment delivery is confirmed (or abandoned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Queued,
    Injected,
    Verified,
    Failed,
}

/// A single unit of inbound text destined for one or more workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub target: MessageTarget,
    pub body: String,
    pub state: MessageState,
    /// Source-assigned idempotency key; duplicates within the dedup TTL are
    /// dropped by the inbound gateway before a message ever reaches a queue.
    #[serde(default)]
    pub dedup_key: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, from: impl Into<String>, target: MessageTarget, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            target,
            body: body.into(),
            state: MessageState::Queued,
            dedup_key: None,
        }
    }
}
