//! Shared data model for agent-relay: workers, messages, runs, steps, and
//! the events that tie them together.

mod delivery;
mod envelope;
mod error;
mod event;
mod message;
mod run;
mod step;
mod worker;

pub use delivery::{DeliveryRecord, DeliveryState};
pub use envelope::ProtocolEnvelope;
pub use error::{
    DeliveryError, ProtocolError, RunError, SpawnError, StepError, StepFailureCategory,
};
pub use event::Event;
pub use message::{Message, MessageState, MessageTarget};
pub use run::{Run, RunStatus};
pub use step::{Step, StepKind, StepStatus};
pub use worker::{RestartPolicy, RuntimeKind, Worker, WorkerState};

/// Generate a new random identifier, used for run ids, step-instance ids,
/// delivery ids, and message ids wherever the caller doesn't already have a
/// natural key.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
