use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryState;
use crate::step::StepStatus;
use crate::worker::WorkerState;

/// Everything the event bus fans out. Every state transition in the data
/// model surfaces here; the protocol stream serializes these directly as
/// the payload of a `event` envelope, and the trajectory recorder folds them
/// into a run's chapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Event {
    WorkerSpawned { worker: String },
    WorkerStateChanged { worker: String, state: WorkerState },
    WorkerStream { worker: String, chunk: String },
    WorkerExited { worker: String, exit_code: Option<i32> },
    WorkerIdle { worker: String },
    WorkerExitRequested { worker: String },
    DeliveryStateChanged {
        delivery_id: String,
        worker: String,
        state: DeliveryState,
    },
    StepStateChanged {
        run_id: String,
        step_id: String,
        status: StepStatus,
    },
    RunStarted { run_id: String },
    RunFinished { run_id: String, failed: bool },
    StepNudged { run_id: String, step_id: String, attempt: u32 },
    StepForceReleased { run_id: String, step_id: String },
    Warning { message: String },
    Error { message: String },
}
