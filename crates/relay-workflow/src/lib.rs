//! DAG-based workflow scheduling: parses a workflow document, builds the
//! step DAG, dispatches ready waves through one of three step executors,
//! resolves both interpolation passes, applies verification and retries,
//! idly nudges stuck agent steps, and records the run's trajectory.

mod config;
mod dag;
mod document;
mod executors;
mod interpolation;
mod persistence;
mod scheduler;
mod step_outputs;
mod trajectory;
mod verification;

pub use config::{ConfigError, RelayConfig};
pub use dag::Dag;
pub use document::{DocumentError, ErrorStrategy, NudgeConfig, StepSpec, Verification, WorkflowDocument};
pub use executors::{non_interactive_args, StepOutcome, WaitOutcome};
pub use interpolation::{interpolate, substitute_vars, InterpolationError, StepOutputs};
pub use persistence::{FilePersistence, InMemoryPersistence, PersistenceAdapter, PersistenceError};
pub use scheduler::{Scheduler, SchedulerControl, SchedulerError};
pub use step_outputs::write_step_output;
pub use trajectory::{RunTally, TrajectoryEntry, TrajectoryRecorder};
pub use verification::{file_exists_relative, strip_escapes, verify, VerificationResult};
