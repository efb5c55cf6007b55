//! PTY-backed worker processes.
//!
//! A [`PtySession`] owns a spawned child on a pseudo-terminal and exposes a
//! byte stream reader and a writer for injection. [`PtyWorker`] wraps a
//! session with the behavior a broker needs from it: ANSI-stripped output
//! forwarding, `/exit` sentinel detection, an idle timer, echo-based
//! delivery verification, and resize forwarding.

mod echo;
mod idle;
mod session;
mod worker;

pub use echo::{EchoOutcome, EchoVerifier, PendingVerification};
pub use idle::IdleTracker;
pub use session::{PtyError, PtySession, PtySize};
pub use worker::{PtyWorker, PtyWorkerCommand, PtyWorkerEvent};

/// Line a worker can print to request its own termination.
pub const EXIT_SENTINEL: &str = "/exit";

/// Default idle threshold: how long a worker must produce no output before
/// it is considered idle.
pub const DEFAULT_IDLE_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(30);

/// Default echo-verification window and retry budget.
pub const DEFAULT_VERIFICATION_WINDOW: std::time::Duration = std::time::Duration::from_secs(5);
pub const DEFAULT_MAX_VERIFICATION_ATTEMPTS: u32 = 3;

/// Cap on the rolling output buffer used for echo matching, and the size it
/// is trimmed back down to once it grows past that cap.
pub const ECHO_BUFFER_MAX_BYTES: usize = 16_000;
pub const ECHO_BUFFER_KEEP_BYTES: usize = 12_000;
