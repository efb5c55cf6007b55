use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use relay_types::StepFailureCategory;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relay_pty::PtyWorkerEvent;

/// What a step executor hands back to the scheduler: either captured
/// output and an exit code for verification, or a categorized failure the
/// scheduler folds into the retry/skip decision (§4.9, §7).
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success {
        output: String,
        exit_code: Option<i32>,
    },
    Failure {
        category: StepFailureCategory,
        message: String,
    },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }
}

/// Suffix appended to an agent step's task text, instructing the child to
/// signal completion the same way any other worker would (§4.9).
pub fn agent_task_suffix() -> &'static str {
    "\n\nWhen you are completely done with this task, print a line containing only /exit."
}

/// Short preamble prepended to a non-interactive step's task, since that
/// executor can't answer any follow-up the child might otherwise expect
/// (§4.9).
pub fn non_interactive_preamble() -> &'static str {
    "This is a one-shot, non-interactive invocation. No follow-up questions \
     are possible; use reasonable defaults and produce a complete answer.\n\n"
}

/// One-shot invocation recipe, keyed by CLI name, translating a task string
/// into the argv of a non-interactive invocation (§4.9). Unknown CLI names
/// fall back to passing the task as the sole positional argument.
pub fn non_interactive_args(cli_name: &str, task: &str) -> Vec<String> {
    match cli_name {
        "claude" => vec!["-p".to_string(), task.to_string()],
        "codex" => vec!["exec".to_string(), task.to_string()],
        "aider" => vec!["--prompt".to_string(), task.to_string()],
        "goose" => vec![
            "run".to_string(),
            "--text".to_string(),
            task.to_string(),
            "--no-session".to_string(),
        ],
        _ => vec![task.to_string()],
    }
}

/// Outcome of [`PtyAgentListener`] waiting on a worker's lifecycle: either
/// it exited/requested exit on its own, it went idle (caller decides
/// whether to nudge), or the wait's own timeout elapsed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    ExitRequested,
    Exited,
    Idle,
    TimedOut,
}

/// Collects one worker's output chunks into a per-step buffer and answers
/// the `wait_for_exit`/`wait_for_idle` primitives of §4.9/§9 by consuming
/// its private event channel (registered with the scheduler's event pump
/// for the duration of the step).
pub struct PtyAgentListener {
    events: mpsc::UnboundedReceiver<PtyWorkerEvent>,
    buffer: String,
    exit_code: Option<i32>,
}

impl PtyAgentListener {
    pub fn new(events: mpsc::UnboundedReceiver<PtyWorkerEvent>) -> Self {
        Self {
            events,
            buffer: String::new(),
            exit_code: None,
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Drain every chunk queued so far without blocking, used when the
    /// caller force-releases a worker and wants whatever was captured.
    pub fn drain_available(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.absorb(event);
        }
    }

    fn absorb(&mut self, event: PtyWorkerEvent) -> Option<WaitOutcome> {
        match event {
            PtyWorkerEvent::Stream { chunk } => {
                self.buffer.push_str(&chunk);
                None
            }
            PtyWorkerEvent::ExitSentinelSeen => Some(WaitOutcome::ExitRequested),
            PtyWorkerEvent::Exited { exit_code } => {
                self.exit_code = exit_code;
                Some(WaitOutcome::Exited)
            }
            PtyWorkerEvent::Idle => Some(WaitOutcome::Idle),
            _ => None,
        }
    }

    /// Block until the worker exits, requests exit, or `timeout` elapses,
    /// absorbing output chunks (and idle transitions, discarded here) along
    /// the way.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }
            match tokio::time::timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) => {
                    if let Some(outcome @ (WaitOutcome::ExitRequested | WaitOutcome::Exited)) =
                        self.absorb(event)
                    {
                        return outcome;
                    }
                }
                Ok(None) => return WaitOutcome::Exited,
                Err(_) => return WaitOutcome::TimedOut,
            }
        }
    }

    /// Block until the worker goes idle, exits, requests exit, or `timeout`
    /// elapses.
    pub async fn wait_for_idle(&mut self, timeout: Duration) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }
            match tokio::time::timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) => {
                    if let Some(outcome) = self.absorb(event) {
                        return outcome;
                    }
                }
                Ok(None) => return WaitOutcome::Exited,
                Err(_) => return WaitOutcome::TimedOut,
            }
        }
    }
}

/// Spawn a child with piped stdio (no pseudo-terminal), write nothing to
/// its stdin, capture its stdout, and enforce `timeout` with a graceful
/// SIGTERM followed by a forceful SIGKILL a few seconds later (§4.9, §5).
pub async fn run_non_interactive(
    command: &str,
    args: &[String],
    timeout: Duration,
    grace: Duration,
    cancel: &CancellationToken,
) -> StepOutcome {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(err) => {
            return StepOutcome::Failure {
                category: StepFailureCategory::SpawnFailed,
                message: format!("failed to spawn {command}: {err}"),
            };
        }
    };

    let wait = async {
        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout).await;
        }
        let status = child.wait().await;
        (status, stdout)
    };

    tokio::select! {
        result = tokio::time::timeout(timeout, wait) => {
            match result {
                Ok((Ok(status), stdout)) => StepOutcome::Success {
                    output: stdout,
                    exit_code: status.code(),
                },
                Ok((Err(err), _)) => StepOutcome::Failure {
                    category: StepFailureCategory::Unknown,
                    message: err.to_string(),
                },
                Err(_) => {
                    terminate_gracefully(&mut child, grace).await;
                    StepOutcome::Failure {
                        category: StepFailureCategory::Timeout,
                        message: format!("{command} exceeded its timeout"),
                    }
                }
            }
        }
        _ = cancel.cancelled() => {
            terminate_gracefully(&mut child, grace).await;
            StepOutcome::Failure {
                category: StepFailureCategory::Aborted,
                message: "run was cancelled".to_string(),
            }
        }
    }
}

/// Invoke `sh -c command`, capturing stdout/stderr, honoring an optional
/// timeout, and wired to the run's cancellation signal (§4.9).
pub async fn run_deterministic(
    command: &str,
    cwd: Option<&Path>,
    timeout: Option<Duration>,
    grace: Duration,
    cancel: &CancellationToken,
) -> StepOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(err) => {
            return StepOutcome::Failure {
                category: StepFailureCategory::SpawnFailed,
                message: format!("failed to spawn shell: {err}"),
            };
        }
    };

    let wait = async {
        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout).await;
        }
        let status = child.wait().await;
        (status, stdout)
    };

    let run_to_completion = async {
        match timeout {
            Some(t) => tokio::time::timeout(t, wait).await,
            None => Ok(wait.await),
        }
    };

    tokio::select! {
        result = run_to_completion => {
            match result {
                Ok((Ok(status), stdout)) => StepOutcome::Success {
                    output: stdout,
                    exit_code: status.code(),
                },
                Ok((Err(err), _)) => StepOutcome::Failure {
                    category: StepFailureCategory::Unknown,
                    message: err.to_string(),
                },
                Err(_) => {
                    terminate_gracefully(&mut child, grace).await;
                    StepOutcome::Failure {
                        category: StepFailureCategory::Timeout,
                        message: format!("command exceeded its timeout: {command}"),
                    }
                }
            }
        }
        _ = cancel.cancelled() => {
            terminate_gracefully(&mut child, grace).await;
            StepOutcome::Failure {
                category: StepFailureCategory::Aborted,
                message: "run was cancelled".to_string(),
            }
        }
    }
}

/// Send SIGTERM, give the child `grace` to exit on its own, then SIGKILL
/// (§5: "a graceful signal first, then after a short grace window a
/// forceful one").
async fn terminate_gracefully(child: &mut tokio::process::Child, grace: Duration) {
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            debug!(%err, "SIGTERM delivery failed, child may have already exited");
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }

    warn!("child did not exit within grace window, sending SIGKILL");
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_cli_recipes_place_the_task_as_documented() {
        assert_eq!(
            non_interactive_args("claude", "do thing"),
            vec!["-p".to_string(), "do thing".to_string()]
        );
        assert_eq!(
            non_interactive_args("codex", "do thing"),
            vec!["exec".to_string(), "do thing".to_string()]
        );
        assert_eq!(
            non_interactive_args("goose", "do thing"),
            vec![
                "run".to_string(),
                "--text".to_string(),
                "do thing".to_string(),
                "--no-session".to_string()
            ]
        );
    }

    #[test]
    fn unknown_cli_falls_back_to_bare_task_argument() {
        assert_eq!(
            non_interactive_args("mystery-cli", "do thing"),
            vec!["do thing".to_string()]
        );
    }

    #[tokio::test]
    async fn deterministic_step_captures_stdout() {
        let cancel = CancellationToken::new();
        let outcome = run_deterministic("printf hello", None, None, Duration::from_secs(1), &cancel).await;
        match outcome {
            StepOutcome::Success { output, exit_code } => {
                assert_eq!(output, "hello");
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deterministic_step_times_out() {
        let cancel = CancellationToken::new();
        let outcome = run_deterministic(
            "sleep 5",
            None,
            Some(Duration::from_millis(50)),
            Duration::from_millis(50),
            &cancel,
        )
        .await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure {
                category: StepFailureCategory::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn deterministic_step_reports_nonzero_exit_without_failing_itself() {
        let cancel = CancellationToken::new();
        let outcome = run_deterministic("exit 7", None, None, Duration::from_secs(1), &cancel).await;
        match outcome {
            StepOutcome::Success { exit_code, .. } => assert_eq!(exit_code, Some(7)),
            other => panic!("expected success with nonzero exit, got {other:?}"),
        }
    }
}
