use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::echo::{EchoOutcome, EchoVerifier, PendingVerification};
use crate::idle::IdleTracker;
use crate::session::{PtyError, PtySession, PtySize};
use crate::{DEFAULT_IDLE_THRESHOLD, DEFAULT_VERIFICATION_WINDOW, EXIT_SENTINEL};

/// Commands accepted by a running [`PtyWorker`] task.
#[derive(Debug)]
pub enum PtyWorkerCommand {
    /// Inject text into the worker and track it for echo verification.
    Inject {
        delivery_id: String,
        text: String,
        expected_echo: String,
        max_attempts: u32,
    },
    Resize(PtySize),
    Stop,
}

/// Events a [`PtyWorker`] task reports back to whoever owns its command
/// channel (normally the broker supervisor).
#[derive(Debug, Clone)]
pub enum PtyWorkerEvent {
    Stream { chunk: String },
    DeliveryInjected { delivery_id: String },
    DeliveryVerified { delivery_id: String },
    DeliveryFailed { delivery_id: String },
    Idle,
    ExitSentinelSeen,
    Exited { exit_code: Option<i32> },
}

/// Owns a [`PtySession`] and runs its output/verification/idle loop until
/// stopped or the child exits.
pub struct PtyWorker {
    session: PtySession,
    verifier: EchoVerifier,
    idle: IdleTracker,
    pending: Vec<PendingVerification>,
    verification_window: Duration,
    log_file: Option<std::fs::File>,
}

impl PtyWorker {
    pub fn spawn(command: &str, args: &[String], size: PtySize) -> Result<Self, PtyError> {
        Self::spawn_in(command, args, size, None)
    }

    pub fn spawn_in(
        command: &str,
        args: &[String],
        size: PtySize,
        cwd: Option<&std::path::Path>,
    ) -> Result<Self, PtyError> {
        let session = PtySession::spawn_in(command, args, size, cwd)?;
        Ok(Self {
            session,
            verifier: EchoVerifier::new(),
            idle: IdleTracker::new(DEFAULT_IDLE_THRESHOLD),
            pending: Vec::new(),
            verification_window: DEFAULT_VERIFICATION_WINDOW,
            log_file: None,
        })
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle = IdleTracker::new(threshold);
        self
    }

    /// Append the worker's raw output (escape sequences included) to a log
    /// file at `.agent-relay/team/worker-logs/<name>.log` for operator
    /// inspection (§4.2 "Owned resources").
    pub fn attach_log_file(&mut self, worker_logs_dir: &std::path::Path, name: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(worker_logs_dir)?;
        let path: PathBuf = worker_logs_dir.join(format!("{name}.log"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        self.log_file = Some(file);
        Ok(())
    }

    /// Run the worker's event loop: read output on a blocking thread,
    /// forward stripped chunks and react to commands, until `Stop` or exit.
    pub fn run(
        mut self,
        mut commands: mpsc::Receiver<PtyWorkerCommand>,
        events: mpsc::UnboundedSender<PtyWorkerEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = match self.session.take_reader() {
                Ok(r) => r,
                Err(err) => {
                    warn!(error = %err, "failed to take pty reader");
                    let _ = events.send(PtyWorkerEvent::Exited { exit_code: None });
                    return;
                }
            };
            let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(64);
            std::thread::spawn(move || {
                use std::io::Read;
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if raw_tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });

            let mut verification_tick = tokio::time::interval(Duration::from_millis(200));
            let mut watchdog_tick = tokio::time::interval(Duration::from_secs(5));

            loop {
                tokio::select! {
                    maybe_chunk = raw_rx.recv() => {
                        match maybe_chunk {
                            Some(bytes) => self.handle_output(&bytes, &events),
                            None => {
                                let exit_code = self.session.has_exited();
                                let _ = events.send(PtyWorkerEvent::Exited { exit_code });
                                break;
                            }
                        }
                    }
                    Some(cmd) = commands.recv() => {
                        if !self.handle_command(cmd, &events) {
                            break;
                        }
                    }
                    _ = verification_tick.tick() => {
                        self.drive_verifications(&events);
                        if self.idle.check_idle_transition() {
                            let _ = events.send(PtyWorkerEvent::Idle);
                        }
                    }
                    _ = watchdog_tick.tick() => {
                        if let Some(exit_code) = self.session.has_exited() {
                            let _ = events.send(PtyWorkerEvent::Exited { exit_code: Some(exit_code) });
                            break;
                        }
                    }
                }
            }
        })
    }

    fn handle_output(&mut self, bytes: &[u8], events: &mpsc::UnboundedSender<PtyWorkerEvent>) {
        if let Some(log_file) = self.log_file.as_mut() {
            if let Err(err) = log_file.write_all(bytes) {
                warn!(error = %err, "failed to append to worker log file");
            }
        }

        let stripped = strip_ansi_escapes::strip(bytes);
        let Ok(text) = String::from_utf8(stripped) else {
            return;
        };
        if text.trim().is_empty() {
            return;
        }

        self.idle.note_output();
        self.verifier.feed(&text);
        let _ = events.send(PtyWorkerEvent::Stream { chunk: text.clone() });

        if text.lines().any(|line| line.trim() == EXIT_SENTINEL) {
            let _ = events.send(PtyWorkerEvent::ExitSentinelSeen);
        }
    }

    fn handle_command(
        &mut self,
        cmd: PtyWorkerCommand,
        events: &mpsc::UnboundedSender<PtyWorkerEvent>,
    ) -> bool {
        match cmd {
            PtyWorkerCommand::Inject {
                delivery_id,
                text,
                expected_echo,
                max_attempts,
            } => {
                if let Err(err) = self.session.write_all(text.as_bytes()) {
                    warn!(%delivery_id, error = %err, "injection write failed");
                    let _ = events.send(PtyWorkerEvent::DeliveryFailed { delivery_id });
                    return true;
                }
                self.pending.push(PendingVerification::new(
                    delivery_id.clone(),
                    text,
                    expected_echo,
                    max_attempts,
                ));
                let _ = events.send(PtyWorkerEvent::DeliveryInjected { delivery_id });
                true
            }
            PtyWorkerCommand::Resize(size) => {
                if let Err(err) = self.session.resize(size) {
                    warn!(error = %err, "pty resize failed");
                }
                true
            }
            PtyWorkerCommand::Stop => {
                let _ = self.session.kill();
                false
            }
        }
    }

    fn drive_verifications(&mut self, events: &mpsc::UnboundedSender<PtyWorkerEvent>) {
        let window = self.verification_window;
        let mut retained = Vec::with_capacity(self.pending.len());
        for mut pending in self.pending.drain(..) {
            match self.verifier.poll(&pending, window) {
                EchoOutcome::Verified => {
                    let _ = events.send(PtyWorkerEvent::DeliveryVerified {
                        delivery_id: pending.delivery_id.clone(),
                    });
                }
                EchoOutcome::Pending => retained.push(pending),
                EchoOutcome::RetryNeeded => {
                    debug!(delivery_id = %pending.delivery_id, attempts = pending.attempts, "re-injecting unverified delivery");
                    if let Err(err) = self.session.write_all(pending.injected_text.as_bytes()) {
                        warn!(delivery_id = %pending.delivery_id, error = %err, "re-injection write failed");
                        let _ = events.send(PtyWorkerEvent::DeliveryFailed {
                            delivery_id: pending.delivery_id.clone(),
                        });
                        continue;
                    }
                    pending.attempts += 1;
                    pending.injected_at = std::time::Instant::now();
                    retained.push(pending);
                }
                EchoOutcome::Failed => {
                    let _ = events.send(PtyWorkerEvent::DeliveryFailed {
                        delivery_id: pending.delivery_id.clone(),
                    });
                }
            }
        }
        self.pending = retained;
    }
}
