use std::collections::HashMap;

use relay_pty::{PtySize, PtyWorker, PtyWorkerCommand, PtyWorkerEvent};
use relay_types::{Event, RestartPolicy, RuntimeKind, Worker, WorkerState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::event_bus::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker {0} already registered")]
    AlreadyRegistered(String),
    #[error("unknown worker {0}")]
    UnknownWorker(String),
    #[error(transparent)]
    Pty(#[from] relay_pty::PtyError),
}

/// A running worker's control channel and join handle, plus the `Worker`
/// record the rest of the system sees.
pub struct WorkerHandle {
    pub record: Worker,
    pub commands: mpsc::Sender<PtyWorkerCommand>,
    join: JoinHandle<()>,
}

/// Owns every worker the broker currently runs: spawns them, restarts them
/// per their restart policy on unexpected exit, and forwards their events
/// onto the shared event bus.
pub struct BrokerSupervisor {
    workers: HashMap<String, WorkerHandle>,
    events: std::sync::Arc<EventBus>,
    worker_events_tx: mpsc::UnboundedSender<(String, PtyWorkerEvent)>,
    worker_logs_dir: Option<std::path::PathBuf>,
}

impl BrokerSupervisor {
    /// Returns the supervisor and the receiving end of the raw per-worker
    /// event stream (output chunks, idle/exit transitions) that every
    /// spawned worker's forwarding task feeds. Callers that need to
    /// consume it on a dedicated task (the workflow scheduler's event
    /// pump) take it once up front; the broker binary's `get_status`/
    /// `get_metrics` handlers instead read worker state off `self`
    /// directly and don't need the raw stream at all.
    pub fn new(events: std::sync::Arc<EventBus>) -> (Self, mpsc::UnboundedReceiver<(String, PtyWorkerEvent)>) {
        let (worker_events_tx, worker_events_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            workers: HashMap::new(),
            events,
            worker_events_tx,
            worker_logs_dir: None,
        };
        (supervisor, worker_events_rx)
    }

    /// Configure the directory raw per-worker output logs are appended to
    /// (`.agent-relay/team/worker-logs/<name>.log`, §6). Without this, no
    /// log file is opened for spawned workers.
    pub fn with_worker_logs_dir(mut self, dir: std::path::PathBuf) -> Self {
        self.worker_logs_dir = Some(dir);
        self
    }

    pub fn spawn_agent(
        &mut self,
        name: &str,
        command: &str,
        args: &[String],
        restart_policy: RestartPolicy,
    ) -> Result<(), SupervisorError> {
        self.spawn_agent_in(name, command, args, restart_policy, None, None, None, &[])
    }

    /// Full form of `spawn_agent`: optionally runs the child in `cwd` (used
    /// by `worktree` steps), injects `initial_task` followed by a newline
    /// once the worker is registered (§4.6), overrides the worker's idle
    /// threshold (default 30s, §3) when `idle_threshold` is given, and
    /// subscribes the worker to `channels` so that `#name`-targeted
    /// messages (§4.3) resolve to it.
    pub fn spawn_agent_in(
        &mut self,
        name: &str,
        command: &str,
        args: &[String],
        restart_policy: RestartPolicy,
        cwd: Option<&std::path::Path>,
        initial_task: Option<&str>,
        idle_threshold: Option<std::time::Duration>,
        channels: &[String],
    ) -> Result<(), SupervisorError> {
        if self.workers.contains_key(name) {
            return Err(SupervisorError::AlreadyRegistered(name.to_string()));
        }

        let mut worker = PtyWorker::spawn_in(command, args, PtySize::default(), cwd)?;
        if let Some(threshold) = idle_threshold {
            worker = worker.with_idle_threshold(threshold);
        }
        if let Some(logs_dir) = &self.worker_logs_dir {
            if let Err(err) = worker.attach_log_file(logs_dir, name) {
                warn!(worker = name, error = %err, "failed to open worker log file");
            }
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let event_forward_tx = self.worker_events_tx.clone();
        let name_owned = name.to_string();

        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        let join = worker.run(cmd_rx, internal_tx);
        tokio::spawn(async move {
            while let Some(event) = internal_rx.recv().await {
                if event_forward_tx.send((name_owned.clone(), event)).is_err() {
                    break;
                }
            }
        });

        let mut record = Worker::new(name, RuntimeKind::Pty);
        record.state = WorkerState::Ready;
        record.restart_policy = restart_policy;
        record.channels = channels.iter().cloned().collect();

        self.events.publish(Event::WorkerSpawned {
            worker: name.to_string(),
        });
        info!(worker = name, %command, "worker spawned");

        self.workers.insert(
            name.to_string(),
            WorkerHandle {
                record,
                commands: cmd_tx.clone(),
                join,
            },
        );

        if let Some(task) = initial_task {
            let body = format!("{task}\n");
            let _ = cmd_tx.try_send(PtyWorkerCommand::Inject {
                delivery_id: relay_types::new_id(),
                expected_echo: String::new(),
                max_attempts: 1,
                text: body,
            });
        }

        Ok(())
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerHandle> {
        self.workers.get(name)
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// Names of every registered worker subscribed to `channel`, for
    /// `#channel`-targeted sends (§4.3) to expand against actual channel
    /// membership instead of the whole worker table.
    pub fn workers_in_channel(&self, channel: &str) -> Vec<String> {
        self.workers
            .iter()
            .filter(|(_, handle)| handle.record.in_channel(channel))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Current lifecycle state of every registered worker, for `get_metrics`
    /// (§4.5) to tally workers by state.
    pub fn worker_states(&self) -> HashMap<String, WorkerState> {
        self.workers
            .iter()
            .map(|(name, handle)| (name.clone(), handle.record.state))
            .collect()
    }

    pub async fn stop_worker(&mut self, name: &str) -> Result<(), SupervisorError> {
        let handle = self
            .workers
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
        let _ = handle.commands.send(PtyWorkerCommand::Stop).await;
        Ok(())
    }

    /// React to a worker's unexpected exit: apply its restart policy, or
    /// drop it from the table if the policy says not to restart.
    pub fn handle_exit(&mut self, name: &str, command: &str, args: &[String]) {
        let Some(handle) = self.workers.get_mut(name) else {
            return;
        };
        handle.record.state = WorkerState::Exited;
        self.events.publish(Event::WorkerExited {
            worker: name.to_string(),
            exit_code: None,
        });

        let should_restart = match handle.record.restart_policy {
            RestartPolicy::Never => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure { max_attempts } => {
                handle.record.restart_count < max_attempts
            }
        };

        if !should_restart {
            self.workers.remove(name);
            return;
        }

        let restart_policy = handle.record.restart_policy;
        let restart_count = handle.record.restart_count + 1;
        let channels: Vec<String> = handle.record.channels.iter().cloned().collect();
        self.workers.remove(name);

        warn!(worker = name, restart_count, "restarting worker after exit");
        if let Err(err) = self.spawn_agent_in(name, command, args, restart_policy, None, None, None, &channels) {
            warn!(worker = name, error = %err, "failed to restart worker");
            return;
        }
        if let Some(handle) = self.workers.get_mut(name) {
            handle.record.restart_count = restart_count;
        }
    }
}

impl Drop for BrokerSupervisor {
    fn drop(&mut self) {
        for (_, handle) in self.workers.drain() {
            handle.join.abort();
        }
    }
}
