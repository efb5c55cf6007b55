use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use relay_broker::{BrokerSupervisor, EventBus};
use relay_pty::{PtyWorkerCommand, PtyWorkerEvent};
use relay_types::{
    Event, RestartPolicy, Run, RunError, RunStatus, StepFailureCategory, StepKind, StepStatus,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::dag::Dag;
use crate::document::{ErrorStrategy, StepSpec, Verification, WorkflowDocument};
use crate::executors::{
    agent_task_suffix, non_interactive_args, non_interactive_preamble, run_deterministic,
    run_non_interactive, PtyAgentListener, StepOutcome, WaitOutcome,
};
use crate::interpolation::{self, StepOutputs};
use crate::persistence::PersistenceAdapter;
use crate::step_outputs::write_step_output;
use crate::trajectory::{RunTally, TrajectoryRecorder};
use crate::verification::{file_exists_relative, strip_escapes, verify, VerificationResult};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("failed to open run-scoped state on disk: {0}")]
    Io(#[from] std::io::Error),
}

/// Boxed future every step executor is funneled through, so a single
/// `FuturesUnordered` can drive a wave mixing all three executor kinds.
type StepFuture = std::pin::Pin<Box<dyn std::future::Future<Output = DispatchResult> + Send>>;

/// Shared, clonable handle for controlling a [`Scheduler`] while its
/// `run()` future executes elsewhere: pause/resume toggle a cooperative
/// flag sampled between waves, and cancel fires the single cancellation
/// signal propagated to every running executor.
#[derive(Clone)]
pub struct SchedulerControl {
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SchedulerControl {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Outcome of running one step's executor, before verification and before
/// the scheduler folds it into `Step`/`Run` state.
struct DispatchResult {
    step_id: String,
    outcome: StepOutcome,
    release_worker: Option<String>,
}

/// The DAG scheduler: parses and validates the workflow document, builds
/// the step DAG, dispatches ready waves bounded by concurrency, resolves
/// both interpolation passes, applies verification and retries, and
/// records the run's trajectory.
pub struct Scheduler {
    document: WorkflowDocument,
    specs: HashMap<String, StepSpec>,
    dag: Dag,
    run: Run,
    run_dir: PathBuf,
    config: RelayConfig,
    supervisor: BrokerSupervisor,
    events: Arc<EventBus>,
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<PtyWorkerEvent>>>>,
    worker_events_rx: Option<mpsc::UnboundedReceiver<(String, PtyWorkerEvent)>>,
    persistence: Arc<dyn PersistenceAdapter>,
    trajectory: TrajectoryRecorder,
    tally: RunTally,
    outputs: HashMap<String, StepOutputs>,
    pub control: SchedulerControl,
}

impl Scheduler {
    pub fn new(
        mut document: WorkflowDocument,
        config: RelayConfig,
        run_dir: PathBuf,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Result<Self, SchedulerError> {
        document.resolve_vars();
        let dag = Dag::build(&document)?;

        let specs: HashMap<String, StepSpec> = document
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        let events = Arc::new(EventBus::new(1024));
        let (supervisor, worker_events_rx) = BrokerSupervisor::new(events.clone());
        let supervisor =
            supervisor.with_worker_logs_dir(run_dir.join(".agent-relay/team/worker-logs"));

        let run = Run::new(relay_types::new_id(), document.name.clone(), chrono::Utc::now());
        let trajectory = TrajectoryRecorder::open(&run_dir, &run.id)?;

        Ok(Self {
            specs,
            run,
            run_dir,
            config,
            supervisor,
            events,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            worker_events_rx: Some(worker_events_rx),
            persistence,
            trajectory,
            tally: RunTally::default(),
            outputs: HashMap::new(),
            control: SchedulerControl {
                paused: Arc::new(AtomicBool::new(false)),
                cancel: CancellationToken::new(),
            },
            dag,
            document,
        })
    }

    /// Replace the freshly-minted run id with one from a prior invocation,
    /// for `--resume` (§6). Must be called before [`Scheduler::run`].
    pub fn resume_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run.id = run_id.into();
        self
    }

    /// Seed a step as already `completed` from a prior run's persisted
    /// output, so the dispatch loop treats its dependents as ready without
    /// re-running it. Unknown step ids are ignored. Must be called before
    /// [`Scheduler::run`].
    pub fn seed_completed_step(&mut self, step_id: &str, output: String, exit_code: Option<i32>) {
        let Some(step) = self.dag.steps.get_mut(step_id) else {
            return;
        };
        step.status = StepStatus::Completed;
        step.exit_code = exit_code;
        step.output = Some(output.clone());
        step.completed_at = Some(chrono::Utc::now());
        self.run.completed_steps.push(step_id.to_string());

        let mut fields = StepOutputs::new();
        fields.insert("output".to_string(), output);
        fields.insert(
            "exit_code".to_string(),
            exit_code.map(|c| c.to_string()).unwrap_or_default(),
        );
        self.outputs.insert(step_id.to_string(), fields);
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Drive the run to completion: dispatch ready waves until every step
    /// is terminal, applying retries, verification, and skip propagation
    /// along the way. Returns the completed `Run` record.
    pub async fn run(mut self) -> Result<Run, SchedulerError> {
        self.tally.total_steps = self.dag.steps.len();
        self.run.status = RunStatus::Running;
        self.events.publish(Event::RunStarted {
            run_id: self.run.id.clone(),
        });
        self.trajectory.planning(chrono::Utc::now());
        let _ = self.persistence.put_run(&self.run);

        let mut worker_events_rx = self
            .worker_events_rx
            .take()
            .expect("event pump taken twice");
        let listeners = self.listeners.clone();
        let events_for_pump = self.events.clone();
        let pump = tokio::spawn(async move {
            while let Some((worker, event)) = worker_events_rx.recv().await {
                if let PtyWorkerEvent::Stream { chunk } = &event {
                    events_for_pump.publish(Event::WorkerStream {
                        worker: worker.clone(),
                        chunk: chunk.clone(),
                    });
                }
                let mut guard = listeners.lock().await;
                if let Some(tx) = guard.get(&worker) {
                    if tx.send(event).is_err() {
                        guard.remove(&worker);
                    }
                }
            }
        });

        loop {
            if self.control.is_cancelled() {
                self.abort_remaining_steps();
                break;
            }
            if self.dag.all_terminal() {
                break;
            }
            while self.control.is_paused() && !self.control.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            let mut ready = self.dag.ready_steps();
            if ready.is_empty() {
                break;
            }
            if let Some(cap) = self.config.max_concurrency.or(self.document.max_concurrency) {
                ready.truncate(cap);
            }

            let wave = self.tally.completed + self.tally.failed + self.tally.skipped + 1;
            self.trajectory.track(wave, ready.clone(), chrono::Utc::now());
            for id in &ready {
                if let Some(step) = self.dag.steps.get_mut(id) {
                    step.status = StepStatus::Dispatched;
                }
            }

            let results = self.dispatch_wave(&ready).await;
            self.trajectory.convergence(chrono::Utc::now());

            for result in results {
                self.finish_step(result).await;
            }
        }

        pump.abort();

        self.run.status = if self.dag.any_failed() {
            RunStatus::Failed
        } else if self.control.is_cancelled() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        self.run.finished_at = Some(chrono::Utc::now());
        self.events.publish(Event::RunFinished {
            run_id: self.run.id.clone(),
            failed: self.run.status == RunStatus::Failed,
        });
        self.trajectory.retrospective(&self.tally, chrono::Utc::now());
        let _ = self.persistence.put_run(&self.run);

        Ok(self.run)
    }

    fn abort_remaining_steps(&mut self) {
        for step in self.dag.steps.values_mut() {
            if matches!(step.status, StepStatus::Pending | StepStatus::Dispatched) {
                step.status = StepStatus::Skipped;
                step.error = Some("run was cancelled".to_string());
                self.run.skipped_steps.push(step.id.clone());
            }
        }
    }

    /// Dispatch every step named in `ready` concurrently and collect their
    /// results once the whole wave completes. Cross-wave ordering is
    /// enforced by only ever calling this with steps whose dependencies
    /// are already terminal-success.
    async fn dispatch_wave(&mut self, ready: &[String]) -> Vec<DispatchResult> {
        let mut futures: FuturesUnordered<StepFuture> = FuturesUnordered::new();

        for step_id in ready {
            let spec = self.specs[step_id].clone();
            let body = match self.resolve_body(step_id, &spec) {
                Ok(body) => body,
                Err((id, message)) => {
                    futures.push(Box::pin(async move {
                        DispatchResult {
                            step_id: id,
                            outcome: StepOutcome::Failure {
                                category: StepFailureCategory::Unknown,
                                message,
                            },
                            release_worker: None,
                        }
                    }));
                    continue;
                }
            };

            if let Some(step) = self.dag.steps.get_mut(step_id) {
                step.task = body.clone();
                step.started_at = Some(chrono::Utc::now());
            }
            self.trajectory.step_intent(step_id, &body, chrono::Utc::now());
            self.trajectory.step_started(step_id, chrono::Utc::now());

            match spec.kind {
                StepKind::Agent | StepKind::Worktree => {
                    futures.push(self.build_agent_future(step_id, &spec, &body).await);
                }
                StepKind::NonInteractive => {
                    futures.push(self.build_non_interactive_future(step_id, &spec, &body));
                }
                StepKind::Deterministic => {
                    futures.push(self.build_deterministic_future(step_id, &spec, &body));
                }
            }
        }

        let mut results = Vec::with_capacity(ready.len());
        while let Some(result) = futures.next().await {
            results.push(result);
        }
        results
    }

    /// Second-pass interpolation of a step's body, resolved lazily right
    /// before dispatch against outputs available at that moment.
    fn resolve_body(&self, step_id: &str, spec: &StepSpec) -> Result<String, (String, String)> {
        interpolation::interpolate(step_id, &spec.body, &self.outputs)
            .map_err(|err| (step_id.to_string(), err.to_string()))
    }

    async fn build_agent_future(
        &mut self,
        step_id: &str,
        spec: &StepSpec,
        body: &str,
    ) -> StepFuture {
        let worker_name = spec
            .worker
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.run.id, step_id));
        let task = format!("{body}{}", agent_task_suffix());
        let cwd = if spec.kind == StepKind::Worktree {
            Some(self.run_dir.join("worktrees").join(step_id))
        } else {
            None
        };
        let step_id_owned = step_id.to_string();

        let spawn_result = self.supervisor.spawn_agent_in(
            &worker_name,
            "claude",
            &[],
            RestartPolicy::Never,
            cwd.as_deref(),
            Some(&task),
            None,
            &[],
        );

        if let Err(err) = spawn_result {
            let message = err.to_string();
            return Box::pin(async move {
                DispatchResult {
                    step_id: step_id_owned,
                    outcome: StepOutcome::Failure {
                        category: StepFailureCategory::SpawnFailed,
                        message,
                    },
                    release_worker: None,
                }
            });
        }

        let own_commands = self
            .supervisor
            .worker(&worker_name)
            .expect("just spawned")
            .commands
            .clone();

        let hub_commands = spec
            .nudge
            .as_ref()
            .and_then(|n| n.hub_worker.as_ref())
            .and_then(|hub| self.supervisor.worker(hub))
            .map(|h| h.commands.clone());

        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .await
            .insert(worker_name.clone(), listener_tx);

        let listener = PtyAgentListener::new(listener_rx);
        let nudge = spec.nudge.clone();
        let timeout = Duration::from_secs(spec.timeout_secs.unwrap_or(3600));
        let cancel = self.control.cancel.clone();
        let events = self.events.clone();
        let run_id = self.run.id.clone();

        Box::pin(async move {
            let (outcome, _force_released) = run_interactive(
                listener,
                own_commands,
                hub_commands,
                nudge,
                timeout,
                cancel,
                &run_id,
                &step_id_owned,
                &events,
            )
            .await;
            DispatchResult {
                step_id: step_id_owned,
                outcome,
                release_worker: Some(worker_name),
            }
        })
    }

    fn build_non_interactive_future(
        &self,
        step_id: &str,
        spec: &StepSpec,
        body: &str,
    ) -> StepFuture {
        let cli_name = spec.command.clone().unwrap_or_else(|| "claude".to_string());
        let task = format!("{}{body}", non_interactive_preamble());
        let args = non_interactive_args(&cli_name, &task);
        let timeout = Duration::from_secs(spec.timeout_secs.unwrap_or(600));
        let grace = self.config.shutdown_grace;
        let cancel = self.control.cancel.clone();
        let check_exit_code = spec.check_exit_code;
        let step_id = step_id.to_string();

        Box::pin(async move {
            let mut outcome = run_non_interactive(&cli_name, &args, timeout, grace, &cancel).await;
            if check_exit_code {
                outcome = reject_nonzero_exit(outcome);
            }
            DispatchResult {
                step_id,
                outcome,
                release_worker: None,
            }
        })
    }

    fn build_deterministic_future(
        &self,
        step_id: &str,
        spec: &StepSpec,
        body: &str,
    ) -> StepFuture {
        let command = body.to_string();
        let timeout = spec.timeout_secs.map(Duration::from_secs);
        let grace = self.config.shutdown_grace;
        let cancel = self.control.cancel.clone();
        let run_dir = self.run_dir.clone();
        let check_exit_code = spec.check_exit_code;
        let capture_stdout = spec.capture_stdout;
        let step_id = step_id.to_string();

        Box::pin(async move {
            if let Some(t) = timeout {
                if t.is_zero() {
                    return DispatchResult {
                        step_id,
                        outcome: StepOutcome::Failure {
                            category: StepFailureCategory::Timeout,
                            message: "zero-duration timeout".to_string(),
                        },
                        release_worker: None,
                    };
                }
            }

            let mut outcome =
                run_deterministic(&command, Some(&run_dir), timeout, grace, &cancel).await;
            if check_exit_code {
                outcome = reject_nonzero_exit(outcome);
            }
            if !capture_stdout {
                if let StepOutcome::Success { output, .. } = &mut outcome {
                    *output = "command completed".to_string();
                }
            }
            DispatchResult {
                step_id,
                outcome,
                release_worker: None,
            }
        })
    }

    /// Apply verification, retries, output caching, and skip propagation
    /// for one completed dispatch.
    async fn finish_step(&mut self, result: DispatchResult) {
        if let Some(worker) = &result.release_worker {
            self.listeners.lock().await.remove(worker);
            let _ = self.supervisor.stop_worker(worker).await;
        }

        let spec = self.specs[&result.step_id].clone();
        let mut outcome = result.outcome;

        if let (
            Some(Verification::FileExists { path }),
            StepOutcome::Failure {
                category: StepFailureCategory::Timeout,
                ..
            },
        ) = (&spec.verification, &outcome)
        {
            if file_exists_relative(path, &self.run_dir) {
                outcome = StepOutcome::Success {
                    output: format!("file {path} present despite timeout"),
                    exit_code: Some(0),
                };
            }
        }

        let verification_result = spec
            .verification
            .as_ref()
            .map(|v| verify(v, &outcome, &self.run_dir));
        if let Some(v) = &verification_result {
            self.tally.verifications_attempted += 1;
            if v.passed() {
                self.tally.verifications_passed += 1;
            }
        }
        let verification_failed = verification_result.as_ref().is_some_and(|v| !v.passed());

        let step = self
            .dag
            .steps
            .get_mut(&result.step_id)
            .expect("dispatched step must exist");

        let succeeded = outcome.is_success() && !verification_failed;

        if succeeded {
            let output = match &outcome {
                StepOutcome::Success { output, exit_code } => {
                    step.exit_code = *exit_code;
                    strip_escapes(output)
                }
                StepOutcome::Failure { .. } => unreachable!("checked by is_success above"),
            };

            step.status = StepStatus::Completed;
            step.output = Some(output.clone());
            step.completed_at = Some(chrono::Utc::now());
            self.run.completed_steps.push(step.id.clone());

            if step.retries_used == 0 {
                self.tally.first_attempt_successes += 1;
            }
            self.tally.completed += 1;

            self.trajectory.step_completed(&step.id, &output, chrono::Utc::now());
            let _ = write_step_output(&self.run_dir, &self.run.id, &step.id, &output);

            let mut fields = StepOutputs::new();
            fields.insert("output".to_string(), output);
            fields.insert(
                "exit_code".to_string(),
                step.exit_code.map(|c| c.to_string()).unwrap_or_default(),
            );
            self.outputs.insert(step.id.clone(), fields);

            let _ = self.persistence.put_step(&self.run.id, step);
            self.events.publish(Event::StepStateChanged {
                run_id: self.run.id.clone(),
                step_id: step.id.clone(),
                status: StepStatus::Completed,
            });
            return;
        }

        let (category, message) = match &outcome {
            StepOutcome::Failure { category, message } => (*category, message.clone()),
            StepOutcome::Success { .. } => (
                StepFailureCategory::VerificationMismatch,
                match verification_result {
                    Some(VerificationResult::Failed { reason }) => reason,
                    _ => "verification failed".to_string(),
                },
            ),
        };

        if step.retries_used < spec.retries {
            step.retries_used += 1;
            step.status = StepStatus::Pending;
            self.trajectory
                .step_retried(&step.id, step.retries_used, chrono::Utc::now());
            debug!(step = %step.id, attempt = step.retries_used, "retrying step after failure");
            return;
        }

        step.status = StepStatus::Failed;
        step.error = Some(message.clone());
        step.failure_category = Some(category);
        step.completed_at = Some(chrono::Utc::now());
        self.run.failed_steps.push(step.id.clone());
        self.tally.failed += 1;

        self.trajectory
            .step_failed(&step.id, category, &message, chrono::Utc::now());
        let _ = self.persistence.put_step(&self.run.id, step);
        self.events.publish(Event::StepStateChanged {
            run_id: self.run.id.clone(),
            step_id: step.id.clone(),
            status: StepStatus::Failed,
        });

        self.skip_dependents(&result.step_id);
    }

    /// Skip propagation per the run's error strategy: `fail_fast` walks
    /// every transitive dependent, `continue` skips only the direct ones.
    fn skip_dependents(&mut self, failed_step_id: &str) {
        let to_skip: Vec<String> = match self.document.error_strategy {
            ErrorStrategy::FailFast => self
                .dag
                .transitive_dependents(failed_step_id)
                .into_iter()
                .collect(),
            ErrorStrategy::Continue => self.dag.direct_dependents(failed_step_id),
        };

        for id in to_skip {
            if let Some(step) = self.dag.steps.get_mut(&id) {
                if matches!(step.status, StepStatus::Pending | StepStatus::Dispatched) {
                    step.status = StepStatus::Skipped;
                    step.error = Some(format!("skipped: upstream step {failed_step_id} failed"));
                    self.run.skipped_steps.push(step.id.clone());
                    self.tally.skipped += 1;
                    self.trajectory.step_skipped(
                        &step.id,
                        &format!("upstream step {failed_step_id} failed"),
                        chrono::Utc::now(),
                    );
                    info!(step = %step.id, upstream = failed_step_id, "step skipped");
                }
            }
        }
    }
}

/// Drives one PTY-backed step's lifecycle: plain exit-waiting when no
/// nudge config is present, or the interleaved wait-for-idle/nudge/
/// escalate loop when one is. The second element of the returned tuple
/// is always `true` (the caller always releases the worker once its step
/// is done); kept so the nudge and plain paths share one return shape.
#[allow(clippy::too_many_arguments)]
async fn run_interactive(
    mut listener: PtyAgentListener,
    own_commands: mpsc::Sender<PtyWorkerCommand>,
    hub_commands: Option<mpsc::Sender<PtyWorkerCommand>>,
    nudge: Option<crate::document::NudgeConfig>,
    overall_timeout: Duration,
    cancel: CancellationToken,
    run_id: &str,
    step_id: &str,
    events: &EventBus,
) -> (StepOutcome, bool) {
    let deadline = tokio::time::Instant::now() + overall_timeout;

    let Some(nudge_cfg) = nudge else {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        return tokio::select! {
            outcome = listener.wait_for_exit(remaining) => finish(outcome, &mut listener),
            _ = cancel.cancelled() => {
                listener.drain_available();
                (
                    StepOutcome::Failure {
                        category: StepFailureCategory::Aborted,
                        message: "run was cancelled".to_string(),
                    },
                    true,
                )
            }
        };
    };

    let mut nudges_sent = 0u32;
    loop {
        if tokio::time::Instant::now() >= deadline || cancel.is_cancelled() {
            listener.drain_available();
            let category = if cancel.is_cancelled() {
                StepFailureCategory::Aborted
            } else {
                StepFailureCategory::Timeout
            };
            return (
                StepOutcome::Failure {
                    category,
                    message: "agent step did not finish in time".to_string(),
                },
                true,
            );
        }

        let idle_wait = deadline
            .saturating_duration_since(tokio::time::Instant::now())
            .min(nudge_cfg.nudge_after);

        let idle_outcome = tokio::select! {
            outcome = listener.wait_for_idle(idle_wait) => outcome,
            _ = cancel.cancelled() => WaitOutcome::TimedOut,
        };

        match idle_outcome {
            WaitOutcome::ExitRequested | WaitOutcome::Exited => {
                return finish(idle_outcome, &mut listener);
            }
            WaitOutcome::Idle | WaitOutcome::TimedOut => {
                if nudges_sent >= nudge_cfg.max_nudges {
                    listener.drain_available();
                    events.publish(Event::StepForceReleased {
                        run_id: run_id.to_string(),
                        step_id: step_id.to_string(),
                    });
                    return (
                        StepOutcome::Success {
                            output: listener.buffer().to_string(),
                            exit_code: None,
                        },
                        true,
                    );
                }

                let target = hub_commands.as_ref().unwrap_or(&own_commands);
                let _ = target
                    .send(PtyWorkerCommand::Inject {
                        delivery_id: relay_types::new_id(),
                        text: "reminder: please continue and finish the current task.\n"
                            .to_string(),
                        expected_echo: String::new(),
                        max_attempts: 1,
                    })
                    .await;
                nudges_sent += 1;
                events.publish(Event::StepNudged {
                    run_id: run_id.to_string(),
                    step_id: step_id.to_string(),
                    attempt: nudges_sent,
                });

                let escalate_wait = deadline
                    .saturating_duration_since(tokio::time::Instant::now())
                    .min(nudge_cfg.escalate_after);
                let post_nudge = listener.wait_for_exit(escalate_wait).await;
                if matches!(post_nudge, WaitOutcome::ExitRequested | WaitOutcome::Exited) {
                    return finish(post_nudge, &mut listener);
                }
            }
        }
    }
}

/// Turn a successful exit with a nonzero code into a categorized failure,
/// for steps that haven't opted out via `check_exit_code: false`.
fn reject_nonzero_exit(outcome: StepOutcome) -> StepOutcome {
    match outcome {
        StepOutcome::Success { output, exit_code } if exit_code.unwrap_or(0) != 0 => {
            StepOutcome::Failure {
                category: StepFailureCategory::ExitNonzero,
                message: format!("exited with code {exit_code:?}: {output}"),
            }
        }
        other => other,
    }
}

fn finish(outcome: WaitOutcome, listener: &mut PtyAgentListener) -> (StepOutcome, bool) {
    match outcome {
        WaitOutcome::ExitRequested | WaitOutcome::Exited => (
            StepOutcome::Success {
                output: listener.buffer().to_string(),
                exit_code: listener.exit_code(),
            },
            true,
        ),
        WaitOutcome::TimedOut | WaitOutcome::Idle => (
            StepOutcome::Failure {
                category: StepFailureCategory::Timeout,
                message: "agent step timed out".to_string(),
            },
            true,
        ),
    }
}
