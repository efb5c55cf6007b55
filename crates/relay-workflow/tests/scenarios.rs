use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use relay_types::{RunStatus, StepKind};
use relay_workflow::{
    ErrorStrategy, InMemoryPersistence, NudgeConfig, RelayConfig, Scheduler, StepSpec,
    Verification, WorkflowDocument,
};

fn step(id: &str, kind: StepKind, deps: &[&str], body: &str) -> StepSpec {
    StepSpec {
        id: id.to_string(),
        kind,
        worker: None,
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        body: body.to_string(),
        expected_echo: None,
        command: None,
        retries: 0,
        timeout_secs: None,
        verification: None,
        nudge: None,
        check_exit_code: true,
        capture_stdout: true,
    }
}

fn document(name: &str, error_strategy: ErrorStrategy, steps: Vec<StepSpec>) -> WorkflowDocument {
    WorkflowDocument {
        name: name.to_string(),
        swarm_pattern: None,
        vars: Default::default(),
        max_concurrency: None,
        error_strategy,
        steps,
    }
}

/// Scenario 1 (§8): single deterministic step, happy path.
#[tokio::test]
async fn single_step_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut hello = step("hello", StepKind::Deterministic, &[], "printf hello");
    hello.verification = Some(Verification::OutputContains {
        text: "hello".to_string(),
    });

    let doc = document("single-step", ErrorStrategy::FailFast, vec![hello]);
    let scheduler = Scheduler::new(
        doc,
        RelayConfig::default(),
        dir.path().to_path_buf(),
        Arc::new(InMemoryPersistence::new()),
    )
    .unwrap();

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps, vec!["hello".to_string()]);
}

/// Scenario 2 (§8): a step that only succeeds on its second invocation,
/// with a retry budget of one.
#[tokio::test]
async fn retry_then_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempted");
    let marker_path = marker.display().to_string();

    // Fails exit code 1 on the first invocation (no marker file yet),
    // creates the marker and exits 0 on the second.
    let command = format!(
        "if [ -f {marker_path} ]; then exit 0; else touch {marker_path}; exit 1; fi"
    );

    let mut flaky = step("flaky", StepKind::Deterministic, &[], &command);
    flaky.retries = 1;

    let doc = document("retry-then-succeed", ErrorStrategy::FailFast, vec![flaky]);
    let scheduler = Scheduler::new(
        doc,
        RelayConfig::default(),
        dir.path().to_path_buf(),
        Arc::new(InMemoryPersistence::new()),
    )
    .unwrap();

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps, vec!["flaky".to_string()]);
}

/// Scenario 3 (§8): three-node fan-out, `a` fails after exhausting
/// retries, and both `b` and `c` are skipped under fail-fast.
#[tokio::test]
async fn fail_fast_cascade() {
    let dir = tempfile::tempdir().unwrap();

    let a = step("a", StepKind::Deterministic, &[], "exit 1");
    let b = step("b", StepKind::Deterministic, &["a"], "printf b");
    let c = step("c", StepKind::Deterministic, &["a"], "printf c");

    let doc = document("fail-fast-cascade", ErrorStrategy::FailFast, vec![a, b, c]);
    let scheduler = Scheduler::new(
        doc,
        RelayConfig::default(),
        dir.path().to_path_buf(),
        Arc::new(InMemoryPersistence::new()),
    )
    .unwrap();

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_steps, vec!["a".to_string()]);
    let mut skipped = run.skipped_steps.clone();
    skipped.sort();
    assert_eq!(skipped, vec!["b".to_string(), "c".to_string()]);
}

/// Scenario 4 (§8): `build`'s task references `plan`'s captured output via
/// the second interpolation pass.
#[tokio::test]
async fn template_interpolation_resolves_upstream_output() {
    let dir = tempfile::tempdir().unwrap();

    let plan = step("plan", StepKind::Deterministic, &[], "printf WIDGET");
    let mut build = step(
        "build",
        StepKind::Deterministic,
        &["plan"],
        "printf make-{{steps.plan.output}}",
    );
    build.verification = Some(Verification::OutputContains {
        text: "make-WIDGET".to_string(),
    });

    let doc = document(
        "template-interpolation",
        ErrorStrategy::FailFast,
        vec![plan, build],
    );
    let scheduler = Scheduler::new(
        doc,
        RelayConfig::default(),
        dir.path().to_path_buf(),
        Arc::new(InMemoryPersistence::new()),
    )
    .unwrap();

    let run = scheduler.run().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_steps.contains(&"build".to_string()));
}

/// A zero-duration timeout fails the step immediately (§8 boundary
/// behaviors: "a step whose timeout equals zero fails immediately with a
/// timeout error").
#[tokio::test]
async fn zero_timeout_fails_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let mut slow = step("slow", StepKind::Deterministic, &[], "sleep 5");
    slow.timeout_secs = Some(0);

    let doc = document("zero-timeout", ErrorStrategy::FailFast, vec![slow]);
    let scheduler = Scheduler::new(
        doc,
        RelayConfig::default(),
        dir.path().to_path_buf(),
        Arc::new(InMemoryPersistence::new()),
    )
    .unwrap();

    let run = scheduler.run().await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

/// A wave of size exceeding `max_concurrency` still gets every step to a
/// terminal state, it just takes more than one wave to get there.
#[tokio::test]
async fn max_concurrency_caps_wave_size_without_losing_steps() {
    let dir = tempfile::tempdir().unwrap();
    let steps: Vec<StepSpec> = (0..5)
        .map(|i| step(&format!("s{i}"), StepKind::Deterministic, &[], "printf ok"))
        .collect();

    let mut config = RelayConfig::default();
    config.max_concurrency = Some(2);

    let doc = document("capped-concurrency", ErrorStrategy::FailFast, steps);
    let scheduler = Scheduler::new(doc, config, dir.path().to_path_buf(), Arc::new(InMemoryPersistence::new())).unwrap();

    let run = scheduler.run().await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps.len(), 5);
}

/// Scenario 6 (§8): an interactive step whose simulated worker produces no
/// output at all is nudged once, then force-released once the nudge
/// budget is exhausted, and the step still succeeds with whatever output
/// was captured (here, none).
///
/// The scheduler always spawns the literal command `claude` for agent
/// steps; this test puts a stand-in script by that name at the front of
/// `PATH` that sleeps without ever writing to its pty, so the worker it
/// drives actually goes idle the way a stuck real agent would.
#[tokio::test]
async fn idle_nudge_then_force_release() {
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    let fake_claude = bin_dir.join("claude");
    std::fs::write(&fake_claude, "#!/bin/sh\nsleep 5\n").unwrap();
    let mut perms = std::fs::metadata(&fake_claude).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(&fake_claude, perms).unwrap();

    let original_path = std::env::var("PATH").unwrap_or_default();
    unsafe {
        std::env::set_var("PATH", format!("{}:{original_path}", bin_dir.display()));
    }

    let mut agent = step("stuck", StepKind::Agent, &[], "do something");
    agent.nudge = Some(NudgeConfig {
        nudge_after: Duration::from_millis(100),
        max_nudges: 1,
        escalate_after: Duration::from_millis(100),
        hub_worker: None,
    });
    agent.timeout_secs = Some(5);

    let doc = document("idle-nudge", ErrorStrategy::FailFast, vec![agent]);
    let scheduler = Scheduler::new(
        doc,
        RelayConfig::default(),
        dir.path().to_path_buf(),
        Arc::new(InMemoryPersistence::new()),
    )
    .unwrap();

    let run = tokio::time::timeout(Duration::from_secs(10), scheduler.run())
        .await
        .expect("run should finish well before the step's own 5s timeout")
        .unwrap();

    unsafe {
        std::env::set_var("PATH", original_path);
    }

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps, vec!["stuck".to_string()]);
}

#[test]
fn depends_on_is_still_a_btreeset_for_deterministic_document_ordering() {
    let spec = step("a", StepKind::Deterministic, &["x", "y"], "printf a");
    let expected: BTreeSet<String> = ["x".to_string(), "y".to_string()].into_iter().collect();
    assert_eq!(spec.depends_on, expected);
}
