mod broker_main;
mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use relay_types::{RunStatus, StepStatus};
use relay_workflow::{Dag, FilePersistence, PersistenceAdapter, RelayConfig, Scheduler, WorkflowDocument};
use tracing_subscriber::EnvFilter;
use tracing::info;

use cli::{dry_run_requested, Cli, Command, RunArgs};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Run(args) => run_workflow(args).await?,
        Command::Broker(args) => {
            broker_main::run(args).await?;
            0
        }
    };

    std::process::exit(exit_code);
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RelayConfig> {
    match path {
        Some(path) => Ok(RelayConfig::load(path)?),
        None => Ok(RelayConfig::default()),
    }
}

/// Build the DAG, pretending every ready wave completes instantly, to
/// produce a planned execution order for `--validate`/`DRY_RUN` (§6) without
/// dispatching anything.
fn planned_waves(dag: &mut Dag, max_concurrency: Option<usize>) -> Vec<Vec<(String, relay_types::StepKind)>> {
    let mut waves = Vec::new();
    loop {
        let ready = dag.ready_steps();
        if ready.is_empty() {
            break;
        }
        for chunk in ready.chunks(max_concurrency.unwrap_or(ready.len()).max(1)) {
            let wave: Vec<_> = chunk
                .iter()
                .map(|id| (id.clone(), dag.steps[id].kind))
                .collect();
            for (id, _) in &wave {
                dag.steps.get_mut(id).unwrap().status = StepStatus::Completed;
            }
            waves.push(wave);
        }
    }
    waves
}

async fn run_workflow(args: RunArgs) -> anyhow::Result<i32> {
    let mut document = WorkflowDocument::load(&args.workflow_path)?;
    if let Some(name) = &args.workflow {
        document.name = name.clone();
    }

    if args.validate || dry_run_requested() {
        document.resolve_vars();
        let mut dag = Dag::build(&document)?;
        let config = load_config(args.config.as_ref())?;
        let waves = planned_waves(&mut dag, config.max_concurrency);

        if args.validate {
            println!("workflow '{}' is valid: {} step(s) across {} wave(s)", document.name, document.steps.len(), waves.len());
        } else {
            println!("planned execution for workflow '{}':", document.name);
            for (index, wave) in waves.iter().enumerate() {
                let summary: Vec<String> = wave
                    .iter()
                    .map(|(id, kind)| format!("{id} ({kind:?})"))
                    .collect();
                println!("  wave {}: {}", index + 1, summary.join(", "));
            }
        }
        return Ok(0);
    }

    let config = load_config(args.config.as_ref())?;
    let persistence: Arc<dyn PersistenceAdapter> = Arc::new(FilePersistence::open(&args.run_dir)?);

    let mut scheduler = Scheduler::new(document, config, args.run_dir.clone(), persistence.clone())?;

    if let Some(resume_id) = &args.resume {
        let prior_steps = persistence.get_steps(resume_id)?;
        scheduler = scheduler.resume_run_id(resume_id.clone());
        for step in prior_steps {
            if step.status == StepStatus::Completed {
                scheduler.seed_completed_step(&step.id, step.output.unwrap_or_default(), step.exit_code);
            }
        }
        info!(run_id = %resume_id, "resuming run from persisted journal");
    }

    let control = scheduler.control.clone();
    let signaled = Arc::new(AtomicBool::new(false));
    {
        let signaled = signaled.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signaled.store(true, Ordering::SeqCst);
                control.cancel();
            }
        });
    }

    println!("run starting: workflow={}", args.workflow_path.display());
    let run = scheduler.run().await?;

    println!(
        "run {}: {:?} ({} completed, {} failed, {} skipped)",
        run.id,
        run.status,
        run.completed_steps.len(),
        run.failed_steps.len(),
        run.skipped_steps.len(),
    );

    if signaled.load(Ordering::SeqCst) {
        return Ok(130);
    }

    Ok(match run.status {
        RunStatus::Completed => 0,
        _ => 1,
    })
}
