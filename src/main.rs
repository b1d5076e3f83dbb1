use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use cloudforge::config::{CliOverrides, Config};
use cloudforge::errors::CliError;
use cloudforge::orchestrator::runner::{install_signal_handlers, terminate_tracked_children, RealStreamRunner};
use cloudforge::orchestrator::scheduler::{DefaultPromptProvider, ExitOutcome, Scheduler, SchedulerConfig};
use cloudforge::orchestrator::state::{NewStateOptions, WorkflowState};
use cloudforge::recovery;
use cloudforge::workflow::WorkflowDefinition;

/// Autonomous orchestrator that drives a coding agent through a workflow
/// of phases.
#[derive(Parser, Debug)]
#[command(name = "cloudforge", version, about)]
struct Cli {
    /// Task description. Omit to resume an existing run in --working-dir.
    task: Option<String>,

    #[arg(long, default_value_t = 25)]
    max_iterations: u32,

    #[arg(long, default_value_t = 3)]
    max_phase_retries: u32,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    working_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 50)]
    max_turns: u32,

    #[arg(long)]
    continue_session: Option<String>,

    #[arg(long)]
    dry_run: bool,

    #[arg(long, default_value_t = 43_200)]
    rate_limit_wait: u64,

    #[arg(long)]
    cli_path: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let working_dir = match &cli.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to read current directory")?,
    };

    let overrides = CliOverrides {
        cli_path: cli.cli_path.clone(),
        model: cli.model.clone(),
        max_iterations: Some(cli.max_iterations),
        max_phase_retries: Some(cli.max_phase_retries),
        max_turns: Some(cli.max_turns),
        rate_limit_wait_secs: Some(cli.rate_limit_wait),
        working_dir: Some(working_dir.clone()),
    };
    let config = Config::resolve(working_dir.clone(), overrides)?;
    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
    }

    let workflow_path = working_dir.join("workflow.dot");
    let workflow = WorkflowDefinition::load_cached(&workflow_path)
        .with_context(|| format!("failed to load workflow definition at {}", workflow_path.display()))?;

    let state_opts = NewStateOptions {
        iteration_cap: config.max_iterations,
        max_phase_retries: config.max_phase_retries,
        model: config.model.clone(),
        first_phase: workflow.first_phase().to_string(),
    };

    let state = resolve_launch_mode(&cli, &working_dir, &workflow, state_opts)?;

    if cli.dry_run {
        println!(
            "dry run: would start task {:?} at phase {}",
            state.task, state.current_phase
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone()).context("failed to install signal handlers")?;

    let scheduler = Scheduler {
        workflow,
        runner: Arc::new(RealStreamRunner),
        prompts: Arc::new(DefaultPromptProvider),
        config: SchedulerConfig {
            cli_path: config.cli_path,
            model: config.model,
            max_turns: config.max_turns,
            working_dir: config.working_dir,
            iteration_cap: config.max_iterations,
            max_phase_retries: config.max_phase_retries,
            rate_limit_wait_secs: config.rate_limit_wait_secs,
            verbose: cli.verbose,
        },
        cancel,
    };

    match scheduler.run(state).await {
        ExitOutcome::Completed => {
            println!("workflow complete");
            Ok(())
        }
        ExitOutcome::Halted { reason } => {
            terminate_tracked_children();
            eprintln!("halted: {reason}");
            eprintln!("re-run with no task argument to auto-resume");
            std::process::exit(1);
        }
    }
}

fn resolve_launch_mode(
    cli: &Cli,
    working_dir: &std::path::Path,
    workflow: &WorkflowDefinition,
    state_opts: NewStateOptions,
) -> Result<WorkflowState> {
    let ordered = workflow.ordered_phase_names().to_vec();

    if let Some(session_id) = &cli.continue_session {
        let state = recovery::load_state_lenient(working_dir).ok_or_else(|| CliError::ContinueSessionNotFound {
            session_id: session_id.clone(),
        })?;
        return Ok(recovery::repair_state(state, &ordered));
    }

    if let Some(task) = &cli.task {
        return Ok(WorkflowState::create(task.clone(), state_opts));
    }

    if recovery::has_artifact_dir(working_dir) {
        if let Some(state) = recovery::try_load_state(working_dir) {
            return Ok(recovery::repair_state(state, &ordered));
        }
        let state = recovery::recover_state_from_artifacts(working_dir, workflow, state_opts)?;
        return Ok(state);
    }

    Err(CliError::NoTaskAndNoRun.into())
}
