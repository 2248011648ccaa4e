use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobplan::agent_rpc::LoopbackAgent;
use jobplan::cli::{Cli, Command};
use jobplan::config::SchedulerConfig;
use jobplan::model::World;
use jobplan::planner::JobDescriptor;
use jobplan::scheduler::Service;
use jobplan::state_machine::{CommandId, CommandStatus, JobArgs, JobClass, ObjectKey, StepResultState};
use jobplan::store::{MemoryStore, Store};
use jobplan::ui::{self, CommandProgress, JobSummary};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Returns whether the requested work succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let config = SchedulerConfig::load(cli.config.as_deref())?;
    let store_path: Option<PathBuf> = cli.store.clone().or_else(|| config.store_path.clone());
    let store = Arc::new(match &store_path {
        Some(path) => MemoryStore::open(path).with_context(|| format!("opening store {}", path.display()))?,
        None => MemoryStore::new(),
    });

    let world = World::load(&cli.world).with_context(|| format!("loading world {}", cli.world.display()))?;
    let inserted = world.populate(store.as_ref())?;
    if inserted > 0 {
        info!(inserted, "objects added from world file");
    }

    if let Command::Status = cli.command {
        ui::print_status(&store.all_objects(), &store.commands());
        return Ok(true);
    }

    let agent = LoopbackAgent::new(world.fqdns());
    let mut service = Service::start(world.registry()?, store.clone(), config, agent)?;
    let outcome = dispatch(&mut service, cli.command, store.as_ref()).await;
    let stopped = service.shutdown().await;

    if let Some(path) = &store_path {
        store
            .snapshot(path)
            .with_context(|| format!("writing store {}", path.display()))?;
        info!(path = %path.display(), "store saved");
    }
    let succeeded = outcome?;
    stopped?;
    Ok(succeeded)
}

async fn dispatch(service: &mut Service, command: Command, store: &dyn Store) -> Result<bool> {
    let scheduler = service.scheduler.clone();
    match command {
        Command::SetState { assignments, message } => {
            let message = message.unwrap_or_else(|| {
                let targets: Vec<String> = assignments.iter().map(|(k, s)| format!("{k} -> {s}")).collect();
                format!("Set state: {}", targets.join(", "))
            });
            let id = scheduler.command_set_state(&assignments, &message)?;
            wait_and_report(service, id, &message, store).await
        }
        Command::RunJob {
            class,
            args,
            objects,
            message,
        } => {
            let mut job_args: JobArgs = args.into_iter().collect();
            match objects.as_slice() {
                [] => {}
                [one] => {
                    job_args.insert("object".into(), json!(one));
                }
                many => {
                    job_args.insert("objects".into(), json!(many));
                }
            }
            let message = message.unwrap_or_else(|| format!("Run {class}"));
            let id = scheduler.command_run_jobs(&[JobDescriptor::new(class, job_args)], &message)?;
            wait_and_report(service, id, &message, store).await
        }
        Command::Consequences { object, state } => {
            let preview = scheduler.get_transition_consequences(&object, &state)?;
            ui::print_json(&format!("{object} -> {state}"), &preview);
            Ok(true)
        }
        Command::Routes { objects } => {
            let transitions = scheduler.available_transitions(&objects)?;
            let jobs = scheduler.available_jobs(&objects)?;
            let routes: serde_json::Map<String, Value> = objects
                .iter()
                .map(|key: &ObjectKey| {
                    let entry = json!({
                        "transitions": transitions.get(key),
                        "jobs": jobs.get(key),
                    });
                    (key.to_string(), entry)
                })
                .collect();
            ui::print_json("Available", &routes);
            Ok(true)
        }
        Command::Status => Ok(true),
    }
}

/// Show a spinner until command `id` completes, then print its jobs.
/// Ctrl-C cancels the command.
async fn wait_and_report(service: &mut Service, id: CommandId, message: &str, store: &dyn Store) -> Result<bool> {
    let scheduler = service.scheduler.clone();
    let progress = CommandProgress::start(message);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let command = loop {
        tokio::select! {
            command = service.await_command(id) => break command?,
            _ = ticker.tick() => {
                if let Some(command) = scheduler.command(id) {
                    let done = command
                        .jobs
                        .iter()
                        .filter_map(|j| scheduler.job(*j))
                        .filter(|j| j.is_complete())
                        .count();
                    progress.update(message, done, command.jobs.len());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(command_id = id, "interrupted, cancelling command");
                scheduler.cancel_command(id)?;
            }
        }
    };

    let summaries: Vec<JobSummary> = command
        .jobs
        .iter()
        .filter_map(|j| scheduler.job(*j))
        .map(|job| {
            let description = scheduler
                .registry()
                .job_class(&job.spec.class_name)
                .map(|class| class.description(&job.spec))
                .unwrap_or_else(|_| job.spec.class_name.clone());
            let failure = store
                .step_results_for_job(job.id)
                .into_iter()
                .filter(|r| r.state == StepResultState::Failed)
                .max_by_key(|r| r.id)
                .map(|r| r.backtrace);
            JobSummary {
                job,
                description,
                failure,
            }
        })
        .collect();
    progress.finish(&command, &summaries);
    Ok(command.status() == CommandStatus::Successful)
}
