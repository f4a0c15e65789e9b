//! CLI commands implementation

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use kabuki_core::{
    parse_batch, ConfigSearch, JobRequirement, JobStatus, KabukiError, MachineConfig,
    SchedulerConfig,
};
use kabuki_runtime::{RemoteRuntime, Runtime, SessionHandle, SessionOutcome, SessionSpec};
use kabuki_scheduler::{BatchOptions, Scheduler};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::TransferArgs;

/// Resolve machine names to records
pub fn load_machines(names: &[String]) -> Result<Vec<MachineConfig>> {
    let search = ConfigSearch::from_env()?;
    names
        .iter()
        .map(|name| {
            search
                .load_machine(name)
                .with_context(|| format!("loading machine '{}'", name))
        })
        .collect()
}

/// Run a batch file across the fleet
pub async fn batch(
    settings: &SchedulerConfig,
    cancel: watch::Receiver<bool>,
    batch_file: &Path,
    machine_names: &[String],
    requirement: JobRequirement,
    transfer: TransferArgs,
    dry_run: bool,
) -> Result<i32> {
    let content = std::fs::read_to_string(batch_file)
        .with_context(|| format!("reading batch file {}", batch_file.display()))?;
    let jobs = parse_batch(batch_file, &content);
    let machines = load_machines(machine_names)?;

    let runtime: Arc<dyn Runtime> = Arc::new(RemoteRuntime::new(settings));
    let scheduler = Scheduler::new(runtime, settings.clone());
    let fleet = scheduler.probe_fleet(machines).await?;

    let mut options = BatchOptions::new(requirement, settings.results_dir.clone());
    options.inputs = transfer.copy_forwards;
    options.outputs = transfer.copy_backwards;

    scheduler.announce(&fleet, &jobs, &options)?;

    if dry_run {
        let plan = scheduler.plan(&fleet, &jobs, &options)?;
        for placed in &plan.placements {
            let accelerator = placed
                .accelerator
                .map_or_else(|| "-".to_string(), |idx| idx.to_string());
            println!(
                "{:<30} {:<20} accelerator {:<3} cost {:.3e}",
                placed.job_name,
                fleet[placed.machine].config.display_name(),
                accelerator,
                placed.cost
            );
        }
        for name in &plan.skipped {
            println!("skipping {}: results already exist", name);
        }
        println!(
            "{} jobs would start, {} would wait for a free slot",
            plan.placements.len(),
            plan.waiting
        );
        return Ok(0);
    }

    let report = scheduler.run_batch(&fleet, jobs, &options, cancel).await?;
    println!(
        "{} finished, {} failed, {} skipped{}",
        report.count(JobStatus::Finished),
        report.count(JobStatus::Failed),
        report.count(JobStatus::Skipped),
        if report.interrupted { " (interrupted)" } else { "" }
    );
    Ok(report.exit_code())
}

fn session_spec(
    settings: &SchedulerConfig,
    name: String,
    command: String,
    transfer: &TransferArgs,
) -> Result<SessionSpec> {
    let result_dir = settings.results_dir.join(&name);
    if result_dir.exists() {
        bail!(
            "results for '{}' already exist in {}",
            name,
            result_dir.display()
        );
    }
    let mut spec = SessionSpec::new(name, command, result_dir);
    spec.inputs = transfer.copy_forwards.clone();
    spec.outputs = transfer.copy_backwards.clone();
    spec.stdout = Box::new(tokio::io::stdout());
    spec.stderr = Box::new(tokio::io::stderr());
    Ok(spec)
}

fn random_job_name() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Map a session outcome onto a process exit status.
fn exit_status(outcome: SessionOutcome) -> Result<i32> {
    match outcome {
        Ok(_) => Ok(0),
        Err(KabukiError::RemoteCommand { status }) => Ok(status),
        Err(KabukiError::Cancelled) => Ok(130),
        Err(e) => Err(e.into()),
    }
}

/// Wait for a session, cancelling it when `cancel` turns true.
async fn wait_for(
    mut handle: SessionHandle,
    cancel: &mut watch::Receiver<bool>,
    poll: Duration,
) -> SessionOutcome {
    while !handle.is_finished() {
        if *cancel.borrow() {
            handle.cancel();
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            changed = cancel.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }
    handle.join().await
}

/// Run one command on one machine
pub async fn run(
    settings: &SchedulerConfig,
    mut cancel: watch::Receiver<bool>,
    command: String,
    machine_name: &str,
    job_name: Option<String>,
    transfer: TransferArgs,
) -> Result<i32> {
    let machine = load_machines(&[machine_name.to_string()])?
        .into_iter()
        .next()
        .context("no machine record loaded")?;
    let name = job_name.unwrap_or_else(random_job_name);
    let spec = session_spec(settings, name, command, &transfer)?;

    let runtime = RemoteRuntime::new(settings);
    let handle = runtime.launch(&machine, spec).await?;
    exit_status(wait_for(handle, &mut cancel, settings.dispatch_pacing()).await)
}

/// Run one command on several machines concurrently
pub async fn on(
    settings: &SchedulerConfig,
    cancel: watch::Receiver<bool>,
    command: String,
    machine_names: &[String],
    job_name: Option<String>,
    transfer: TransferArgs,
) -> Result<i32> {
    let machines = load_machines(machine_names)?;
    let prefix = job_name.unwrap_or_else(random_job_name);
    let runtime = RemoteRuntime::new(settings);

    let mut handles = Vec::with_capacity(machines.len());
    for (position, machine) in machines.iter().enumerate() {
        let name = format!("{}_{}", prefix, position);
        let spec = session_spec(settings, name, command.clone(), &transfer)?;
        handles.push((machine.display_name().to_string(), runtime.launch(machine, spec).await?));
    }

    let poll = settings.dispatch_pacing();
    let waits = handles.into_iter().map(|(machine, handle)| {
        let mut cancel = cancel.clone();
        async move { (machine, wait_for(handle, &mut cancel, poll).await) }
    });

    let mut code = 0;
    for (machine, outcome) in join_all(waits).await {
        match exit_status(outcome) {
            Ok(0) => {}
            Ok(status) => {
                eprintln!("{}: exited with status {}", machine, status);
                code = code.max(status);
            }
            Err(e) => {
                eprintln!("{}: {}", machine, e);
                code = code.max(1);
            }
        }
    }
    Ok(code)
}

/// Print readings and capacity of each machine
pub async fn probe(
    settings: &SchedulerConfig,
    machine_names: &[String],
    requirement: JobRequirement,
) -> Result<i32> {
    let machines = load_machines(machine_names)?;
    let runtime: Arc<dyn Runtime> = Arc::new(RemoteRuntime::new(settings));
    let scheduler = Scheduler::new(runtime, settings.clone());
    let fleet = scheduler.probe_fleet(machines).await?;
    let capacity = scheduler.capacity(&fleet, &requirement)?;

    for (machine, slots) in fleet.iter().zip(capacity) {
        println!("{}:", machine.config.display_name());
        println!("{}", serde_json::to_string_pretty(&machine.reading)?);
        println!("  room for {} jobs", slots.len());
    }
    Ok(0)
}
