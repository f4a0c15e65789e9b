//! Main scheduler logic

use futures::future::join_all;
use kabuki_core::{
    Job, JobRequirement, JobStatus, KabukiError, KabukiResult, MachineConfig, ResourceReading,
    SchedulerConfig,
};
use kabuki_runtime::{Runtime, SessionHandle, SessionOutcome, SessionSpec};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cost::CostModel;
use crate::ledger::{MachineLedger, ReservationId};
use crate::placement::{ensure_feasible, place_on_fleet, probe_capacity};

/// A configured machine together with its startup reading
#[derive(Debug, Clone)]
pub struct Machine {
    pub config: MachineConfig,
    pub reading: ResourceReading,
}

/// Everything every job of a batch shares
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub requirement: JobRequirement,
    /// Local paths staged for every job
    pub inputs: Vec<PathBuf>,
    /// Remote paths collected from every job
    pub outputs: Vec<PathBuf>,
    /// Directory holding per-job result directories and side files
    pub results_dir: PathBuf,
}

impl BatchOptions {
    pub fn new(requirement: JobRequirement, results_dir: PathBuf) -> Self {
        Self {
            requirement,
            inputs: Vec::new(),
            outputs: Vec::new(),
            results_dir,
        }
    }

    /// Where `job`'s collected outputs go; its existence marks the job done.
    pub fn result_dir(&self, job: &Job) -> PathBuf {
        self.results_dir.join(&job.name)
    }

    fn side_file(&self, job: &Job, extension: &str) -> PathBuf {
        self.results_dir.join(format!("{}.{}", job.name, extension))
    }
}

/// Outcome of a whole batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub jobs: Vec<Job>,
    /// The batch was cancelled before every job ran
    pub interrupted: bool,
    /// Jobs failed because no machine could ever host them
    pub infeasible: usize,
}

impl BatchReport {
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    /// 0 when every job finished or was skipped, 130 when interrupted,
    /// 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            130
        } else if self
            .jobs
            .iter()
            .all(|j| matches!(j.status, JobStatus::Finished | JobStatus::Skipped))
        {
            0
        } else {
            1
        }
    }
}

/// One placement of a dry run
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub job_name: String,
    pub machine: usize,
    pub accelerator: Option<usize>,
    pub cost: f64,
}

/// First scheduling round of a batch, computed without running anything
#[derive(Debug, Clone, Default)]
pub struct DryRunPlan {
    pub placements: Vec<PlannedJob>,
    pub skipped: Vec<String>,
    /// Jobs that would wait for a slot to free up
    pub waiting: usize,
}

struct RunningJob {
    job: usize,
    machine: usize,
    reservation: ReservationId,
    handle: SessionHandle,
}

/// Scheduler places queued jobs on the fleet and drives their sessions
pub struct Scheduler {
    runtime: Arc<dyn Runtime>,
    config: SchedulerConfig,
    model: CostModel,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(runtime: Arc<dyn Runtime>, config: SchedulerConfig) -> Self {
        let model = CostModel::from(&config);
        info!(
            runtime = runtime.name(),
            cpu_soft_limit = model.cpu_soft_limit,
            accelerator_soft_limit = model.accelerator_soft_limit,
            "Scheduler initialized"
        );
        Self {
            runtime,
            config,
            model,
        }
    }

    pub fn model(&self) -> &CostModel {
        &self.model
    }

    /// Read every machine concurrently. Any failure is fatal, naming every
    /// host that could not be read.
    pub async fn probe_fleet(&self, machines: Vec<MachineConfig>) -> KabukiResult<Vec<Machine>> {
        let timeout = self.config.probe_timeout();
        let probes = machines.iter().map(|machine| async move {
            match tokio::time::timeout(timeout, self.runtime.probe(machine)).await {
                Ok(result) => result,
                Err(_) => Err(KabukiError::connectivity(
                    machine.display_name(),
                    format!("probe timed out after {:?}", timeout),
                )),
            }
        });
        let results = join_all(probes).await;

        let mut fleet = Vec::with_capacity(machines.len());
        let mut failed_hosts = Vec::new();
        let mut messages = Vec::new();
        for (config, result) in machines.into_iter().zip(results) {
            match result {
                Ok(reading) => fleet.push(Machine { config, reading }),
                Err(e) => {
                    warn!(machine = %config.display_name(), error = %e, "Probe failed");
                    failed_hosts.push(config.display_name().to_string());
                    messages.push(e.to_string());
                }
            }
        }
        if !failed_hosts.is_empty() {
            return Err(KabukiError::connectivity(
                failed_hosts.join(", "),
                messages.join("; "),
            ));
        }
        Ok(fleet)
    }

    /// Accelerator choices of every slot each machine offers right now
    pub fn capacity(
        &self,
        fleet: &[Machine],
        requirement: &JobRequirement,
    ) -> KabukiResult<Vec<Vec<Option<usize>>>> {
        fleet
            .iter()
            .map(|machine| {
                let mut ledger = MachineLedger::from_reading(&machine.reading);
                probe_capacity(&self.model, &mut ledger, requirement)
            })
            .collect()
    }

    /// Print what the fleet can take and which results already exist.
    pub fn announce(&self, fleet: &[Machine], jobs: &[Job], options: &BatchOptions) -> KabukiResult<()> {
        for (machine, slots) in fleet.iter().zip(self.capacity(fleet, &options.requirement)?) {
            let choices: Vec<String> = slots
                .iter()
                .map(|slot| slot.map_or_else(|| "-".to_string(), |idx| idx.to_string()))
                .collect();
            println!(
                "{}: room for {} jobs (accelerators: {})",
                machine.config.display_name(),
                slots.len(),
                choices.join(" ")
            );
        }
        let existing = jobs
            .iter()
            .filter(|job| options.result_dir(job).exists())
            .count();
        if existing > 0 {
            println!(
                "warning: {} of {} jobs already have results in {} and will be skipped",
                existing,
                jobs.len(),
                options.results_dir.display()
            );
        }
        Ok(())
    }

    fn feasibility(&self, fleet: &[Machine], requirement: &JobRequirement) -> KabukiResult<()> {
        let readings: Vec<(String, &ResourceReading)> = fleet
            .iter()
            .map(|m| (m.config.display_name().to_string(), &m.reading))
            .collect();
        ensure_feasible(&self.model, &readings, requirement)
    }

    /// Plan the first round of placements without starting any session.
    pub fn plan(
        &self,
        fleet: &[Machine],
        jobs: &[Job],
        options: &BatchOptions,
    ) -> KabukiResult<DryRunPlan> {
        self.feasibility(fleet, &options.requirement)?;
        let mut ledgers: Vec<MachineLedger> = fleet
            .iter()
            .map(|m| MachineLedger::from_reading(&m.reading))
            .collect();
        let mut plan = DryRunPlan::default();
        let mut full = false;

        for job in jobs {
            if options.result_dir(job).exists() {
                plan.skipped.push(job.name.clone());
                continue;
            }
            if full {
                plan.waiting += 1;
                continue;
            }
            let Some((machine, decision)) =
                place_on_fleet(&self.model, &mut ledgers, &options.requirement)?
            else {
                full = true;
                plan.waiting += 1;
                continue;
            };
            plan.placements.push(PlannedJob {
                job_name: job.name.clone(),
                machine,
                accelerator: decision.accelerator,
                cost: decision.cost.raw(),
            });
        }
        Ok(plan)
    }

    /// Run every job of the batch, returning once each one reached a
    /// terminal status or `cancel` turned true and all sessions cleaned up.
    pub async fn run_batch(
        &self,
        fleet: &[Machine],
        mut jobs: Vec<Job>,
        options: &BatchOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> KabukiResult<BatchReport> {
        self.feasibility(fleet, &options.requirement)?;
        tokio::fs::create_dir_all(&options.results_dir).await?;

        let mut ledgers: Vec<MachineLedger> = fleet
            .iter()
            .map(|m| MachineLedger::from_reading(&m.reading))
            .collect();
        let mut queue: VecDeque<usize> = (0..jobs.len()).collect();
        let mut running: Vec<RunningJob> = Vec::new();
        let mut report = BatchReport::default();

        info!(jobs = jobs.len(), machines = fleet.len(), "Batch started");

        loop {
            if *cancel.borrow() {
                info!(running = running.len(), "Cancelling batch");
                self.cancel_all(&mut running, &mut jobs, &mut ledgers).await?;
                report.interrupted = true;
                break;
            }

            self.collect_finished(&mut running, &mut jobs, &mut ledgers)
                .await?;

            while let Some(&idx) = queue.front() {
                if !options.result_dir(&jobs[idx]).exists() {
                    break;
                }
                queue.pop_front();
                println!("skipping {}: results already exist", jobs[idx].name);
                jobs[idx].finish(JobStatus::Skipped, None);
            }

            let Some(&next) = queue.front() else {
                if running.is_empty() {
                    break;
                }
                pause(self.config.poll_interval(), &mut cancel).await;
                continue;
            };

            let Some((machine, decision)) =
                place_on_fleet(&self.model, &mut ledgers, &options.requirement)?
            else {
                if running.is_empty() {
                    // Readings are static, so an idle fleet never gains room.
                    report.infeasible = queue.len();
                    for idx in queue.drain(..) {
                        println!("failed: {}; no machine has room for it", jobs[idx].name);
                        jobs[idx].finish(
                            JobStatus::Failed,
                            Some("no machine has room for this job".to_string()),
                        );
                    }
                    break;
                }
                debug!(running = running.len(), "Fleet full, backing off");
                pause(self.config.backoff_interval(), &mut cancel).await;
                continue;
            };

            queue.pop_front();
            match self
                .dispatch(&fleet[machine], &jobs[next], decision.accelerator, options)
                .await
            {
                Ok(handle) => {
                    let job = &mut jobs[next];
                    job.start(machine, decision.accelerator);
                    println!("started: {}; {}", job.name, job.command);
                    info!(
                        job = %job.name,
                        machine = %fleet[machine].config.display_name(),
                        accelerator = ?decision.accelerator,
                        cost = decision.cost.raw(),
                        "Job dispatched"
                    );
                    running.push(RunningJob {
                        job: next,
                        machine,
                        reservation: decision.reservation,
                        handle,
                    });
                }
                Err(e) => {
                    ledgers[machine].release(decision.reservation)?;
                    let job = &mut jobs[next];
                    warn!(job = %job.name, error = %e, "Dispatch failed");
                    println!("failed: {}; {}", job.name, e);
                    job.finish(JobStatus::Failed, Some(e.to_string()));
                }
            }
            pause(self.config.dispatch_pacing(), &mut cancel).await;
        }

        report.jobs = jobs;
        info!(
            finished = report.count(JobStatus::Finished),
            failed = report.count(JobStatus::Failed),
            skipped = report.count(JobStatus::Skipped),
            interrupted = report.interrupted,
            "Batch done"
        );
        Ok(report)
    }

    async fn dispatch(
        &self,
        machine: &Machine,
        job: &Job,
        accelerator: Option<usize>,
        options: &BatchOptions,
    ) -> KabukiResult<SessionHandle> {
        let stdout = append_to(&options.side_file(job, "out")).await?;
        let stderr = append_to(&options.side_file(job, "err")).await?;

        let mut spec = SessionSpec::new(job.name.clone(), job.command.clone(), options.result_dir(job));
        spec.env = options.requirement.placement_env(accelerator);
        spec.inputs = options.inputs.clone();
        spec.outputs = options.outputs.clone();
        spec.stdout = Box::new(stdout);
        spec.stderr = Box::new(stderr);
        self.runtime.launch(&machine.config, spec).await
    }

    async fn collect_finished(
        &self,
        running: &mut Vec<RunningJob>,
        jobs: &mut [Job],
        ledgers: &mut [MachineLedger],
    ) -> KabukiResult<()> {
        let mut idx = 0;
        while idx < running.len() {
            if !running[idx].handle.is_finished() {
                idx += 1;
                continue;
            }
            let done = running.remove(idx);
            let outcome = done.handle.join().await;
            ledgers[done.machine].release(done.reservation)?;
            record_outcome(&mut jobs[done.job], outcome);
        }
        Ok(())
    }

    async fn cancel_all(
        &self,
        running: &mut Vec<RunningJob>,
        jobs: &mut [Job],
        ledgers: &mut [MachineLedger],
    ) -> KabukiResult<()> {
        for job in running.iter_mut() {
            job.handle.cancel();
        }
        let outcomes = join_all(running.drain(..).map(|r| async move {
            let outcome = r.handle.join().await;
            (r.job, r.machine, r.reservation, outcome)
        }))
        .await;
        for (job, machine, reservation, outcome) in outcomes {
            ledgers[machine].release(reservation)?;
            record_outcome(&mut jobs[job], outcome);
        }
        Ok(())
    }
}

fn record_outcome(job: &mut Job, outcome: SessionOutcome) {
    match outcome {
        Ok(summary) => {
            debug!(
                job = %job.name,
                stdout_bytes = summary.stdout_bytes,
                collected = summary.collected_entries,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Job finished"
            );
            println!("finished: {}", job.name);
            job.finish(JobStatus::Finished, None);
        }
        Err(e) => {
            if e.is_connectivity_like() {
                warn!(job = %job.name, error = %e, "Job lost its transport");
            }
            println!("failed: {}; {}", job.name, e);
            job.finish(JobStatus::Failed, Some(e.to_string()));
        }
    }
}

/// Open a side file for appending so output of earlier attempts is kept.
async fn append_to(path: &Path) -> KabukiResult<tokio::fs::File> {
    Ok(tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

/// Sleep for `duration`, waking early when cancellation is requested.
async fn pause(duration: Duration, cancel: &mut watch::Receiver<bool>) {
    if duration.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        changed = cancel.changed() => {
            if changed.is_err() {
                tokio::time::sleep(duration).await;
            }
        }
    }
}
