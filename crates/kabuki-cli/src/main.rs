//! kabuki CLI
//!
//! Runs shell commands on machines reachable over ssh, one at a time or as
//! a resource-aware batch.

mod commands;

use clap::{Args, Parser, Subcommand};
use kabuki_core::{JobRequirement, LoggingConfig, SchedulerConfig};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// kabuki - agentless batch scheduling over ssh
#[derive(Parser, Debug)]
#[command(name = "kabuki")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Scheduler configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every line of a batch file as a job on the least loaded machine
    Batch {
        /// File with one shell command per line
        batch_file: PathBuf,

        #[command(flatten)]
        machines: MachineArgs,

        #[command(flatten)]
        requirement: RequirementArgs,

        #[command(flatten)]
        transfer: TransferArgs,

        /// Print the first round of placements without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Run one command on one machine
    Run {
        /// Shell command to run
        command: String,

        /// Machine record name or path
        #[arg(long, default_value = "local")]
        machine: String,

        /// Name of the result directory (random by default)
        #[arg(long)]
        job_name: Option<String>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Run the same command on several machines at once
    On {
        /// Shell command to run
        command: String,

        /// Machine record names or paths
        #[arg(long, num_args = 1.., required = true)]
        machines: Vec<String>,

        /// Prefix of the result directories (random by default)
        #[arg(long)]
        job_name: Option<String>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Show what machines have free and how many jobs would fit
    Probe {
        #[command(flatten)]
        machines: MachineArgs,

        #[command(flatten)]
        requirement: RequirementArgs,
    },
}

#[derive(Args, Debug)]
struct MachineArgs {
    /// Machine record names or paths
    #[arg(long, num_args = 1.., default_value = "local")]
    machines: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct RequirementArgs {
    /// CPU cores each job keeps busy
    #[arg(long, default_value_t = 1.0)]
    cpu_share: f64,

    /// Host memory each job needs, in MiB
    #[arg(long, default_value_t = 7000)]
    memory_required: i64,

    /// Reserve the whole machine for each job
    #[arg(long)]
    exclusive_host: bool,

    /// Let several jobs share one accelerator
    #[arg(long)]
    shared_accelerator: bool,

    /// Jobs do not use an accelerator
    #[arg(long)]
    no_accelerator: bool,

    /// Accelerator memory each job needs, in MiB
    #[arg(long, default_value_t = 1000)]
    accelerator_memory: i64,

    /// Accelerator utilization each job adds (0.0-1.0)
    #[arg(long, default_value_t = 0.75)]
    accelerator_utilization: f64,
}

impl RequirementArgs {
    fn requirement(&self) -> JobRequirement {
        JobRequirement {
            cpu_share: self.cpu_share,
            memory_mib: self.memory_required,
            wants_accelerator: !self.no_accelerator,
            accelerator_memory: self.accelerator_memory,
            accelerator_utilization: self.accelerator_utilization,
            exclusive_host: self.exclusive_host,
            exclusive_accelerator: !self.shared_accelerator,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
struct TransferArgs {
    /// Local files and folders copied to the job's working directory
    #[arg(long, num_args = 1..)]
    copy_forwards: Vec<PathBuf>,

    /// Files and folders copied back from the job's working directory
    #[arg(long, num_args = 1..)]
    copy_backwards: Vec<PathBuf>,
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        let _ = tracing::subscriber::set_global_default(builder.json().finish());
    } else {
        let _ = tracing::subscriber::set_global_default(builder.finish());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::default(),
    };
    init_logging(cli.verbose, &settings.logging);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, cancelling running jobs");
            let _ = cancel_tx.send(true);
        }
    });

    let code = match cli.command {
        Commands::Batch {
            batch_file,
            machines,
            requirement,
            transfer,
            dry_run,
        } => {
            commands::batch(
                &settings,
                cancel_rx,
                &batch_file,
                &machines.machines,
                requirement.requirement(),
                transfer,
                dry_run,
            )
            .await?
        }
        Commands::Run {
            command,
            machine,
            job_name,
            transfer,
        } => {
            commands::run(
                &settings,
                cancel_rx,
                command,
                &machine,
                job_name,
                transfer,
            )
            .await?
        }
        Commands::On {
            command,
            machines,
            job_name,
            transfer,
        } => {
            commands::on(
                &settings,
                cancel_rx,
                command,
                &machines,
                job_name,
                transfer,
            )
            .await?
        }
        Commands::Probe {
            machines,
            requirement,
        } => commands::probe(&settings, &machines.machines, requirement.requirement()).await?,
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_flags_build_requirement() {
        let cli = Cli::parse_from([
            "kabuki",
            "batch",
            "jobs.txt",
            "--machines",
            "gpu1",
            "gpu2",
            "--cpu-share",
            "2",
            "--shared-accelerator",
            "--copy-backwards",
            "out.txt",
            "--dry-run",
        ]);
        match cli.command {
            Commands::Batch {
                batch_file,
                machines,
                requirement,
                transfer,
                dry_run,
            } => {
                assert_eq!(batch_file, PathBuf::from("jobs.txt"));
                assert_eq!(machines.machines, vec!["gpu1", "gpu2"]);
                let req = requirement.requirement();
                assert_eq!(req.cpu_share, 2.0);
                assert!(req.wants_accelerator);
                assert!(!req.exclusive_accelerator);
                assert_eq!(req.memory_mib, 7000);
                assert_eq!(transfer.copy_backwards, vec![PathBuf::from("out.txt")]);
                assert!(dry_run);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_run_defaults_to_local_machine() {
        let cli = Cli::parse_from(["kabuki", "-v", "run", "nvidia-smi"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                command, machine, ..
            } => {
                assert_eq!(command, "nvidia-smi");
                assert_eq!(machine, "local");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_on_requires_machines() {
        assert!(Cli::try_parse_from(["kabuki", "on", "hostname"]).is_err());
    }
}
