//! Job, requirement and batch type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// What one instance of a job consumes on its host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequirement {
    /// CPU cores the job keeps busy
    pub cpu_share: f64,
    /// Host memory in MiB
    pub memory_mib: i64,
    /// Whether the job runs on an accelerator
    pub wants_accelerator: bool,
    /// Accelerator memory in MiB
    pub accelerator_memory: i64,
    /// Accelerator utilization fraction the job adds
    pub accelerator_utilization: f64,
    /// Reserve the whole host for this job
    pub exclusive_host: bool,
    /// Reserve the whole accelerator for this job
    pub exclusive_accelerator: bool,
}

impl Default for JobRequirement {
    fn default() -> Self {
        Self {
            cpu_share: 1.0,
            memory_mib: 7000,
            wants_accelerator: true,
            accelerator_memory: 1000,
            accelerator_utilization: 0.75,
            exclusive_host: false,
            exclusive_accelerator: true,
        }
    }
}

impl JobRequirement {
    /// Environment the job's command runs with once placed on `accelerator`.
    ///
    /// A job holding the whole host sees every device.
    pub fn placement_env(&self, accelerator: Option<usize>) -> Vec<(String, String)> {
        match accelerator {
            Some(idx) if self.wants_accelerator && !self.exclusive_host => {
                vec![("CUDA_VISIBLE_DEVICES".to_string(), idx.to_string())]
            }
            _ => Vec::new(),
        }
    }
}

/// Job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a slot
    Queued,
    /// Dispatched to a machine
    Running,
    /// Command exited with status 0
    Finished,
    /// Command failed, the transport failed, or no machine can host it
    Failed,
    /// Results already existed, never dispatched
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One line of a batch file plus its placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: Uuid,
    /// Position in the batch, zero based
    pub sequence_index: usize,
    /// Result name, derived from the batch file and line number
    pub name: String,
    /// Shell command to run
    pub command: String,
    /// Index of the machine the job was placed on
    pub assigned_machine: Option<usize>,
    /// Index of the accelerator the job was placed on
    pub assigned_accelerator: Option<usize>,
    /// Current status
    pub status: JobStatus,
    /// Why the job failed
    pub error: Option<String>,
    /// Dispatch timestamp
    pub started_at: Option<DateTime<Utc>>,
    /// Completion timestamp
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a queued job
    pub fn new(sequence_index: usize, name: String, command: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_index,
            name,
            command,
            assigned_machine: None,
            assigned_accelerator: None,
            status: JobStatus::Queued,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Mark the job as dispatched on `machine`/`accelerator`
    pub fn start(&mut self, machine: usize, accelerator: Option<usize>) {
        self.assigned_machine = Some(machine);
        self.assigned_accelerator = accelerator;
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Move the job to a terminal status
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

/// Result name for a batch line: the batch path with `/` flattened, then the
/// one-based line number.
pub fn job_name(batch_path: &Path, line_index: usize) -> String {
    let flat = batch_path.to_string_lossy().replace('/', "_");
    format!("{}.{}", flat, line_index + 1)
}

/// Parse a batch file into queued jobs, one per non-blank line.
///
/// Blank lines still advance the line number so names keep matching the file.
pub fn parse_batch(batch_path: &Path, content: &str) -> Vec<Job> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .enumerate()
        .map(|(seq, (line_index, line))| {
            Job::new(seq, job_name(batch_path, line_index), line.trim().to_string())
        })
        .collect()
}
