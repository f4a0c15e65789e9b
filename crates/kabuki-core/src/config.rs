//! Configuration types for kabuki

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{KabukiError, KabukiResult};

/// How a machine is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Remote shell over the system `ssh` client
    #[default]
    Ssh,
    /// Run on this host through `sh -c`
    Local,
}

/// Connection record for one remote host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Identifier the machine was requested by; filled in by the loader
    #[serde(default)]
    pub name: String,
    /// Hostname or address
    #[serde(alias = "ip")]
    pub host: String,
    /// ssh port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user
    pub username: String,
    /// Private key used for key-based login
    #[serde(alias = "key_path")]
    pub ssh_key_path: PathBuf,
    /// Transport used to reach the machine
    #[serde(default)]
    pub transport: TransportKind,
}

fn default_ssh_port() -> u16 {
    22
}

impl MachineConfig {
    /// A machine that runs everything on this host.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: "localhost".to_string(),
            port: default_ssh_port(),
            username: String::new(),
            ssh_key_path: PathBuf::new(),
            transport: TransportKind::Local,
        }
    }

    /// Load a machine record from a YAML or TOML file.
    ///
    /// Files ending in `.toml` are parsed as TOML, everything else as YAML.
    pub fn from_file(path: &Path) -> KabukiResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KabukiError::Config(format!(
                "Failed to read machine config {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: MachineConfig = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content).map_err(|e| {
                KabukiError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|e| {
                KabukiError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject records that cannot possibly connect.
    pub fn validate(&self) -> KabukiResult<()> {
        if self.transport == TransportKind::Local {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(KabukiError::Config("machine record has no host".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(KabukiError::Config(format!(
                "machine record for {} has no username",
                self.host
            )));
        }
        Ok(())
    }

    /// Key path with a leading `~` expanded to the home directory.
    pub fn expanded_key_path(&self) -> PathBuf {
        expand_home(&self.ssh_key_path)
    }

    /// Label used in logs and progress output.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.host
        } else {
            &self.name
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Where machine records are looked up, in order
#[derive(Debug, Clone)]
pub struct ConfigSearch {
    /// Directory relative names are resolved against
    pub cwd: PathBuf,
    /// Shared directory of machine records
    pub fallback_root: PathBuf,
}

const CONFIG_EXTENSIONS: [&str; 3] = ["yaml", "yml", "toml"];

impl ConfigSearch {
    pub fn new(cwd: PathBuf, fallback_root: PathBuf) -> Self {
        Self { cwd, fallback_root }
    }

    /// Search the current directory, then `~/.local/var/kabuki`.
    pub fn from_env() -> KabukiResult<Self> {
        let cwd = std::env::current_dir()?;
        let fallback_root = dirs::home_dir()
            .map(|home| home.join(".local").join("var").join("kabuki"))
            .unwrap_or_else(|| PathBuf::from("/etc/kabuki"));
        Ok(Self::new(cwd, fallback_root))
    }

    /// Candidate paths for `name`, in lookup order.
    pub fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for root in [&self.cwd, &self.fallback_root] {
            out.push(root.join(name));
            for ext in CONFIG_EXTENSIONS {
                out.push(root.join(format!("{}.{}", name, ext)));
            }
        }
        out
    }

    /// First existing candidate for `name`.
    pub fn resolve(&self, name: &str) -> KabukiResult<PathBuf> {
        let candidates = self.candidates(name);
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or_else(|| {
                let tried: Vec<String> =
                    candidates.iter().map(|p| p.display().to_string()).collect();
                KabukiError::Config(format!(
                    "machine config '{}' not found, tried: {}",
                    name,
                    tried.join(", ")
                ))
            })
    }

    /// Resolve and load the machine record for `name`.
    ///
    /// The name `local` resolves to this host when no record of that name exists.
    pub fn load_machine(&self, name: &str) -> KabukiResult<MachineConfig> {
        let path = match self.resolve(name) {
            Ok(path) => path,
            Err(_) if name == "local" => return Ok(MachineConfig::local(name)),
            Err(e) => return Err(e),
        };
        let mut config = MachineConfig::from_file(&path)?;
        config.name = name.to_string();
        Ok(config)
    }
}

/// Scheduler and session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between completion polls
    pub poll_interval_ms: u64,
    /// Wait after a placement failed the capacity check
    pub backoff_interval_ms: u64,
    /// Pause after each dispatch so sshd is not flooded
    pub dispatch_pacing_ms: u64,
    /// Upper bound of the random delay before a cleanup connection
    pub cleanup_jitter_ms: u64,
    /// Time the remote process gets between the kill and the directory removal
    pub kill_grace_ms: u64,
    /// ssh connect timeout
    pub connect_timeout_secs: u64,
    /// Bound on a single host probe
    pub probe_timeout_secs: u64,
    /// Root of the per-job working directories on remote hosts
    pub remote_root: String,
    /// Local directory receiving per-job results
    pub results_dir: PathBuf,
    /// CPU usage fraction the soft cost term normalises by
    pub cpu_soft_limit: f64,
    /// Accelerator utilisation the soft cost term normalises by
    pub accelerator_soft_limit: f64,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            backoff_interval_ms: 1000,
            dispatch_pacing_ms: 100,
            cleanup_jitter_ms: 500,
            kill_grace_ms: 300,
            connect_timeout_secs: 5,
            probe_timeout_secs: 30,
            remote_root: "kabuki_jobs".to_string(),
            results_dir: PathBuf::from("job_results"),
            cpu_soft_limit: 1.5,
            accelerator_soft_limit: 1.2,
            logging: LoggingConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> KabukiResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KabukiError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| KabukiError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_interval(&self) -> Duration {
        Duration::from_millis(self.backoff_interval_ms)
    }

    pub fn dispatch_pacing(&self) -> Duration {
        Duration::from_millis(self.dispatch_pacing_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "text".to_string(),
        }
    }
}
