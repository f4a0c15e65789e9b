//! ssh and local shell transports

use kabuki_core::{MachineConfig, TransportKind};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;

use crate::traits::Transport;

/// Remote shell through the system `ssh` client, key-based login only
#[derive(Debug, Clone)]
pub struct SshTransport {
    machine: MachineConfig,
    connect_timeout_secs: u64,
}

impl SshTransport {
    pub fn new(machine: MachineConfig, connect_timeout_secs: u64) -> Self {
        Self {
            machine,
            connect_timeout_secs,
        }
    }

    /// Arguments passed to `ssh`, excluding the script
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-p".to_string(),
            self.machine.port.to_string(),
        ];
        let key = self.machine.expanded_key_path();
        if !key.as_os_str().is_empty() {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{}", self.machine.username, self.machine.host));
        args
    }
}

impl Transport for SshTransport {
    fn shell_command(&self, script: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args()).arg(script);
        cmd
    }

    fn host(&self) -> &str {
        &self.machine.host
    }
}

/// Runs scripts on this host with `sh -c`
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    working_dir: Option<PathBuf>,
}

impl LocalTransport {
    /// Scripts start in the home directory, like an ssh login would.
    pub fn new() -> Self {
        Self {
            working_dir: dirs::home_dir(),
        }
    }

    /// Scripts start in `dir`.
    pub fn in_dir(dir: PathBuf) -> Self {
        Self {
            working_dir: Some(dir),
        }
    }
}

impl Transport for LocalTransport {
    fn shell_command(&self, script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn host(&self) -> &str {
        "localhost"
    }
}

/// Pick the transport a machine record asks for.
pub fn transport_for(machine: &MachineConfig, connect_timeout_secs: u64) -> Arc<dyn Transport> {
    match machine.transport {
        TransportKind::Ssh => Arc::new(SshTransport::new(machine.clone(), connect_timeout_secs)),
        TransportKind::Local => Arc::new(LocalTransport::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> MachineConfig {
        MachineConfig {
            name: "gpu1".to_string(),
            host: "10.0.0.7".to_string(),
            port: 2222,
            username: "ben".to_string(),
            ssh_key_path: PathBuf::from("/keys/id_rsa"),
            transport: TransportKind::Ssh,
        }
    }

    #[test]
    fn test_ssh_args() {
        let transport = SshTransport::new(machine(), 5);
        let args = transport.ssh_args();
        assert_eq!(args.last().unwrap(), "ben@10.0.0.7");
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        let port = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[port + 1], "2222");
        let key = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[key + 1], "/keys/id_rsa");
        assert_eq!(transport.host(), "10.0.0.7");
    }

    #[test]
    fn test_transport_for_local() {
        let transport = transport_for(&MachineConfig::local("local"), 5);
        assert_eq!(transport.host(), "localhost");
    }

    #[tokio::test]
    async fn test_local_transport_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::in_dir(dir.path().to_path_buf());
        let output = transport
            .shell_command("pwd; exit 3")
            .output()
            .await
            .unwrap();
        assert_eq!(output.status.code(), Some(3));
        let pwd = String::from_utf8(output.stdout).unwrap();
        assert_eq!(
            std::fs::canonicalize(pwd.trim()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }
}
