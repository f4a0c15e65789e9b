//! Runtime trait definitions

use async_trait::async_trait;
use kabuki_core::{KabukiResult, MachineConfig, ResourceReading};
use tokio::process::Command;

use crate::session::{SessionHandle, SessionSpec};

/// A way of running a shell script on one host
pub trait Transport: Send + Sync {
    /// Build the command that hands `script` to the host's shell.
    ///
    /// The caller configures stdio and spawns it.
    fn shell_command(&self, script: &str) -> Command;

    /// Host the transport connects to, for error reporting
    fn host(&self) -> &str;
}

/// Runtime trait for launching jobs on machines
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start one job on `machine`; the session progresses in the background
    async fn launch(&self, machine: &MachineConfig, spec: SessionSpec)
        -> KabukiResult<SessionHandle>;

    /// Read the current capacity of `machine`
    async fn probe(&self, machine: &MachineConfig) -> KabukiResult<ResourceReading>;

    /// Get the runtime name
    fn name(&self) -> &'static str;
}
