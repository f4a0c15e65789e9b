//! Runtime that runs jobs over a remote shell
//!
//! Each launch opens one [`RemoteSession`] on the machine's transport and
//! drives it on a background task.

use async_trait::async_trait;
use kabuki_core::{KabukiResult, MachineConfig, ResourceReading, SchedulerConfig};
use std::time::Duration;
use tracing::debug;

use crate::probe::probe_reading;
use crate::session::{RemoteSession, SessionHandle, SessionSettings, SessionSpec};
use crate::traits::Runtime;
use crate::transport::transport_for;

/// Remote-shell runtime
pub struct RemoteRuntime {
    settings: SessionSettings,
    connect_timeout_secs: u64,
    probe_timeout: Duration,
}

impl RemoteRuntime {
    /// Create a new remote runtime
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            settings: SessionSettings::from(config),
            connect_timeout_secs: config.connect_timeout_secs,
            probe_timeout: config.probe_timeout(),
        }
    }
}

#[async_trait]
impl Runtime for RemoteRuntime {
    async fn launch(
        &self,
        machine: &MachineConfig,
        spec: SessionSpec,
    ) -> KabukiResult<SessionHandle> {
        let transport = transport_for(machine, self.connect_timeout_secs);
        let session = RemoteSession::new(transport, &self.settings);
        let job_id = session.names().job_id.clone();
        debug!(
            machine = %machine.display_name(),
            job = %spec.job_name,
            job_id = %job_id,
            "Launching session"
        );
        Ok(SessionHandle::spawn(job_id, move |cancel| {
            session.run(spec, cancel)
        }))
    }

    async fn probe(&self, machine: &MachineConfig) -> KabukiResult<ResourceReading> {
        let transport = transport_for(machine, self.connect_timeout_secs);
        probe_reading(transport.as_ref(), self.probe_timeout).await
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
