//! kabuki-runtime: Remote execution layer
//!
//! This crate runs jobs on machines without any agent installed there:
//! - ssh and local shell transports
//! - Remote sessions that stage inputs, stream output and collect results
//! - The host capacity probe

pub mod archive;
pub mod probe;
pub mod remote;
pub mod session;
pub mod stream;
pub mod traits;
pub mod transport;

pub use probe::{parse_probe_output, probe_reading, PROBE_COMMAND};
pub use remote::RemoteRuntime;
pub use session::{
    OutputSink, RemoteSession, SessionHandle, SessionOutcome, SessionSettings, SessionSpec,
    SessionSummary,
};
pub use traits::{Runtime, Transport};
pub use transport::{transport_for, LocalTransport, SshTransport};
