//! Error types for kabuki

use thiserror::Error;

/// Main error type for kabuki
#[derive(Error, Debug)]
pub enum KabukiError {
    /// Bad or missing machine record, unreadable config file
    #[error("Configuration error: {0}")]
    Config(String),

    /// The transport could not be established (unreachable host, auth failure)
    #[error("Connectivity error on {host}: {message}")]
    Connectivity { host: String, message: String },

    /// The user command exited with a nonzero status
    #[error("Remote command exited with status {status}")]
    RemoteCommand { status: i32 },

    /// The job cannot fit on any configured machine, even at zero load
    #[error("Resource infeasible: {0}")]
    ResourceInfeasible(String),

    /// The multiplexed output stream was malformed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The session was cancelled before it completed
    #[error("Cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for kabuki operations
pub type KabukiResult<T> = Result<T, KabukiError>;

impl KabukiError {
    /// Shorthand for a connectivity failure against `host`.
    pub fn connectivity(host: impl Into<String>, message: impl Into<String>) -> Self {
        KabukiError::Connectivity {
            host: host.into(),
            message: message.into(),
        }
    }

    /// True when the job's transport failed, either outright or by
    /// corrupting the stream.
    pub fn is_connectivity_like(&self) -> bool {
        matches!(
            self,
            KabukiError::Connectivity { .. } | KabukiError::Protocol(_)
        )
    }
}

impl From<serde_json::Error> for KabukiError {
    fn from(err: serde_json::Error) -> Self {
        KabukiError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for KabukiError {
    fn from(err: serde_yaml::Error) -> Self {
        KabukiError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for KabukiError {
    fn from(err: toml::de::Error) -> Self {
        KabukiError::Config(err.to_string())
    }
}
