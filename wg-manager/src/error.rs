//! Error types returned across the library boundary
//!
//! Backend and store plumbing uses `anyhow`; the errors here are the ones a
//! caller is expected to match on. A [`BackendError`] travels inside an
//! `anyhow::Error` and can be recovered with `downcast_ref`.

use std::time::Duration;

/// Failure of a [`crate::manager::TunnelManager`] operation
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("invalid tunnel name '{0}'")]
    InvalidName(String),

    #[error("tunnel '{0}' already exists")]
    AlreadyExists(String),

    #[error("tunnel '{0}' not found")]
    NotFound(String),

    #[error("backend failed for tunnel '{name}'")]
    Backend {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("config store failed for tunnel '{name}'")]
    Store {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to access preferences")]
    Preferences(#[source] anyhow::Error),

    #[error("failed to restore tunnels: {}", .0.join(", "))]
    Restore(Vec<String>),
}

impl TunnelError {
    pub(crate) fn backend(name: &str, source: anyhow::Error) -> Self {
        TunnelError::Backend {
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn store(name: &str, source: anyhow::Error) -> Self {
        TunnelError::Store {
            name: name.to_string(),
            source,
        }
    }

    /// The [`BackendError`] behind a backend failure, if there is one
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            TunnelError::Backend { source, .. } => source.downcast_ref(),
            _ => None,
        }
    }
}

/// Conditions a backend reports as fatal
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("only one userspace tunnel may be up at a time ('{running}' is up)")]
    MultipleTunnels { running: String },

    #[error("control socket for '{name}' did not appear within {waited:?}")]
    TransportTimeout { name: String, waited: Duration },

    #[error("tunnel '{0}' has no loaded configuration")]
    MissingConfig(String),

    #[error("tunnel '{0}' has no private key")]
    MissingPrivateKey(String),

    #[error("the WireGuard kernel module is not loaded")]
    ModuleNotLoaded,

    #[error("required tool '{0}' was not found in PATH")]
    ToolMissing(String),

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("userspace API returned errno={0}")]
    Uapi(i32),
}
