//! KL-002: Error kinds shared by catalog decoding, graph building and convergence.

use std::time::Duration;

/// Everything that can go wrong between reading a catalog and converging a host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or unsupported declarative input.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// A user or group name could not be resolved to a numeric id.
    #[error("lookup failed: {0}")]
    Lookup(String),

    /// Filesystem or content read failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Post-mutation verification mismatch, or an exec exit-code mismatch.
    #[error("convergence failed: {0}")]
    Convergence(String),

    /// The run was cancelled while this resource was waiting or running.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An afterOk predecessor ended Failed.
    #[error("dependency failed: {0}")]
    DependencyFailed(String),

    /// An exec resource exceeded its timeout.
    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// Reserved extension point.
    #[error("{0} is not implemented")]
    NotImplemented(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an `io::Error` with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Prefix the message with the resource key that produced it.
    pub fn with_key(self, key: &str) -> Self {
        match self {
            Self::InvalidSpec(m) => Self::InvalidSpec(format!("{key}: {m}")),
            Self::Lookup(m) => Self::Lookup(format!("{key}: {m}")),
            Self::Io { context, source } => Self::Io {
                context: format!("{key}: {context}"),
                source,
            },
            Self::Convergence(m) => Self::Convergence(format!("{key}: {m}")),
            Self::Cancelled(m) => Self::Cancelled(format!("{key}: {m}")),
            Self::DependencyFailed(m) => Self::DependencyFailed(format!("{key}: {m}")),
            Self::Timeout { command, after } => Self::Timeout {
                command: format!("{key}: {command}"),
                after,
            },
            Self::NotImplemented(m) => Self::NotImplemented(format!("{key}: {m}")),
        }
    }
}
