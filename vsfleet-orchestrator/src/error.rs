use std::fmt;
use std::time::Duration;
use vsfleet_providers::GatewayError;

/// Which step of a remote operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Submit,
    Complete,
    PowerOff,
    Destroy,
}

impl TaskPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPhase::Submit => "task submission",
            TaskPhase::Complete => "task completion",
            TaskPhase::PowerOff => "power-off",
            TaskPhase::Destroy => "destroy",
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("this plugin cannot provision credentials")]
    CredentialsUnsupported,

    #[error("please provide {0} in plugin config")]
    MissingField(&'static str),

    #[error("invalid {field} in plugin config: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("instance group is not initialized")]
    NotInitialized,

    #[error("lookup of {path} failed: {source}")]
    Lookup {
        path: String,
        #[source]
        source: GatewayError,
    },

    #[error("{phase} failed for {target}: {source}")]
    Task {
        phase: TaskPhase,
        target: String,
        #[source]
        source: GatewayError,
    },

    #[error("could not find an IPv4 address for VM: {0}")]
    NoAddress(String),

    #[error("no IPv4 address for VM {name} after {waited:?}")]
    ReadinessTimeout { name: String, waited: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl GroupError {
    pub fn lookup(path: impl Into<String>, source: GatewayError) -> Self {
        GroupError::Lookup {
            path: path.into(),
            source,
        }
    }

    pub fn task(phase: TaskPhase, target: impl Into<String>, source: GatewayError) -> Self {
        GroupError::Task {
            phase,
            target: target.into(),
            source,
        }
    }

    /// True when a named backend object did not resolve.
    pub fn is_not_found(&self) -> bool {
        match self {
            GroupError::Lookup { source, .. } | GroupError::Task { source, .. } => {
                source.is_not_found()
            }
            GroupError::Gateway(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self,
            GroupError::CredentialsUnsupported
                | GroupError::MissingField(_)
                | GroupError::InvalidField { .. }
        )
    }

    /// Errors a caller is expected to retry later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GroupError::NoAddress(_))
    }
}
