//! Error types for RKNPU driver operations

use thiserror::Error;

/// Result type alias for RKNPU operations
pub type Result<T> = std::result::Result<T, NpuError>;

/// Errors that can occur during RKNPU operations
#[derive(Debug, Error)]
pub enum NpuError {
    /// Caller supplied arguments the driver cannot execute
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// Allocation of driver bookkeeping failed
    #[error("Resource exhausted: {reason}")]
    ResourceExhausted {
        /// What could not be allocated
        reason: String,
    },

    /// A required clock, regulator or register window is missing
    #[error("Unavailable: {reason}")]
    Unavailable {
        /// What is missing
        reason: String,
    },

    /// The address-translation domain could not be activated
    #[error("Address domain {domain_id} unavailable: {reason}")]
    DomainError {
        /// Domain the job asked for
        domain_id: i32,
        /// Reason reported by the domain service
        reason: String,
    },

    /// Job or fence did not complete in time
    #[error("Operation timeout after {duration_ms}ms (task counter {task_counter})")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
        /// Tasks the hardware reported as completed
        task_counter: u32,
    },

    /// Hardware misbehaved or was reset underneath a job
    #[error("Hardware fault: {reason}")]
    HardwareFault {
        /// Reason for failure
        reason: String,
    },

    /// Submission refused by the safety policy
    #[error("Refused by policy: {reason}")]
    PolicyRefused {
        /// Policy that refused
        reason: String,
    },

    /// I/O error on a register window
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const EOPNOTSUPP: i32 = 95;
const ETIMEDOUT: i32 = 110;

impl NpuError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            reason: reason.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Create a domain error
    pub fn domain(domain_id: i32, reason: impl Into<String>) -> Self {
        Self::DomainError {
            domain_id,
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration: std::time::Duration, task_counter: u32) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            task_counter,
        }
    }

    /// Create a hardware fault error
    pub fn hardware_fault(reason: impl Into<String>) -> Self {
        Self::HardwareFault {
            reason: reason.into(),
        }
    }

    /// Create a policy refusal
    pub fn policy_refused(reason: impl Into<String>) -> Self {
        Self::PolicyRefused {
            reason: reason.into(),
        }
    }

    /// Negative errno equivalent, stable across releases.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } | Self::DomainError { .. } => -EINVAL,
            Self::ResourceExhausted { .. } => -ENOMEM,
            Self::Unavailable { .. } => -ENODEV,
            Self::Timeout { .. } => -ETIMEDOUT,
            Self::HardwareFault { .. } | Self::Io { .. } => -EIO,
            Self::PolicyRefused { .. } => -EOPNOTSUPP,
        }
    }

    /// True for [`NpuError::Timeout`].
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
