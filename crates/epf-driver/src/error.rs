// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for link operations

use thiserror::Error;

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, EpfError>;

/// Errors that can occur on either side of the link
#[derive(Debug, Error)]
pub enum EpfError {
    /// Rejected at entry: bad subdevice index, zero length, misaligned
    /// address or length beyond the advertised region
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for rejection
        reason: String,
    },

    /// Waited past the deadline for the peer
    #[error("Timeout after {duration_ms}ms waiting for {what}")]
    Timeout {
        /// What was being waited for
        what: String,
        /// Deadline length in milliseconds
        duration_ms: u64,
    },

    /// The waiter was cancelled (signal delivery)
    #[error("Cancelled while waiting for {what}")]
    Cancelled {
        /// What was being waited for
        what: String,
    },

    /// DMA descriptor rejected or completed with an error
    #[error("DMA failed: {reason}")]
    DmaFailed {
        /// Reason for failure
        reason: String,
    },

    /// Pool allocation failure, no DMA channel, registry full
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted {
        /// Which resource ran out
        resource: String,
    },

    /// BAR unmapped or peer disappeared; the endpoint is dead
    #[error("Device gone: {reason}")]
    DeviceGone {
        /// Reason the endpoint was declared dead
        reason: String,
    },

    /// Unknown ioctl command or command for the other side
    #[error("Operation not supported: {what}")]
    NotSupported {
        /// Rejected operation
        what: String,
    },

    /// Write to an MCB field owned by the other side
    #[error("{field} is written by the peer only")]
    NotOwner {
        /// Field name
        field: &'static str,
    },

    /// RC initialisation not yet visible in the MCB
    #[error("Peer not ready: {reason}")]
    PeerNotReady {
        /// What is missing
        reason: String,
    },

    /// Both sides disagree on boot-time configuration
    #[error("Configuration mismatch: {reason}")]
    ConfigMismatch {
        /// What differs
        reason: String,
    },

    /// I/O error while mapping a BAR
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl EpfError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    #[allow(clippy::cast_possible_truncation)]
    pub fn timeout(what: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            duration_ms: after.as_millis() as u64,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::Cancelled { what: what.into() }
    }

    /// Create a DMA failure error
    pub fn dma_failed(reason: impl Into<String>) -> Self {
        Self::DmaFailed {
            reason: reason.into(),
        }
    }

    /// Create a resource exhaustion error
    pub fn exhausted(resource: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
        }
    }

    /// Create a device gone error
    pub fn device_gone(reason: impl Into<String>) -> Self {
        Self::DeviceGone {
            reason: reason.into(),
        }
    }

    /// Create a not supported error
    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported { what: what.into() }
    }

    /// Create a peer not ready error
    pub fn peer_not_ready(reason: impl Into<String>) -> Self {
        Self::PeerNotReady {
            reason: reason.into(),
        }
    }

    /// Create a configuration mismatch error
    pub fn config_mismatch(reason: impl Into<String>) -> Self {
        Self::ConfigMismatch {
            reason: reason.into(),
        }
    }

    /// Negative Linux errno reported by the raw ioctl surface
    #[must_use]
    pub fn errno(&self) -> i32 {
        -match self {
            Self::InvalidArgument { .. } => libc::EINVAL,
            Self::Timeout { .. } => libc::ETIMEDOUT,
            Self::Cancelled { .. } => libc::EINTR,
            Self::DmaFailed { .. } | Self::Io { .. } => libc::EIO,
            Self::ResourceExhausted { .. } => libc::ENOMEM,
            Self::DeviceGone { .. } => libc::ENODEV,
            Self::NotSupported { .. } => libc::EOPNOTSUPP,
            Self::NotOwner { .. } => libc::EPERM,
            Self::PeerNotReady { .. } => libc::EAGAIN,
            Self::ConfigMismatch { .. } => libc::EPROTO,
        }
    }

    /// Whether the caller may retry the same request unchanged
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Cancelled { .. } | Self::PeerNotReady { .. }
        )
    }
}
