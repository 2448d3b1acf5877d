//! Error types for Aevum runtime operations

use aevum_proto::wire::WireError;
use thiserror::Error;

/// Result type alias for Aevum operations
pub type Result<T> = std::result::Result<T, AevumError>;

/// Errors that can occur during Aevum runtime operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AevumError {
    /// A caller-supplied argument failed validation
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with it
        reason: String,
    },

    /// Memory allocation failed (heap, carveout or correlation id space)
    #[error("Out of memory: {reason}")]
    OutOfMemory {
        /// What could not be allocated
        reason: String,
    },

    /// Bad user memory or handle-limit violation
    #[error("Fault: {reason}")]
    Faulted {
        /// What faulted
        reason: String,
    },

    /// The mailbox has been shut down
    #[error("No device")]
    NoDevice,

    /// The calling task was interrupted while waiting
    #[error("Interrupted")]
    Interrupted,

    /// A bounded wait expired
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Malformed wire packet (magic or payload size)
    #[error("Bad message: {reason}")]
    BadMessage {
        /// What was malformed
        reason: String,
    },

    /// Unexpected message type or protocol version mismatch
    #[error("Protocol error: {reason}")]
    ProtocolError {
        /// What disagreed
        reason: String,
    },

    /// The firmware reported a network-info failure
    #[error("Firmware rejected network: {reason}")]
    BadFile {
        /// Firmware-side reason
        reason: String,
    },

    /// More feature maps than the interface allows
    #[error("Too many feature maps: {count} (limit {max})")]
    TooManyFiles {
        /// Count requested
        count: u32,
        /// Interface limit
        max: u32,
    },

    /// A wire string was not NUL-terminated within its field
    #[error("Unterminated string in message")]
    MessageTooLong,

    /// The transport reported a hard send failure
    #[error("Transport error: {reason}")]
    Transport {
        /// Transport-side reason
        reason: String,
    },
}

impl AevumError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an out of memory error
    pub fn out_of_memory(reason: impl Into<String>) -> Self {
        Self::OutOfMemory {
            reason: reason.into(),
        }
    }

    /// Create a fault error
    pub fn faulted(reason: impl Into<String>) -> Self {
        Self::Faulted {
            reason: reason.into(),
        }
    }

    /// Create a timeout error from a wait duration
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis().try_into().unwrap_or(u64::MAX),
        }
    }

    /// Create a bad message error
    pub fn bad_message(reason: impl Into<String>) -> Self {
        Self::BadMessage {
            reason: reason.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolError {
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }
}

impl From<WireError> for AevumError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::UnknownType { .. } => Self::protocol(err.to_string()),
            _ => Self::bad_message(err.to_string()),
        }
    }
}
