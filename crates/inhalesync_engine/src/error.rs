//! Error types for the sync engine.

use inhalesync_model::RecordKind;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// None of these abort the host: the engine logs them, skips the affected
/// record or cycle, and returns to idle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A repository read or write failed.
    #[error("{kind} store error: {message}")]
    Store {
        /// Record type of the failing repository.
        kind: RecordKind,
        /// Error message.
        message: String,
    },

    /// The remote service rejected or failed a request.
    #[error("gateway {operation} failed")]
    Gateway {
        /// Failed operation, such as `upload`.
        operation: String,
    },

    /// The server time could not be obtained; the cycle was deferred.
    #[error("server time unavailable")]
    ServerTimeUnavailable,

    /// A downloaded inhale event refers to a device that is not stored locally.
    #[error("no local device {serial_number} for inhale event {event_uid}")]
    MissingDevice {
        /// Serial number referenced by the event.
        serial_number: String,
        /// Event UID.
        event_uid: u32,
    },

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The active profile is an emancipated minor; syncing is disabled.
    #[error("sync disabled for emancipated profile")]
    Emancipated,
}

impl SyncError {
    /// Creates a store error for the given record type.
    pub fn store(kind: RecordKind, message: impl Into<String>) -> Self {
        Self::Store {
            kind,
            message: message.into(),
        }
    }

    /// Creates a gateway error for the named operation.
    pub fn gateway(operation: impl Into<String>) -> Self {
        Self::Gateway {
            operation: operation.into(),
        }
    }

    /// Returns true if retrying on a later cycle may succeed.
    ///
    /// A missing device can appear once a later download brings it in, but the
    /// event that referenced it has already been dropped.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store { .. } => true,
            SyncError::Gateway { .. } => true,
            SyncError::ServerTimeUnavailable => true,
            SyncError::InvalidStateTransition { .. } => true,
            SyncError::MissingDevice { .. } => false,
            SyncError::Emancipated => false,
        }
    }
}
