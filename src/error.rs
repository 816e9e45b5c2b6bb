//! Error classification shared by the codec, the pipeline, and the hub.

use thiserror::Error;

/// Recoverable relay failures. None of these terminate a connection except
/// [`RelayError::DuplicateConnection`] and [`RelayError::HubClosed`], which
/// reject it outright.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Malformed wire syntax. The reason is stable and machine-readable.
    #[error("bad message: {0}")]
    BadMessage(String),
    /// The event object parsed but failed shape or signature checks.
    #[error("invalid: {0}")]
    BadEvent(String),
    /// A transport handle was registered with the hub twice.
    #[error("duplicate connection: {0}")]
    DuplicateConnection(String),
    /// A transport tried to register after the relay began shutting down.
    #[error("relay is shutting down: {0}")]
    HubClosed(String),
}

impl RelayError {
    pub fn bad_message(reason: impl Into<String>) -> Self {
        Self::BadMessage(reason.into())
    }

    pub fn bad_event(reason: impl Into<String>) -> Self {
        Self::BadEvent(reason.into())
    }

    /// The reason text without the classification prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::BadMessage(reason) | Self::BadEvent(reason) => reason,
            Self::DuplicateConnection(transport) | Self::HubClosed(transport) => transport,
        }
    }
}
