//! Session client error types.
//!
//! Errors are `Clone` so they can ride on the session event channel.

use signaling_protocol::{ErrorKind, MediaKind, TransportRole, WireError};
use thiserror::Error;

/// Local capture failure. Aborts the join; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaAcquisitionError {
    #[error("Camera or microphone access was denied")]
    PermissionDenied,

    #[error("No camera or microphone found")]
    DeviceNotFound,

    #[error("Error accessing camera or microphone: {0}")]
    Other(String),
}

/// Failure of the local device model or one of its transports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Router capabilities could not be loaded.
    #[error("Unsupported router capabilities: {0}")]
    UnsupportedCapabilities(String),

    #[error("Device not loaded")]
    NotLoaded,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Signaling link failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Failed to connect to signaling server: {0}")]
    Connect(String),

    #[error("Signaling link closed")]
    Closed,

    #[error("Frame codec error: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    MediaAcquisition(#[from] MediaAcquisitionError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Link(#[from] LinkError),

    /// The registry rejected a request.
    #[error("Registry rejected {operation}: {error}")]
    Registry {
        operation: &'static str,
        error: WireError,
    },

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("No local {0} track")]
    NoLocalTrack(MediaKind),

    /// Recovery hit its attempt limit for a transport role.
    #[error("Giving up on {role} transport after {attempts} attempts")]
    RecoveryExhausted { role: TransportRole, attempts: u32 },

    /// Join or request abandoned because the session left.
    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Wire tag when the registry produced this error.
    #[must_use]
    pub fn wire_kind(&self) -> Option<ErrorKind> {
        match self {
            SessionError::Registry { error, .. } => Some(error.kind),
            _ => None,
        }
    }

    /// Whether the error ends the current join attempt.
    ///
    /// Capture and device-load failures cannot be fixed without a fresh
    /// negotiation, so the session returns to `Idle`.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::MediaAcquisition(_)
                | SessionError::Device(DeviceError::UnsupportedCapabilities(_))
                | SessionError::Link(LinkError::Closed)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_acquisition_messages() {
        assert_eq!(
            SessionError::from(MediaAcquisitionError::PermissionDenied).to_string(),
            "Camera or microphone access was denied"
        );
        assert_eq!(
            MediaAcquisitionError::Other("busy".to_string()).to_string(),
            "Error accessing camera or microphone: busy"
        );
    }

    #[test]
    fn test_wire_kind_only_for_registry_errors() {
        let err = SessionError::Registry {
            operation: "consume",
            error: WireError::new(ErrorKind::CannotConsume, "Cannot consume"),
        };
        assert_eq!(err.wire_kind(), Some(ErrorKind::CannotConsume));
        assert_eq!(SessionError::Cancelled.wire_kind(), None);
        assert!(err.to_string().contains("consume"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SessionError::from(MediaAcquisitionError::DeviceNotFound).is_fatal());
        assert!(
            SessionError::from(DeviceError::UnsupportedCapabilities("no codecs".into())).is_fatal()
        );
        assert!(!SessionError::from(DeviceError::Transport("ice".into())).is_fatal());
        assert!(!SessionError::NoLocalTrack(MediaKind::Video).is_fatal());
    }
}
