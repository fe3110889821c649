//! Room Registry error types.
//!
//! Every error maps to a wire [`ErrorKind`] so clients can branch on it.
//! Internal details are logged server-side but not exposed to clients.

use crate::media::MediaError;
use common::types::{ConsumerId, ParticipantId, ProducerId, RoomId, TransportId};
use signaling_protocol::{ErrorKind, WireError};
use thiserror::Error;

/// Room Registry error type.
///
/// Numeric codes used in logs and metric labels:
/// - `ServerNotReady`: 1
/// - `MissingIdentity`, `InvalidRequest`: 2
/// - `PermissionDenied`: 3
/// - `*NotFound`: 4
/// - `CannotConsume`: 5
/// - `Media`, `Internal`, `RoomClosing`: 6
/// - `CapacityExceeded`: 7
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Media engine has not finished initializing.
    #[error("Media engine not ready")]
    ServerNotReady,

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// Routing context reports the capabilities cannot decode the producer.
    #[error("Cannot consume producer {0} with the given capabilities")]
    CannotConsume(ProducerId),

    #[error("Request is missing a participant identity")]
    MissingIdentity,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Room actor drained its last participant and is shutting down.
    #[error("Room is closing")]
    RoomClosing,

    #[error("Media engine error: {0}")]
    Media(#[from] MediaError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Wire tag for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::ServerNotReady => ErrorKind::ServerNotReady,
            RegistryError::RoomNotFound(_) => ErrorKind::RoomNotFound,
            RegistryError::ParticipantNotFound(_) => ErrorKind::ParticipantNotFound,
            RegistryError::TransportNotFound(_) => ErrorKind::TransportNotFound,
            RegistryError::ProducerNotFound(_) => ErrorKind::ProducerNotFound,
            RegistryError::ConsumerNotFound(_) => ErrorKind::ConsumerNotFound,
            RegistryError::CannotConsume(_) => ErrorKind::CannotConsume,
            RegistryError::MissingIdentity => ErrorKind::MissingIdentity,
            RegistryError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            RegistryError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            RegistryError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            RegistryError::Media(MediaError::NotReady) => ErrorKind::ServerNotReady,
            RegistryError::Media(_) => ErrorKind::MediaEngine,
            RegistryError::RoomClosing | RegistryError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Numeric code for logs and metric labels.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            RegistryError::ServerNotReady => 1,
            RegistryError::MissingIdentity | RegistryError::InvalidRequest(_) => 2,
            RegistryError::PermissionDenied(_) => 3,
            RegistryError::RoomNotFound(_)
            | RegistryError::ParticipantNotFound(_)
            | RegistryError::TransportNotFound(_)
            | RegistryError::ProducerNotFound(_)
            | RegistryError::ConsumerNotFound(_) => 4,
            RegistryError::CannotConsume(_) => 5,
            RegistryError::Media(_) | RegistryError::Internal(_) | RegistryError::RoomClosing => 6,
            RegistryError::CapacityExceeded(_) => 7,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RegistryError::ServerNotReady | RegistryError::Media(MediaError::NotReady) => {
                "Server not ready".to_string()
            }
            RegistryError::RoomNotFound(_) => "Room not found".to_string(),
            RegistryError::ParticipantNotFound(_) => "Participant not found".to_string(),
            RegistryError::TransportNotFound(_) => "Transport not found".to_string(),
            RegistryError::ProducerNotFound(_) => "Producer not found".to_string(),
            RegistryError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            RegistryError::CannotConsume(_) => "Cannot consume".to_string(),
            RegistryError::MissingIdentity => "Missing user id".to_string(),
            RegistryError::PermissionDenied(reason) => format!("Permission denied: {reason}"),
            RegistryError::CapacityExceeded(reason) => format!("Capacity exceeded: {reason}"),
            RegistryError::InvalidRequest(reason) => format!("Invalid request: {reason}"),
            RegistryError::Media(_) => "Media engine error".to_string(),
            RegistryError::RoomClosing | RegistryError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Error payload sent to the client.
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        WireError::new(self.kind(), self.client_message())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RegistryError::ServerNotReady.error_code(), 1);
        assert_eq!(RegistryError::MissingIdentity.error_code(), 2);
        assert_eq!(
            RegistryError::PermissionDenied("spectator".to_string()).error_code(),
            3
        );
        assert_eq!(
            RegistryError::ProducerNotFound(ProducerId::new("p1")).error_code(),
            4
        );
        assert_eq!(
            RegistryError::CannotConsume(ProducerId::new("p1")).error_code(),
            5
        );
        assert_eq!(RegistryError::Internal("boom".to_string()).error_code(), 6);
        assert_eq!(
            RegistryError::CapacityExceeded("rooms".to_string()).error_code(),
            7
        );
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            RegistryError::RoomNotFound(RoomId::new("r1")).kind(),
            ErrorKind::RoomNotFound
        );
        assert_eq!(
            RegistryError::CannotConsume(ProducerId::new("p")).kind(),
            ErrorKind::CannotConsume
        );
        assert_eq!(
            RegistryError::Media(MediaError::NotReady).kind(),
            ErrorKind::ServerNotReady
        );
        assert_eq!(
            RegistryError::Media(MediaError::Transport("dtls".to_string())).kind(),
            ErrorKind::MediaEngine
        );
        assert_eq!(RegistryError::RoomClosing.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_client_message_hides_internal_details() {
        let err = RegistryError::Internal("channel send failed: closed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = RegistryError::Media(MediaError::Engine("worker 3 died".to_string()));
        assert!(!err.client_message().contains("worker"));

        let wire = RegistryError::TransportNotFound(TransportId::new("t-secret")).to_wire();
        assert_eq!(wire.kind, ErrorKind::TransportNotFound);
        assert!(!wire.message.contains("t-secret"));
    }

    #[test]
    fn test_display_keeps_detail_for_logs() {
        let err = RegistryError::ParticipantNotFound(ParticipantId::new("alice"));
        assert_eq!(err.to_string(), "Participant not found: alice");
    }
}
